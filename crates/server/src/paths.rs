//! Central path resolution for all Skydeck data files.
//!
//! Resolved once at startup from: CLI `--data-dir` > `SKYDECK_DATA_DIR` env > `~/.skydeck`.
//! All callsites use these helpers instead of constructing paths from `HOME`.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

static DATA_DIR: RwLock<Option<PathBuf>> = RwLock::new(None);

/// Initialize the global data directory. Returns the resolved path.
///
/// Priority: `explicit` arg > `SKYDECK_DATA_DIR` env > `~/.skydeck` default.
/// Panics if no valid path can be resolved.
pub fn init_data_dir(explicit: Option<&Path>) -> PathBuf {
    let dir = if let Some(p) = explicit {
        p.to_path_buf()
    } else if let Ok(env_val) = std::env::var("SKYDECK_DATA_DIR") {
        PathBuf::from(env_val)
    } else {
        dirs::home_dir()
            .expect("HOME directory not found")
            .join(".skydeck")
    };

    let mut guard = DATA_DIR.write().expect("DATA_DIR lock poisoned");
    *guard = Some(dir.clone());
    dir
}

/// Return the current data directory. Panics if `init_data_dir` hasn't been called.
pub fn data_dir() -> PathBuf {
    DATA_DIR
        .read()
        .expect("DATA_DIR lock poisoned")
        .clone()
        .expect("data_dir() called before init_data_dir()")
}

pub fn db_path() -> PathBuf {
    data_dir().join("skydeck.db")
}

pub fn log_dir() -> PathBuf {
    data_dir().join("logs")
}

/// Socket hook scripts write event records to.
pub fn ingress_socket_path() -> PathBuf {
    data_dir().join("events.sock")
}

/// Socket the CLI and wrapper hosts talk to the daemon over.
pub fn control_socket_path() -> PathBuf {
    data_dir().join("control.sock")
}

/// Create all required subdirectories under the data dir.
pub fn ensure_dirs() -> io::Result<()> {
    let base = data_dir();
    std::fs::create_dir_all(&base)?;
    std::fs::create_dir_all(base.join("logs"))?;
    Ok(())
}

/// Reset data dir — for test isolation only.
#[cfg(test)]
pub fn reset_data_dir() {
    let mut guard = DATA_DIR.write().expect("DATA_DIR lock poisoned");
    *guard = None;
}
