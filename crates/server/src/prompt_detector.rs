//! Heuristic detection of "awaiting input" terminal output.
//!
//! Scans a bounded trailing window of wrapper output for prompt-like
//! patterns. Inherently approximate: the patterns catch the common shells,
//! REPLs and yes/no confirmations, and both false positives and false
//! negatives are expected. The wrapper state machine limits the blast
//! radius by only consulting the detector while the wrapper is processing.

use regex::Regex;

/// How much trailing output is kept for matching. Older content is trimmed.
pub const TRAILING_WINDOW_BYTES: usize = 2048;

pub struct PromptDetector {
    buffer: String,
    patterns: Vec<Regex>,
    ansi: Regex,
}

impl Default for PromptDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptDetector {
    pub fn new() -> Self {
        let patterns = [
            // Bare shell/REPL prompt on its own line.
            r"(?m)^\s*(?:>|\$|%|❯)\s*$",
            // A question was just asked.
            r"\?\s*$",
            r"(?i)press enter",
            // Yes/no confirmations in their usual spellings.
            r"(?i)\((?:y/n|yes/no)\)\s*:?\s*$",
            r"\[[Yy]/[Nn]\]\s*$",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("prompt pattern compiles"))
        .collect();

        Self {
            buffer: String::new(),
            patterns,
            ansi: Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]").expect("ansi pattern compiles"),
        }
    }

    /// Append an output chunk, trimming the front to the trailing window.
    pub fn feed(&mut self, chunk: &str) {
        self.buffer.push_str(chunk);
        if self.buffer.len() > TRAILING_WINDOW_BYTES {
            let mut cut = self.buffer.len() - TRAILING_WINDOW_BYTES;
            while !self.buffer.is_char_boundary(cut) {
                cut += 1;
            }
            self.buffer.drain(..cut);
        }
    }

    /// Whether the trailing output looks like the process wants input.
    pub fn looks_like_waiting(&self) -> bool {
        let plain = self.ansi.replace_all(&self.buffer, "");
        let tail = plain.trim_end_matches(['\r', '\n', ' ']);
        if tail.is_empty() {
            return false;
        }
        self.patterns.iter().any(|p| p.is_match(tail))
    }

    /// Forget buffered output (after input was written).
    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}
