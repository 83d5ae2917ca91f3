//! Correlation state for the event broker.
//!
//! Two mechanisms link sub-agent activity back to its parent session:
//! in-process tracking via per-parent LIFO stacks of [`SubagentContext`]s,
//! and cross-process tracking via [`PendingSpawn`] candidates matched by
//! working-directory affinity inside a fixed time window. The window and
//! the affinity rules are best-effort heuristics, not guarantees.

use std::collections::HashMap;

use skydeck_protocol::new_virtual_id;

/// Maximum gap between a spawn-triggering event and a candidate child
/// session for the two to be linked.
pub const CORRELATION_WINDOW_MS: u64 = 30_000;

/// Spawn candidates older than this are garbage collected.
pub const SPAWN_CANDIDATE_TTL_MS: u64 = CORRELATION_WINDOW_MS * 2;

/// Transient record of one in-flight sub-agent invocation.
#[derive(Debug, Clone)]
pub struct SubagentContext {
    pub virtual_session_id: String,
    pub parent_session_id: String,
    pub agent_type: Option<String>,
    pub started_at: u64,
}

/// Per-parent-session stacks of active sub-agent contexts.
///
/// Nested invocations nest correctly: the most recently started,
/// not-yet-stopped sub-agent is always the top of its parent's stack.
#[derive(Debug, Default)]
pub struct SubagentStacks {
    stacks: HashMap<String, Vec<SubagentContext>>,
}

impl SubagentStacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a fresh context for `parent_session_id`; returns the context.
    pub fn push(
        &mut self,
        parent_session_id: &str,
        agent_type: Option<String>,
        started_at: u64,
    ) -> SubagentContext {
        let ctx = SubagentContext {
            virtual_session_id: new_virtual_id(),
            parent_session_id: parent_session_id.to_string(),
            agent_type,
            started_at,
        };
        self.stacks
            .entry(parent_session_id.to_string())
            .or_default()
            .push(ctx.clone());
        ctx
    }

    /// Pop the most recent context for `parent_session_id` (LIFO).
    /// Removes the stack entry once it drains.
    pub fn pop(&mut self, parent_session_id: &str) -> Option<SubagentContext> {
        let stack = self.stacks.get_mut(parent_session_id)?;
        let ctx = stack.pop();
        if stack.is_empty() {
            self.stacks.remove(parent_session_id);
        }
        ctx
    }

    /// Top of `parent_session_id`'s stack, if any context is active.
    pub fn top(&self, parent_session_id: &str) -> Option<&SubagentContext> {
        self.stacks.get(parent_session_id)?.last()
    }

    /// Find an active context by its virtual session id, across all parents.
    pub fn find_virtual(&self, virtual_session_id: &str) -> Option<&SubagentContext> {
        self.stacks
            .values()
            .flatten()
            .find(|ctx| ctx.virtual_session_id == virtual_session_id)
    }

    /// Drop every active context for `parent_session_id`.
    pub fn remove(&mut self, parent_session_id: &str) {
        self.stacks.remove(parent_session_id);
    }

    pub fn clear(&mut self) {
        self.stacks.clear();
    }
}

/// A weaker correlation record for sub-agents running as separate
/// connections, where the in-process stack cannot see them.
#[derive(Debug, Clone)]
pub struct PendingSpawn {
    pub parent_session_id: String,
    pub working_directory: String,
    pub timestamp: u64,
    pub agent_type: Option<String>,
}

/// How strongly two working directories relate. Ordered by precedence:
/// the first match short-circuits, so `Exact` always beats `Ancestor`,
/// which beats `SharedParent`, which beats `SharedPrefix`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DirAffinity {
    Exact,
    Ancestor,
    SharedParent,
    SharedPrefix,
}

fn components(path: &str) -> Vec<&str> {
    path.split('/').filter(|c| !c.is_empty()).collect()
}

/// Judge whether two paths "share a project".
pub fn directory_affinity(a: &str, b: &str) -> Option<DirAffinity> {
    let ca = components(a);
    let cb = components(b);
    if ca.is_empty() || cb.is_empty() {
        return None;
    }

    if ca == cb {
        return Some(DirAffinity::Exact);
    }

    let shorter = ca.len().min(cb.len());
    let common = ca
        .iter()
        .zip(cb.iter())
        .take_while(|(x, y)| x == y)
        .count();

    // One path contains the other entirely.
    if common == shorter {
        return Some(DirAffinity::Ancestor);
    }

    // Siblings: identical up to the last component.
    if ca.len() == cb.len() && common == ca.len() - 1 {
        return Some(DirAffinity::SharedParent);
    }

    if common >= 3 {
        return Some(DirAffinity::SharedPrefix);
    }

    None
}

/// Holds spawn candidates for the cross-process correlation path.
#[derive(Debug, Default)]
pub struct SpawnCandidates {
    candidates: Vec<PendingSpawn>,
}

impl SpawnCandidates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, spawn: PendingSpawn) {
        self.candidates.push(spawn);
    }

    /// Drop candidates older than twice the correlation window.
    pub fn collect_expired(&mut self, now: u64) {
        self.candidates
            .retain(|c| now.saturating_sub(c.timestamp) <= SPAWN_CANDIDATE_TTL_MS);
    }

    /// Consume the best candidate for a new session seen at `timestamp` in
    /// `working_directory`. A candidate matches when its directory relates to
    /// the session's and the timestamps fall within the correlation window;
    /// among matches the strongest affinity wins, recency breaks ties.
    /// The consumed candidate is removed — each spawn links at most one child.
    pub fn consume(
        &mut self,
        session_id: &str,
        working_directory: &str,
        timestamp: u64,
    ) -> Option<PendingSpawn> {
        self.collect_expired(timestamp);

        let mut best: Option<(usize, DirAffinity, u64)> = None;
        for (idx, cand) in self.candidates.iter().enumerate() {
            if cand.parent_session_id == session_id {
                continue;
            }
            if timestamp.abs_diff(cand.timestamp) > CORRELATION_WINDOW_MS {
                continue;
            }
            let Some(affinity) = directory_affinity(&cand.working_directory, working_directory)
            else {
                continue;
            };
            let better = match &best {
                None => true,
                Some((_, best_affinity, best_ts)) => {
                    affinity < *best_affinity
                        || (affinity == *best_affinity && cand.timestamp > *best_ts)
                }
            };
            if better {
                best = Some((idx, affinity, cand.timestamp));
            }
        }

        best.map(|(idx, _, _)| self.candidates.remove(idx))
    }

    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn clear(&mut self) {
        self.candidates.clear();
    }
}
