//! Memoization table shared between views of one predicted process

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::process::RunFuture;
use crate::signal::SignalId;

/// Signal identity → run future cache
///
/// Cloning the table clones the handle, not the entries: every clone reads
/// and writes the same map.
#[derive(Clone, Default)]
pub struct MemoTable {
    entries: Arc<Mutex<HashMap<SignalId, RunFuture>>>,
}

impl MemoTable {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached run for `signal`, if any
    pub fn get(&self, signal: SignalId) -> Option<RunFuture> {
        self.entries.lock().get(&signal).cloned()
    }

    /// Cache `run` under `signal`, replacing an earlier entry
    pub fn insert(&self, signal: SignalId, run: RunFuture) {
        self.entries.lock().insert(signal, run);
    }

    /// Whether a run is cached for `signal`
    pub fn contains(&self, signal: SignalId) -> bool {
        self.entries.lock().contains_key(&signal)
    }

    /// Number of cached runs
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing is cached
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Whether `self` and `other` are handles to the same table
    pub fn shares_with(&self, other: &MemoTable) -> bool {
        Arc::ptr_eq(&self.entries, &other.entries)
    }
}

impl std::fmt::Debug for MemoTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoTable")
            .field("entries", &self.len())
            .finish()
    }
}
