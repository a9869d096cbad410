use std::collections::HashSet;
use std::hash::Hash;

/// "What's new since the last check" over a set of keys.
///
/// An empty snapshot means the baseline is unknown (nothing loaded yet, or
/// nothing in the local store), so observations are ignored until a
/// non-empty snapshot is loaded. This keeps a fresh install from reporting
/// every existing member as new.
#[derive(Debug, Clone)]
pub struct SnapshotDiff<K> {
    current: HashSet<K>,
    pending: HashSet<K>,
}

impl<K> Default for SnapshotDiff<K> {
    fn default() -> Self {
        Self {
            current: HashSet::new(),
            pending: HashSet::new(),
        }
    }
}

impl<K: Eq + Hash + Clone> SnapshotDiff<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the baseline. Pending keys are kept.
    pub fn load(&mut self, current: HashSet<K>) {
        self.current = current;
    }

    pub fn is_loaded(&self) -> bool {
        !self.current.is_empty()
    }

    pub fn current(&self) -> &HashSet<K> {
        &self.current
    }

    pub fn pending(&self) -> &HashSet<K> {
        &self.pending
    }

    /// Record a sighting. Returns true when `key` is new relative to the
    /// baseline (including when it was already pending).
    pub fn observe(&mut self, key: K) -> bool {
        if !self.is_loaded() || self.current.contains(&key) {
            return false;
        }
        self.pending.insert(key);
        true
    }

    pub fn take_pending(&mut self) -> HashSet<K> {
        std::mem::take(&mut self.pending)
    }

    pub fn clear_pending(&mut self) {
        self.pending.clear();
    }

    /// Fold reported keys into the baseline so they are not reported again
    pub fn absorb<I: IntoIterator<Item = K>>(&mut self, keys: I) {
        self.current.extend(keys);
    }

    pub fn reset(&mut self) {
        self.current.clear();
        self.pending.clear();
    }
}
