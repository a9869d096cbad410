use std::collections::HashSet;

use parking_lot::RwLock;

/// Decides whether a pubkey may appear in notifications
pub trait TrustFilter: Send + Sync {
    fn is_allowed(&self, pubkey: &str) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl TrustFilter for AllowAll {
    fn is_allowed(&self, _pubkey: &str) -> bool {
        true
    }
}

#[derive(Debug, Default)]
struct TrustSets {
    trusted: HashSet<String>,
    blocked: HashSet<String>,
}

/// Explicit trust list: a pubkey is allowed when it is trusted and not blocked
#[derive(Debug, Default)]
pub struct TrustList {
    sets: RwLock<TrustSets>,
}

impl TrustList {
    pub fn new<I, S>(trusted: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let list = Self::default();
        list.sets.write().trusted = trusted.into_iter().map(Into::into).collect();
        list
    }

    pub fn is_trusted(&self, pubkey: &str) -> bool {
        self.sets.read().trusted.contains(pubkey)
    }

    pub fn is_blocked(&self, pubkey: &str) -> bool {
        self.sets.read().blocked.contains(pubkey)
    }

    pub fn set_lists(&self, trusted: HashSet<String>, blocked: HashSet<String>) {
        let mut sets = self.sets.write();
        sets.trusted = trusted;
        sets.blocked = blocked;
    }

    /// Trust a pubkey. Removes it from the blocked set.
    pub fn add_trusted(&self, pubkey: &str) {
        let mut sets = self.sets.write();
        sets.blocked.remove(pubkey);
        sets.trusted.insert(pubkey.to_string());
    }

    /// Block a pubkey. Removes it from the trusted set.
    pub fn add_blocked(&self, pubkey: &str) {
        let mut sets = self.sets.write();
        sets.trusted.remove(pubkey);
        sets.blocked.insert(pubkey.to_string());
    }

    pub fn len(&self) -> usize {
        self.sets.read().trusted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.read().trusted.is_empty()
    }
}

impl TrustFilter for TrustList {
    fn is_allowed(&self, pubkey: &str) -> bool {
        let sets = self.sets.read();
        sets.trusted.contains(pubkey) && !sets.blocked.contains(pubkey)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allow_all() {
        assert!(AllowAll.is_allowed("anyone"));
    }

    #[test]
    fn test_trust_and_block_are_exclusive() {
        let list = TrustList::new(["alice", "bob"]);
        assert!(list.is_allowed("alice"));
        assert!(!list.is_allowed("carol"));

        list.add_blocked("alice");
        assert!(!list.is_allowed("alice"));
        assert!(!list.is_trusted("alice"));

        list.add_trusted("alice");
        assert!(list.is_allowed("alice"));
        assert!(!list.is_blocked("alice"));
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn test_set_lists_replaces_both() {
        let list = TrustList::new(["alice"]);
        list.set_lists(
            ["carol".to_string()].into_iter().collect(),
            ["alice".to_string()].into_iter().collect(),
        );
        assert!(list.is_allowed("carol"));
        assert!(!list.is_allowed("alice"));
        assert!(list.is_blocked("alice"));
    }
}
