use std::collections::{HashMap, HashSet};

use nostr::Event;
use parking_lot::RwLock;

use super::{
    indexed_tags, parse_event, replace_key, serialize_tags, BgContext, EventQuery, EventStore,
    NotificationKind, NotificationStore, PersistentNotification, SaveOutcome, StoreError, TagMatch,
};

#[derive(Default)]
struct MemoryInner {
    events: HashMap<String, Event>,
    tag_index: HashMap<(String, String), HashSet<String>>,
    /// Replaceable identity -> id of the version currently kept
    replaceable: HashMap<(String, u16, String), String>,
    notifications: Vec<PersistentNotification>,
}

impl MemoryInner {
    fn insert(&mut self, event: Event) {
        let id = event.id.to_hex();
        for key in indexed_tags(&event) {
            self.tag_index.entry(key).or_default().insert(id.clone());
        }
        self.events.insert(id, event);
    }

    fn remove(&mut self, id: &str) {
        if let Some(event) = self.events.remove(id) {
            for key in indexed_tags(&event) {
                if let Some(ids) = self.tag_index.get_mut(&key) {
                    ids.remove(id);
                    if ids.is_empty() {
                        self.tag_index.remove(&key);
                    }
                }
            }
        }
    }
}

/// In-memory event and notification store with a parsed tag index
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().events.is_empty()
    }
}

impl EventStore for MemoryStore {
    fn fetch_event(&self, _ctx: &BgContext, id: &str) -> Result<Option<Event>, StoreError> {
        Ok(self.inner.read().events.get(id).cloned())
    }

    fn fetch_events(&self, _ctx: &BgContext, query: &EventQuery) -> Result<Vec<Event>, StoreError> {
        let inner = self.inner.read();
        let candidates: Box<dyn Iterator<Item = &Event> + '_> = match &query.tag {
            Some(tag) if tag.matching == TagMatch::Exact => {
                match inner.tag_index.get(&(tag.key.clone(), tag.value.clone())) {
                    Some(ids) => Box::new(ids.iter().filter_map(|id| inner.events.get(id))),
                    None => Box::new(std::iter::empty()),
                }
            }
            _ => Box::new(inner.events.values()),
        };

        let needle = query
            .tag
            .as_ref()
            .filter(|tag| tag.matching == TagMatch::SerializedContains)
            .map(|tag| tag.serialized_needle());

        let mut events: Vec<Event> = candidates
            .filter(|event| query.matches_fields(event))
            .filter(|event| match &needle {
                Some(needle) => serialize_tags(event).contains(needle.as_str()),
                None => true,
            })
            .cloned()
            .collect();
        events.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = query.limit {
            events.truncate(limit);
        }
        Ok(events)
    }

    fn save_event(&self, _ctx: &BgContext, raw_json: &str) -> Result<SaveOutcome, StoreError> {
        let event = parse_event(raw_json)?;
        let id = event.id.to_hex();
        let mut inner = self.inner.write();
        if inner.events.contains_key(&id) {
            return Ok(SaveOutcome::Duplicate(event));
        }

        if let Some(key) = replace_key(&event) {
            if let Some(current_id) = inner.replaceable.get(&key).cloned() {
                let newer = inner
                    .events
                    .get(&current_id)
                    .map_or(true, |current| event.created_at > current.created_at);
                if !newer {
                    return Ok(SaveOutcome::Superseded(event));
                }
                inner.remove(&current_id);
            }
            inner.replaceable.insert(key, id);
        }
        inner.insert(event.clone());
        Ok(SaveOutcome::Inserted(event))
    }
}

impl NotificationStore for MemoryStore {
    fn latest_notification(
        &self,
        _ctx: &BgContext,
        pubkey: &str,
        kind: NotificationKind,
    ) -> Result<Option<PersistentNotification>, StoreError> {
        Ok(self
            .inner
            .read()
            .notifications
            .iter()
            .filter(|n| n.pubkey == pubkey && n.kind == kind)
            .max_by_key(|n| n.created_at)
            .cloned())
    }

    fn create_notification(
        &self,
        _ctx: &BgContext,
        notification: &PersistentNotification,
    ) -> Result<(), StoreError> {
        self.inner.write().notifications.push(notification.clone());
        Ok(())
    }

    fn notifications(
        &self,
        _ctx: &BgContext,
        pubkey: &str,
        limit: usize,
    ) -> Result<Vec<PersistentNotification>, StoreError> {
        let mut notifications: Vec<PersistentNotification> = self
            .inner
            .read()
            .notifications
            .iter()
            .filter(|n| n.pubkey == pubkey)
            .cloned()
            .collect();
        notifications.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        notifications.truncate(limit);
        Ok(notifications)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::kinds;
    use crate::store::test_util::{contact_list, note};
    use nostr::{JsonUtil, Keys};

    #[test]
    fn test_save_and_fetch_by_id() {
        let ctx = BgContext::new();
        let store = MemoryStore::new();
        let event = note(&Keys::generate(), "hello", 100);
        assert!(store.save_event(&ctx, &event.as_json()).unwrap().is_inserted());
        assert_eq!(
            store.save_event(&ctx, &event.as_json()).unwrap(),
            SaveOutcome::Duplicate(event.clone())
        );

        assert_eq!(store.len(), 1);
        let fetched = store.fetch_event(&ctx, &event.id.to_hex()).unwrap();
        assert_eq!(fetched, Some(event));
        assert!(store.fetch_event(&ctx, "missing").unwrap().is_none());
    }

    #[test]
    fn test_invalid_json_is_an_error() {
        let ctx = BgContext::new();
        let store = MemoryStore::new();
        assert!(matches!(
            store.save_event(&ctx, "{\"kind\":1}"),
            Err(StoreError::InvalidEvent(_))
        ));
    }

    #[test]
    fn test_exact_tag_query_finds_followers() {
        let ctx = BgContext::new();
        let store = MemoryStore::new();
        let me = Keys::generate();
        let (a, b, c) = (Keys::generate(), Keys::generate(), Keys::generate());
        for (author, follows) in [(&a, vec![&me]), (&b, vec![&c, &me]), (&c, vec![&a])] {
            let event = contact_list(author, &follows, 100);
            store.save_event(&ctx, &event.as_json()).unwrap();
        }

        let query = EventQuery::new()
            .kind(kinds::CONTACT_LIST)
            .tag("p", me.public_key().to_hex(), TagMatch::Exact);
        let authors: HashSet<String> = store
            .fetch_events(&ctx, &query)
            .unwrap()
            .iter()
            .map(|e| e.pubkey.to_hex())
            .collect();
        let expected: HashSet<String> =
            [a.public_key().to_hex(), b.public_key().to_hex()].into_iter().collect();
        assert_eq!(authors, expected);

        let legacy = EventQuery::new()
            .kind(kinds::CONTACT_LIST)
            .tag("p", me.public_key().to_hex(), TagMatch::SerializedContains);
        assert_eq!(store.fetch_events(&ctx, &legacy).unwrap().len(), 2);
    }

    #[test]
    fn test_newer_contact_list_replaces_older() {
        let ctx = BgContext::new();
        let store = MemoryStore::new();
        let me = Keys::generate();
        let fan = Keys::generate();
        let old = contact_list(&fan, &[&me], 100);
        let unfollowed = contact_list(&fan, &[], 200);
        assert!(store.save_event(&ctx, &old.as_json()).unwrap().is_inserted());
        assert!(store.save_event(&ctx, &unfollowed.as_json()).unwrap().is_inserted());
        // An older version arriving late is ignored
        assert_eq!(
            store.save_event(&ctx, &old.as_json()).unwrap(),
            SaveOutcome::Superseded(old.clone())
        );

        assert_eq!(store.len(), 1);
        let query = EventQuery::new().tag("p", me.public_key().to_hex(), TagMatch::Exact);
        assert!(store.fetch_events(&ctx, &query).unwrap().is_empty());
    }

    #[test]
    fn test_query_window_order_and_limit() {
        let ctx = BgContext::new();
        let store = MemoryStore::new();
        let author = Keys::generate();
        for ts in [100, 200, 300, 400] {
            store
                .save_event(&ctx, &note(&author, &ts.to_string(), ts).as_json())
                .unwrap();
        }
        let query = EventQuery::new()
            .author(author.public_key().to_hex())
            .kind(kinds::TEXT_NOTE)
            .since(200)
            .until(400)
            .limit(2);
        let created: Vec<u64> = store
            .fetch_events(&ctx, &query)
            .unwrap()
            .iter()
            .map(|e| e.created_at.as_u64())
            .collect();
        assert_eq!(created, vec![400, 300]);
    }

    #[test]
    fn test_latest_notification_per_pubkey_and_kind() {
        let ctx = BgContext::new();
        let store = MemoryStore::new();
        for (pubkey, created_at) in [("me", 10), ("me", 30), ("other", 50)] {
            store
                .create_notification(
                    &ctx,
                    &PersistentNotification::new_followers(pubkey, vec![], created_at),
                )
                .unwrap();
        }
        let latest = store
            .latest_notification(&ctx, "me", NotificationKind::NewFollowers)
            .unwrap()
            .unwrap();
        assert_eq!(latest.created_at, 30);
        assert!(store
            .latest_notification(&ctx, "me", NotificationKind::Mentions)
            .unwrap()
            .is_none());
        assert_eq!(store.notifications(&ctx, "me", 10).unwrap().len(), 2);
    }
}
