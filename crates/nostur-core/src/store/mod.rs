//! Local persistence the core reads from and writes to.
//!
//! All store calls take a [`BgContext`], which only the worker can hand out,
//! so store access is confined to the background context by construction.

pub mod memory;
pub mod notifications;
pub mod settings;
pub mod sqlite;
pub mod trust;

use nostr::Event;

use crate::constants::kinds;

pub use memory::MemoryStore;
pub use notifications::{NotificationKind, PersistentNotification};
pub use settings::{Settings, SettingsStore};
pub use sqlite::SqliteStore;
pub use trust::{AllowAll, TrustFilter, TrustList};

/// Proof that the caller runs on the background context
#[derive(Debug)]
pub struct BgContext {
    _private: (),
}

impl BgContext {
    pub(crate) fn new() -> Self {
        Self { _private: () }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Invalid event: {0}")]
    InvalidEvent(String),
    #[error("Corrupt record: {0}")]
    Corrupt(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagMatch {
    /// Match against the parsed tag index
    Exact,
    /// Substring search over the serialized tag array. Kept for parity with
    /// older stores; it can match a value that sits in a different tag
    /// position than `key`.
    SerializedContains,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagQuery {
    pub key: String,
    pub value: String,
    pub matching: TagMatch,
}

impl TagQuery {
    /// The needle used for [`TagMatch::SerializedContains`]
    pub fn serialized_needle(&self) -> String {
        format!("\"{}\",\"{}\"", self.key, self.value)
    }
}

/// Conjunctive query over stored events; empty lists match everything
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventQuery {
    pub ids: Vec<String>,
    pub authors: Vec<String>,
    pub kinds: Vec<u16>,
    pub tag: Option<TagQuery>,
    pub since: Option<u64>,
    pub until: Option<u64>,
    pub limit: Option<usize>,
}

impl EventQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.ids.push(id.into());
        self
    }

    pub fn author(mut self, pubkey: impl Into<String>) -> Self {
        self.authors.push(pubkey.into());
        self
    }

    pub fn kind(mut self, kind: u16) -> Self {
        self.kinds.push(kind);
        self
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>, matching: TagMatch) -> Self {
        self.tag = Some(TagQuery {
            key: key.into(),
            value: value.into(),
            matching,
        });
        self
    }

    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: u64) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Everything except the tag clause, which stores resolve through their index
    pub(crate) fn matches_fields(&self, event: &Event) -> bool {
        let created_at = event.created_at.as_u64();
        (self.ids.is_empty() || self.ids.contains(&event.id.to_hex()))
            && (self.authors.is_empty() || self.authors.contains(&event.pubkey.to_hex()))
            && (self.kinds.is_empty() || self.kinds.contains(&event.kind.as_u16()))
            && self.since.map_or(true, |since| created_at >= since)
            && self.until.map_or(true, |until| created_at <= until)
    }
}

/// What `save_event` did with an event
#[derive(Debug, Clone, PartialEq)]
pub enum SaveOutcome {
    /// Stored as a new event
    Inserted(Event),
    /// Already stored under the same id
    Duplicate(Event),
    /// Replaceable event older than (or as old as) the version already kept; not stored
    Superseded(Event),
}

impl SaveOutcome {
    pub fn event(&self) -> &Event {
        match self {
            Self::Inserted(event) | Self::Duplicate(event) | Self::Superseded(event) => event,
        }
    }

    pub fn into_event(self) -> Event {
        match self {
            Self::Inserted(event) | Self::Duplicate(event) | Self::Superseded(event) => event,
        }
    }

    pub fn is_inserted(&self) -> bool {
        matches!(self, Self::Inserted(_))
    }
}

pub trait EventStore: Send + Sync {
    fn fetch_event(&self, ctx: &BgContext, id: &str) -> Result<Option<Event>, StoreError>;

    /// Newest first
    fn fetch_events(&self, ctx: &BgContext, query: &EventQuery) -> Result<Vec<Event>, StoreError>;

    /// Parse and store a raw event. Replaceable kinds keep only the newest
    /// version per author (and `d` tag for addressable kinds).
    fn save_event(&self, ctx: &BgContext, raw_json: &str) -> Result<SaveOutcome, StoreError>;
}

pub trait NotificationStore: Send + Sync {
    fn latest_notification(
        &self,
        ctx: &BgContext,
        pubkey: &str,
        kind: NotificationKind,
    ) -> Result<Option<PersistentNotification>, StoreError>;

    fn create_notification(
        &self,
        ctx: &BgContext,
        notification: &PersistentNotification,
    ) -> Result<(), StoreError>;

    /// Newest first
    fn notifications(
        &self,
        ctx: &BgContext,
        pubkey: &str,
        limit: usize,
    ) -> Result<Vec<PersistentNotification>, StoreError>;
}

pub(crate) fn parse_event(raw_json: &str) -> Result<Event, StoreError> {
    serde_json::from_str::<Event>(raw_json).map_err(|e| StoreError::InvalidEvent(e.to_string()))
}

pub(crate) fn serialize_tags(event: &Event) -> String {
    let tags: Vec<&[String]> = event.tags.iter().map(|tag| tag.as_slice()).collect();
    serde_json::to_string(&tags).unwrap_or_default()
}

/// Single-letter tag pairs, the ones relays index
pub(crate) fn indexed_tags(event: &Event) -> Vec<(String, String)> {
    event
        .tags
        .iter()
        .filter_map(|tag| match tag.as_slice() {
            [key, value, ..] if key.chars().count() == 1 => Some((key.clone(), value.clone())),
            _ => None,
        })
        .collect()
}

/// Identity under which a newer event replaces an older one
pub(crate) fn replace_key(event: &Event) -> Option<(String, u16, String)> {
    let kind = event.kind.as_u16();
    if kinds::is_replaceable(kind) {
        Some((event.pubkey.to_hex(), kind, String::new()))
    } else if kinds::is_addressable(kind) {
        let d = event
            .tags
            .iter()
            .find_map(|tag| match tag.as_slice() {
                [key, value, ..] if key == "d" => Some(value.clone()),
                _ => None,
            })
            .unwrap_or_default();
        Some((event.pubkey.to_hex(), kind, d))
    } else {
        None
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use nostr::{Event, EventBuilder, Keys, Kind, Tag, Timestamp};

    pub fn contact_list(author: &Keys, follows: &[&Keys], created_at: u64) -> Event {
        let mut builder = EventBuilder::new(Kind::ContactList, "")
            .custom_created_at(Timestamp::from(created_at));
        for follow in follows {
            builder = builder.tag(Tag::public_key(follow.public_key()));
        }
        builder.sign_with_keys(author).unwrap()
    }

    pub fn note(author: &Keys, content: &str, created_at: u64) -> Event {
        EventBuilder::new(Kind::TextNote, content)
            .custom_created_at(Timestamp::from(created_at))
            .sign_with_keys(author)
            .unwrap()
    }
}
