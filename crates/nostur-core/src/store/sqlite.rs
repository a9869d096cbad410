use std::path::Path;

use nostr::Event;
use parking_lot::Mutex;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};

use super::{
    indexed_tags, parse_event, replace_key, serialize_tags, BgContext, EventQuery, EventStore,
    NotificationKind, NotificationStore, PersistentNotification, SaveOutcome, StoreError, TagMatch,
};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS events (
        id TEXT PRIMARY KEY,
        pubkey TEXT NOT NULL,
        kind INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        d_tag TEXT,
        tags_serialized TEXT NOT NULL,
        raw TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_events_kind ON events(kind, created_at DESC);
    CREATE INDEX IF NOT EXISTS idx_events_pubkey ON events(pubkey, kind);
    CREATE TABLE IF NOT EXISTS event_tags (
        event_id TEXT NOT NULL REFERENCES events(id) ON DELETE CASCADE,
        key TEXT NOT NULL,
        value TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_event_tags ON event_tags(key, value);
    CREATE INDEX IF NOT EXISTS idx_event_tags_event ON event_tags(event_id);
    CREATE TABLE IF NOT EXISTS notifications (
        id TEXT PRIMARY KEY,
        pubkey TEXT NOT NULL,
        kind TEXT NOT NULL,
        pubkeys TEXT NOT NULL,
        created_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_notifications ON notifications(pubkey, kind, created_at DESC);
";

/// SQLite-backed store: events, their single-letter tags, and notifications
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) `nostur.db` inside `data_dir`
    pub fn open(data_dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(data_dir)?;
        let conn = Connection::open(data_dir.join("nostur.db"))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn event_count(&self) -> Result<usize, StoreError> {
        let count: i64 = self
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

fn build_query(query: &EventQuery) -> (String, Vec<SqlValue>) {
    let mut sql = String::from("SELECT e.raw FROM events e");
    let mut clauses: Vec<String> = Vec::new();
    let mut values: Vec<SqlValue> = Vec::new();

    if let Some(tag) = &query.tag {
        match tag.matching {
            TagMatch::Exact => {
                clauses.push(
                    "e.id IN (SELECT event_id FROM event_tags WHERE key = ? AND value = ?)".into(),
                );
                values.push(SqlValue::Text(tag.key.clone()));
                values.push(SqlValue::Text(tag.value.clone()));
            }
            TagMatch::SerializedContains => {
                clauses.push("instr(e.tags_serialized, ?) > 0".into());
                values.push(SqlValue::Text(tag.serialized_needle()));
            }
        }
    }

    let mut in_clause = |column: &str, items: Vec<SqlValue>| {
        if !items.is_empty() {
            let marks = vec!["?"; items.len()].join(", ");
            clauses.push(format!("{} IN ({})", column, marks));
            values.extend(items);
        }
    };
    in_clause(
        "e.id",
        query.ids.iter().cloned().map(SqlValue::Text).collect(),
    );
    in_clause(
        "e.pubkey",
        query.authors.iter().cloned().map(SqlValue::Text).collect(),
    );
    in_clause(
        "e.kind",
        query
            .kinds
            .iter()
            .map(|kind| SqlValue::Integer(i64::from(*kind)))
            .collect(),
    );

    if let Some(since) = query.since {
        clauses.push("e.created_at >= ?".into());
        values.push(SqlValue::Integer(since as i64));
    }
    if let Some(until) = query.until {
        clauses.push("e.created_at <= ?".into());
        values.push(SqlValue::Integer(until as i64));
    }

    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY e.created_at DESC");
    if let Some(limit) = query.limit {
        sql.push_str(" LIMIT ?");
        values.push(SqlValue::Integer(limit as i64));
    }
    (sql, values)
}

impl EventStore for SqliteStore {
    fn fetch_event(&self, _ctx: &BgContext, id: &str) -> Result<Option<Event>, StoreError> {
        let raw: Option<String> = self
            .conn
            .lock()
            .query_row("SELECT raw FROM events WHERE id = ?1", params![id], |row| row.get(0))
            .optional()?;
        raw.map(|raw| parse_event(&raw)).transpose()
    }

    fn fetch_events(&self, _ctx: &BgContext, query: &EventQuery) -> Result<Vec<Event>, StoreError> {
        let (sql, values) = build_query(query);
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), |row| row.get::<_, String>(0))?;

        let mut events = Vec::new();
        for raw in rows {
            let raw = raw?;
            match parse_event(&raw) {
                Ok(event) => events.push(event),
                Err(e) => tracing::warn!("[STORE] skipping unreadable stored event: {}", e),
            }
        }
        Ok(events)
    }

    fn save_event(&self, _ctx: &BgContext, raw_json: &str) -> Result<SaveOutcome, StoreError> {
        let event = parse_event(raw_json)?;
        let id = event.id.to_hex();
        let pubkey = event.pubkey.to_hex();
        let kind = i64::from(event.kind.as_u16());
        let created_at = event.created_at.as_u64() as i64;
        let replace = replace_key(&event);

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let exists: bool = tx
            .query_row("SELECT 1 FROM events WHERE id = ?1", params![id], |_| Ok(true))
            .optional()?
            .unwrap_or(false);
        if exists {
            return Ok(SaveOutcome::Duplicate(event));
        }

        if let Some((_, _, d_tag)) = &replace {
            let current: Option<(String, i64)> = tx
                .query_row(
                    "SELECT id, created_at FROM events WHERE pubkey = ?1 AND kind = ?2 AND d_tag = ?3",
                    params![pubkey, kind, d_tag],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            if let Some((current_id, current_created_at)) = current {
                if current_created_at >= created_at {
                    return Ok(SaveOutcome::Superseded(event));
                }
                tx.execute("DELETE FROM events WHERE id = ?1", params![current_id])?;
            }
        }

        tx.execute(
            "INSERT INTO events (id, pubkey, kind, created_at, d_tag, tags_serialized, raw)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id,
                pubkey,
                kind,
                created_at,
                replace.as_ref().map(|(_, _, d_tag)| d_tag.as_str()),
                serialize_tags(&event),
                raw_json
            ],
        )?;
        {
            let mut insert_tag =
                tx.prepare("INSERT INTO event_tags (event_id, key, value) VALUES (?1, ?2, ?3)")?;
            for (key, value) in indexed_tags(&event) {
                insert_tag.execute(params![id, key, value])?;
            }
        }
        tx.commit()?;
        Ok(SaveOutcome::Inserted(event))
    }
}

fn row_to_notification(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, String, String, String, i64)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn decode_notification(
    (id, pubkey, kind, pubkeys, created_at): (String, String, String, String, i64),
) -> Result<PersistentNotification, StoreError> {
    let kind = NotificationKind::parse(&kind)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown notification kind {}", kind)))?;
    let pubkeys: Vec<String> =
        serde_json::from_str(&pubkeys).map_err(|e| StoreError::Corrupt(e.to_string()))?;
    Ok(PersistentNotification {
        id,
        pubkey,
        kind,
        pubkeys,
        created_at: created_at.max(0) as u64,
    })
}

impl NotificationStore for SqliteStore {
    fn latest_notification(
        &self,
        _ctx: &BgContext,
        pubkey: &str,
        kind: NotificationKind,
    ) -> Result<Option<PersistentNotification>, StoreError> {
        let row = self
            .conn
            .lock()
            .query_row(
                "SELECT id, pubkey, kind, pubkeys, created_at FROM notifications
                 WHERE pubkey = ?1 AND kind = ?2
                 ORDER BY created_at DESC LIMIT 1",
                params![pubkey, kind.as_str()],
                row_to_notification,
            )
            .optional()?;
        row.map(decode_notification).transpose()
    }

    fn create_notification(
        &self,
        _ctx: &BgContext,
        notification: &PersistentNotification,
    ) -> Result<(), StoreError> {
        let pubkeys = serde_json::to_string(&notification.pubkeys)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        self.conn.lock().execute(
            "INSERT INTO notifications (id, pubkey, kind, pubkeys, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                notification.id,
                notification.pubkey,
                notification.kind.as_str(),
                pubkeys,
                notification.created_at as i64
            ],
        )?;
        Ok(())
    }

    fn notifications(
        &self,
        _ctx: &BgContext,
        pubkey: &str,
        limit: usize,
    ) -> Result<Vec<PersistentNotification>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, pubkey, kind, pubkeys, created_at FROM notifications
             WHERE pubkey = ?1 ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![pubkey, limit as i64], row_to_notification)?;
        let mut notifications = Vec::new();
        for row in rows {
            notifications.push(decode_notification(row?)?);
        }
        Ok(notifications)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::kinds;
    use crate::store::test_util::{contact_list, note};
    use nostr::{EventBuilder, JsonUtil, Keys, Kind, Tag, Timestamp};
    use tempfile::tempdir;

    #[test]
    fn test_open_creates_database_file() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open(dir.path()).unwrap();
        assert_eq!(store.event_count().unwrap(), 0);
        assert!(dir.path().join("nostur.db").exists());
    }

    #[test]
    fn test_events_survive_reopen() {
        let dir = tempdir().unwrap();
        let ctx = BgContext::new();
        let event = note(&Keys::generate(), "persisted", 100);
        {
            let store = SqliteStore::open(dir.path()).unwrap();
            assert!(store.save_event(&ctx, &event.as_json()).unwrap().is_inserted());
            assert_eq!(
                store.save_event(&ctx, &event.as_json()).unwrap(),
                SaveOutcome::Duplicate(event.clone())
            );
        }
        let store = SqliteStore::open(dir.path()).unwrap();
        assert_eq!(store.event_count().unwrap(), 1);
        assert_eq!(store.fetch_event(&ctx, &event.id.to_hex()).unwrap(), Some(event));
    }

    #[test]
    fn test_exact_tag_index_and_replacement() {
        let ctx = BgContext::new();
        let store = SqliteStore::open_in_memory().unwrap();
        let me = Keys::generate();
        let (a, b) = (Keys::generate(), Keys::generate());
        store
            .save_event(&ctx, &contact_list(&a, &[&me], 100).as_json())
            .unwrap();
        store
            .save_event(&ctx, &contact_list(&b, &[&me], 100).as_json())
            .unwrap();
        // b unfollows
        store
            .save_event(&ctx, &contact_list(&b, &[&a], 200).as_json())
            .unwrap();
        // b's older list replayed late is not stored again
        let replayed = contact_list(&b, &[&me], 150);
        assert_eq!(
            store.save_event(&ctx, &replayed.as_json()).unwrap(),
            SaveOutcome::Superseded(replayed)
        );

        let query = EventQuery::new()
            .kind(kinds::CONTACT_LIST)
            .tag("p", me.public_key().to_hex(), TagMatch::Exact);
        let followers = store.fetch_events(&ctx, &query).unwrap();
        assert_eq!(followers.len(), 1);
        assert_eq!(followers[0].pubkey, a.public_key());
        assert_eq!(store.event_count().unwrap(), 2);
    }

    #[test]
    fn test_serialized_contains_false_positive() {
        // A pubkey in a non-p tag still matches the substring search when its
        // serialized neighbour happens to be "p"
        let ctx = BgContext::new();
        let store = SqliteStore::open_in_memory().unwrap();
        let me = Keys::generate();
        let author = Keys::generate();
        let hex = me.public_key().to_hex();
        let tricky = EventBuilder::new(Kind::ContactList, "")
            .tag(Tag::parse(["x", "p", hex.as_str()]).unwrap())
            .custom_created_at(Timestamp::from(100))
            .sign_with_keys(&author)
            .unwrap();
        store.save_event(&ctx, &tricky.as_json()).unwrap();

        let exact = EventQuery::new().tag("p", hex.clone(), TagMatch::Exact);
        assert!(store.fetch_events(&ctx, &exact).unwrap().is_empty());
        let legacy = EventQuery::new().tag("p", hex, TagMatch::SerializedContains);
        assert_eq!(store.fetch_events(&ctx, &legacy).unwrap().len(), 1);
    }

    #[test]
    fn test_query_filters() {
        let ctx = BgContext::new();
        let store = SqliteStore::open_in_memory().unwrap();
        let author = Keys::generate();
        let other = Keys::generate();
        for ts in [100, 200, 300] {
            store
                .save_event(&ctx, &note(&author, "n", ts).as_json())
                .unwrap();
        }
        let foreign = note(&other, "o", 250);
        store.save_event(&ctx, &foreign.as_json()).unwrap();

        let query = EventQuery::new()
            .author(author.public_key().to_hex())
            .since(150)
            .limit(5);
        let created: Vec<u64> = store
            .fetch_events(&ctx, &query)
            .unwrap()
            .iter()
            .map(|e| e.created_at.as_u64())
            .collect();
        assert_eq!(created, vec![300, 200]);

        let by_id = EventQuery::new().id(foreign.id.to_hex());
        assert_eq!(store.fetch_events(&ctx, &by_id).unwrap(), vec![foreign]);
    }

    #[test]
    fn test_notifications_roundtrip_and_latest() {
        let ctx = BgContext::new();
        let store = SqliteStore::open_in_memory().unwrap();
        let first = PersistentNotification::new_followers("me", vec!["a".into()], 100);
        let second = PersistentNotification::new_followers("me", vec!["b".into(), "c".into()], 200);
        store.create_notification(&ctx, &first).unwrap();
        store.create_notification(&ctx, &second).unwrap();

        let latest = store
            .latest_notification(&ctx, "me", NotificationKind::NewFollowers)
            .unwrap();
        assert_eq!(latest, Some(second.clone()));
        assert!(store
            .latest_notification(&ctx, "someone", NotificationKind::NewFollowers)
            .unwrap()
            .is_none());
        assert_eq!(store.notifications(&ctx, "me", 10).unwrap(), vec![second, first]);
    }
}
