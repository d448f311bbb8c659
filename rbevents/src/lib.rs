//! # rbevents — the Event Store
//!
//! A durable timeline with live pub/sub: one `event_log` table plus an
//! `event_detail` side table, not a general-purpose database. Every
//! `start_event`/`end_event`/`update_event` call both writes to SQLite and
//! publishes a message to subscribers over a bounded, drop-oldest channel.
//!
//! If the database cannot be opened the store still constructs — it just
//! becomes a no-op in-memory stub (`start_event` returns [`rbtypes::NO_EVENT_ID`],
//! everything else silently does nothing). The rest of the system should
//! never have to special-case a missing event store.

pub mod error;

pub use error::{Error, Result};

use chrono::{DateTime, Utc};
use rbtypes::{EventStatus, TimelineEvent, NO_EVENT_ID};
use rusqlite::{params, params_from_iter, Connection};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::broadcast;

const SUBSCRIBER_CAPACITY: usize = 256;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS event_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_type TEXT NOT NULL,
    lane TEXT NOT NULL,
    title TEXT NOT NULL,
    started_at TEXT NOT NULL,
    ended_at TEXT,
    status TEXT NOT NULL DEFAULT 'active',
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS event_detail (
    event_id INTEGER NOT NULL REFERENCES event_log(id),
    key TEXT NOT NULL,
    value TEXT,
    PRIMARY KEY (event_id, key)
);
CREATE INDEX IF NOT EXISTS idx_event_log_started ON event_log(started_at);
CREATE INDEX IF NOT EXISTS idx_event_log_lane ON event_log(lane);
CREATE INDEX IF NOT EXISTS idx_event_log_status ON event_log(status);
";

/// A published change to the timeline. Subscribers see the same three
/// shapes the store itself writes: a new row, a closed row, or a field
/// patch.
#[derive(Clone)]
pub enum EventMessage {
    Start(TimelineEvent),
    End {
        id: i64,
        ended_at: DateTime<Utc>,
        status: EventStatus,
    },
    Update {
        id: i64,
        title: Option<String>,
        status: Option<EventStatus>,
        started_at: Option<DateTime<Utc>>,
        ended_at: Option<DateTime<Utc>>,
    },
}

/// Fields `update_event` is allowed to touch. Anything else is rejected
/// silently by virtue of not having a slot here.
#[derive(Debug, Clone, Default)]
pub struct EventUpdate {
    pub title: Option<String>,
    pub status: Option<EventStatus>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

pub struct EventStore {
    conn: Option<Arc<StdMutex<Connection>>>,
    tx: broadcast::Sender<EventMessage>,
    last_music_z_stagger: Arc<StdMutex<bool>>,
}

impl EventStore {
    /// Opens (or creates) the database at `db_path`, runs crash recovery,
    /// and recovers `last_music_z_stagger`. Never fails: a connection error
    /// degrades the store to its in-memory no-op mode and is logged at
    /// `warn`.
    pub fn open(db_path: &Path) -> Self {
        let (tx, _rx) = broadcast::channel(SUBSCRIBER_CAPACITY);
        let conn = match Self::open_connection(db_path) {
            Ok(conn) => Some(Arc::new(StdMutex::new(conn))),
            Err(e) => {
                tracing::warn!(error = %e, "event store unavailable, continuing in-memory");
                None
            }
        };

        let store = Self {
            conn,
            tx,
            last_music_z_stagger: Arc::new(StdMutex::new(false)),
        };

        if store.conn.is_some() {
            if let Err(e) = store.recover() {
                tracing::warn!(error = %e, "event store crash recovery failed");
            }
        }

        store
    }

    fn open_connection(db_path: &Path) -> rusqlite::Result<Connection> {
        if let Some(parent) = db_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(conn)
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Option<T> {
        let conn = self.conn.as_ref()?;
        let guard = conn.lock().unwrap();
        f(&guard).ok()
    }

    /// Closes any `active`/`scheduled` rows orphaned by a previous process,
    /// zero-width (`ended_at := started_at`), then recovers the last
    /// music-lane z_stagger bit so alternation survives a restart.
    fn recover(&self) -> rusqlite::Result<()> {
        let conn_arc = self.conn.as_ref().expect("recover called on closed store");
        let conn = conn_arc.lock().unwrap();

        let active_closed = conn.execute(
            "UPDATE event_log SET ended_at = COALESCE(ended_at, started_at), status = 'completed' \
             WHERE status = 'active'",
            [],
        )?;
        let scheduled_closed = conn.execute(
            "UPDATE event_log SET ended_at = COALESCE(ended_at, started_at), status = 'cancelled' \
             WHERE status = 'scheduled'",
            [],
        )?;
        if active_closed + scheduled_closed > 0 {
            tracing::info!(
                active_closed,
                scheduled_closed,
                "closed orphaned events from previous run"
            );
        }

        let z: Option<String> = conn
            .query_row(
                "SELECT d.value FROM event_detail d JOIN event_log e ON d.event_id = e.id \
                 WHERE e.lane = 'music' AND d.key = 'z_stagger' ORDER BY e.id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .ok();
        if let Some(raw) = z {
            if let Ok(value) = serde_json::from_str::<bool>(&raw) {
                *self.last_music_z_stagger.lock().unwrap() = value;
            }
        }

        Ok(())
    }

    /// Inserts a new event and publishes it. Returns [`rbtypes::NO_EVENT_ID`]
    /// if the store is closed.
    pub async fn start_event(
        &self,
        event_type: &str,
        lane: &str,
        title: &str,
        details: HashMap<String, serde_json::Value>,
        status: EventStatus,
        started_at: Option<DateTime<Utc>>,
    ) -> i64 {
        let Some(conn_arc) = self.conn.as_ref() else {
            return NO_EVENT_ID;
        };

        let now = Utc::now();
        let ts = started_at.unwrap_or(now);

        let id = {
            let conn = conn_arc.lock().unwrap();
            let inserted = conn.execute(
                "INSERT INTO event_log (event_type, lane, title, started_at, ended_at, status, created_at) \
                 VALUES (?1, ?2, ?3, ?4, NULL, ?5, ?6)",
                params![event_type, lane, title, ts.to_rfc3339(), status.as_str(), now.to_rfc3339()],
            );
            let Ok(_) = inserted else {
                return NO_EVENT_ID;
            };
            let id = conn.last_insert_rowid();
            for (key, value) in &details {
                let _ = conn.execute(
                    "INSERT INTO event_detail (event_id, key, value) VALUES (?1, ?2, ?3)",
                    params![id, key, value.to_string()],
                );
            }
            id
        };

        if lane == "music" {
            if let Some(z) = details.get("z_stagger").and_then(|v| v.as_bool()) {
                *self.last_music_z_stagger.lock().unwrap() = z;
            }
        }

        self.publish(EventMessage::Start(TimelineEvent {
            id,
            event_type: event_type.to_string(),
            lane: lane.to_string(),
            title: title.to_string(),
            started_at: ts,
            ended_at: None,
            status,
            created_at: now,
            details,
        }));

        id
    }

    /// Marks an event ended. No-op on a closed store or a sentinel id.
    pub async fn end_event(
        &self,
        id: i64,
        status: EventStatus,
        extra_details: Option<HashMap<String, serde_json::Value>>,
    ) {
        if id < 0 {
            return;
        }
        let Some(conn_arc) = self.conn.as_ref() else {
            return;
        };

        let now = Utc::now();
        {
            let conn = conn_arc.lock().unwrap();
            let _ = conn.execute(
                "UPDATE event_log SET ended_at = ?1, status = ?2 WHERE id = ?3",
                params![now.to_rfc3339(), status.as_str(), id],
            );
            if let Some(details) = &extra_details {
                for (key, value) in details {
                    let _ = conn.execute(
                        "INSERT OR REPLACE INTO event_detail (event_id, key, value) VALUES (?1, ?2, ?3)",
                        params![id, key, value.to_string()],
                    );
                }
            }
        }

        self.publish(EventMessage::End {
            id,
            ended_at: now,
            status,
        });
    }

    /// Patches `title`/`status`/`started_at`/`ended_at`. No-op if nothing
    /// in `update` is set, the store is closed, or `id` is a sentinel.
    pub async fn update_event(&self, id: i64, update: EventUpdate) {
        if id < 0 {
            return;
        }
        let Some(conn_arc) = self.conn.as_ref() else {
            return;
        };
        if update.title.is_none()
            && update.status.is_none()
            && update.started_at.is_none()
            && update.ended_at.is_none()
        {
            return;
        }

        {
            let conn = conn_arc.lock().unwrap();
            let mut set_clauses = Vec::new();
            let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

            if let Some(title) = &update.title {
                set_clauses.push("title = ?");
                values.push(Box::new(title.clone()));
            }
            if let Some(status) = update.status {
                set_clauses.push("status = ?");
                values.push(Box::new(status.as_str().to_string()));
            }
            if let Some(started_at) = update.started_at {
                set_clauses.push("started_at = ?");
                values.push(Box::new(started_at.to_rfc3339()));
            }
            if let Some(ended_at) = update.ended_at {
                set_clauses.push("ended_at = ?");
                values.push(Box::new(ended_at.to_rfc3339()));
            }
            values.push(Box::new(id));

            let sql = format!(
                "UPDATE event_log SET {} WHERE id = ?",
                set_clauses.join(", ")
            );
            let params: Vec<&dyn rusqlite::ToSql> = values.iter().map(|v| v.as_ref()).collect();
            let _ = conn.execute(&sql, params_from_iter(params));
        }

        self.publish(EventMessage::Update {
            id,
            title: update.title,
            status: update.status,
            started_at: update.started_at,
            ended_at: update.ended_at,
        });
    }

    /// Returns events whose `[started_at, ended_at or +inf)` intersects
    /// `[start_ts, end_ts]`, ordered by `started_at`, with details batch-joined.
    pub async fn get_window(
        &self,
        start_ts: DateTime<Utc>,
        end_ts: DateTime<Utc>,
        lanes: Option<&[String]>,
    ) -> Vec<TimelineEvent> {
        let Some(conn_arc) = self.conn.as_ref() else {
            return Vec::new();
        };
        let conn = conn_arc.lock().unwrap();

        let mut sql = String::from(
            "SELECT id, event_type, lane, title, started_at, ended_at, status, created_at \
             FROM event_log WHERE started_at <= ?1 AND (ended_at IS NULL OR ended_at >= ?2)",
        );
        let mut bind: Vec<Box<dyn rusqlite::ToSql>> =
            vec![Box::new(end_ts.to_rfc3339()), Box::new(start_ts.to_rfc3339())];

        if let Some(lanes) = lanes {
            if !lanes.is_empty() {
                let placeholders = lanes
                    .iter()
                    .map(|_| "?")
                    .collect::<Vec<_>>()
                    .join(",");
                sql.push_str(&format!(" AND lane IN ({placeholders})"));
                for lane in lanes {
                    bind.push(Box::new(lane.clone()));
                }
            }
        }
        sql.push_str(" ORDER BY started_at");

        let bind_refs: Vec<&dyn rusqlite::ToSql> = bind.iter().map(|v| v.as_ref()).collect();

        let mut stmt = match conn.prepare(&sql) {
            Ok(stmt) => stmt,
            Err(_) => return Vec::new(),
        };
        let rows = stmt.query_map(params_from_iter(bind_refs), |row| {
            let started_at: String = row.get(4)?;
            let ended_at: Option<String> = row.get(5)?;
            let status: String = row.get(6)?;
            let created_at: String = row.get(7)?;
            Ok(TimelineEvent {
                id: row.get(0)?,
                event_type: row.get(1)?,
                lane: row.get(2)?,
                title: row.get(3)?,
                started_at: parse_ts(&started_at),
                ended_at: ended_at.as_deref().map(parse_ts),
                status: EventStatus::parse(&status).unwrap_or(EventStatus::Completed),
                created_at: parse_ts(&created_at),
                details: HashMap::new(),
            })
        });

        let mut events: Vec<TimelineEvent> = match rows {
            Ok(rows) => rows.filter_map(|r| r.ok()).collect(),
            Err(_) => return Vec::new(),
        };

        if events.is_empty() {
            return events;
        }

        let ids: Vec<i64> = events.iter().map(|e| e.id).collect();
        let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let detail_sql = format!(
            "SELECT event_id, key, value FROM event_detail WHERE event_id IN ({placeholders})"
        );
        let id_refs: Vec<&dyn rusqlite::ToSql> = ids.iter().map(|v| v as &dyn rusqlite::ToSql).collect();
        if let Ok(mut stmt) = conn.prepare(&detail_sql) {
            if let Ok(rows) = stmt.query_map(params_from_iter(id_refs), |row| {
                let event_id: i64 = row.get(0)?;
                let key: String = row.get(1)?;
                let value: String = row.get(2)?;
                Ok((event_id, key, value))
            }) {
                let mut by_id: HashMap<i64, HashMap<String, serde_json::Value>> = HashMap::new();
                for row in rows.filter_map(|r| r.ok()) {
                    let (event_id, key, raw) = row;
                    let value = serde_json::from_str(&raw).unwrap_or(serde_json::Value::String(raw));
                    by_id.entry(event_id).or_default().insert(key, value);
                }
                for event in &mut events {
                    if let Some(details) = by_id.remove(&event.id) {
                        event.details = details;
                    }
                }
            }
        }

        events
    }

    /// Returns the filename from the most recent music-lane event, if any.
    pub async fn last_music_filename(&self) -> Option<String> {
        let raw = self.with_conn(|conn| {
            conn.query_row(
                "SELECT d.value FROM event_detail d JOIN event_log e ON d.event_id = e.id \
                 WHERE e.lane = 'music' AND d.key = 'filename' ORDER BY e.id DESC LIMIT 1",
                [],
                |row| row.get::<_, String>(0),
            )
        })?;
        serde_json::from_str(&raw).ok()
    }

    /// The z_stagger bit to alternate from for the next queued music track,
    /// recovered at open and updated on every music-lane `start_event`.
    pub fn last_music_z_stagger(&self) -> bool {
        *self.last_music_z_stagger.lock().unwrap()
    }

    /// Returns a receiver that gets every published message from here on,
    /// bounded to 256 buffered messages with oldest-dropped-first semantics
    /// for a receiver that falls behind.
    pub fn subscribe(&self) -> broadcast::Receiver<EventMessage> {
        self.tx.subscribe()
    }

    /// Drops the receiver. Kept as an explicit call for symmetry with
    /// `subscribe`, since `broadcast::Receiver` has no shared state to
    /// release beyond being dropped.
    pub fn unsubscribe(&self, rx: broadcast::Receiver<EventMessage>) {
        drop(rx);
    }

    fn publish(&self, message: EventMessage) {
        let _ = self.tx.send(message);
    }
}

fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_store() -> (EventStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = EventStore::open(&dir.path().join("events.db"));
        (store, dir)
    }

    #[tokio::test]
    async fn start_end_round_trips_through_get_window() {
        let (store, _dir) = open_store();
        let start = Utc::now();
        let id = store
            .start_event("track_play", "music", "Song A", HashMap::new(), EventStatus::Active, None)
            .await;
        assert!(id >= 0);

        store.end_event(id, EventStatus::Completed, None).await;

        let end = Utc::now() + chrono::Duration::seconds(1);
        let events = store.get_window(start - chrono::Duration::seconds(1), end, None).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, EventStatus::Completed);
    }

    #[tokio::test]
    async fn closed_store_returns_sentinel_and_noops() {
        // A directory that can't hold a sqlite file forces open_connection to fail.
        let bad_path = Path::new("/dev/null/not-a-real-dir/events.db");
        let store = EventStore::open(bad_path);

        let id = store
            .start_event("track_play", "music", "x", HashMap::new(), EventStatus::Active, None)
            .await;
        assert_eq!(id, rbtypes::NO_EVENT_ID);

        store.end_event(-1, EventStatus::Completed, None).await;
        store
            .update_event(-1, EventUpdate { title: Some("y".into()), ..Default::default() })
            .await;
        assert!(store.get_window(Utc::now(), Utc::now(), None).await.is_empty());
    }

    #[tokio::test]
    async fn recovery_closes_orphaned_rows_zero_width() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("events.db");

        {
            let store = EventStore::open(&db_path);
            let _ = store
                .start_event("track_play", "music", "A", HashMap::new(), EventStatus::Active, None)
                .await;
            let _ = store
                .start_event("voice_segment", "system", "B", HashMap::new(), EventStatus::Scheduled, None)
                .await;
        }

        let reopened = EventStore::open(&db_path);
        let events = reopened
            .get_window(Utc::now() - chrono::Duration::days(1), Utc::now() + chrono::Duration::days(1), None)
            .await;
        assert_eq!(events.len(), 2);
        for event in &events {
            assert!(matches!(event.status, EventStatus::Completed | EventStatus::Cancelled));
            assert_eq!(event.started_at, event.ended_at.unwrap());
        }
    }

    #[tokio::test]
    async fn subscriber_receives_published_messages() {
        let (store, _dir) = open_store();
        let mut rx = store.subscribe();

        let id = store
            .start_event("track_play", "music", "Song A", HashMap::new(), EventStatus::Active, None)
            .await;
        match rx.recv().await.unwrap() {
            EventMessage::Start(event) => assert_eq!(event.id, id),
            other => panic!("unexpected message: {other:?}"),
        }

        store.end_event(id, EventStatus::Completed, None).await;
        match rx.recv().await.unwrap() {
            EventMessage::End { id: ended_id, status, .. } => {
                assert_eq!(ended_id, id);
                assert_eq!(status, EventStatus::Completed);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn z_stagger_survives_restart() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("events.db");

        {
            let store = EventStore::open(&db_path);
            let mut details = HashMap::new();
            details.insert("z_stagger".to_string(), serde_json::Value::Bool(true));
            store
                .start_event("track_play", "music", "A", details, EventStatus::Active, None)
                .await;
            assert!(store.last_music_z_stagger());
        }

        let reopened = EventStore::open(&db_path);
        assert!(reopened.last_music_z_stagger());
    }
}

impl std::fmt::Debug for EventMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventMessage::Start(event) => f.debug_tuple("Start").field(&event.id).finish(),
            EventMessage::End { id, status, .. } => {
                f.debug_struct("End").field("id", id).field("status", status).finish()
            }
            EventMessage::Update { id, .. } => f.debug_struct("Update").field("id", id).finish(),
        }
    }
}
