//! # rbplaylist — the Playlist Planner
//!
//! Owns the in-memory lookahead queue, keeps the mixer's music queue in
//! sync with it, persists queue and history across restarts, and projects
//! predicted start/end times for every queued track so other observers can
//! predict the future timeline.
//!
//! Queue mutations — `advance`, `insert_track`, `remove_track`,
//! `move_track` — are all serialized by one lock; the mixer resync and
//! event-store writes performed inside a mutation happen while that lock is
//! held, so from the outside each mutation is atomic.

pub mod error;

pub use error::{Error, Result};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rbevents::{EventStore, EventUpdate};
use rblibrary::LibraryScanner;
use rbmixer::Client as MixerClient;
use rbplugin::SelectionStrategy;
use rbtypes::{EventStatus, HistoryEntry, QueueEntry, Track};
use rusqlite::{params, Connection};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

const SUBSCRIBER_CAPACITY: usize = 256;
const HISTORY_CACHE_CAP: usize = 50;
const DEFAULT_LOOKAHEAD: usize = 5;
const FILL_MAX_ATTEMPTS: u32 = 5;
const STOP_CEILING: Duration = Duration::from_secs(8);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS playlist_queue (
    position INTEGER PRIMARY KEY,
    file_path TEXT NOT NULL,
    metadata TEXT NOT NULL,
    tts_status TEXT,
    tts_path TEXT,
    z_stagger INTEGER NOT NULL DEFAULT 0,
    event_id INTEGER
);
CREATE TABLE IF NOT EXISTS playlist_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    file_path TEXT NOT NULL,
    played_at TEXT NOT NULL,
    planned_position INTEGER
);
";

/// What Stream Context observed at the moment the filename changed.
#[derive(Debug, Clone)]
pub struct AdvanceInput {
    pub filename: String,
    pub remaining_seconds: f64,
    pub elapsed_seconds: f64,
    /// Consumed from Stream Context's one-shot skip flag (§4.5.2); decides
    /// whether the closing event is `skipped` or `completed`.
    pub skip_signaled: bool,
}

/// Broadcast to queue observers and the Voice Scheduler's TTS pre-generator.
#[derive(Debug, Clone)]
pub enum PlannerMessage {
    QueueChanged(Vec<QueueEntry>),
    /// `(entry, position)` — fired for the N+2 slot so pre-generation can
    /// start while the N+1 slot is still playing.
    TtsNeeded(QueueEntry, usize),
}

struct PlannerState {
    library: Vec<Track>,
    upcoming: Vec<QueueEntry>,
    history: VecDeque<HistoryEntry>,
    feeder: Option<Box<dyn SelectionStrategy>>,
    active_event_id: Option<i64>,
}

struct Inner {
    state: Mutex<PlannerState>,
    conn: Arc<StdMutex<Connection>>,
    scanner: Arc<LibraryScanner>,
    events: Arc<EventStore>,
    mixer: Arc<MixerClient>,
    tx: broadcast::Sender<PlannerMessage>,
    lookahead: usize,
    crossfade_duration: StdMutex<f32>,
    rescan_task: StdMutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

/// Cheap-to-clone handle to the planner; cloning shares the same lock and
/// backing state, mirroring the way a singleton manager is usually passed
/// around by reference in this workspace.
pub struct Planner {
    inner: Arc<Inner>,
}

impl Clone for Planner {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl Planner {
    pub fn new(
        db_path: &Path,
        scanner: Arc<LibraryScanner>,
        events: Arc<EventStore>,
        mixer: Arc<MixerClient>,
        lookahead: Option<usize>,
    ) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch(SCHEMA)?;

        Ok(Self {
            inner: Arc::new(Inner {
                state: Mutex::new(PlannerState {
                    library: Vec::new(),
                    upcoming: Vec::new(),
                    history: VecDeque::new(),
                    feeder: None,
                    active_event_id: None,
                }),
                conn: Arc::new(StdMutex::new(conn)),
                scanner,
                events,
                mixer,
                tx: broadcast::channel(SUBSCRIBER_CAPACITY).0,
                lookahead: lookahead.unwrap_or(DEFAULT_LOOKAHEAD),
                crossfade_duration: StdMutex::new(5.0),
                rescan_task: StdMutex::new(None),
                stopped: AtomicBool::new(false),
            }),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlannerMessage> {
        self.inner.tx.subscribe()
    }

    pub fn set_crossfade_duration(&self, seconds: f32) {
        *self.inner.crossfade_duration.lock().unwrap() = seconds;
    }

    /// §4.4.5: load library/queue/history from DB, clear stale event ids
    /// left on loaded queue entries (the store's own crash recovery already
    /// cancelled them), push the persisted queue to the mixer with no fill,
    /// kick off a fresh scan, then start the periodic rescan loop.
    pub async fn start(&self, scan_root: PathBuf, scan_interval: Duration) -> Result<()> {
        {
            let mut state = self.inner.state.lock().await;
            state.library = self.inner.scanner.load_all().map_err(|e| Error::Other(e.into()))?;

            let mut queue = self.load_queue()?;
            for entry in &mut queue {
                entry.event_id = None;
            }
            state.upcoming = queue;
            state.history = self.load_history(HISTORY_CACHE_CAP, 0)?.into_iter().collect();

            for entry in &state.upcoming {
                self.inner.mixer.queue_music(Path::new(&entry.file_path)).await;
            }
        }

        let scanner = self.inner.scanner.clone();
        let root = scan_root.clone();
        tokio::spawn(async move {
            if let Err(e) = scanner.scan_directory(root).await {
                tracing::warn!(error = %e, "initial library scan failed");
            }
        });

        let this = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(scan_interval).await;
                if this.inner.stopped.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(e) = this.inner.scanner.scan_directory(scan_root.clone()).await {
                    tracing::warn!(error = %e, "periodic library rescan failed");
                    continue;
                }
                match this.inner.scanner.load_all() {
                    Ok(tracks) => {
                        let mut state = this.inner.state.lock().await;
                        state.library = tracks;
                    }
                    Err(e) => tracing::warn!(error = %e, "failed to reload library after rescan"),
                }
            }
        });
        *self.inner.rescan_task.lock().unwrap() = Some(handle);

        Ok(())
    }

    /// Signals the periodic rescan loop to stop after its current sleep and
    /// waits for it, up to an 8s ceiling.
    pub async fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        let handle = self.inner.rescan_task.lock().unwrap().take();
        if let Some(handle) = handle {
            if tokio::time::timeout(STOP_CEILING, handle).await.is_err() {
                tracing::warn!("playlist rescan loop did not stop within the shutdown ceiling");
            }
        }
    }

    /// Registers the feeder and kicks off a deferred fill (§4.4.3).
    pub async fn set_feeder(&self, strategy: Box<dyn SelectionStrategy>) {
        {
            let mut state = self.inner.state.lock().await;
            state.feeder = Some(strategy);
        }
        let this = self.clone();
        tokio::spawn(async move {
            this.deferred_fill().await;
        });
    }

    pub async fn clear_feeder(&self) {
        let mut state = self.inner.state.lock().await;
        state.feeder = None;
    }

    /// Up to 5 attempts with linearly increasing backoff (2,4,6,8,10 s).
    /// Success is either the engine confirms at least one queued entry, or
    /// the planner queue is empty (nothing to push in the first place).
    async fn deferred_fill(&self) {
        for attempt in 0..FILL_MAX_ATTEMPTS {
            {
                let mut state = self.inner.state.lock().await;
                self.fill_locked(&mut state).await;
                self.recompute_projection(&mut state, -1.0).await;
                self.persist_queue(&state.upcoming);
                let _ = self.inner.tx.send(PlannerMessage::QueueChanged(state.upcoming.clone()));

                let empty = state.upcoming.is_empty();
                drop(state);

                if empty {
                    return;
                }
            }
            if self.inner.mixer.music_queue_length().await >= 1 {
                return;
            }
            tokio::time::sleep(Duration::from_secs(2 * (attempt as u64 + 1))).await;
        }
        tracing::warn!("deferred fill exhausted all attempts without a confirmed mixer queue");
    }

    /// §4.4.1 — invoked when Stream Context reports a new filename.
    pub async fn advance(&self, input: AdvanceInput) -> Vec<QueueEntry> {
        let mut state = self.inner.state.lock().await;

        // 1. End the previous active music event.
        if let Some(active_id) = state.active_event_id.take() {
            let status = if input.skip_signaled { EventStatus::Skipped } else { EventStatus::Completed };
            self.inner.events.end_event(active_id, status, None).await;
        }

        // 2. Append a history entry, resolved to a full path if found.
        let resolved_path = resolve_path(&state.library, &input.filename);
        let played_at = Utc::now();

        // 3. Remove the matching entry: prefer index 0, else first basename match.
        let removed = if !state.upcoming.is_empty() && basename_matches(&state.upcoming[0].file_path, &input.filename) {
            Some(state.upcoming.remove(0))
        } else if let Some(pos) = state
            .upcoming
            .iter()
            .position(|e| basename_matches(&e.file_path, &input.filename))
        {
            Some(state.upcoming.remove(pos))
        } else {
            None
        };
        let planned_position = removed.as_ref().map(|e| e.position);
        renumber(&mut state.upcoming);

        let history_id = self
            .append_history(&resolved_path, played_at, planned_position)
            .unwrap_or(-1);
        state.history.push_front(HistoryEntry {
            id: history_id,
            file_path: resolved_path,
            played_at,
            planned_position,
        });
        while state.history.len() > HISTORY_CACHE_CAP {
            state.history.pop_back();
        }

        // 4. If the removed entry's event is still scheduled, make it active
        // with wall-clock-true start/end taken from Stream Context.
        if let Some(entry) = &removed {
            if let Some(event_id) = entry.event_id {
                let started_at = Utc::now() - millis(input.elapsed_seconds.max(0.0));
                let ended_at = Utc::now() + millis(input.remaining_seconds.max(0.0));
                self.inner
                    .events
                    .update_event(
                        event_id,
                        EventUpdate {
                            status: Some(EventStatus::Active),
                            started_at: Some(started_at),
                            ended_at: Some(ended_at),
                            ..Default::default()
                        },
                    )
                    .await;
                state.active_event_id = Some(event_id);
            }
        }

        // 5 & 6. Refill the queue, pushing each newly added track to the mixer.
        self.fill_locked(&mut state).await;

        // 7. Recompute predicted start/end for every remaining scheduled event.
        self.recompute_projection(&mut state, input.remaining_seconds).await;

        // 8. Persist the queue snapshot.
        let snapshot = state.upcoming.clone();
        self.persist_queue(&snapshot);

        // 9. Emit queue_changed and, if long enough, tts_needed for slot 1.
        let _ = self.inner.tx.send(PlannerMessage::QueueChanged(snapshot.clone()));
        if snapshot.len() >= 2 {
            let _ = self
                .inner
                .tx
                .send(PlannerMessage::TtsNeeded(snapshot[1].clone(), 1));
        }

        snapshot
    }

    /// §4.4.2 — apply locally, flush and re-push the mixer's music queue,
    /// recompute event times, persist, emit `queue_changed`.
    pub async fn insert_track(&self, file_path: &str, pos: Option<usize>) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        let position = pos.unwrap_or(state.upcoming.len()).min(state.upcoming.len());
        let metadata = find_track(&state.library, file_path)
            .map(track_metadata_json)
            .unwrap_or(serde_json::Value::Null);

        state.upcoming.insert(
            position,
            QueueEntry {
                position,
                file_path: file_path.to_string(),
                metadata,
                tts_path: None,
                tts_status: None,
                z_stagger: false,
                event_id: None,
            },
        );
        renumber(&mut state.upcoming);
        let base = self.inner.events.last_music_z_stagger();
        reassign_stagger(&mut state.upcoming, base);

        self.resync_after_mutation(&mut state).await;
        Ok(())
    }

    pub async fn remove_track(&self, pos: usize) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        if pos >= state.upcoming.len() {
            return Err(Error::PositionOutOfRange(pos));
        }
        let removed = state.upcoming.remove(pos);
        renumber(&mut state.upcoming);
        let base = self.inner.events.last_music_z_stagger();
        reassign_stagger(&mut state.upcoming, base);

        if let Some(event_id) = removed.event_id {
            self.inner
                .events
                .update_event(event_id, EventUpdate { status: Some(EventStatus::Skipped), ..Default::default() })
                .await;
        }

        self.resync_after_mutation(&mut state).await;
        Ok(())
    }

    pub async fn move_track(&self, from: usize, to: usize) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        if from >= state.upcoming.len() || to >= state.upcoming.len() {
            return Err(Error::PositionOutOfRange(from.max(to)));
        }
        let entry = state.upcoming.remove(from);
        state.upcoming.insert(to, entry);
        renumber(&mut state.upcoming);
        let base = self.inner.events.last_music_z_stagger();
        reassign_stagger(&mut state.upcoming, base);

        self.resync_after_mutation(&mut state).await;
        Ok(())
    }

    pub async fn get_history(&self, limit: usize, offset: usize) -> Vec<HistoryEntry> {
        self.load_history(limit, offset).unwrap_or_default()
    }

    /// Read-only copy of the upcoming queue, for Stream Context's
    /// enrichment policy (§4.5.1 matches this before falling back to the
    /// full library).
    pub async fn upcoming_snapshot(&self) -> Vec<QueueEntry> {
        self.inner.state.lock().await.upcoming.clone()
    }

    /// Read-only copy of the scanned library, for the same enrichment
    /// fallback.
    pub async fn library_snapshot(&self) -> Vec<Track> {
        self.inner.state.lock().await.library.clone()
    }

    async fn resync_after_mutation(&self, state: &mut PlannerState) {
        self.inner.mixer.flush_music().await;
        for entry in &state.upcoming {
            self.inner.mixer.queue_music(Path::new(&entry.file_path)).await;
        }
        self.recompute_projection(state, -1.0).await;
        self.persist_queue(&state.upcoming);
        let _ = self.inner.tx.send(PlannerMessage::QueueChanged(state.upcoming.clone()));
    }

    /// Invokes the feeder until `lookahead` is reached or it returns null,
    /// assigning an alternating z_stagger bit and pushing each new track to
    /// the mixer as it's added.
    async fn fill_locked(&self, state: &mut PlannerState) -> usize {
        let mut added = 0;
        loop {
            if state.upcoming.len() >= self.inner.lookahead {
                break;
            }
            let Some(feeder) = state.feeder.as_mut() else {
                break;
            };
            let upcoming_tracks: Vec<Track> = state
                .upcoming
                .iter()
                .filter_map(|e| find_track(&state.library, &e.file_path).cloned())
                .collect();
            let history_vec: Vec<HistoryEntry> = state.history.iter().cloned().collect();

            let Some(track) = feeder.select_next(&state.library, &history_vec, &upcoming_tracks).await else {
                tracing::warn!("selection strategy starved, stopping fill");
                break;
            };

            let z_stagger = match state.upcoming.last() {
                Some(prev) => !prev.z_stagger,
                None => !self.inner.events.last_music_z_stagger(),
            };
            let entry = QueueEntry {
                position: state.upcoming.len(),
                file_path: track.file_path.clone(),
                metadata: track_metadata_json(&track),
                tts_path: None,
                tts_status: None,
                z_stagger,
                event_id: None,
            };

            self.inner.mixer.queue_music(Path::new(&entry.file_path)).await;
            state.upcoming.push(entry);
            added += 1;
        }
        added
    }

    /// §4.4.4 — chains predicted starts through the queue, creating a
    /// `scheduled` event for any entry that doesn't have one yet and
    /// updating the rest.
    async fn recompute_projection(&self, state: &mut PlannerState, remaining_seconds: f64) {
        let crossfade = *self.inner.crossfade_duration.lock().unwrap();
        let mut cursor = if remaining_seconds > 0.0 {
            Utc::now() + millis(remaining_seconds) - millis(crossfade as f64)
        } else {
            Utc::now()
        };

        for entry in &mut state.upcoming {
            let duration = find_track(&state.library, &entry.file_path)
                .map(|t| t.projection_duration_seconds())
                .unwrap_or(180);
            let start = cursor;
            let end = start + ChronoDuration::seconds(duration as i64);

            match entry.event_id {
                Some(id) => {
                    self.inner
                        .events
                        .update_event(
                            id,
                            EventUpdate { started_at: Some(start), ended_at: Some(end), ..Default::default() },
                        )
                        .await;
                }
                None => {
                    let mut details = std::collections::HashMap::new();
                    details.insert("filename".to_string(), serde_json::json!(entry.file_path));
                    details.insert("z_stagger".to_string(), serde_json::json!(entry.z_stagger));
                    let title = find_track(&state.library, &entry.file_path)
                        .and_then(|t| t.title.clone())
                        .unwrap_or_else(|| entry.file_path.clone());
                    let id = self
                        .inner
                        .events
                        .start_event("track_play", "music", &title, details, EventStatus::Scheduled, Some(start))
                        .await;
                    self.inner
                        .events
                        .update_event(id, EventUpdate { ended_at: Some(end), ..Default::default() })
                        .await;
                    entry.event_id = Some(id);
                }
            }

            cursor = end - millis(crossfade as f64);
        }
    }

    fn persist_queue(&self, upcoming: &[QueueEntry]) {
        let conn = self.inner.conn.lock().unwrap();
        let _ = conn.execute("DELETE FROM playlist_queue", []);
        for entry in upcoming {
            let _ = conn.execute(
                "INSERT INTO playlist_queue (position, file_path, metadata, tts_status, tts_path, z_stagger, event_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    entry.position as i64,
                    entry.file_path,
                    entry.metadata.to_string(),
                    entry.tts_status,
                    entry.tts_path,
                    entry.z_stagger as i64,
                    entry.event_id,
                ],
            );
        }
    }

    fn load_queue(&self) -> Result<Vec<QueueEntry>> {
        let conn = self.inner.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT position, file_path, metadata, tts_status, tts_path, z_stagger, event_id
             FROM playlist_queue ORDER BY position",
        )?;
        let rows = stmt.query_map([], |row| {
            let metadata_raw: String = row.get(2)?;
            let z_stagger: i64 = row.get(5)?;
            Ok(QueueEntry {
                position: row.get::<_, i64>(0)? as usize,
                file_path: row.get(1)?,
                metadata: serde_json::from_str(&metadata_raw).unwrap_or(serde_json::Value::Null),
                tts_status: row.get(3)?,
                tts_path: row.get(4)?,
                z_stagger: z_stagger != 0,
                event_id: row.get(6)?,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    fn append_history(&self, file_path: &str, played_at: DateTime<Utc>, planned_position: Option<usize>) -> Result<i64> {
        let conn = self.inner.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO playlist_history (file_path, played_at, planned_position) VALUES (?1, ?2, ?3)",
            params![file_path, played_at.to_rfc3339(), planned_position.map(|p| p as i64)],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn load_history(&self, limit: usize, offset: usize) -> Result<Vec<HistoryEntry>> {
        let conn = self.inner.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, file_path, played_at, planned_position FROM playlist_history
             ORDER BY id DESC LIMIT ?1 OFFSET ?2",
        )?;
        let rows = stmt.query_map(params![limit as i64, offset as i64], |row| {
            let played_at: String = row.get(2)?;
            let planned_position: Option<i64> = row.get(3)?;
            Ok(HistoryEntry {
                id: row.get(0)?,
                file_path: row.get(1)?,
                played_at: DateTime::parse_from_rfc3339(&played_at)
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
                planned_position: planned_position.map(|p| p as usize),
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }
}

fn millis(seconds: f64) -> ChronoDuration {
    ChronoDuration::milliseconds((seconds * 1000.0) as i64)
}

fn renumber(queue: &mut [QueueEntry]) {
    for (i, entry) in queue.iter_mut().enumerate() {
        entry.position = i;
    }
}

fn reassign_stagger(queue: &mut [QueueEntry], base: bool) {
    let mut prev = base;
    for entry in queue.iter_mut() {
        prev = !prev;
        entry.z_stagger = prev;
    }
}

fn basename(path: &str) -> &str {
    Path::new(path).file_name().and_then(|s| s.to_str()).unwrap_or(path)
}

fn basename_matches(a: &str, b: &str) -> bool {
    basename(a) == basename(b)
}

fn find_track<'a>(library: &'a [Track], file_path: &str) -> Option<&'a Track> {
    library
        .iter()
        .find(|t| basename_matches(&t.file_path, file_path))
        .or_else(|| library.iter().find(|t| t.file_path == file_path))
}

fn resolve_path(library: &[Track], filename: &str) -> String {
    find_track(library, filename)
        .map(|t| t.file_path.clone())
        .unwrap_or_else(|| filename.to_string())
}

fn track_metadata_json(track: &Track) -> serde_json::Value {
    serde_json::json!({
        "artist": track.artist,
        "title": track.title,
        "album": track.album,
        "genre": track.genre,
        "year": track.year,
        "duration_seconds": track.duration_seconds,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use tempfile::tempdir;

    fn track(path: &str, duration: u32) -> Track {
        Track {
            file_path: path.to_string(),
            artist: Some("Artist".into()),
            title: Some("Title".into()),
            album: None,
            genre: None,
            year: None,
            duration_seconds: duration,
            file_hash: "h".into(),
            last_scanned: Utc::now(),
        }
    }

    struct FixedFeeder {
        tracks: Vec<Track>,
        cursor: usize,
    }

    #[async_trait]
    impl SelectionStrategy for FixedFeeder {
        async fn select_next(&mut self, _library: &[Track], _history: &[HistoryEntry], upcoming: &[Track]) -> Option<Track> {
            while self.cursor < self.tracks.len() {
                let candidate = self.tracks[self.cursor].clone();
                self.cursor += 1;
                if !upcoming.iter().any(|t| t.file_path == candidate.file_path) {
                    return Some(candidate);
                }
            }
            None
        }
    }

    async fn build_planner(dir: &tempfile::TempDir) -> Planner {
        let scanner = Arc::new(LibraryScanner::new(&dir.path().join("library.db")).unwrap());
        let events = Arc::new(EventStore::open(&dir.path().join("events.db")));
        let mixer = Arc::new(MixerClient::new(
            rbmixer::MixerConfig { host: "127.0.0.1".into(), port: 1, path_mappings: vec![] },
            None,
        ));
        Planner::new(&dir.path().join("playlist.db"), scanner, events, mixer, Some(3)).unwrap()
    }

    #[tokio::test]
    async fn fill_respects_lookahead_and_skips_duplicates() {
        let dir = tempdir().unwrap();
        let planner = build_planner(&dir).await;
        let tracks = vec![track("a.mp3", 200), track("b.mp3", 200), track("c.mp3", 200), track("d.mp3", 200)];
        {
            let mut state = planner.inner.state.lock().await;
            state.library = tracks.clone();
        }
        planner
            .set_feeder(Box::new(FixedFeeder { tracks, cursor: 0 }))
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let state = planner.inner.state.lock().await;
        assert_eq!(state.upcoming.len(), 3);
        assert_eq!(state.upcoming[0].file_path, "a.mp3");
        assert_ne!(state.upcoming[0].z_stagger, state.upcoming[1].z_stagger);
        assert_ne!(state.upcoming[1].z_stagger, state.upcoming[2].z_stagger);
    }

    #[tokio::test]
    async fn advance_closes_previous_event_and_refills() {
        let dir = tempdir().unwrap();
        let planner = build_planner(&dir).await;
        let tracks = vec![track("a.mp3", 200), track("b.mp3", 200), track("c.mp3", 200), track("d.mp3", 200)];
        {
            let mut state = planner.inner.state.lock().await;
            state.library = tracks.clone();
        }
        planner
            .set_feeder(Box::new(FixedFeeder { tracks, cursor: 0 }))
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let before = {
            let state = planner.inner.state.lock().await;
            state.upcoming.len()
        };
        assert_eq!(before, 3);

        let snapshot = planner
            .advance(AdvanceInput {
                filename: "a.mp3".to_string(),
                remaining_seconds: 180.0,
                elapsed_seconds: 5.0,
                skip_signaled: false,
            })
            .await;

        assert_eq!(snapshot.len(), 3);
        assert!(!snapshot.iter().any(|e| e.file_path == "a.mp3"));
        assert_eq!(snapshot[0].file_path, "b.mp3");

        let history = planner.get_history(10, 0).await;
        assert_eq!(history[0].file_path, "a.mp3");
    }

    #[tokio::test]
    async fn remove_track_marks_event_skipped_and_renumbers() {
        let dir = tempdir().unwrap();
        let planner = build_planner(&dir).await;
        let tracks = vec![track("a.mp3", 200), track("b.mp3", 200), track("c.mp3", 200)];
        {
            let mut state = planner.inner.state.lock().await;
            state.library = tracks.clone();
        }
        planner
            .set_feeder(Box::new(FixedFeeder { tracks, cursor: 0 }))
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        planner.remove_track(1).await.unwrap();
        let state = planner.inner.state.lock().await;
        assert_eq!(state.upcoming.len(), 2);
        assert_eq!(state.upcoming[0].position, 0);
        assert_eq!(state.upcoming[1].position, 1);
        assert_eq!(state.upcoming[1].file_path, "c.mp3");
    }

    #[tokio::test]
    async fn remove_track_rejects_out_of_range_position() {
        let dir = tempdir().unwrap();
        let planner = build_planner(&dir).await;
        let err = planner.remove_track(9).await.unwrap_err();
        assert!(matches!(err, Error::PositionOutOfRange(9)));
    }

    #[tokio::test]
    async fn queue_persists_and_reloads_with_cleared_event_ids() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("playlist.db");
        let tracks = vec![track("a.mp3", 200), track("b.mp3", 200)];

        {
            let scanner = Arc::new(LibraryScanner::new(&dir.path().join("library.db")).unwrap());
            let events = Arc::new(EventStore::open(&dir.path().join("events.db")));
            let mixer = Arc::new(MixerClient::new(
                rbmixer::MixerConfig { host: "127.0.0.1".into(), port: 1, path_mappings: vec![] },
                None,
            ));
            let planner = Planner::new(&db_path, scanner, events, mixer, Some(2)).unwrap();
            {
                let mut state = planner.inner.state.lock().await;
                state.library = tracks.clone();
            }
            planner
                .set_feeder(Box::new(FixedFeeder { tracks: tracks.clone(), cursor: 0 }))
                .await;
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let scanner = Arc::new(LibraryScanner::new(&dir.path().join("library.db")).unwrap());
        let events = Arc::new(EventStore::open(&dir.path().join("events.db")));
        let mixer = Arc::new(MixerClient::new(
            rbmixer::MixerConfig { host: "127.0.0.1".into(), port: 1, path_mappings: vec![] },
            None,
        ));
        let reopened = Planner::new(&db_path, scanner, events, mixer, Some(2)).unwrap();
        let loaded = reopened.load_queue().unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(loaded.iter().all(|e| e.event_id.is_some()));
    }
}
