//! # rbstream — Stream Context
//!
//! Polls the Mixer Client for the currently playing file, detects track
//! boundaries, enriches the raw engine metadata against the planner's
//! upcoming queue and scanned library, and notifies the Playlist Planner of
//! each boundary so it can advance its own queue and timeline events. Fires
//! `track_changed`/`track_ending` to registered handlers; does not touch the
//! event store itself — that stays the planner's job (see `DESIGN.md`).

use async_trait::async_trait;
use rbmixer::Client as MixerClient;
use rbplaylist::{AdvanceInput, Planner};
use rbtypes::{QueueEntry, Track};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
const DEFAULT_TRACK_ENDING_THRESHOLD: f64 = 30.0;
const STOP_CEILING: Duration = Duration::from_secs(8);

/// Enriched view of the engine's current track, overlaid with planner
/// metadata where a match is found (§4.5.1).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackInfo {
    pub artist: String,
    pub title: String,
    pub filename: String,
    pub genre: String,
    pub year: String,
    pub album: String,
    pub duration_seconds: Option<u32>,
}

#[async_trait]
pub trait TrackChangedHandler: Send + Sync {
    async fn handle(&self, info: &TrackInfo);
}

#[async_trait]
pub trait TrackEndingHandler: Send + Sync {
    async fn handle(&self, remaining_seconds: f64);
}

struct StreamState {
    current_track: TrackInfo,
    remaining_seconds: f64,
    elapsed_seconds: f64,
    enrichments: HashMap<String, serde_json::Value>,
    feeder_context: HashMap<String, serde_json::Value>,
    last_filename: String,
    track_ending_fired: bool,
    skip_signaled: bool,
}

struct Inner {
    mixer: Arc<MixerClient>,
    planner: Planner,
    poll_interval: Duration,
    track_ending_threshold: f64,
    state: Mutex<StreamState>,
    track_changed_handlers: StdMutex<Vec<Arc<dyn TrackChangedHandler>>>,
    track_ending_handlers: StdMutex<Vec<Arc<dyn TrackEndingHandler>>>,
    stopped: AtomicBool,
    poll_task: StdMutex<Option<JoinHandle<()>>>,
}

/// Handle to the running poll loop. Cheap to clone; every clone shares the
/// same background task and handler registry.
pub struct StreamContext {
    inner: Arc<Inner>,
}

impl Clone for StreamContext {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl StreamContext {
    pub fn new(
        mixer: Arc<MixerClient>,
        planner: Planner,
        poll_interval: Option<Duration>,
        track_ending_threshold: Option<f64>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                mixer,
                planner,
                poll_interval: poll_interval.unwrap_or(DEFAULT_POLL_INTERVAL),
                track_ending_threshold: track_ending_threshold
                    .unwrap_or(DEFAULT_TRACK_ENDING_THRESHOLD),
                state: Mutex::new(StreamState {
                    current_track: TrackInfo::default(),
                    remaining_seconds: 0.0,
                    elapsed_seconds: 0.0,
                    enrichments: HashMap::new(),
                    feeder_context: HashMap::new(),
                    last_filename: String::new(),
                    track_ending_fired: false,
                    skip_signaled: false,
                }),
                track_changed_handlers: StdMutex::new(Vec::new()),
                track_ending_handlers: StdMutex::new(Vec::new()),
                stopped: AtomicBool::new(false),
                poll_task: StdMutex::new(None),
            }),
        }
    }

    pub fn on_track_changed(&self, handler: Arc<dyn TrackChangedHandler>) {
        self.inner.track_changed_handlers.lock().unwrap().push(handler);
    }

    pub fn on_track_ending(&self, handler: Arc<dyn TrackEndingHandler>) {
        self.inner.track_ending_handlers.lock().unwrap().push(handler);
    }

    /// One-shot flag consumed by the next detected track change, so its
    /// closing history/event record reads as skipped rather than completed
    /// (§4.5.2).
    pub async fn notify_skip(&self) {
        self.inner.state.lock().await.skip_signaled = true;
    }

    pub async fn current_track(&self) -> TrackInfo {
        self.inner.state.lock().await.current_track.clone()
    }

    pub async fn remaining_seconds(&self) -> f64 {
        self.inner.state.lock().await.remaining_seconds
    }

    pub async fn elapsed_seconds(&self) -> f64 {
        self.inner.state.lock().await.elapsed_seconds
    }

    /// Arbitrary values a selection strategy stashes between calls, keyed
    /// by its own convention. Persists across track changes.
    pub async fn feeder_context(&self) -> HashMap<String, serde_json::Value> {
        self.inner.state.lock().await.feeder_context.clone()
    }

    pub async fn set_feeder_context(&self, key: String, value: serde_json::Value) {
        self.inner.state.lock().await.feeder_context.insert(key, value);
    }

    /// Ad-hoc metadata attached to the current track by external callers.
    /// Cleared on every track change.
    pub async fn enrichments(&self) -> HashMap<String, serde_json::Value> {
        self.inner.state.lock().await.enrichments.clone()
    }

    pub async fn set_enrichment(&self, key: String, value: serde_json::Value) {
        self.inner.state.lock().await.enrichments.insert(key, value);
    }

    /// Starts the polling loop if it isn't already running. Idempotent.
    pub fn start(&self) {
        let mut guard = self.inner.poll_task.lock().unwrap();
        if guard.is_some() {
            return;
        }
        self.inner.stopped.store(false, Ordering::SeqCst);
        let this = self.clone();
        *guard = Some(tokio::spawn(async move {
            this.poll_loop().await;
        }));
    }

    /// Signals the loop to stop after its current iteration and waits for
    /// it, up to an 8s ceiling.
    pub async fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        let handle = self.inner.poll_task.lock().unwrap().take();
        if let Some(handle) = handle {
            if tokio::time::timeout(STOP_CEILING, handle).await.is_err() {
                tracing::warn!("stream context poll loop did not stop within the shutdown ceiling");
            }
        }
    }

    async fn poll_loop(&self) {
        loop {
            if self.inner.stopped.load(Ordering::SeqCst) {
                break;
            }
            self.poll_once().await;
            tokio::time::sleep(self.inner.poll_interval).await;
        }
    }

    async fn poll_once(&self) {
        let info = self.inner.mixer.get_track_info().await;
        let remaining = self.inner.mixer.get_remaining().await;
        let elapsed = self.inner.mixer.get_elapsed().await;

        let track_info = TrackInfo {
            artist: info.artist,
            title: info.title,
            filename: info.filename,
            genre: info.genre,
            year: info.year,
            album: info.album,
            duration_seconds: None,
        };

        let mut state = self.inner.state.lock().await;
        state.remaining_seconds = remaining;
        state.elapsed_seconds = elapsed;

        let changed = !track_info.filename.is_empty() && track_info.filename != state.last_filename;
        if !changed {
            state.current_track = track_info;
            let should_fire = remaining > 0.0
                && remaining < self.inner.track_ending_threshold
                && !state.track_ending_fired;
            if should_fire {
                state.track_ending_fired = true;
            }
            drop(state);
            if should_fire {
                self.emit_track_ending(remaining).await;
            }
            return;
        }

        state.last_filename = track_info.filename.clone();
        state.track_ending_fired = false;
        state.enrichments.clear();
        let skip_signaled = std::mem::take(&mut state.skip_signaled);
        drop(state);

        let upcoming = self.inner.planner.upcoming_snapshot().await;
        let library = self.inner.planner.library_snapshot().await;
        let enriched = enrich(track_info, &upcoming, &library);

        self.inner.state.lock().await.current_track = enriched.clone();

        self.inner
            .planner
            .advance(AdvanceInput {
                filename: enriched.filename.clone(),
                remaining_seconds: remaining,
                elapsed_seconds: elapsed,
                skip_signaled,
            })
            .await;

        self.emit_track_changed(&enriched).await;

        if remaining > 0.0 && remaining < self.inner.track_ending_threshold {
            let mut state = self.inner.state.lock().await;
            if !state.track_ending_fired {
                state.track_ending_fired = true;
                drop(state);
                self.emit_track_ending(remaining).await;
            }
        }
    }

    async fn emit_track_changed(&self, info: &TrackInfo) {
        let handlers = self.inner.track_changed_handlers.lock().unwrap().clone();
        for handler in handlers {
            handler.handle(info).await;
        }
    }

    async fn emit_track_ending(&self, remaining_seconds: f64) {
        let handlers = self.inner.track_ending_handlers.lock().unwrap().clone();
        for handler in handlers {
            handler.handle(remaining_seconds).await;
        }
    }
}

fn basename(path: &str) -> &str {
    std::path::Path::new(path)
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or(path)
}

/// Matches the current filename against the upcoming queue first, falling
/// back to the full library, overwriting only present/non-empty fields
/// (§4.5.1). Duration is always overwritten when the match has one.
fn enrich(mut info: TrackInfo, upcoming: &[QueueEntry], library: &[Track]) -> TrackInfo {
    if info.filename.is_empty() {
        return info;
    }
    let target = basename(&info.filename);

    if let Some(entry) = upcoming.iter().find(|e| basename(&e.file_path) == target) {
        apply_metadata(&mut info, &entry.metadata);
        return info;
    }
    if let Some(track) = library.iter().find(|t| basename(&t.file_path) == target) {
        apply_track(&mut info, track);
    }
    info
}

fn apply_metadata(info: &mut TrackInfo, metadata: &serde_json::Value) {
    if let Some(v) = metadata.get("artist").and_then(|v| v.as_str()) {
        if !v.is_empty() {
            info.artist = v.to_string();
        }
    }
    if let Some(v) = metadata.get("title").and_then(|v| v.as_str()) {
        if !v.is_empty() {
            info.title = v.to_string();
        }
    }
    if let Some(v) = metadata.get("album").and_then(|v| v.as_str()) {
        if !v.is_empty() {
            info.album = v.to_string();
        }
    }
    if let Some(v) = metadata.get("genre").and_then(|v| v.as_str()) {
        if !v.is_empty() {
            info.genre = v.to_string();
        }
    }
    if let Some(v) = metadata.get("year").and_then(|v| v.as_u64()) {
        info.year = v.to_string();
    }
    if let Some(v) = metadata.get("duration_seconds").and_then(|v| v.as_u64()) {
        info.duration_seconds = Some(v as u32);
    }
}

fn apply_track(info: &mut TrackInfo, track: &Track) {
    if let Some(v) = &track.artist {
        if !v.is_empty() {
            info.artist = v.clone();
        }
    }
    if let Some(v) = &track.title {
        if !v.is_empty() {
            info.title = v.clone();
        }
    }
    if let Some(v) = &track.album {
        if !v.is_empty() {
            info.album = v.clone();
        }
    }
    if let Some(v) = &track.genre {
        if !v.is_empty() {
            info.genre = v.clone();
        }
    }
    if let Some(v) = track.year {
        info.year = v.to_string();
    }
    info.duration_seconds = Some(track.duration_seconds);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enrich_prefers_upcoming_over_library() {
        let info = TrackInfo { filename: "/music/song.mp3".into(), ..Default::default() };
        let upcoming = vec![QueueEntry {
            position: 0,
            file_path: "/mixer/song.mp3".into(),
            metadata: serde_json::json!({"artist": "Queue Artist", "duration_seconds": 200}),
            tts_path: None,
            tts_status: None,
            z_stagger: false,
            event_id: None,
        }];
        let library = vec![Track {
            file_path: "/music/song.mp3".into(),
            artist: Some("Library Artist".into()),
            title: None,
            album: None,
            genre: None,
            year: None,
            duration_seconds: 150,
            file_hash: "x".into(),
            last_scanned: chrono::Utc::now(),
        }];

        let enriched = enrich(info, &upcoming, &library);
        assert_eq!(enriched.artist, "Queue Artist");
        assert_eq!(enriched.duration_seconds, Some(200));
    }

    #[test]
    fn enrich_falls_back_to_library_when_not_queued() {
        let info = TrackInfo { filename: "/music/other.mp3".into(), ..Default::default() };
        let library = vec![Track {
            file_path: "/elsewhere/other.mp3".into(),
            artist: Some("Library Artist".into()),
            title: Some("Title".into()),
            album: None,
            genre: None,
            year: Some(1999),
            duration_seconds: 210,
            file_hash: "x".into(),
            last_scanned: chrono::Utc::now(),
        }];

        let enriched = enrich(info, &[], &library);
        assert_eq!(enriched.artist, "Library Artist");
        assert_eq!(enriched.title, "Title");
        assert_eq!(enriched.year, "1999");
        assert_eq!(enriched.duration_seconds, Some(210));
    }

    #[test]
    fn enrich_leaves_unmatched_track_untouched() {
        let info = TrackInfo {
            filename: "/music/unknown.mp3".into(),
            artist: "Raw Artist".into(),
            ..Default::default()
        };
        let enriched = enrich(info.clone(), &[], &[]);
        assert_eq!(enriched, info);
    }

    struct RecordingHandler {
        seen: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl TrackChangedHandler for RecordingHandler {
        async fn handle(&self, info: &TrackInfo) {
            self.seen.lock().unwrap().push(info.filename.clone());
        }
    }

    #[tokio::test]
    async fn emit_track_changed_calls_every_registered_handler() {
        let mixer = Arc::new(MixerClient::new(
            rbmixer::MixerConfig { host: "127.0.0.1".into(), port: 1, path_mappings: vec![] },
            None,
        ));
        let dir = tempfile::tempdir().unwrap();
        let events = Arc::new(rbevents::EventStore::open(&dir.path().join("events.db")));
        let scanner = Arc::new(rblibrary::LibraryScanner::new(&dir.path().join("library.db")).unwrap());
        let planner = Planner::new(&dir.path().join("playlist.db"), scanner, events, mixer.clone(), None).unwrap();

        let ctx = StreamContext::new(mixer, planner, None, None);
        let handler = Arc::new(RecordingHandler { seen: StdMutex::new(Vec::new()) });
        ctx.on_track_changed(handler.clone());

        ctx.emit_track_changed(&TrackInfo { filename: "a.mp3".into(), ..Default::default() }).await;
        ctx.emit_track_changed(&TrackInfo { filename: "b.mp3".into(), ..Default::default() }).await;

        assert_eq!(*handler.seen.lock().unwrap(), vec!["a.mp3".to_string(), "b.mp3".to_string()]);
    }
}
