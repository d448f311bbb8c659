//! # rbvoice — Voice Scheduler
//!
//! Central timing engine for voice segments submitted by plugins (§4.6).
//! One public entry point, [`VoiceScheduler::submit`]; everything else —
//! trigger evaluation, interrupt handling, mix-mode routing — happens off
//! the back of Stream Context's `track_changed`/`track_ending` callbacks
//! and a 2s monitor loop for `after_start` triggers.

use async_trait::async_trait;
use rbevents::{EventStore, EventUpdate};
use rbmixer::Client as MixerClient;
use rbplugin::TtsGenerator;
use rbstream::{StreamContext, TrackChangedHandler, TrackEndingHandler, TrackInfo};
use rbtypes::{EventStatus, MixMode, Trigger, VoiceSegment};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

const MONITOR_INTERVAL: Duration = Duration::from_secs(2);
const GENTLE_DUCK_LEVEL: f32 = 0.25;
const GENTLE_DUCK_RESTORE_DELAY: Duration = Duration::from_secs(10);
const STOP_CEILING: Duration = Duration::from_secs(8);

struct SchedulerState {
    between_queue: Vec<VoiceSegment>,
    before_end_triggers: Vec<(f64, VoiceSegment)>,
    after_start_triggers: Vec<(f64, VoiceSegment)>,
    fired_before_end: HashSet<usize>,
    fired_after_start: HashSet<usize>,
}

struct Inner {
    mixer: Arc<MixerClient>,
    events: Arc<EventStore>,
    tts: Arc<dyn TtsGenerator>,
    stream: StreamContext,
    state: Mutex<SchedulerState>,
    monitor_task: StdMutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

/// Handle to the scheduler. Cheap to clone; every clone shares the same
/// queues and background monitor task.
pub struct VoiceScheduler {
    inner: Arc<Inner>,
}

impl Clone for VoiceScheduler {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl VoiceScheduler {
    pub fn new(
        mixer: Arc<MixerClient>,
        events: Arc<EventStore>,
        tts: Arc<dyn TtsGenerator>,
        stream: StreamContext,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                mixer,
                events,
                tts,
                stream,
                state: Mutex::new(SchedulerState {
                    between_queue: Vec::new(),
                    before_end_triggers: Vec::new(),
                    after_start_triggers: Vec::new(),
                    fired_before_end: HashSet::new(),
                    fired_after_start: HashSet::new(),
                }),
                monitor_task: StdMutex::new(None),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Registers the scheduler's stream-context callbacks and starts its
    /// monitor loop. Idempotent.
    pub fn start(&self) {
        let mut guard = self.inner.monitor_task.lock().unwrap();
        if guard.is_some() {
            return;
        }
        self.inner.stream.on_track_changed(Arc::new(ChangeHandler(self.clone())));
        self.inner.stream.on_track_ending(Arc::new(EndingHandler(self.clone())));
        self.inner.stopped.store(false, Ordering::SeqCst);
        let this = self.clone();
        *guard = Some(tokio::spawn(async move {
            this.monitor_loop().await;
        }));
    }

    pub async fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        let handle = self.inner.monitor_task.lock().unwrap().take();
        if let Some(handle) = handle {
            if tokio::time::timeout(STOP_CEILING, handle).await.is_err() {
                tracing::warn!("voice scheduler monitor loop did not stop within the shutdown ceiling");
            }
        }
    }

    /// Submits a segment for scheduled playback (§4.6). `priority < 0`
    /// with `trigger = asap` is an interrupt: it flushes the mixer's TTS
    /// queue and cancels any queued `between_songs` segment with a
    /// strictly higher priority number before playing immediately.
    pub async fn submit(&self, mut segment: VoiceSegment) {
        let source = source_label(&segment);
        let preview = preview(&segment.text);

        match segment.trigger {
            Trigger::Asap if segment.priority < 0 => {
                segment.event_id = Some(
                    self.start_voice_event(&source, &preview, &segment, "interrupt", EventStatus::Active)
                        .await,
                );
                tracing::info!(plugin = %source, priority = segment.priority, "voice interrupt: {preview}");
                self.interrupt_for(segment).await;
            }
            Trigger::Asap => {
                segment.event_id = Some(
                    self.start_voice_event(&source, &preview, &segment, "asap", EventStatus::Active)
                        .await,
                );
                tracing::info!(plugin = %source, "voice asap: {preview}");
                self.play(segment).await;
            }
            Trigger::BetweenSongs => {
                segment.event_id = Some(
                    self.start_voice_event(&source, &preview, &segment, "between_songs", EventStatus::Scheduled)
                        .await,
                );
                tracing::info!(plugin = %source, priority = segment.priority, "voice queued between songs: {preview}");
                self.inner.state.lock().await.between_queue.push(segment);
            }
            Trigger::Bridge => {
                segment.event_id = Some(
                    self.start_voice_event(&source, &preview, &segment, "bridge", EventStatus::Scheduled)
                        .await,
                );
                self.schedule_bridge(segment).await;
            }
            Trigger::BeforeEnd(seconds) => {
                segment.event_id = Some(
                    self.start_voice_event(
                        &source,
                        &preview,
                        &segment,
                        &format!("before_end:{seconds}"),
                        EventStatus::Scheduled,
                    )
                    .await,
                );
                tracing::info!(plugin = %source, seconds, "voice timed (before_end): {preview}");
                self.inner.state.lock().await.before_end_triggers.push((seconds, segment));
            }
            Trigger::AfterStart(seconds) => {
                segment.event_id = Some(
                    self.start_voice_event(
                        &source,
                        &preview,
                        &segment,
                        &format!("after_start:{seconds}"),
                        EventStatus::Scheduled,
                    )
                    .await,
                );
                tracing::info!(plugin = %source, seconds, "voice timed (after_start): {preview}");
                self.inner.state.lock().await.after_start_triggers.push((seconds, segment));
            }
        }
    }

    async fn start_voice_event(
        &self,
        source: &str,
        title: &str,
        segment: &VoiceSegment,
        trigger_label: &str,
        status: EventStatus,
    ) -> i64 {
        let mut details = HashMap::new();
        details.insert("trigger".to_string(), serde_json::json!(trigger_label));
        details.insert("priority".to_string(), serde_json::json!(segment.priority));
        details.insert("text".to_string(), serde_json::json!(segment.text));
        if let Some(duration) = segment.pre_generated_duration_seconds {
            details.insert("duration_seconds".to_string(), serde_json::json!(duration));
        }
        self.inner
            .events
            .start_event("voice_segment", source, title, details, status, None)
            .await
    }

    /// Generates (or reuses pre-generated) audio and queues it through the
    /// selected mix mode. Ends the segment's event `completed` on success,
    /// `failed` if synthesis comes back empty.
    async fn play(&self, segment: VoiceSegment) {
        if let Some(id) = segment.event_id {
            self.inner
                .events
                .update_event(id, EventUpdate { status: Some(EventStatus::Active), ..Default::default() })
                .await;
        }

        let audio_path = match segment.pre_generated_audio.as_deref() {
            Some(path) if Path::new(path).exists() => Some(PathBuf::from(path)),
            _ => self
                .inner
                .tts
                .speak(&segment.text, segment.voice_style.as_deref())
                .await
                .map(|(path, _duration)| path),
        };

        let Some(audio_path) = audio_path else {
            tracing::warn!(plugin = %segment.source_plugin, "voice playback failed: no usable audio");
            if let Some(id) = segment.event_id {
                self.inner.events.end_event(id, EventStatus::Failed, None).await;
            }
            return;
        };

        if segment.leading_silence_ms > 0 {
            tokio::time::sleep(Duration::from_millis(segment.leading_silence_ms as u64)).await;
        }

        self.queue_with_mix_mode(&audio_path, segment.mix_mode).await;

        if segment.trailing_silence_ms > 0 {
            tokio::time::sleep(Duration::from_millis(segment.trailing_silence_ms as u64)).await;
        }

        if let Some(id) = segment.event_id {
            self.inner.events.end_event(id, EventStatus::Completed, None).await;
        }
    }

    async fn queue_with_mix_mode(&self, audio_path: &Path, mode: MixMode) {
        match mode {
            MixMode::Overlay => {
                self.inner.mixer.queue_earcon(audio_path).await;
            }
            MixMode::GentleDuck => {
                let original = self.inner.mixer.get_volumes().await.duck_amount;
                self.inner.mixer.set_duck_amount(GENTLE_DUCK_LEVEL, false).await;
                self.inner.mixer.queue_tts(audio_path).await;
                let mixer = self.inner.mixer.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(GENTLE_DUCK_RESTORE_DELAY).await;
                    mixer.set_duck_amount(original, false).await;
                });
            }
            MixMode::Duck => {
                self.inner.mixer.queue_tts(audio_path).await;
            }
        }
    }

    async fn schedule_bridge(&self, segment: VoiceSegment) {
        let crossfade = self.inner.mixer.get_volumes().await.crossfade_duration as f64;
        let voice_duration = segment.pre_generated_duration_seconds.unwrap_or(0.0);
        let trigger_at = if voice_duration <= 0.0 {
            tracing::warn!("bridge segment has no known duration, falling back to before_end");
            crossfade
        } else {
            (voice_duration + crossfade) / 2.0
        };
        tracing::info!(
            voice_duration,
            crossfade,
            trigger_at,
            "bridge scheduled"
        );
        self.inner.state.lock().await.before_end_triggers.push((trigger_at, segment));
    }

    async fn interrupt_for(&self, segment: VoiceSegment) {
        self.inner.mixer.flush_tts().await;

        let cancelled = {
            let mut state = self.inner.state.lock().await;
            let (kept, cancelled): (Vec<_>, Vec<_>) =
                state.between_queue.drain(..).partition(|s| s.priority <= segment.priority);
            state.between_queue = kept;
            cancelled
        };

        for s in &cancelled {
            if let Some(id) = s.event_id {
                self.inner.events.end_event(id, EventStatus::Cancelled, None).await;
            }
        }
        tracing::info!(cancelled = cancelled.len(), "voice interrupt flushed tts queue");

        self.play(segment).await;
    }

    async fn on_track_changed(&self) {
        let queue = {
            let mut state = self.inner.state.lock().await;
            state.before_end_triggers.clear();
            state.after_start_triggers.clear();
            state.fired_before_end.clear();
            state.fired_after_start.clear();
            let mut queue = std::mem::take(&mut state.between_queue);
            queue.sort_by_key(|s| s.priority);
            queue
        };
        if queue.is_empty() {
            return;
        }
        tracing::info!(count = queue.len(), "playing between-songs voice queue");
        for segment in queue {
            self.play(segment).await;
        }
    }

    async fn on_track_ending(&self, remaining_seconds: f64) {
        let segments = {
            let mut state = self.inner.state.lock().await;
            let mut fire = Vec::new();
            for (i, (threshold, _)) in state.before_end_triggers.iter().enumerate() {
                if remaining_seconds <= *threshold && !state.fired_before_end.contains(&i) {
                    fire.push(i);
                }
            }
            let segments: Vec<VoiceSegment> =
                fire.iter().map(|&i| state.before_end_triggers[i].1.clone()).collect();
            for i in fire {
                state.fired_before_end.insert(i);
            }
            segments
        };
        for segment in segments {
            self.play(segment).await;
        }
    }

    async fn check_after_start(&self) {
        let elapsed = self.inner.stream.elapsed_seconds().await;
        if elapsed <= 0.0 {
            return;
        }
        let segments = {
            let mut state = self.inner.state.lock().await;
            let mut fire = Vec::new();
            for (i, (threshold, _)) in state.after_start_triggers.iter().enumerate() {
                if elapsed >= *threshold && !state.fired_after_start.contains(&i) {
                    fire.push(i);
                }
            }
            let segments: Vec<VoiceSegment> =
                fire.iter().map(|&i| state.after_start_triggers[i].1.clone()).collect();
            for i in fire {
                state.fired_after_start.insert(i);
            }
            segments
        };
        for segment in segments {
            self.play(segment).await;
        }
    }

    async fn monitor_loop(&self) {
        loop {
            if self.inner.stopped.load(Ordering::SeqCst) {
                break;
            }
            self.check_after_start().await;
            tokio::time::sleep(MONITOR_INTERVAL).await;
        }
    }
}

struct ChangeHandler(VoiceScheduler);

#[async_trait]
impl TrackChangedHandler for ChangeHandler {
    async fn handle(&self, _info: &TrackInfo) {
        self.0.on_track_changed().await;
    }
}

struct EndingHandler(VoiceScheduler);

#[async_trait]
impl TrackEndingHandler for EndingHandler {
    async fn handle(&self, remaining_seconds: f64) {
        self.0.on_track_ending(remaining_seconds).await;
    }
}

fn source_label(segment: &VoiceSegment) -> String {
    if segment.source_plugin.is_empty() {
        "unknown".to_string()
    } else {
        segment.source_plugin.clone()
    }
}

fn preview(text: &str) -> String {
    if text.chars().count() > 40 {
        let truncated: String = text.chars().take(40).collect();
        format!("{truncated}...")
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rbmixer::MixerConfig;

    struct StubTts;

    #[async_trait]
    impl TtsGenerator for StubTts {
        async fn speak(&self, _text: &str, _voice_style: Option<&str>) -> Option<(PathBuf, f64)> {
            Some((PathBuf::from("/tmp/voice.wav"), 3.0))
        }
    }

    fn segment(trigger: Trigger, priority: i32) -> VoiceSegment {
        VoiceSegment {
            text: "hello".to_string(),
            trigger,
            priority,
            leading_silence_ms: 0,
            trailing_silence_ms: 0,
            pre_generated_audio: None,
            pre_generated_duration_seconds: None,
            mix_mode: MixMode::Duck,
            voice_style: None,
            source_plugin: "test".to_string(),
            event_id: None,
        }
    }

    async fn scheduler() -> VoiceScheduler {
        let mixer = Arc::new(MixerClient::new(
            MixerConfig { host: "127.0.0.1".into(), port: 1, path_mappings: vec![] },
            None,
        ));
        let dir = tempfile::tempdir().unwrap();
        let events = Arc::new(EventStore::open(&dir.path().join("events.db")));
        let scanner = Arc::new(rblibrary::LibraryScanner::new(&dir.path().join("library.db")).unwrap());
        let planner =
            rbplaylist::Planner::new(&dir.path().join("playlist.db"), scanner, events.clone(), mixer.clone(), None)
                .unwrap();
        let stream = StreamContext::new(mixer.clone(), planner, None, None);
        VoiceScheduler::new(mixer, events, Arc::new(StubTts), stream)
    }

    #[tokio::test]
    async fn between_songs_segments_queue_until_track_change() {
        let scheduler = scheduler().await;
        scheduler.submit(segment(Trigger::BetweenSongs, 5)).await;
        scheduler.submit(segment(Trigger::BetweenSongs, 1)).await;

        {
            let state = scheduler.inner.state.lock().await;
            assert_eq!(state.between_queue.len(), 2);
        }

        scheduler.on_track_changed().await;

        let state = scheduler.inner.state.lock().await;
        assert!(state.between_queue.is_empty());
    }

    #[tokio::test]
    async fn interrupt_cancels_strictly_lower_priority_between_songs_segments() {
        let scheduler = scheduler().await;
        scheduler.submit(segment(Trigger::BetweenSongs, 5)).await;
        scheduler.submit(segment(Trigger::BetweenSongs, -1)).await;

        scheduler.submit(segment(Trigger::Asap, -1)).await;

        let state = scheduler.inner.state.lock().await;
        assert_eq!(state.between_queue.len(), 1);
        assert_eq!(state.between_queue[0].priority, -1);
    }

    #[tokio::test]
    async fn before_end_trigger_fires_once_per_track() {
        let scheduler = scheduler().await;
        scheduler.submit(segment(Trigger::BeforeEnd(20.0), 0)).await;

        scheduler.on_track_ending(15.0).await;
        scheduler.on_track_ending(10.0).await;

        let state = scheduler.inner.state.lock().await;
        assert_eq!(state.fired_before_end.len(), 1);
    }

    #[tokio::test]
    async fn bridge_falls_back_to_before_end_crossfade_when_duration_unknown() {
        let scheduler = scheduler().await;
        let mut bridge = segment(Trigger::Bridge, 0);
        bridge.pre_generated_duration_seconds = None;
        scheduler.submit(bridge).await;

        let state = scheduler.inner.state.lock().await;
        assert_eq!(state.before_end_triggers.len(), 1);
        assert_eq!(state.before_end_triggers[0].0, 5.0);
    }
}
