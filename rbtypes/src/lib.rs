//! # rbtypes — shared data model for the radiobridge workspace
//!
//! Track/queue/history/voice/event records used across the Event Store,
//! Mixer Client, Track Library Scanner, Playlist Planner, Stream Context,
//! and Voice Scheduler crates. Kept as plain product types rather than
//! untyped key-value maps so every crate shares one definition of what a
//! track or a timeline event is.

pub mod error;

pub use error::{Error, Result};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A scanned audio file, keyed by file path.
///
/// Created by the library scanner, mutated only by rescans, never deleted
/// except on a rescan diff that finds the file gone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub file_path: String,
    pub artist: Option<String>,
    pub title: Option<String>,
    pub album: Option<String>,
    pub genre: Option<String>,
    pub year: Option<u32>,
    pub duration_seconds: u32,
    /// md5 over file size + first 8 KiB, used to detect changes on rescan.
    pub file_hash: String,
    pub last_scanned: DateTime<Utc>,
}

impl Track {
    /// Duration to use for time projection when the real duration is
    /// unknown (defaults to 0 on the scanned record).
    pub fn projection_duration_seconds(&self) -> u32 {
        if self.duration_seconds == 0 {
            180
        } else {
            self.duration_seconds
        }
    }
}

/// One entry in the planner's upcoming queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub position: usize,
    pub file_path: String,
    pub metadata: serde_json::Value,
    pub tts_path: Option<String>,
    pub tts_status: Option<String>,
    /// Alternates across adjacent entries; used by external timeline views
    /// to visually offset overlapping crossfaded tracks.
    pub z_stagger: bool,
    pub event_id: Option<i64>,
}

/// An append-only playback record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub file_path: String,
    pub played_at: DateTime<Utc>,
    pub planned_position: Option<usize>,
}

/// Trigger expression evaluated by the Voice Scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Trigger {
    Asap,
    BetweenSongs,
    BeforeEnd(f64),
    AfterStart(f64),
    Bridge,
}

impl Trigger {
    /// Parses the grammar described for the Voice Scheduler: `asap`,
    /// `between_songs`, `before_end:X`, `after_start:X`, `bridge`.
    pub fn parse(raw: &str) -> Option<Self> {
        if let Some(rest) = raw.strip_prefix("before_end:") {
            return rest.parse().ok().map(Trigger::BeforeEnd);
        }
        if let Some(rest) = raw.strip_prefix("after_start:") {
            return rest.parse().ok().map(Trigger::AfterStart);
        }
        match raw {
            "asap" => Some(Trigger::Asap),
            "between_songs" => Some(Trigger::BetweenSongs),
            "bridge" => Some(Trigger::Bridge),
            _ => None,
        }
    }
}

/// How a voice segment routes through the mixer relative to the music.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum MixMode {
    Duck,
    GentleDuck,
    Overlay,
}

/// A transient voice announcement submitted by a plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceSegment {
    pub text: String,
    pub trigger: Trigger,
    /// Lower = earlier; negative with `Trigger::Asap` is an interrupt.
    pub priority: i32,
    pub leading_silence_ms: u32,
    pub trailing_silence_ms: u32,
    pub pre_generated_audio: Option<String>,
    pub pre_generated_duration_seconds: Option<f64>,
    pub mix_mode: MixMode,
    pub voice_style: Option<String>,
    pub source_plugin: String,
    pub event_id: Option<i64>,
}

/// Lifecycle status of a [`TimelineEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventStatus {
    Scheduled,
    Active,
    Completed,
    Skipped,
    Cancelled,
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Scheduled => "scheduled",
            EventStatus::Active => "active",
            EventStatus::Completed => "completed",
            EventStatus::Skipped => "skipped",
            EventStatus::Cancelled => "cancelled",
            EventStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "scheduled" => Some(EventStatus::Scheduled),
            "active" => Some(EventStatus::Active),
            "completed" => Some(EventStatus::Completed),
            "skipped" => Some(EventStatus::Skipped),
            "cancelled" => Some(EventStatus::Cancelled),
            "failed" => Some(EventStatus::Failed),
            _ => None,
        }
    }
}

/// A persistent timeline entry. Carries a sparse `key -> JSON value` detail
/// map stored in a side table, not inline here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub id: i64,
    pub event_type: String,
    pub lane: String,
    pub title: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: EventStatus,
    pub created_at: DateTime<Utc>,
    pub details: HashMap<String, serde_json::Value>,
}

/// Sentinel event id returned by a closed Event Store.
pub const NO_EVENT_ID: i64 = -1;

/// Current mixer scalar state, as read back by `get_volumes` plus the
/// non-volume transition parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MixerState {
    pub music_volume: f32,
    pub tts_volume: f32,
    pub earcon_volume: f32,
    pub duck_amount: f32,
    pub crossfade_duration: f32,
    pub duck_in_duration: f32,
    pub duck_out_duration: f32,
    pub duck_in_curve: f32,
    pub duck_out_curve: f32,
}

impl Default for MixerState {
    fn default() -> Self {
        Self {
            music_volume: 1.0,
            tts_volume: 0.85,
            earcon_volume: 0.5,
            duck_amount: 0.15,
            crossfade_duration: 5.0,
            duck_in_duration: 0.8,
            duck_out_duration: 0.6,
            duck_in_curve: 0.7,
            duck_out_curve: 0.3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_parses_before_end_with_threshold() {
        assert_eq!(Trigger::parse("before_end:12.5"), Some(Trigger::BeforeEnd(12.5)));
    }

    #[test]
    fn trigger_parses_simple_variants() {
        assert_eq!(Trigger::parse("asap"), Some(Trigger::Asap));
        assert_eq!(Trigger::parse("between_songs"), Some(Trigger::BetweenSongs));
        assert_eq!(Trigger::parse("bridge"), Some(Trigger::Bridge));
    }

    #[test]
    fn trigger_rejects_unknown_syntax() {
        assert_eq!(Trigger::parse("whenever"), None);
        assert_eq!(Trigger::parse("before_end:not-a-number"), None);
    }

    #[test]
    fn track_projection_duration_falls_back_to_180() {
        let t = Track {
            file_path: "x.mp3".into(),
            artist: None,
            title: None,
            album: None,
            genre: None,
            year: None,
            duration_seconds: 0,
            file_hash: "abc".into(),
            last_scanned: Utc::now(),
        };
        assert_eq!(t.projection_duration_seconds(), 180);
    }

    #[test]
    fn event_status_round_trips_through_str() {
        for s in [
            EventStatus::Scheduled,
            EventStatus::Active,
            EventStatus::Completed,
            EventStatus::Skipped,
            EventStatus::Cancelled,
            EventStatus::Failed,
        ] {
            assert_eq!(EventStatus::parse(s.as_str()), Some(s));
        }
    }
}
