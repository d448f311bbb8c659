//! # rbplugin — contracts the core consumes from and exposes to plugins
//!
//! `SelectionStrategy` and `TtsGenerator` are the two contracts the core
//! consumes (from the Playlist Planner and Voice Scheduler respectively);
//! everything a plugin needs to call *into* the core (submitting voice
//! segments, mutating the queue, subscribing to stream events) is exposed
//! directly by the crates that own it (`rbvoice`, `rbplaylist`, `rbstream`)
//! rather than through a second layer of traits here.

use async_trait::async_trait;
use rbtypes::{HistoryEntry, Track};
use std::path::PathBuf;

/// Source of the next track when the upcoming queue needs refilling.
///
/// Implementations see the full library, the recent history, and what's
/// already queued, so they can avoid repeats or apply their own rotation
/// logic. Returning `None` signals the planner to stop filling for now —
/// not an error.
#[async_trait]
pub trait SelectionStrategy: Send + Sync {
    async fn select_next(
        &mut self,
        library: &[Track],
        history: &[HistoryEntry],
        upcoming: &[Track],
    ) -> Option<Track>;
}

/// Picks library tracks in path order, skipping anything already queued.
/// A minimal, deterministic feeder useful as a default and in tests.
#[derive(Debug, Default)]
pub struct SequentialStrategy {
    cursor: usize,
}

#[async_trait]
impl SelectionStrategy for SequentialStrategy {
    async fn select_next(
        &mut self,
        library: &[Track],
        _history: &[HistoryEntry],
        upcoming: &[Track],
    ) -> Option<Track> {
        if library.is_empty() {
            return None;
        }
        for _ in 0..library.len() {
            let candidate = &library[self.cursor % library.len()];
            self.cursor += 1;
            if !upcoming.iter().any(|t| t.file_path == candidate.file_path) {
                return Some(candidate.clone());
            }
        }
        None
    }
}

/// Speech synthesis backend the Voice Scheduler calls into when a segment
/// has no usable `pre_generated_audio`. The TTS/STT/LLM backends themselves
/// are out of scope here; this is only the seam the scheduler calls through.
///
/// Returns the rendered audio's path and duration in seconds, or `None` on
/// any synthesis failure — the scheduler treats that the same as an
/// exception in the original: the segment's event ends `failed`.
#[async_trait]
pub trait TtsGenerator: Send + Sync {
    async fn speak(&self, text: &str, voice_style: Option<&str>) -> Option<(PathBuf, f64)>;
}

/// Always fails synthesis. A safe default until a real TTS backend plugin
/// is wired in: any segment without `pre_generated_audio` ends up `failed`
/// rather than the binary panicking for lack of a generator.
#[derive(Debug, Default)]
pub struct NullTtsGenerator;

#[async_trait]
impl TtsGenerator for NullTtsGenerator {
    async fn speak(&self, _text: &str, _voice_style: Option<&str>) -> Option<(PathBuf, f64)> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn track(path: &str) -> Track {
        Track {
            file_path: path.to_string(),
            artist: None,
            title: None,
            album: None,
            genre: None,
            year: None,
            duration_seconds: 180,
            file_hash: "x".to_string(),
            last_scanned: Utc::now(),
        }
    }

    #[tokio::test]
    async fn sequential_strategy_skips_already_queued_tracks() {
        let library = vec![track("a"), track("b"), track("c")];
        let mut strategy = SequentialStrategy::default();
        let upcoming = vec![track("a")];

        let picked = strategy.select_next(&library, &[], &upcoming).await;
        assert_eq!(picked.unwrap().file_path, "b");
    }

    #[tokio::test]
    async fn sequential_strategy_returns_none_on_empty_library() {
        let mut strategy = SequentialStrategy::default();
        assert!(strategy.select_next(&[], &[], &[]).await.is_none());
    }

    #[tokio::test]
    async fn null_tts_generator_always_fails() {
        let tts = NullTtsGenerator;
        assert!(tts.speak("hello", None).await.is_none());
    }
}
