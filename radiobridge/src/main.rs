//! `radiobridge` — binary entry point for the AI-augmented internet-radio
//! control plane's real-time orchestration engine.
//!
//! Wires the Event Store, Mixer Client, Track Library Scanner, Playlist
//! Planner, Stream Context, and Voice Scheduler together, then runs until
//! `Ctrl+C`. Mirrors `PMOMusic/src/main.rs`'s shape: sequential phases
//! logged at `info`, non-fatal failures logged at `warn` rather than
//! aborting startup, and a final wait on the shutdown signal.

mod config;

use anyhow::Result;
use config::Settings;
use rbevents::EventStore;
use rblibrary::LibraryScanner;
use rbmixer::{Client as MixerClient, MixerConfig};
use rbplaylist::Planner;
use rbplugin::{NullTtsGenerator, SequentialStrategy};
use rbstream::StreamContext;
use rbvoice::VoiceScheduler;
use std::sync::Arc;
use std::time::Duration;

const SHUTDOWN_CEILING: Duration = Duration::from_secs(8);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let override_path = std::env::var("RADIOBRIDGE_CONFIG").ok().map(std::path::PathBuf::from);
    let settings = Settings::load(override_path.as_deref())?;
    tracing::info!(station = %settings.station_name, "starting radiobridge");

    std::fs::create_dir_all(&settings.data_dir)?;

    // ========== Event Store ==========
    tracing::info!("opening event store");
    let events = Arc::new(EventStore::open(&settings.sqlite_path("events.db")));

    // ========== Mixer Client ==========
    tracing::info!(host = %settings.mixer.host, port = settings.mixer.port, "connecting to mixer");
    let mixer = Arc::new(MixerClient::new(
        MixerConfig {
            host: settings.mixer.host.clone(),
            port: settings.mixer.port,
            path_mappings: settings.mixer.path_mappings.clone(),
        },
        Some(&settings.sqlite_path("mixer_config.db")),
    ));
    if !mixer.start().await {
        tracing::warn!("mixer unreachable at startup; continuing — commands will retry per-call");
    }

    // ========== Track Library Scanner ==========
    let scanner = Arc::new(LibraryScanner::new(&settings.sqlite_path("library.db"))?);

    // ========== Playlist Planner ==========
    tracing::info!("starting playlist planner");
    let planner = Planner::new(
        &settings.sqlite_path("playlist.db"),
        scanner.clone(),
        events.clone(),
        mixer.clone(),
        Some(settings.playlist.lookahead),
    )?;
    planner
        .start(
            settings.playlist.music_dir.clone(),
            Duration::from_secs(settings.playlist.scan_interval_seconds),
        )
        .await?;
    planner.set_feeder(Box::new(SequentialStrategy::default())).await;

    // ========== Stream Context ==========
    tracing::info!("starting stream context poll loop");
    let stream = StreamContext::new(
        mixer.clone(),
        planner.clone(),
        Some(Duration::from_secs(settings.stream.poll_interval_seconds)),
        Some(settings.stream.track_ending_threshold_seconds),
    );
    stream.start();

    // ========== Voice Scheduler ==========
    tracing::info!("starting voice scheduler");
    let voice = VoiceScheduler::new(
        mixer.clone(),
        events.clone(),
        Arc::new(NullTtsGenerator),
        stream.clone(),
    );
    voice.start();

    tracing::info!("radiobridge is ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received, stopping components");

    let shutdown = async {
        voice.stop().await;
        stream.stop().await;
        planner.stop().await;
    };
    if tokio::time::timeout(SHUTDOWN_CEILING, shutdown).await.is_err() {
        tracing::warn!("components did not stop within the shutdown ceiling; abandoning");
    }

    tracing::info!("radiobridge stopped");
    Ok(())
}
