//! # rbmixer — the Mixer Client
//!
//! A serialized, per-command TCP control channel to the external audio
//! engine, plus typed wrappers with clamping for every scalar the engine
//! exposes. Every operation opens a fresh connection (the engine closes
//! idle ones), writes one line, reads lines until a literal `END`, sends
//! `quit`, and closes — never pooled.
//!
//! Every public operation returns success/failure or a numeric sentinel;
//! none of them propagate an error across the boundary. Connection
//! failures are logged once per command at `warn` and the caller gets back
//! whatever the operation's documented failure value is.

pub mod error;

pub use error::{Error, Result};

use rbtypes::MixerState;
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::timeout;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Engine host/port and the host-path-to-engine-path translation table.
#[derive(Debug, Clone)]
pub struct MixerConfig {
    pub host: String,
    pub port: u16,
    /// `(host_base, engine_base)` pairs, checked longest-prefix-first.
    pub path_mappings: Vec<(PathBuf, String)>,
}

/// Engine-reported current-track metadata, `var.get`/`music.info` shaped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackInfo {
    pub artist: String,
    pub title: String,
    pub filename: String,
    pub genre: String,
    pub year: String,
    pub album: String,
}

/// Serialized control channel to the external mixer, with persisted
/// volume state.
pub struct Client {
    config: MixerConfig,
    lock: AsyncMutex<()>,
    config_store: Option<Arc<StdMutex<Connection>>>,
    pre_mute_music_vol: StdMutex<f32>,
    pre_mute_tts_vol: StdMutex<f32>,
    pre_mute_earcon_vol: StdMutex<f32>,
    music_muted: StdMutex<bool>,
    tts_muted: StdMutex<bool>,
    earcon_muted: StdMutex<bool>,
    random_mode: StdMutex<bool>,
}

impl Client {
    /// Builds a client. `config_db_path` is optional — without it, volume
    /// writes simply aren't persisted (the engine still gets the command).
    pub fn new(config: MixerConfig, config_db_path: Option<&Path>) -> Self {
        let config_store = config_db_path.and_then(|path| match Self::open_config_store(path) {
            Ok(conn) => Some(Arc::new(StdMutex::new(conn))),
            Err(e) => {
                tracing::warn!(error = %e, "mixer config store unavailable");
                None
            }
        });

        let defaults = MixerState::default();
        Self {
            config,
            lock: AsyncMutex::new(()),
            config_store,
            pre_mute_music_vol: StdMutex::new(defaults.music_volume),
            pre_mute_tts_vol: StdMutex::new(defaults.tts_volume),
            pre_mute_earcon_vol: StdMutex::new(defaults.earcon_volume),
            music_muted: StdMutex::new(false),
            tts_muted: StdMutex::new(false),
            earcon_muted: StdMutex::new(false),
            random_mode: StdMutex::new(true),
        }
    }

    fn open_config_store(path: &Path) -> rusqlite::Result<Connection> {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS config (
                section TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (section, key)
            )",
        )?;
        Ok(conn)
    }

    fn persist(&self, key: &str, value: f32) {
        let Some(conn_arc) = &self.config_store else {
            return;
        };
        let conn = conn_arc.lock().unwrap();
        let _ = conn.execute(
            "INSERT OR REPLACE INTO config (section, key, value) VALUES ('audio', ?1, ?2)",
            params![key, value.to_string()],
        );
    }

    fn read_persisted(&self, key: &str) -> Option<f32> {
        let conn_arc = self.config_store.as_ref()?;
        let conn = conn_arc.lock().unwrap();
        conn.query_row(
            "SELECT value FROM config WHERE section = 'audio' AND key = ?1",
            params![key],
            |row| row.get::<_, String>(0),
        )
        .ok()
        .and_then(|raw| raw.parse().ok())
    }

    /// Converts a host filesystem path to the engine-visible path via the
    /// longest matching prefix in `path_mappings`.
    fn to_engine_path(&self, host_path: &Path) -> String {
        let mut best: Option<(&Path, &str)> = None;
        for (host_base, engine_base) in &self.config.path_mappings {
            if host_path.starts_with(host_base) {
                let is_longer = best.map(|(b, _)| host_base.as_os_str().len() > b.as_os_str().len()).unwrap_or(true);
                if is_longer {
                    best = Some((host_base, engine_base));
                }
            }
        }
        match best {
            Some((host_base, engine_base)) => {
                let relative = host_path.strip_prefix(host_base).unwrap_or(host_path);
                format!("{}/{}", engine_base.trim_end_matches('/'), relative.display())
            }
            None => host_path.display().to_string(),
        }
    }

    /// Opens a fresh connection, writes `command\n`, reads lines until a
    /// literal `END`, sends `quit\n`, closes. Serialized process-wide by
    /// `self.lock`.
    async fn send_command(&self, command: &str) -> Result<String> {
        let _guard = self.lock.lock().await;

        let connect = TcpStream::connect((self.config.host.as_str(), self.config.port));
        let stream = timeout(COMMAND_TIMEOUT, connect)
            .await
            .map_err(|_| Error::Unreachable(format!("connect timed out: {command}")))?
            .map_err(|e| Error::Unreachable(format!("connect failed: {e}")))?;

        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        write_half
            .write_all(format!("{command}\n").as_bytes())
            .await
            .map_err(|e| Error::Unreachable(format!("write failed: {e}")))?;

        let mut response_lines = Vec::new();
        loop {
            let mut line = String::new();
            let read = timeout(COMMAND_TIMEOUT, reader.read_line(&mut line))
                .await
                .map_err(|_| Error::Unreachable(format!("read timed out: {command}")))?
                .map_err(|e| Error::Unreachable(format!("read failed: {e}")))?;
            if read == 0 {
                break;
            }
            let trimmed = line.trim_end_matches(['\n', '\r']);
            if trimmed == "END" {
                break;
            }
            response_lines.push(trimmed.to_string());
        }

        let _ = write_half.write_all(b"quit\n").await;
        let _ = write_half.shutdown().await;

        Ok(response_lines.join("\n"))
    }

    async fn run(&self, command: &str, context: &str) -> Result<String> {
        self.send_command(command).await.map_err(|e| {
            tracing::warn!(command, context, error = %e, "mixer command failed");
            e
        })
    }

    /// Tests connectivity (`version`) and, if reachable, restores any
    /// persisted volume settings.
    pub async fn start(&self) -> bool {
        let connected = self.run("version", "start").await.is_ok();
        if connected {
            self.load_saved_volumes().await;
        }
        connected
    }

    /// No-op: mixer connections are per-command, nothing to tear down.
    pub async fn stop(&self) {}

    async fn load_saved_volumes(&self) {
        let keys = [
            "music_vol",
            "tts_vol",
            "earcon_vol",
            "duck_amount",
            "crossfade_duration",
            "duck_in_duration",
            "duck_out_duration",
            "duck_in_curve",
            "duck_out_curve",
        ];
        for key in keys {
            if let Some(value) = self.read_persisted(key) {
                let _ = self.run(&format!("var.set {key} = {value}"), "restore").await;
            }
        }
        if let Some(v) = self.read_persisted("music_vol") {
            if v > 0.0 {
                *self.pre_mute_music_vol.lock().unwrap() = v;
            }
        }
        if let Some(v) = self.read_persisted("tts_vol") {
            if v > 0.0 {
                *self.pre_mute_tts_vol.lock().unwrap() = v;
            }
        }
        if let Some(v) = self.read_persisted("earcon_vol") {
            if v > 0.0 {
                *self.pre_mute_earcon_vol.lock().unwrap() = v;
            }
        }
    }

    pub async fn queue_tts(&self, path: &Path) -> bool {
        let engine_path = self.to_engine_path(path);
        self.run(&format!("tts.push {engine_path}"), "queue_tts").await.is_ok()
    }

    pub async fn queue_earcon(&self, path: &Path) -> bool {
        let engine_path = self.to_engine_path(path);
        self.run(&format!("earcons.push {engine_path}"), "queue_earcon").await.is_ok()
    }

    pub async fn queue_music(&self, path: &Path) -> bool {
        let engine_path = self.to_engine_path(path);
        self.run(&format!("music_q.push {engine_path}"), "queue_music").await.is_ok()
    }

    /// Clears the engine's music queue, mirroring `tts.flush_and_skip`'s
    /// shape for the voice queue. Used by the planner when a queue mutation
    /// requires re-pushing the whole upcoming list from scratch.
    pub async fn flush_music(&self) -> bool {
        self.run("music_q.flush", "flush_music").await.is_ok()
    }

    /// Number of tracks queued in the engine's music queue, or 0 on any
    /// failure (connection or parse).
    pub async fn music_queue_length(&self) -> u32 {
        match self.run("music_q.queue_length", "music_queue_length").await {
            Ok(resp) => resp.trim().parse().unwrap_or(0),
            Err(_) => 0,
        }
    }

    pub async fn flush_tts(&self) -> bool {
        self.run("tts.flush_and_skip", "flush_tts").await.is_ok()
    }

    pub async fn skip_tts(&self) -> bool {
        self.run("tts.skip", "skip_tts").await.is_ok()
    }

    pub async fn next_track(&self) -> bool {
        self.run("music.skip", "next_track").await.is_ok()
    }

    async fn set_scalar(&self, var: &str, value: f32, persist: bool) -> bool {
        let ok = self.run(&format!("var.set {var} = {value}"), "set_scalar").await.is_ok();
        if ok && persist {
            self.persist(var, value);
        }
        ok
    }

    pub async fn set_music_volume(&self, vol: f32) -> bool {
        let vol = vol.clamp(0.0, 1.0);
        let ok = self.set_scalar("music_vol", vol, true).await;
        if ok {
            *self.music_muted.lock().unwrap() = vol == 0.0;
            if vol > 0.0 {
                *self.pre_mute_music_vol.lock().unwrap() = vol;
            }
        }
        ok
    }

    pub async fn set_tts_volume(&self, vol: f32) -> bool {
        let vol = vol.clamp(0.0, 1.0);
        let ok = self.set_scalar("tts_vol", vol, true).await;
        if ok {
            *self.tts_muted.lock().unwrap() = vol == 0.0;
            if vol > 0.0 {
                *self.pre_mute_tts_vol.lock().unwrap() = vol;
            }
        }
        ok
    }

    pub async fn set_earcon_volume(&self, vol: f32) -> bool {
        let vol = vol.clamp(0.0, 1.0);
        let ok = self.set_scalar("earcon_vol", vol, true).await;
        if ok {
            *self.earcon_muted.lock().unwrap() = vol == 0.0;
            if vol > 0.0 {
                *self.pre_mute_earcon_vol.lock().unwrap() = vol;
            }
        }
        ok
    }

    /// `persist = false` is used by the Voice Scheduler's `gentle_duck` mix
    /// mode for its temporary, non-persistent duck-amount bump.
    pub async fn set_duck_amount(&self, amount: f32, persist: bool) -> bool {
        self.set_scalar("duck_amount", amount.clamp(0.0, 1.0), persist).await
    }

    pub async fn set_crossfade_duration(&self, seconds: f32) -> bool {
        self.set_scalar("crossfade_duration", seconds.clamp(1.0, 15.0), true).await
    }

    pub async fn set_duck_in_duration(&self, seconds: f32) -> bool {
        self.set_scalar("duck_in_duration", seconds.clamp(0.05, 5.0), true).await
    }

    pub async fn set_duck_out_duration(&self, seconds: f32) -> bool {
        self.set_scalar("duck_out_duration", seconds.clamp(0.05, 5.0), true).await
    }

    pub async fn set_duck_in_curve(&self, cy: f32) -> bool {
        self.set_scalar("duck_in_curve", cy.clamp(0.0, 1.0), true).await
    }

    pub async fn set_duck_out_curve(&self, cy: f32) -> bool {
        self.set_scalar("duck_out_curve", cy.clamp(0.0, 1.0), true).await
    }

    /// Every field falls back independently to its documented default on a
    /// read failure — never an all-or-nothing failure.
    pub async fn get_volumes(&self) -> MixerState {
        let mut state = MixerState::default();
        let fields: [(&str, &mut f32); 9] = [
            ("music_vol", &mut state.music_volume),
            ("tts_vol", &mut state.tts_volume),
            ("earcon_vol", &mut state.earcon_volume),
            ("duck_amount", &mut state.duck_amount),
            ("crossfade_duration", &mut state.crossfade_duration),
            ("duck_in_duration", &mut state.duck_in_duration),
            ("duck_out_duration", &mut state.duck_out_duration),
            ("duck_in_curve", &mut state.duck_in_curve),
            ("duck_out_curve", &mut state.duck_out_curve),
        ];
        for (var, slot) in fields {
            if let Ok(resp) = self.run(&format!("var.get {var}"), "get_volumes").await {
                if let Ok(value) = resp.trim().parse::<f32>() {
                    *slot = value;
                }
            }
        }
        state
    }

    /// Toggles mute, returning `(is_muted, volume_now_applied)`.
    pub async fn toggle_music_mute(&self) -> (bool, f32) {
        let muted = *self.music_muted.lock().unwrap();
        if muted {
            let restore = *self.pre_mute_music_vol.lock().unwrap();
            self.set_music_volume(restore).await;
            (false, restore)
        } else {
            self.set_music_volume(0.0).await;
            (true, 0.0)
        }
    }

    pub async fn toggle_tts_mute(&self) -> (bool, f32) {
        let muted = *self.tts_muted.lock().unwrap();
        if muted {
            let restore = *self.pre_mute_tts_vol.lock().unwrap();
            self.set_tts_volume(restore).await;
            (false, restore)
        } else {
            self.set_tts_volume(0.0).await;
            (true, 0.0)
        }
    }

    pub async fn toggle_earcon_mute(&self) -> (bool, f32) {
        let muted = *self.earcon_muted.lock().unwrap();
        if muted {
            let restore = *self.pre_mute_earcon_vol.lock().unwrap();
            self.set_earcon_volume(restore).await;
            (false, restore)
        } else {
            self.set_earcon_volume(0.0).await;
            (true, 0.0)
        }
    }

    /// In-memory flip only — the engine's own playlist randomization is
    /// set at its own init and isn't reloaded here.
    pub async fn toggle_random(&self) -> bool {
        let mut guard = self.random_mode.lock().unwrap();
        *guard = !*guard;
        *guard
    }

    pub fn random_mode(&self) -> bool {
        *self.random_mode.lock().unwrap()
    }

    pub async fn get_track_info(&self) -> TrackInfo {
        let mut info = TrackInfo::default();
        let Ok(resp) = self.run("music.info", "get_track_info").await else {
            return info;
        };
        let mut fields: HashMap<&str, &mut String> = HashMap::from([
            ("artist", &mut info.artist),
            ("title", &mut info.title),
            ("filename", &mut info.filename),
            ("genre", &mut info.genre),
            ("year", &mut info.year),
            ("album", &mut info.album),
        ]);
        for line in resp.lines() {
            if let Some((key, value)) = line.split_once('=') {
                if let Some(slot) = fields.get_mut(key.trim()) {
                    **slot = value.trim().to_string();
                }
            }
        }
        info
    }

    pub async fn get_remaining(&self) -> f64 {
        match self.run("music.remaining", "get_remaining").await {
            Ok(resp) => resp.trim().parse().unwrap_or(-1.0),
            Err(_) => -1.0,
        }
    }

    pub async fn get_elapsed(&self) -> f64 {
        match self.run("music.elapsed", "get_elapsed").await {
            Ok(resp) => resp.trim().parse().unwrap_or(-1.0),
            Err(_) => -1.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_without_store() -> Client {
        Client::new(
            MixerConfig {
                host: "127.0.0.1".to_string(),
                port: 1,
                path_mappings: vec![(PathBuf::from("/music"), "/srv/music".to_string())],
            },
            None,
        )
    }

    #[test]
    fn engine_path_uses_longest_matching_prefix() {
        let client = Client::new(
            MixerConfig {
                host: "x".into(),
                port: 1,
                path_mappings: vec![
                    (PathBuf::from("/music"), "/m".to_string()),
                    (PathBuf::from("/music/rock"), "/m/rock".to_string()),
                ],
            },
            None,
        );
        assert_eq!(
            client.to_engine_path(Path::new("/music/rock/song.mp3")),
            "/m/rock/song.mp3"
        );
        assert_eq!(
            client.to_engine_path(Path::new("/music/jazz/song.mp3")),
            "/m/jazz/song.mp3"
        );
    }

    #[test]
    fn engine_path_falls_back_to_host_path_when_unmapped() {
        let client = client_without_store();
        assert_eq!(
            client.to_engine_path(Path::new("/other/song.mp3")),
            "/other/song.mp3"
        );
    }

    #[tokio::test]
    async fn unreachable_mixer_fails_closed_on_every_op() {
        let client = client_without_store();
        assert!(!client.start().await);
        assert!(!client.queue_music(Path::new("/music/a.mp3")).await);
        assert_eq!(client.music_queue_length().await, 0);
        assert_eq!(client.get_remaining().await, -1.0);
        assert_eq!(client.get_elapsed().await, -1.0);
    }

    #[tokio::test]
    async fn get_volumes_falls_back_to_defaults_when_unreachable() {
        let client = client_without_store();
        let state = client.get_volumes().await;
        assert_eq!(state, MixerState::default());
    }

    #[tokio::test]
    async fn toggle_random_flips_in_memory_only() {
        let client = client_without_store();
        assert!(client.random_mode());
        let new_state = client.toggle_random().await;
        assert!(!new_state);
        assert!(!client.random_mode());
    }
}
