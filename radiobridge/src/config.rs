//! Typed settings surface for the binary's handful of knobs.
//!
//! `spec.md` §1 places generic configuration loading out of scope (it's the
//! chat front-end's concern), but the core still needs somewhere to read
//! mixer host/port, path mappings, and the various interval/threshold knobs
//! from. This mirrors the teacher's "embedded default + optional override
//! file" shape (`pmoconfig::DEFAULT_CONFIG`) at a fraction of its scope: no
//! encryption, no REST API, no plugin-instance CRUD, no hot reload.

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_yaml::Value;
use std::path::{Path, PathBuf};

const DEFAULT_CONFIG: &str = include_str!("default.yaml");

#[derive(Debug, Clone, Deserialize)]
pub struct MixerSettings {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub path_mappings: Vec<(PathBuf, String)>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlaylistSettings {
    pub music_dir: PathBuf,
    pub lookahead: usize,
    pub scan_interval_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamSettings {
    pub poll_interval_seconds: u64,
    pub track_ending_threshold_seconds: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub station_name: String,
    pub mixer: MixerSettings,
    pub playlist: PlaylistSettings,
    pub stream: StreamSettings,
    pub data_dir: PathBuf,
}

impl Settings {
    /// Loads the embedded default, merges an optional override file on top
    /// (missing file is not an error — the embedded default stands alone),
    /// and deserializes the merged tree into the typed struct.
    pub fn load(override_path: Option<&Path>) -> Result<Self> {
        let mut merged: Value =
            serde_yaml::from_str(DEFAULT_CONFIG).context("embedded default config is malformed")?;

        if let Some(path) = override_path {
            match std::fs::read_to_string(path) {
                Ok(contents) => {
                    let external: Value = serde_yaml::from_str(&contents)
                        .with_context(|| format!("parsing config override {}", path.display()))?;
                    merge_yaml(&mut merged, &external);
                    tracing::info!(path = %path.display(), "loaded config override");
                }
                Err(e) => {
                    tracing::info!(path = %path.display(), error = %e, "no config override found, using embedded default");
                }
            }
        }

        serde_yaml::from_value(merged).context("deserializing merged configuration")
    }

    pub fn sqlite_path(&self, name: &str) -> PathBuf {
        self.data_dir.join(name)
    }
}

/// Recursively merges `external` over `default`: mappings merge key by key,
/// anything else (scalars, sequences) is replaced wholesale.
fn merge_yaml(default: &mut Value, external: &Value) {
    match (default, external) {
        (Value::Mapping(dmap), Value::Mapping(emap)) => {
            for (k, v) in emap {
                match dmap.get_mut(k) {
                    Some(dv) => merge_yaml(dv, v),
                    None => {
                        dmap.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        (d, e) => *d = e.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_default_loads_without_an_override() {
        let settings = Settings::load(None).unwrap();
        assert_eq!(settings.mixer.port, 1234);
        assert_eq!(settings.playlist.lookahead, 5);
    }

    #[test]
    fn override_file_replaces_only_the_keys_it_sets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("override.yaml");
        std::fs::write(&path, "mixer:\n  host: \"10.0.0.5\"\n  port: 9999\n").unwrap();

        let settings = Settings::load(Some(&path)).unwrap();
        assert_eq!(settings.mixer.host, "10.0.0.5");
        assert_eq!(settings.mixer.port, 9999);
        // untouched keys still come from the embedded default
        assert_eq!(settings.playlist.lookahead, 5);
    }

    #[test]
    fn missing_override_path_falls_back_to_default() {
        let settings = Settings::load(Some(Path::new("/nonexistent/radiobridge.yaml"))).unwrap();
        assert_eq!(settings.station_name, "Radio Bridge");
    }
}
