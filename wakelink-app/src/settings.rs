//! Host settings: a JSON file holding the pipeline configuration plus a few
//! host-only knobs.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use wakelink_core::PipelineConfig;

pub const DEFAULT_SETTINGS_FILE: &str = "wakelink.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    #[serde(flatten)]
    pub pipeline: PipelineConfig,
    /// Overrides the default log filter when `RUST_LOG` is unset.
    pub log_filter: Option<String>,
    /// Detections kept in the in-memory history.
    pub history_len: usize,
    /// Pace WAV input at real time instead of as fast as it can be read.
    pub wav_realtime: bool,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            pipeline: PipelineConfig::default(),
            log_filter: None,
            history_len: 20,
            wav_realtime: true,
        }
    }
}

impl AppSettings {
    pub fn normalize(&mut self) {
        self.pipeline.normalize();
        self.log_filter = self
            .log_filter
            .as_ref()
            .map(|f| f.trim().to_string())
            .filter(|f| !f.is_empty());
        self.history_len = self.history_len.clamp(1, 1000);
    }
}

pub fn default_settings_path() -> PathBuf {
    PathBuf::from(DEFAULT_SETTINGS_FILE)
}

/// Load and normalise settings. A missing file yields defaults; an unreadable
/// or malformed one is an error.
pub fn load_settings(path: &Path) -> anyhow::Result<AppSettings> {
    let mut settings = match fs::read_to_string(path) {
        Ok(raw) => serde_json::from_str::<AppSettings>(&raw)
            .with_context(|| format!("parsing settings file {}", path.display()))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => AppSettings::default(),
        Err(e) => {
            return Err(e).with_context(|| format!("reading settings file {}", path.display()))
        }
    };
    settings.normalize();
    Ok(settings)
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings)?;
    fs::write(path, json).with_context(|| format!("writing settings file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings(&dir.path().join("absent.json")).unwrap();
        assert_eq!(settings.history_len, 20);
        assert_eq!(settings.pipeline.volume_steps, 15);
    }

    #[test]
    fn pipeline_fields_are_read_from_the_top_level() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wakelink.json");
        fs::write(
            &path,
            r#"{"keywords":"hey link","threshold":2.0,"logFilter":"  ","historyLen":0}"#,
        )
        .unwrap();

        let settings = load_settings(&path).unwrap();
        assert_eq!(settings.pipeline.keywords, "hey link");
        assert!((settings.pipeline.threshold - 0.99).abs() < f32::EPSILON);
        assert!(settings.log_filter.is_none());
        assert_eq!(settings.history_len, 1);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wakelink.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(load_settings(&path).is_err());
    }

    #[test]
    fn saved_settings_load_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("wakelink.json");
        let mut settings = AppSettings::default();
        settings.pipeline.threshold = 0.4;
        settings.wav_realtime = false;
        save_settings(&path, &settings).unwrap();

        let loaded = load_settings(&path).unwrap();
        assert!((loaded.pipeline.threshold - 0.4).abs() < f32::EPSILON);
        assert!(!loaded.wav_realtime);
    }
}
