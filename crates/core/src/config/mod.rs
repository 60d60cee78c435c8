use std::{fs, path::Path};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    matcher::clamp_session_duration,
    onset::OnsetConfig,
    pattern::{clamp_bpm, BeatSlot, PatternKind, RhythmPattern, DEFAULT_BPM},
    session::{CaptureMode, SessionContext},
    Result,
};

/// Top-level configuration structure for the application.
///
/// Every section falls back to its defaults when missing from the JSON
/// document, and [`AppConfig::sanitized`] pulls numeric values back into
/// their supported ranges instead of rejecting them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub tempo: TempoConfig,
    pub session: SessionConfig,
    pub onset: OnsetConfig,
    pub audio: AudioConfig,
}

impl AppConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        Ok(config.sanitized())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        let config = Self::from_json_str(&json)?;
        debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn sanitized(self) -> Self {
        Self {
            tempo: TempoConfig {
                bpm: clamp_bpm(self.tempo.bpm),
                ..self.tempo
            },
            session: SessionConfig {
                duration_seconds: clamp_session_duration(self.session.duration_seconds),
                countdown_beats: self.session.countdown_beats.min(16),
                sweep_interval_ms: self.session.sweep_interval_ms.clamp(10, 1_000),
                ..self.session
            },
            onset: self.onset.sanitized(),
            audio: AudioConfig {
                sample_rate: self.audio.sample_rate.clamp(8_000, 192_000),
                block_size: self.audio.block_size.clamp(64, 16_384),
                ..self.audio
            },
        }
    }

    /// Resolves the configured pattern, preferring custom slots when given.
    pub fn pattern(&self) -> Result<RhythmPattern> {
        match &self.tempo.custom {
            Some(custom) => RhythmPattern::custom(custom.slots.clone(), custom.subdivisions),
            None => Ok(self.tempo.pattern.pattern()),
        }
    }

    /// Builds the per-session context handed to every component.
    pub fn session_context(&self) -> Result<SessionContext> {
        SessionContext::from_config(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TempoConfig {
    pub bpm: f64,
    pub pattern: PatternKind,
    /// User-defined measure; overrides `pattern` when present.
    pub custom: Option<CustomPatternConfig>,
}

impl Default for TempoConfig {
    fn default() -> Self {
        Self {
            bpm: DEFAULT_BPM,
            pattern: PatternKind::QuarterNotes,
            custom: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomPatternConfig {
    pub slots: Vec<BeatSlot>,
    pub subdivisions: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub duration_seconds: f64,
    pub countdown_beats: u32,
    pub capture_mode: CaptureMode,
    pub sweep_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            duration_seconds: 60.0,
            countdown_beats: 4,
            capture_mode: CaptureMode::Tap,
            sweep_interval_ms: 100,
        }
    }
}

/// Configuration specific to the audio subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub block_size: usize,
    pub device_name: String,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            block_size: 1024,
            device_name: "default".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = AppConfig::from_json_str("{}").unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.tempo.bpm, 90.0);
        assert_eq!(config.session.countdown_beats, 4);
        assert_eq!(config.session.capture_mode, CaptureMode::Tap);
        assert_eq!(config.audio.block_size, 1024);
    }

    #[test]
    fn out_of_range_values_are_clamped() {
        let config = AppConfig::from_json_str(
            r#"{
                "tempo": { "bpm": 500, "pattern": "triplets" },
                "session": { "duration_seconds": 0.1, "sweep_interval_ms": 1 },
                "onset": { "amplitude_threshold": 3.0 },
                "audio": { "sample_rate": 100 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.tempo.bpm, 240.0);
        assert_eq!(config.tempo.pattern, PatternKind::Triplets);
        assert_eq!(config.session.duration_seconds, 1.0);
        assert_eq!(config.session.sweep_interval_ms, 10);
        assert_eq!(config.onset.amplitude_threshold, 1.0);
        assert_eq!(config.onset.min_interval_ms, 50.0);
        assert_eq!(config.audio.sample_rate, 8_000);
    }

    #[test]
    fn custom_pattern_overrides_preset() {
        let config = AppConfig::from_json_str(
            r#"{ "tempo": { "custom": { "subdivisions": 1, "slots": [
                { "offset_fraction": 0.0, "accented": true, "is_rest": false },
                { "offset_fraction": 0.5, "accented": false, "is_rest": false }
            ] } } }"#,
        )
        .unwrap();

        let pattern = config.pattern().unwrap();
        assert_eq!(pattern.kind(), PatternKind::Custom);
        assert_eq!(pattern.slot_count(), 2);
    }

    #[test]
    fn invalid_custom_pattern_is_reported() {
        let mut config = AppConfig::default();
        config.tempo.custom = Some(CustomPatternConfig {
            slots: Vec::new(),
            subdivisions: 1,
        });
        assert!(config.pattern().is_err());
        assert!(config.session_context().is_err());
    }

    #[test]
    fn loads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trainer.json");
        let mut config = AppConfig::default();
        config.tempo.bpm = 132.0;
        std::fs::write(&path, config.to_json_pretty().unwrap()).unwrap();

        assert_eq!(AppConfig::load(&path).unwrap().tempo.bpm, 132.0);
        assert!(AppConfig::load(&dir.path().join("missing.json")).is_err());
        assert!(AppConfig::from_json_str("not json").is_err());
    }
}
