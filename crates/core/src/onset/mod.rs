use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    analysis::{cosine_similarity, SpectralAnalyzer},
    Result, RhythmError,
};

/// Samples further than this above full scale mark the frame as malformed.
const FULL_SCALE_TOLERANCE: f32 = 1e-3;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OnsetConfig {
    /// Minimum peak amplitude (linear, full scale = 1.0) for a candidate onset.
    pub amplitude_threshold: f32,
    /// Debounce window measured from the previous accepted onset.
    pub min_interval_ms: f64,
    /// Minimum cosine similarity to the calibration profile.
    pub similarity_threshold: f32,
}

impl Default for OnsetConfig {
    fn default() -> Self {
        Self {
            amplitude_threshold: 0.1,
            min_interval_ms: 50.0,
            similarity_threshold: 0.6,
        }
    }
}

impl OnsetConfig {
    pub fn sanitized(self) -> Self {
        let defaults = Self::default();
        Self {
            amplitude_threshold: finite_or(self.amplitude_threshold, defaults.amplitude_threshold)
                .clamp(0.0, 1.0),
            min_interval_ms: if self.min_interval_ms.is_finite() {
                self.min_interval_ms.clamp(0.0, 1_000.0)
            } else {
                defaults.min_interval_ms
            },
            similarity_threshold: finite_or(self.similarity_threshold, defaults.similarity_threshold)
                .clamp(0.0, 1.0),
        }
    }

    fn min_interval_seconds(&self) -> f64 {
        self.min_interval_ms / 1000.0
    }
}

fn finite_or(value: f32, fallback: f32) -> f32 {
    if value.is_finite() {
        value
    } else {
        fallback
    }
}

/// An accepted onset, stamped with the capture time of the frame it came from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Onset {
    pub timestamp: f64,
    pub peak: f32,
    /// Similarity to the calibration profile, when one was applied.
    pub similarity: Option<f32>,
}

/// Outcome of feeding a single frame to the detector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OnsetDecision {
    /// Empty, non-finite or out-of-range buffer.
    Invalid,
    /// Peak below the amplitude threshold.
    Silent,
    /// Loud enough but inside the debounce window of the last onset.
    Debounced,
    /// Spectrum did not match the calibrated instrument.
    Rejected { similarity: f32 },
    Accepted(Onset),
}

impl OnsetDecision {
    pub fn onset(&self) -> Option<Onset> {
        match self {
            OnsetDecision::Accepted(onset) => Some(*onset),
            _ => None,
        }
    }
}

/// Turns a stream of audio frames into discrete onset events.
#[derive(Debug)]
pub struct OnsetDetector {
    config: OnsetConfig,
    analyzer: SpectralAnalyzer,
    profile: Option<Vec<f32>>,
    last_onset: Option<f64>,
    sink: Option<Sender<Onset>>,
}

impl OnsetDetector {
    pub fn new(config: OnsetConfig, analyzer: SpectralAnalyzer) -> Self {
        Self {
            config: config.sanitized(),
            analyzer,
            profile: None,
            last_onset: None,
            sink: None,
        }
    }

    /// Also publish every accepted onset on `sink`.
    pub fn with_sink(mut self, sink: Sender<Onset>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn config(&self) -> &OnsetConfig {
        &self.config
    }

    pub fn analyzer(&self) -> &SpectralAnalyzer {
        &self.analyzer
    }

    pub fn is_calibrated(&self) -> bool {
        self.profile.is_some()
    }

    /// Forgets the debounce history, e.g. between sessions.
    pub fn reset(&mut self) {
        self.last_onset = None;
    }

    /// Examines one frame captured at `timestamp` (seconds on the session
    /// clock). Accepted onsets carry `timestamp` itself so processing latency
    /// never leaks into the scored time.
    pub fn ingest(&mut self, frame: &[f32], timestamp: f64) -> OnsetDecision {
        let Some(peak) = peak_amplitude(frame) else {
            return OnsetDecision::Invalid;
        };
        if !timestamp.is_finite() {
            return OnsetDecision::Invalid;
        }
        if peak < self.config.amplitude_threshold {
            return OnsetDecision::Silent;
        }

        if let Some(last) = self.last_onset {
            if timestamp - last <= self.config.min_interval_seconds() {
                debug!(timestamp, last, "onset suppressed by debounce window");
                return OnsetDecision::Debounced;
            }
        }

        let similarity = match self.profile.as_deref() {
            Some(profile) => match self.analyzer.analyze(frame) {
                Ok(spectrum) => {
                    let similarity = cosine_similarity(profile, &spectrum.magnitudes);
                    if similarity < self.config.similarity_threshold {
                        debug!(timestamp, similarity, "onset rejected by calibration profile");
                        return OnsetDecision::Rejected { similarity };
                    }
                    Some(similarity)
                }
                Err(err) => {
                    warn!(%err, "spectral analysis failed; treating frame as no onset");
                    return OnsetDecision::Invalid;
                }
            },
            None => None,
        };

        let onset = Onset {
            timestamp,
            peak,
            similarity,
        };
        self.last_onset = Some(timestamp);
        if let Some(sink) = &self.sink {
            if sink.send(onset).is_err() {
                debug!("onset sink disconnected");
            }
        }

        OnsetDecision::Accepted(onset)
    }

    /// Stores the spectral profile of a clean reference hit.
    pub fn calibrate(&mut self, sample: &[f32]) -> Result<()> {
        if peak_amplitude(sample).is_none() {
            return Err(RhythmError::Calibration("reference sample is malformed"));
        }

        let spectrum = self.analyzer.analyze(sample)?;
        if spectrum.is_silent() {
            warn!("refusing to calibrate against a silent sample");
            return Err(RhythmError::Calibration("reference sample is silent"));
        }

        info!(
            centroid_hz = spectrum.centroid(),
            "onset detector calibrated"
        );
        self.profile = Some(spectrum.magnitudes);
        Ok(())
    }

    /// Reverts to amplitude-only validation.
    pub fn reset_calibration(&mut self) {
        self.profile = None;
    }
}

/// Peak absolute sample value, or `None` for buffers that cannot be trusted.
fn peak_amplitude(frame: &[f32]) -> Option<f32> {
    if frame.is_empty() {
        return None;
    }

    let mut peak = 0.0f32;
    for sample in frame {
        if !sample.is_finite() {
            return None;
        }
        peak = peak.max(sample.abs());
    }

    (peak <= 1.0 + FULL_SCALE_TOLERANCE).then_some(peak)
}
