//! Core library for the Rhythm Trainer application.
//!
//! The crate is split along the timing path of a practice session:
//!
//! - [`beat_clock`] emits countdown and beat events on an absolute timeline,
//! - [`analysis`] and [`onset`] turn audio frames into timestamped onsets,
//! - [`matcher`] attributes captures to target beats and scores them,
//! - [`session`] wires the three together for live and offline use.
//!
//! All components read time from one [`clock::ClockSource`] so that beat
//! deadlines, captures and sweeps share a single reference.

pub mod analysis;
pub mod audio;
pub mod beat_clock;
pub mod clock;
pub mod config;
pub mod error;
pub mod matcher;
pub mod onset;
pub mod pattern;
pub mod scoring;
pub mod session;

pub use analysis::{cosine_similarity, SpectralAnalyzer, SpectralProfile, Spectrum};
pub use audio::{AudioFrame, BufferFrameSource, CaptureEngine, FrameSource, InputDevice, WavFrameSource};
pub use beat_clock::{BeatClock, BeatTick, ClockEvent, ClockPhase, DriftStats, TickPlan};
pub use clock::{ClockSource, ManualClock, MonotonicClock, SharedClock};
pub use config::{AppConfig, AudioConfig, SessionConfig, TempoConfig};
pub use error::{Result, RhythmError};
pub use matcher::{CaptureOutcome, RhythmMatcher, SessionPhase, SharedMatcher};
pub use onset::{Onset, OnsetConfig, OnsetDecision, OnsetDetector};
pub use pattern::{BeatSlot, CapturedEvent, PatternKind, RhythmPattern, TargetBeat, TempoSpec};
pub use scoring::{AccuracyTier, BeatResult, Grade, SessionResult, TierCounts};
pub use session::{
    score_offline, score_recording, CaptureMode, SessionContext, SessionController, SessionEvent,
};
