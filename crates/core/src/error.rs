/// Result alias that carries the custom [`RhythmError`] type.
pub type Result<T> = std::result::Result<T, RhythmError>;

/// Common error type for the core crate.
///
/// Out-of-range tunables never end up here: they are clamped where they are
/// consumed. The variants below cover conditions a caller has to react to,
/// such as a missing microphone or a malformed custom pattern.
#[derive(Debug, thiserror::Error)]
pub enum RhythmError {
    /// Free-form message for conditions that do not warrant their own variant.
    #[error("{0}")]
    Message(String),
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    #[error("invalid rhythm pattern: {0}")]
    InvalidPattern(String),
    #[error("calibration failed: {0}")]
    Calibration(&'static str),
    /// The audio input could not be opened. Sessions may still run in tap mode.
    #[error("capture unavailable: {0}")]
    CaptureUnavailable(String),
    /// Another holder owns the audio input device.
    #[error("audio input device is already held by `{holder}`")]
    DeviceBusy { holder: String },
    #[error("{0} has been poisoned")]
    Poisoned(&'static str),
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("configuration error: {0}")]
    Config(#[from] serde_json::Error),
    #[error("fft error: {0}")]
    Fft(#[from] realfft::FftError),
    #[error("wav error: {0}")]
    Wav(#[from] hound::Error),
}

impl RhythmError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    /// True when the failure means the microphone path is unusable and the
    /// caller should fall back to tap capture.
    pub fn is_capture_unavailable(&self) -> bool {
        matches!(
            self,
            Self::CaptureUnavailable(_) | Self::DeviceBusy { .. } | Self::Wav(_)
        )
    }
}
