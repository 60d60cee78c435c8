use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

pub const NANOS_PER_SECOND: f64 = 1_000_000_000.0;

/// Monotonic time reference shared by the beat clock, the capture path and
/// the matcher. Values never wrap or go backwards during a session.
pub trait ClockSource: Send + Sync {
    fn now_nanos(&self) -> u64;

    fn now_seconds(&self) -> f64 {
        nanos_to_seconds(self.now_nanos())
    }
}

pub type SharedClock = Arc<dyn ClockSource>;

/// Wall clock backed by [`Instant`], anchored when constructed.
#[derive(Clone)]
pub struct MonotonicClock {
    anchor: Instant,
}

impl MonotonicClock {
    /// Anchors time zero at the moment of the call.
    pub fn new() -> Self {
        Self {
            anchor: Instant::now(),
        }
    }

    /// A fresh clock behind the shared trait object.
    pub fn shared() -> SharedClock {
        Arc::new(Self::new())
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockSource for MonotonicClock {
    fn now_nanos(&self) -> u64 {
        // u64 nanoseconds cover ~584 years from the anchor.
        self.anchor.elapsed().as_nanos() as u64
    }
}

impl fmt::Debug for MonotonicClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonotonicClock")
            .field("elapsed", &self.anchor.elapsed())
            .finish()
    }
}

/// Hand-driven clock for tests and offline scoring. Time only moves when the
/// owner advances it, and it refuses to move backwards.
#[derive(Debug, Default, Clone)]
pub struct ManualClock {
    nanos: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves to `nanos`; earlier values are ignored.
    pub fn set_nanos(&self, nanos: u64) {
        self.nanos.fetch_max(nanos, Ordering::AcqRel);
    }

    pub fn set_seconds(&self, seconds: f64) {
        self.set_nanos(seconds_to_nanos(seconds));
    }

    /// Moves forward by `delta`.
    pub fn advance(&self, delta: Duration) {
        self.nanos
            .fetch_add(delta.as_nanos() as u64, Ordering::AcqRel);
    }
}

impl ClockSource for ManualClock {
    fn now_nanos(&self) -> u64 {
        self.nanos.load(Ordering::Acquire)
    }
}

/// Clock nanoseconds as fractional seconds.
pub fn nanos_to_seconds(nanos: u64) -> f64 {
    nanos as f64 / NANOS_PER_SECOND
}

/// Converts seconds to nanoseconds, saturating negative and non-finite input
/// at zero.
pub fn seconds_to_nanos(seconds: f64) -> u64 {
    if !seconds.is_finite() || seconds <= 0.0 {
        return 0;
    }
    (seconds * NANOS_PER_SECOND).round() as u64
}

/// Signed offset of `nanos` from `origin`, in seconds. Captures that land
/// before the session origin come out negative.
pub fn seconds_since(origin: u64, nanos: u64) -> f64 {
    (nanos as i128 - origin as i128) as f64 / NANOS_PER_SECOND
}
