//! Drift-compensated metronome.
//!
//! Every tick deadline is computed from the origin of the current segment and
//! the tick index, never from the time the previous tick actually fired. A
//! late wake-up therefore delays only the tick it belongs to; the ticks after
//! it still aim at their nominal instants.
//!
//! One [`TickPlan`] covers both the countdown and the running phase, so the
//! hand-over from pre-roll to the first beat shares the same timeline.

use std::{
    sync::{Arc, Mutex, MutexGuard},
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    clock::{seconds_since, seconds_to_nanos, ClockSource, SharedClock},
    Result, RhythmError, RhythmPattern, TargetBeat, TempoSpec,
};

pub const DEFAULT_COUNTDOWN_BEATS: u32 = 4;
/// Lateness above this counts as an overrun in [`DriftStats`].
pub const OVERRUN_THRESHOLD_NANOS: u64 = 1_000_000;
/// Final approach to a deadline is spun instead of slept.
const SPIN_WINDOW: Duration = Duration::from_micros(500);

/// Longest single sleep; the clock source is re-read at least this often so
/// a source that jumps forward is noticed promptly.
const MAX_WAIT_SLICE: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClockPhase {
    Idle,
    Countdown,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BeatTick {
    pub target: TargetBeat,
    pub slot_index: usize,
    pub deadline_nanos: u64,
    pub emitted_nanos: u64,
}

impl BeatTick {
    pub fn lateness_nanos(&self) -> u64 {
        self.emitted_nanos.saturating_sub(self.deadline_nanos)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClockEvent {
    CountdownTick {
        remaining: u32,
        deadline_nanos: u64,
        emitted_nanos: u64,
    },
    /// Sent once per `start()`, right before the first running beat.
    /// `origin_nanos` is the session origin all target times refer to.
    CountdownComplete { origin_nanos: u64 },
    Beat(BeatTick),
}

/// Scheduling error bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftStats {
    pub ticks: u64,
    pub overruns: u64,
    pub max_lateness_nanos: u64,
    pub total_lateness_nanos: u64,
}

impl DriftStats {
    /// Records one firing; returns true when it counts as an overrun.
    pub fn record(&mut self, lateness_nanos: u64) -> bool {
        self.ticks += 1;
        self.total_lateness_nanos += lateness_nanos;
        self.max_lateness_nanos = self.max_lateness_nanos.max(lateness_nanos);

        let overrun = lateness_nanos > OVERRUN_THRESHOLD_NANOS;
        if overrun {
            self.overruns += 1;
        }
        overrun
    }

    /// Average lateness over every recorded firing, zero before the first.
    pub fn mean_lateness_nanos(&self) -> f64 {
        if self.ticks == 0 {
            0.0
        } else {
            self.total_lateness_nanos as f64 / self.ticks as f64
        }
    }
}

/// A tick the plan wants fired at `deadline_nanos()`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PlannedTick {
    Countdown { remaining: u32, deadline_nanos: u64 },
    Beat {
        target: TargetBeat,
        slot_index: usize,
        deadline_nanos: u64,
    },
}

impl PlannedTick {
    pub fn deadline_nanos(&self) -> u64 {
        match self {
            PlannedTick::Countdown { deadline_nanos, .. } | PlannedTick::Beat { deadline_nanos, .. } => {
                *deadline_nanos
            }
        }
    }
}

/// Absolute timeline for one uninterrupted segment of clock activity.
///
/// Ticks `0..countdown_ticks` are pre-roll ticks one beat apart; the running
/// beats follow from `run_origin_nanos()`, laid out by the pattern.
#[derive(Debug, Clone)]
pub struct TickPlan {
    origin_nanos: u64,
    tempo: TempoSpec,
    pattern: Arc<RhythmPattern>,
    countdown_ticks: u32,
    first_sequence_index: usize,
    /// Session time (seconds) of this segment's running origin.
    session_offset: f64,
    announce_origin: bool,
}

impl TickPlan {
    /// Plan for a fresh start: pre-roll followed by beats from index 0.
    pub fn starting(
        origin_nanos: u64,
        tempo: TempoSpec,
        pattern: Arc<RhythmPattern>,
        countdown_ticks: u32,
    ) -> Self {
        Self {
            origin_nanos,
            tempo: tempo.sanitized(),
            pattern,
            countdown_ticks,
            first_sequence_index: 0,
            session_offset: 0.0,
            announce_origin: true,
        }
    }

    /// Plan that resumes running beats at `first_sequence_index` from
    /// `origin_nanos`, relative to an already announced session origin.
    pub fn resuming(
        origin_nanos: u64,
        session_origin_nanos: u64,
        tempo: TempoSpec,
        pattern: Arc<RhythmPattern>,
        first_sequence_index: usize,
    ) -> Self {
        Self {
            origin_nanos,
            tempo: tempo.sanitized(),
            pattern,
            countdown_ticks: 0,
            first_sequence_index,
            session_offset: seconds_since(session_origin_nanos, origin_nanos),
            announce_origin: false,
        }
    }

    pub fn tempo(&self) -> TempoSpec {
        self.tempo
    }

    pub fn countdown_ticks(&self) -> u32 {
        self.countdown_ticks
    }

    pub fn beat_nanos(&self) -> u64 {
        seconds_to_nanos(self.tempo.beat_duration())
    }

    pub fn run_origin_nanos(&self) -> u64 {
        self.origin_nanos + self.offset_nanos(self.countdown_ticks as f64 * self.tempo.beat_duration())
    }

    fn offset_nanos(&self, seconds: f64) -> u64 {
        seconds_to_nanos(seconds)
    }

    pub fn tick(&self, index: u64) -> PlannedTick {
        if index < self.countdown_ticks as u64 {
            return PlannedTick::Countdown {
                remaining: self.countdown_ticks - index as u32,
                deadline_nanos: self.origin_nanos
                    + self.offset_nanos(index as f64 * self.tempo.beat_duration()),
            };
        }

        let running_index = (index - self.countdown_ticks as u64) as usize;
        let relative = self.pattern.target_at(&self.tempo, running_index);
        let target = TargetBeat {
            time_seconds: self.session_offset + relative.time_seconds,
            sequence_index: self.first_sequence_index + running_index,
            ..relative
        };

        PlannedTick::Beat {
            target,
            slot_index: running_index % self.pattern.slot_count(),
            deadline_nanos: self.run_origin_nanos() + self.offset_nanos(relative.time_seconds),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ClockState {
    phase: ClockPhase,
    drift: DriftStats,
    session_origin: Option<u64>,
    countdown_emitted: u32,
    last_deadline: Option<u64>,
    last_sequence_index: Option<usize>,
}

impl ClockState {
    fn idle() -> Self {
        Self {
            phase: ClockPhase::Idle,
            drift: DriftStats::default(),
            session_origin: None,
            countdown_emitted: 0,
            last_deadline: None,
            last_sequence_index: None,
        }
    }
}

#[derive(Debug, Clone)]
struct ClockSettings {
    tempo: TempoSpec,
    pattern: Arc<RhythmPattern>,
    countdown_beats: u32,
}

struct Worker {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

/// Beat generator driven by a dedicated timer thread.
///
/// All methods take `&self` so the clock can be shared behind an `Arc` and
/// stopped from any thread. Events go out on the channel handed to
/// [`BeatClock::new`]; once [`BeatClock::stop`] returns no further event is
/// sent.
pub struct BeatClock {
    clock: SharedClock,
    events: Sender<ClockEvent>,
    settings: Mutex<ClockSettings>,
    state: Arc<Mutex<ClockState>>,
    worker: Mutex<Option<Worker>>,
    /// Held by `start`, `stop` and `update_tempo` from halting the old
    /// worker until the replacement is spawned.
    lifecycle: Mutex<()>,
}

impl BeatClock {
    pub fn new(clock: SharedClock, events: Sender<ClockEvent>) -> Self {
        let pattern = RhythmPattern::default();
        Self {
            clock,
            events,
            settings: Mutex::new(ClockSettings {
                tempo: TempoSpec::for_pattern(crate::pattern::DEFAULT_BPM, &pattern),
                pattern: Arc::new(pattern),
                countdown_beats: DEFAULT_COUNTDOWN_BEATS,
            }),
            state: Arc::new(Mutex::new(ClockState::idle())),
            worker: Mutex::new(None),
            lifecycle: Mutex::new(()),
        }
    }

    /// Sets tempo and pattern for the next `start()`.
    pub fn configure(&self, tempo: TempoSpec, pattern: RhythmPattern) -> Result<()> {
        let mut settings = self.lock_settings()?;
        settings.tempo = TempoSpec::new(tempo.bpm, pattern.subdivisions());
        settings.pattern = Arc::new(pattern);
        Ok(())
    }

    /// Pre-roll length for the next `start()`. Zero starts on the first beat.
    pub fn set_countdown_beats(&self, beats: u32) -> Result<()> {
        self.lock_settings()?.countdown_beats = beats;
        Ok(())
    }

    pub fn tempo(&self) -> Result<TempoSpec> {
        Ok(self.lock_settings()?.tempo)
    }

    pub fn phase(&self) -> Result<ClockPhase> {
        Ok(self.lock_state()?.phase)
    }

    pub fn drift_stats(&self) -> Result<DriftStats> {
        Ok(self.lock_state()?.drift)
    }

    /// Session origin announced by the last `CountdownComplete`, if any.
    pub fn session_origin(&self) -> Result<Option<u64>> {
        Ok(self.lock_state()?.session_origin)
    }

    /// Starts the pre-roll immediately. A clock that is already active is
    /// stopped first.
    pub fn start(&self) -> Result<()> {
        let _lifecycle = self.lock_lifecycle()?;
        self.stop_locked()?;

        let settings = self.lock_settings()?.clone();
        let origin = self.clock.now_nanos();
        {
            let mut state = self.lock_state()?;
            *state = ClockState::idle();
            state.phase = ClockPhase::Countdown;
        }

        info!(
            bpm = settings.tempo.bpm,
            pattern = %settings.pattern.kind(),
            countdown = settings.countdown_beats,
            "beat clock starting"
        );
        let plan = TickPlan::starting(origin, settings.tempo, settings.pattern, settings.countdown_beats);
        self.spawn(plan)
    }

    /// Cancels all pending ticks and waits for the timer thread to exit.
    /// Idempotent.
    pub fn stop(&self) -> Result<()> {
        let _lifecycle = self.lock_lifecycle()?;
        self.stop_locked()
    }

    fn stop_locked(&self) -> Result<()> {
        let halted = self.halt_worker()?;
        let mut state = self.lock_state()?;
        if halted || state.phase != ClockPhase::Idle {
            debug!(
                ticks = state.drift.ticks,
                overruns = state.drift.overruns,
                mean_lateness_us = state.drift.mean_lateness_nanos() / 1_000.0,
                "beat clock stopped"
            );
        }
        state.phase = ClockPhase::Idle;
        Ok(())
    }

    /// Changes the tempo. While running, beat generation restarts from now
    /// at the next measure boundary; during the countdown the remaining
    /// pre-roll restarts at the new interval; while idle the tempo is stored
    /// for the next start.
    pub fn update_tempo(&self, bpm: f64) -> Result<()> {
        let (tempo, pattern, countdown_beats) = {
            let mut settings = self.lock_settings()?;
            settings.tempo = TempoSpec::new(bpm, settings.pattern.subdivisions());
            (settings.tempo, settings.pattern.clone(), settings.countdown_beats)
        };

        // A concurrent stop either finishes first and leaves the clock idle,
        // or waits until the new worker is in place and halts it.
        let _lifecycle = self.lock_lifecycle()?;
        let phase = self.lock_state()?.phase;
        if phase == ClockPhase::Idle {
            return Ok(());
        }

        self.halt_worker()?;
        let snapshot = *self.lock_state()?;
        let now = self.clock.now_nanos();

        let plan = match (snapshot.phase, snapshot.session_origin) {
            (ClockPhase::Running, Some(session_origin)) => {
                let slot_count = pattern.slot_count();
                let first_sequence_index = snapshot
                    .last_sequence_index
                    .map(|last| (last / slot_count + 1) * slot_count)
                    .unwrap_or(0);
                let spacing = seconds_to_nanos(pattern.measure_duration(&tempo) / slot_count as f64);
                let origin = earliest_origin(now, snapshot.last_deadline, spacing);
                TickPlan::resuming(origin, session_origin, tempo, pattern, first_sequence_index)
            }
            _ => {
                let remaining = countdown_beats.saturating_sub(snapshot.countdown_emitted);
                let spacing = seconds_to_nanos(tempo.beat_duration());
                let origin = earliest_origin(now, snapshot.last_deadline, spacing);
                TickPlan::starting(origin, tempo, pattern, remaining)
            }
        };

        info!(bpm = tempo.bpm, phase = ?snapshot.phase, "beat clock tempo updated");
        self.lock_state()?.phase = snapshot.phase;
        self.spawn(plan)
    }

    fn spawn(&self, plan: TickPlan) -> Result<()> {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
        let clock = self.clock.clone();
        let events = self.events.clone();
        let state = self.state.clone();

        let handle = thread::Builder::new()
            .name("beat-clock".to_string())
            .spawn(move || run_worker(plan, clock, events, stop_rx, state))?;

        *self.lock_worker()? = Some(Worker { stop_tx, handle });
        Ok(())
    }

    fn halt_worker(&self) -> Result<bool> {
        let worker = self.lock_worker()?.take();
        let Some(worker) = worker else {
            return Ok(false);
        };

        let _ = worker.stop_tx.try_send(());
        drop(worker.stop_tx);
        if worker.handle.thread().id() == thread::current().id() {
            // Stopping from inside the timer thread: it exits on its own once
            // the signal is observed.
            return Ok(true);
        }
        if worker.handle.join().is_err() {
            warn!("beat clock worker panicked");
        }
        Ok(true)
    }

    fn lock_settings(&self) -> Result<MutexGuard<'_, ClockSettings>> {
        self.settings
            .lock()
            .map_err(|_| RhythmError::Poisoned("beat clock settings"))
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, ClockState>> {
        self.state
            .lock()
            .map_err(|_| RhythmError::Poisoned("beat clock state"))
    }

    fn lock_lifecycle(&self) -> Result<MutexGuard<'_, ()>> {
        self.lifecycle
            .lock()
            .map_err(|_| RhythmError::Poisoned("beat clock lifecycle"))
    }

    fn lock_worker(&self) -> Result<MutexGuard<'_, Option<Worker>>> {
        self.worker
            .lock()
            .map_err(|_| RhythmError::Poisoned("beat clock worker"))
    }
}

impl Drop for BeatClock {
    fn drop(&mut self) {
        let _ = self.halt_worker();
    }
}

impl std::fmt::Debug for BeatClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().ok().map(|state| *state);
        f.debug_struct("BeatClock")
            .field("phase", &state.map(|s| s.phase))
            .field("drift", &state.map(|s| s.drift))
            .finish()
    }
}

/// New segments never start closer than `spacing` after the last fired tick.
fn earliest_origin(now: u64, last_deadline: Option<u64>, spacing: u64) -> u64 {
    last_deadline
        .map(|last| now.max(last + spacing))
        .unwrap_or(now)
}

fn run_worker(
    plan: TickPlan,
    clock: SharedClock,
    events: Sender<ClockEvent>,
    stop_rx: Receiver<()>,
    state: Arc<Mutex<ClockState>>,
) {
    let mut index = 0u64;
    loop {
        let tick = plan.tick(index);
        let deadline = tick.deadline_nanos();
        if !wait_until(clock.as_ref(), deadline, &stop_rx) {
            return;
        }

        let emitted = clock.now_nanos();
        let lateness = emitted.saturating_sub(deadline);
        let mut outgoing = Vec::with_capacity(2);
        {
            let Ok(mut state) = state.lock() else {
                warn!("beat clock state poisoned; stopping worker");
                return;
            };
            if state.drift.record(lateness) {
                debug!(index, lateness_us = lateness / 1_000, "beat clock overrun");
            }
            state.last_deadline = Some(deadline);

            match tick {
                PlannedTick::Countdown { remaining, deadline_nanos } => {
                    state.countdown_emitted += 1;
                    outgoing.push(ClockEvent::CountdownTick {
                        remaining,
                        deadline_nanos,
                        emitted_nanos: emitted,
                    });
                }
                PlannedTick::Beat {
                    target,
                    slot_index,
                    deadline_nanos,
                } => {
                    if plan.announce_origin && index == plan.countdown_ticks() as u64 {
                        let origin_nanos = plan.run_origin_nanos();
                        state.session_origin = Some(origin_nanos);
                        state.phase = ClockPhase::Running;
                        outgoing.push(ClockEvent::CountdownComplete { origin_nanos });
                    }
                    state.last_sequence_index = Some(target.sequence_index);
                    outgoing.push(ClockEvent::Beat(BeatTick {
                        target,
                        slot_index,
                        deadline_nanos,
                        emitted_nanos: emitted,
                    }));
                }
            }
        }

        for event in outgoing {
            if events.send(event).is_err() {
                debug!("beat clock listener disconnected");
                return;
            }
        }
        index += 1;
    }
}

/// Sleeps until `deadline` on `clock`, waking early if a stop is requested.
/// Returns false when stopped.
fn wait_until(clock: &dyn ClockSource, deadline: u64, stop_rx: &Receiver<()>) -> bool {
    loop {
        let now = clock.now_nanos();
        if now >= deadline {
            return matches!(stop_rx.try_recv(), Err(TryRecvError::Empty));
        }

        let remaining = Duration::from_nanos(deadline - now);
        if remaining > SPIN_WINDOW {
            match stop_rx.recv_timeout((remaining - SPIN_WINDOW).min(MAX_WAIT_SLICE)) {
                Err(RecvTimeoutError::Timeout) => continue,
                _ => return false,
            }
        }

        if !matches!(stop_rx.try_recv(), Err(TryRecvError::Empty)) {
            return false;
        }
        std::hint::spin_loop();
    }
}
