//! Session composition: one beat clock, one matcher and any number of
//! capture producers, tied together by a coordinator thread.
//!
//! The coordinator owns the only path into the matcher during a live session.
//! Clock events, captures and the periodic sweep all arrive on channels and
//! are handled one at a time, so matcher mutations are serialised without
//! the producers ever blocking on each other.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{select, Receiver, Sender};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    analysis::SpectralAnalyzer,
    audio::{open_live_input, CaptureEngine, FrameSource},
    beat_clock::{BeatClock, BeatTick, ClockEvent, DEFAULT_COUNTDOWN_BEATS},
    clock::{seconds_since, SharedClock},
    config::{AppConfig, AudioConfig},
    matcher::{clamp_session_duration, CaptureOutcome, RhythmMatcher, SharedMatcher},
    onset::{OnsetConfig, OnsetDetector},
    scoring::{BeatResult, SessionResult},
    Result, RhythmError, RhythmPattern, TempoSpec,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CaptureMode {
    #[default]
    Tap,
    Microphone,
}

/// Everything one practice session needs, resolved once up front.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub tempo: TempoSpec,
    pub pattern: RhythmPattern,
    pub duration_seconds: f64,
    pub countdown_beats: u32,
    pub capture_mode: CaptureMode,
    pub sweep_interval: Duration,
    pub onset: OnsetConfig,
    pub audio: AudioConfig,
}

impl SessionContext {
    pub fn new(bpm: f64, pattern: RhythmPattern, duration_seconds: f64) -> Self {
        Self {
            tempo: TempoSpec::for_pattern(bpm, &pattern),
            pattern,
            duration_seconds: clamp_session_duration(duration_seconds),
            countdown_beats: DEFAULT_COUNTDOWN_BEATS,
            capture_mode: CaptureMode::Tap,
            sweep_interval: Duration::from_millis(100),
            onset: OnsetConfig::default(),
            audio: AudioConfig::default(),
        }
    }

    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let config = config.clone().sanitized();
        let pattern = config.pattern()?;
        Ok(Self {
            tempo: TempoSpec::for_pattern(config.tempo.bpm, &pattern),
            pattern,
            duration_seconds: config.session.duration_seconds,
            countdown_beats: config.session.countdown_beats,
            capture_mode: config.session.capture_mode,
            sweep_interval: Duration::from_millis(config.session.sweep_interval_ms),
            onset: config.onset,
            audio: config.audio,
        })
    }

    /// Time after the nominal end during which the last targets can still
    /// be hit.
    pub fn grace_seconds(&self) -> f64 {
        crate::matcher::MISS_WINDOW_FRACTION * self.tempo.beat_duration()
    }

    pub fn onset_detector(&self) -> OnsetDetector {
        let analyzer = SpectralAnalyzer::with_frame_len(self.audio.sample_rate, self.audio.block_size);
        OnsetDetector::new(self.onset, analyzer)
    }

    fn sweep_seconds(&self) -> f64 {
        self.sweep_interval.as_secs_f64().max(0.001)
    }
}

/// Notifications for the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    CountdownTick { remaining: u32 },
    /// Countdown finished; target times are measured from `origin_nanos`.
    Started { origin_nanos: u64 },
    BeatTick(BeatTick),
    /// A hit, an upgraded hit or a sweep miss.
    BeatResult(BeatResult),
    CaptureUnavailable(String),
    Finished(SessionResult),
}

struct CaptureWorker {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

/// Live session driver. Dropping it finishes the session.
pub struct SessionController {
    context: SessionContext,
    clock: SharedClock,
    beat_clock: Arc<BeatClock>,
    matcher: SharedMatcher,
    events: Sender<SessionEvent>,
    captures_tx: Sender<u64>,
    stop_tx: Sender<()>,
    coordinator: Mutex<Option<JoinHandle<()>>>,
    capture_workers: Mutex<Vec<CaptureWorker>>,
    outcome: Arc<Mutex<Option<SessionResult>>>,
    taps_enabled: Arc<AtomicBool>,
}

impl SessionController {
    /// Starts the countdown immediately. In microphone mode the live input
    /// is opened first; if that fails the session degrades to taps and
    /// reports [`SessionEvent::CaptureUnavailable`].
    pub fn start(context: SessionContext, clock: SharedClock, events: Sender<SessionEvent>) -> Result<Self> {
        let input = match context.capture_mode {
            CaptureMode::Tap => None,
            CaptureMode::Microphone => Some(open_live_input(&context.audio)),
        };
        Self::launch(context, clock, events, input)
    }

    /// Starts a microphone-mode session fed by `source` instead of the live
    /// input device. An `Err` source degrades to taps like a failed device.
    pub fn start_with_input<S>(
        context: SessionContext,
        clock: SharedClock,
        events: Sender<SessionEvent>,
        source: Result<S>,
    ) -> Result<Self>
    where
        S: FrameSource + Send + 'static,
    {
        if context.capture_mode != CaptureMode::Microphone {
            return Err(RhythmError::InvalidInput(
                "audio input needs a microphone-mode session",
            ));
        }
        let input = source.map(|source| Box::new(source) as Box<dyn FrameSource + Send>);
        Self::launch(context, clock, events, Some(input))
    }

    fn launch(
        context: SessionContext,
        clock: SharedClock,
        events: Sender<SessionEvent>,
        input: Option<Result<Box<dyn FrameSource + Send>>>,
    ) -> Result<Self> {
        let (clock_tx, clock_rx) = crossbeam_channel::unbounded();
        let beat_clock = Arc::new(BeatClock::new(clock.clone(), clock_tx));
        beat_clock.configure(context.tempo, context.pattern.clone())?;
        beat_clock.set_countdown_beats(context.countdown_beats)?;

        let (captures_tx, captures_rx) = crossbeam_channel::unbounded();
        let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
        let matcher = SharedMatcher::new(RhythmMatcher::new());
        let outcome = Arc::new(Mutex::new(None));

        let coordinator = Coordinator {
            context: context.clone(),
            clock: clock.clone(),
            beat_clock: beat_clock.clone(),
            matcher: matcher.clone(),
            events: events.clone(),
            outcome: outcome.clone(),
            origin: None,
            pending: Vec::new(),
        };
        let handle = thread::Builder::new()
            .name("session-coordinator".to_string())
            .spawn(move || coordinator.run(clock_rx, captures_rx, stop_rx))?;

        info!(
            bpm = context.tempo.bpm,
            pattern = %context.pattern.kind(),
            duration = context.duration_seconds,
            mode = ?context.capture_mode,
            "practice session starting"
        );

        let session = Self {
            taps_enabled: Arc::new(AtomicBool::new(input.is_none())),
            context,
            clock,
            beat_clock,
            matcher,
            events,
            captures_tx,
            stop_tx,
            coordinator: Mutex::new(Some(handle)),
            capture_workers: Mutex::new(Vec::new()),
            outcome,
        };

        match input {
            Some(Ok(source)) => {
                if let Err(err) = session.spawn_capture(source) {
                    session.fall_back_to_taps(&err);
                }
            }
            Some(Err(err)) => session.fall_back_to_taps(&err),
            None => {}
        }

        // On error the drop of `session` stops the coordinator and capture.
        session.beat_clock.start()?;
        Ok(session)
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    pub fn matcher(&self) -> &SharedMatcher {
        &self.matcher
    }

    pub fn beat_clock(&self) -> &BeatClock {
        &self.beat_clock
    }

    /// Channel for capture producers. Timestamps are absolute clock nanos.
    pub fn capture_sender(&self) -> Sender<u64> {
        self.captures_tx.clone()
    }

    /// Whether [`SessionController::tap`] is accepted: always in tap mode,
    /// and in microphone mode once the input has failed.
    pub fn taps_enabled(&self) -> bool {
        self.taps_enabled.load(Ordering::Acquire)
    }

    /// Records a tap at the current instant. Refused while microphone
    /// capture is live.
    pub fn tap(&self) -> Result<()> {
        if !self.taps_enabled() {
            return Err(RhythmError::InvalidInput(
                "taps are ignored while microphone capture is active",
            ));
        }
        self.captures_tx
            .send(self.clock.now_nanos())
            .map_err(|_| RhythmError::msg("session is no longer accepting captures"))
    }

    fn spawn_capture(&self, mut source: Box<dyn FrameSource + Send>) -> Result<()> {
        let analyzer = SpectralAnalyzer::with_frame_len(source.sample_rate(), self.context.audio.block_size);
        let detector = OnsetDetector::new(self.context.onset, analyzer);
        let mut engine = CaptureEngine::open(self.context.audio.device_name.clone(), detector)?;
        info!(device = engine.device().holder(), "microphone capture attached");

        let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
        let clock = self.clock.clone();
        let captures = self.captures_tx.clone();
        let events = self.events.clone();
        let taps_enabled = self.taps_enabled.clone();
        let handle = thread::Builder::new()
            .name("session-capture".to_string())
            .spawn(move || {
                let origin = clock.now_nanos();
                match engine.stream(source.as_mut(), clock.as_ref(), origin, &stop_rx, &captures) {
                    Ok(count) => debug!(count, "input stream finished"),
                    Err(err) => {
                        warn!(%err, "input stream failed; continuing with taps");
                        taps_enabled.store(true, Ordering::Release);
                        let _ = events.send(SessionEvent::CaptureUnavailable(err.to_string()));
                    }
                }
            })?;

        self.lock_workers()?.push(CaptureWorker { stop_tx, handle });
        Ok(())
    }

    fn fall_back_to_taps(&self, err: &RhythmError) {
        warn!(%err, "audio input unavailable; continuing with taps only");
        self.taps_enabled.store(true, Ordering::Release);
        if self.events.send(SessionEvent::CaptureUnavailable(err.to_string())).is_err() {
            debug!("session listener disconnected");
        }
    }

    pub fn is_finished(&self) -> Result<bool> {
        Ok(self.lock_outcome()?.is_some())
    }

    /// Stops everything and returns the final result, or `None` when the
    /// session was abandoned before the countdown completed. Idempotent.
    pub fn finish(&self) -> Result<Option<SessionResult>> {
        let coordinator = self.lock_coordinator()?.take();
        if let Some(handle) = coordinator {
            let _ = self.stop_tx.try_send(());
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                warn!("session coordinator panicked");
            }
        }
        self.beat_clock.stop()?;

        let workers: Vec<CaptureWorker> = self.lock_workers()?.drain(..).collect();
        for worker in workers {
            let _ = worker.stop_tx.try_send(());
            if worker.handle.join().is_err() {
                warn!("capture worker panicked");
            }
        }

        Ok(self.lock_outcome()?.clone())
    }

    fn lock_coordinator(&self) -> Result<MutexGuard<'_, Option<JoinHandle<()>>>> {
        self.coordinator
            .lock()
            .map_err(|_| RhythmError::Poisoned("session coordinator"))
    }

    fn lock_workers(&self) -> Result<MutexGuard<'_, Vec<CaptureWorker>>> {
        self.capture_workers
            .lock()
            .map_err(|_| RhythmError::Poisoned("capture workers"))
    }

    fn lock_outcome(&self) -> Result<MutexGuard<'_, Option<SessionResult>>> {
        self.outcome
            .lock()
            .map_err(|_| RhythmError::Poisoned("session outcome"))
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        if let Err(err) = self.finish() {
            warn!(%err, "failed to finish session on drop");
        }
    }
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("context", &self.context)
            .field("beat_clock", &self.beat_clock)
            .finish()
    }
}

struct Coordinator {
    context: SessionContext,
    clock: SharedClock,
    beat_clock: Arc<BeatClock>,
    matcher: SharedMatcher,
    events: Sender<SessionEvent>,
    outcome: Arc<Mutex<Option<SessionResult>>>,
    origin: Option<u64>,
    /// Captures that raced ahead of the countdown-complete event.
    pending: Vec<u64>,
}

impl Coordinator {
    fn run(mut self, clock_rx: Receiver<ClockEvent>, captures_rx: Receiver<u64>, stop_rx: Receiver<()>) {
        let ticker = crossbeam_channel::tick(self.context.sweep_interval);
        if let Err(err) = self.event_loop(&clock_rx, &captures_rx, &stop_rx, &ticker) {
            warn!(%err, "session coordinator failed");
        }
        if let Err(err) = self.complete() {
            warn!(%err, "failed to complete session");
        }
    }

    fn event_loop(
        &mut self,
        clock_rx: &Receiver<ClockEvent>,
        captures_rx: &Receiver<u64>,
        stop_rx: &Receiver<()>,
        ticker: &Receiver<std::time::Instant>,
    ) -> Result<()> {
        loop {
            select! {
                recv(clock_rx) -> event => match event {
                    Ok(event) => self.on_clock_event(event)?,
                    Err(_) => return Ok(()),
                },
                recv(captures_rx) -> capture => {
                    if let Ok(nanos) = capture {
                        self.on_capture(nanos)?;
                    }
                },
                recv(ticker) -> _ => {
                    if self.on_sweep()? {
                        info!("session duration elapsed");
                        return Ok(());
                    }
                },
                recv(stop_rx) -> _ => return Ok(()),
            }
        }
    }

    fn on_clock_event(&mut self, event: ClockEvent) -> Result<()> {
        match event {
            ClockEvent::CountdownTick { remaining, .. } => {
                self.emit(SessionEvent::CountdownTick { remaining });
            }
            ClockEvent::CountdownComplete { origin_nanos } => {
                self.origin = Some(origin_nanos);
                self.matcher
                    .begin_session(self.context.tempo, &self.context.pattern, self.context.duration_seconds)?;
                self.emit(SessionEvent::Started { origin_nanos });
                for nanos in std::mem::take(&mut self.pending) {
                    self.on_capture(nanos)?;
                }
            }
            ClockEvent::Beat(tick) => self.emit(SessionEvent::BeatTick(tick)),
        }
        Ok(())
    }

    fn on_capture(&mut self, nanos: u64) -> Result<()> {
        let Some(origin) = self.origin else {
            self.pending.push(nanos);
            return Ok(());
        };

        if let CaptureOutcome::Recorded(result) = self.matcher.record_capture(seconds_since(origin, nanos))? {
            self.emit(SessionEvent::BeatResult(result));
        }
        Ok(())
    }

    /// Returns true once the session has run its course.
    fn on_sweep(&mut self) -> Result<bool> {
        let Some(origin) = self.origin else {
            return Ok(false);
        };

        let now = seconds_since(origin, self.clock.now_nanos());
        for miss in self.matcher.on_periodic_sweep(now)? {
            self.emit(SessionEvent::BeatResult(miss));
        }
        Ok(now >= self.context.duration_seconds + self.context.grace_seconds())
    }

    fn complete(&mut self) -> Result<()> {
        self.beat_clock.stop()?;
        if self.origin.is_none() {
            info!("session abandoned during countdown");
            return Ok(());
        }

        let result = self.matcher.end_session()?;
        *self
            .outcome
            .lock()
            .map_err(|_| RhythmError::Poisoned("session outcome"))? = Some(result.clone());
        self.emit(SessionEvent::Finished(result));
        Ok(())
    }

    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            debug!("session listener disconnected");
        }
    }
}

/// Scores a list of capture times (session seconds) without real time,
/// sweeping at the context's interval exactly like a live session would.
/// Captures past the end of the grace period are ignored.
pub fn score_offline(context: &SessionContext, captures: &[f64]) -> SessionResult {
    let mut matcher = RhythmMatcher::new();
    matcher.begin_session(context.tempo, &context.pattern, context.duration_seconds);

    let mut ordered: Vec<f64> = captures.to_vec();
    ordered.sort_by(f64::total_cmp);

    let interval = context.sweep_seconds();
    let end = matcher.duration_seconds() + context.grace_seconds();
    let mut sweeps = 1u64;
    for time in ordered {
        if time > end {
            break;
        }
        while sweeps as f64 * interval <= time {
            matcher.on_periodic_sweep(sweeps as f64 * interval);
            sweeps += 1;
        }
        matcher.record_capture(time);
    }

    matcher.end_session()
}

/// Detects onsets in a recording and scores them. `lead_in_seconds` is the
/// time between the start of the recording and the session origin.
pub fn score_recording<S: FrameSource + ?Sized>(
    context: &SessionContext,
    source: &mut S,
    lead_in_seconds: f64,
) -> Result<SessionResult> {
    let mut detector = context.onset_detector();
    let mut captures = Vec::new();
    while let Some(frame) = source.next_frame()? {
        if let Some(onset) = detector.ingest(&frame.samples, frame.timestamp).onset() {
            captures.push(onset.timestamp - lead_in_seconds);
        }
    }

    info!(onsets = captures.len(), "recording analysed");
    Ok(score_offline(context, &captures))
}
