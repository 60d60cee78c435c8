//! Matches captured events against the target timeline and scores them.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    scoring::{AccuracyTier, BeatResult, SessionResult, TierCounts},
    CapturedEvent, Result, RhythmError, RhythmPattern, TargetBeat, TempoSpec,
};

pub const MIN_SESSION_SECONDS: f64 = 1.0;
pub const MAX_SESSION_SECONDS: f64 = 3600.0;
/// Targets older than this fraction of a beat with no result become misses.
pub const MISS_WINDOW_FRACTION: f64 = 0.5;

pub fn clamp_session_duration(seconds: f64) -> f64 {
    if seconds.is_finite() {
        seconds.clamp(MIN_SESSION_SECONDS, MAX_SESSION_SECONDS)
    } else {
        MIN_SESSION_SECONDS
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionPhase {
    Idle,
    Active,
    Completed,
}

/// What happened to a single capture.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CaptureOutcome {
    /// The capture produced a new or better result for its nearest target.
    Recorded(BeatResult),
    /// The nearest target already holds an equal or better result.
    Retained(BeatResult),
    /// No scorable target within half a beat, or the session is over.
    Discarded,
}

#[derive(Debug, Clone)]
pub struct RhythmMatcher {
    phase: SessionPhase,
    tempo: TempoSpec,
    pattern: RhythmPattern,
    duration_seconds: f64,
    targets: Vec<TargetBeat>,
    results: BTreeMap<usize, BeatResult>,
    captures: Vec<CapturedEvent>,
    summary: Option<SessionResult>,
}

impl Default for RhythmMatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl RhythmMatcher {
    pub fn new() -> Self {
        Self {
            phase: SessionPhase::Idle,
            tempo: TempoSpec::default(),
            pattern: RhythmPattern::default(),
            duration_seconds: 0.0,
            targets: Vec::new(),
            results: BTreeMap::new(),
            captures: Vec::new(),
            summary: None,
        }
    }

    /// Builds the target timeline and starts accepting captures. Times are
    /// seconds relative to the session origin. Any previous session state is
    /// discarded.
    pub fn begin_session(&mut self, tempo: TempoSpec, pattern: &RhythmPattern, duration_seconds: f64) {
        let tempo = TempoSpec::for_pattern(tempo.bpm, pattern);
        let duration_seconds = clamp_session_duration(duration_seconds);

        self.targets = pattern.timeline(&tempo, duration_seconds);
        self.tempo = tempo;
        self.pattern = pattern.clone();
        self.duration_seconds = duration_seconds;
        self.results.clear();
        self.captures.clear();
        self.summary = None;
        self.phase = SessionPhase::Active;

        info!(
            bpm = tempo.bpm,
            pattern = %pattern.kind(),
            duration_seconds,
            targets = self.targets.len(),
            "matcher session started"
        );
    }

    /// Attributes a capture to its nearest scorable target.
    ///
    /// # Panics
    ///
    /// Panics if no session was ever started.
    pub fn record_capture(&mut self, time_seconds: f64) -> CaptureOutcome {
        match self.phase {
            SessionPhase::Idle => panic!("record_capture called before begin_session"),
            SessionPhase::Completed => return CaptureOutcome::Discarded,
            SessionPhase::Active => {}
        }

        self.captures.push(CapturedEvent { time_seconds });
        if !time_seconds.is_finite() {
            return CaptureOutcome::Discarded;
        }

        let Some(target) = self.nearest_target(time_seconds).copied() else {
            return CaptureOutcome::Discarded;
        };

        let fraction = (time_seconds - target.time_seconds) / self.tempo.beat_duration();
        let Some(tier) = AccuracyTier::classify(fraction) else {
            debug!(time_seconds, fraction, "capture too far from any target");
            return CaptureOutcome::Discarded;
        };

        let candidate = BeatResult::hit(target.sequence_index, target.time_seconds, time_seconds, tier);
        match self.results.get(&target.sequence_index) {
            Some(existing) if existing.accuracy.points() >= tier.points() => {
                CaptureOutcome::Retained(*existing)
            }
            _ => {
                self.results.insert(target.sequence_index, candidate);
                CaptureOutcome::Recorded(candidate)
            }
        }
    }

    /// Marks overdue unresolved targets as misses and returns them.
    ///
    /// # Panics
    ///
    /// Panics if no session was ever started.
    pub fn on_periodic_sweep(&mut self, now_seconds: f64) -> Vec<BeatResult> {
        match self.phase {
            SessionPhase::Idle => panic!("on_periodic_sweep called before begin_session"),
            SessionPhase::Completed => return Vec::new(),
            SessionPhase::Active => {}
        }

        let window = MISS_WINDOW_FRACTION * self.tempo.beat_duration();
        let overdue: Vec<BeatResult> = self
            .targets
            .iter()
            .filter(|target| target.is_scorable())
            .filter(|target| !self.results.contains_key(&target.sequence_index))
            .filter(|target| now_seconds - target.time_seconds > window)
            .map(|target| BeatResult::miss(target.sequence_index, target.time_seconds))
            .collect();

        for miss in &overdue {
            self.results.insert(miss.target_index, *miss);
        }
        overdue
    }

    /// Resolves every outstanding scorable target as a miss and produces the
    /// final result. Calling it again returns the same result.
    ///
    /// # Panics
    ///
    /// Panics if no session was ever started.
    pub fn end_session(&mut self) -> SessionResult {
        match self.phase {
            SessionPhase::Idle => panic!("end_session called before begin_session"),
            SessionPhase::Completed => {
                if let Some(summary) = &self.summary {
                    return summary.clone();
                }
            }
            SessionPhase::Active => {}
        }

        for target in self.targets.iter().filter(|target| target.is_scorable()) {
            self.results
                .entry(target.sequence_index)
                .or_insert_with(|| BeatResult::miss(target.sequence_index, target.time_seconds));
        }

        let summary = SessionResult::aggregate(
            self.tempo.bpm,
            self.pattern.kind(),
            self.duration_seconds,
            self.scorable_targets(),
            self.results.values().copied().collect(),
        );
        info!(
            accuracy = summary.accuracy_percentage,
            grade = %summary.grade,
            captures = self.captures.len(),
            "matcher session completed"
        );

        self.phase = SessionPhase::Completed;
        self.summary = Some(summary.clone());
        summary
    }

    fn nearest_target(&self, time_seconds: f64) -> Option<&TargetBeat> {
        let mut best: Option<(&TargetBeat, f64)> = None;
        for target in self.targets.iter().filter(|target| target.is_scorable()) {
            let distance = (time_seconds - target.time_seconds).abs();
            if best.map_or(true, |(_, closest)| distance < closest) {
                best = Some((target, distance));
            }
        }
        best.map(|(target, _)| target)
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Tempo fixed at `begin_session`.
    pub fn tempo(&self) -> TempoSpec {
        self.tempo
    }

    /// Clamped session length; the timeline holds only whole measures of it.
    pub fn duration_seconds(&self) -> f64 {
        self.duration_seconds
    }

    /// Every target of the session, rests included, in time order.
    pub fn targets(&self) -> &[TargetBeat] {
        &self.targets
    }

    /// Targets that can be hit or missed, i.e. everything except rests.
    pub fn scorable_targets(&self) -> usize {
        self.targets.iter().filter(|target| target.is_scorable()).count()
    }

    /// Every accepted capture in arrival order, matched or not.
    pub fn captures(&self) -> &[CapturedEvent] {
        &self.captures
    }

    /// Resolved results ordered by target index.
    pub fn results(&self) -> Vec<BeatResult> {
        self.results.values().copied().collect()
    }

    /// Tier counts of the targets resolved so far.
    pub fn live_counts(&self) -> TierCounts {
        TierCounts::tally(self.results.values())
    }
}

/// Thread-safe handle for sharing one matcher between the capture path and
/// the session coordinator.
#[derive(Debug, Clone, Default)]
pub struct SharedMatcher {
    inner: Arc<Mutex<RhythmMatcher>>,
}

impl SharedMatcher {
    pub fn new(matcher: RhythmMatcher) -> Self {
        Self {
            inner: Arc::new(Mutex::new(matcher)),
        }
    }

    pub fn begin_session(&self, tempo: TempoSpec, pattern: &RhythmPattern, duration_seconds: f64) -> Result<()> {
        self.lock()?.begin_session(tempo, pattern, duration_seconds);
        Ok(())
    }

    pub fn record_capture(&self, time_seconds: f64) -> Result<CaptureOutcome> {
        Ok(self.lock()?.record_capture(time_seconds))
    }

    pub fn on_periodic_sweep(&self, now_seconds: f64) -> Result<Vec<BeatResult>> {
        Ok(self.lock()?.on_periodic_sweep(now_seconds))
    }

    pub fn end_session(&self) -> Result<SessionResult> {
        Ok(self.lock()?.end_session())
    }

    pub fn phase(&self) -> Result<SessionPhase> {
        Ok(self.lock()?.phase())
    }

    pub fn live_counts(&self) -> Result<TierCounts> {
        Ok(self.lock()?.live_counts())
    }

    /// Direct access for callers that need several reads to agree.
    pub fn lock(&self) -> Result<MutexGuard<'_, RhythmMatcher>> {
        self.inner
            .lock()
            .map_err(|_| RhythmError::Poisoned("rhythm matcher"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scoring::Grade;

    fn quarter_session(bpm: f64, duration: f64) -> RhythmMatcher {
        let pattern = RhythmPattern::quarter_notes();
        let mut matcher = RhythmMatcher::new();
        matcher.begin_session(TempoSpec::for_pattern(bpm, &pattern), &pattern, duration);
        matcher
    }

    #[test]
    fn later_spurious_capture_does_not_downgrade() {
        let mut matcher = quarter_session(120.0, 4.0);

        match matcher.record_capture(1.05) {
            CaptureOutcome::Recorded(result) => {
                assert_eq!(result.target_index, 2);
                assert_eq!(result.accuracy, AccuracyTier::Perfect);
            }
            other => panic!("expected a recorded hit, got {other:?}"),
        }
        matcher.record_capture(1.4);

        let results = matcher.results();
        let first = results.iter().find(|r| r.target_index == 2).unwrap();
        assert_eq!(first.accuracy, AccuracyTier::Perfect);
        assert_eq!(first.actual_time, Some(1.05));
    }

    #[test]
    fn better_capture_upgrades_worse_result() {
        let mut matcher = quarter_session(120.0, 4.0);

        assert!(matches!(
            matcher.record_capture(1.2),
            CaptureOutcome::Recorded(BeatResult { accuracy: AccuracyTier::Inaccurate, .. })
        ));
        assert!(matches!(
            matcher.record_capture(0.98),
            CaptureOutcome::Recorded(BeatResult { accuracy: AccuracyTier::Perfect, .. })
        ));
        assert!(matches!(
            matcher.record_capture(1.1),
            CaptureOutcome::Retained(BeatResult { accuracy: AccuracyTier::Perfect, .. })
        ));
        assert_eq!(matcher.captures().len(), 3);
    }

    #[test]
    fn sweep_turns_overdue_targets_into_misses() {
        let mut matcher = quarter_session(120.0, 4.0);
        for t in [0.0, 0.5, 1.0, 1.5] {
            matcher.record_capture(t);
        }

        assert!(matcher.on_periodic_sweep(2.2).is_empty());
        let misses = matcher.on_periodic_sweep(2.3);
        assert_eq!(misses.len(), 1);
        assert_eq!(misses[0].target_index, 4);
        assert_eq!(misses[0].target_time, 2.0);
        assert_eq!(misses[0].accuracy, AccuracyTier::Miss);

        // Already resolved targets are not reported twice.
        assert!(matcher.on_periodic_sweep(2.3).is_empty());
    }

    #[test]
    fn end_to_end_quarter_notes_at_100_bpm() {
        let pattern = RhythmPattern::quarter_notes();
        let tempo = TempoSpec::for_pattern(100.0, &pattern);
        let mut matcher = RhythmMatcher::new();
        matcher.begin_session(tempo, &pattern, 4.8);
        assert_eq!(matcher.targets().len(), 8);

        for t in [0.05, 0.62, 1.25, 2.38, 3.05, 4.15] {
            assert!(matches!(matcher.record_capture(t), CaptureOutcome::Recorded(_)));
        }
        let result = matcher.end_session();

        assert_eq!(result.counts.perfect, 6);
        assert_eq!(result.counts.miss, 2);
        assert!((result.accuracy_percentage - 75.0).abs() < 1e-9);
        assert_eq!(result.grade, Grade::B);
        assert_eq!(result.results.len(), 8);
        assert_eq!(result.results[3].accuracy, AccuracyTier::Miss);
        assert_eq!(result.results[6].accuracy, AccuracyTier::Miss);
    }

    #[test]
    fn rests_are_neither_matched_nor_missed() {
        let pattern = RhythmPattern::quarter_rests();
        let tempo = TempoSpec::for_pattern(120.0, &pattern);
        let mut matcher = RhythmMatcher::new();
        matcher.begin_session(tempo, &pattern, 2.0);

        // Right on the rest at 0.5: the nearest notes are a full beat away.
        assert_eq!(matcher.record_capture(0.5), CaptureOutcome::Discarded);
        let result = matcher.end_session();
        assert_eq!(result.scorable_targets, 2);
        assert_eq!(result.counts.miss, 2);
        assert!(result.results.iter().all(|r| r.target_index % 2 == 0));
    }

    #[test]
    fn equidistant_capture_goes_to_the_earlier_target() {
        let mut matcher = quarter_session(120.0, 2.0);
        match matcher.record_capture(0.25) {
            CaptureOutcome::Recorded(result) => assert_eq!(result.target_index, 0),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn far_captures_are_logged_but_discarded() {
        let mut matcher = quarter_session(120.0, 2.0);
        assert_eq!(matcher.record_capture(-0.3), CaptureOutcome::Discarded);
        assert_eq!(matcher.record_capture(f64::NAN), CaptureOutcome::Discarded);
        assert_eq!(matcher.captures().len(), 2);
        assert!(matcher.results().is_empty());
    }

    #[test]
    fn session_duration_is_clamped() {
        let matcher = quarter_session(60.0, 0.2);
        assert_eq!(matcher.duration_seconds(), MIN_SESSION_SECONDS);
        // A one-second session cannot hold a four-second measure.
        assert!(matcher.targets().is_empty());

        let matcher = quarter_session(60.0, 1e9);
        assert_eq!(matcher.duration_seconds(), MAX_SESSION_SECONDS);
    }

    #[test]
    #[should_panic(expected = "before begin_session")]
    fn capture_before_session_is_a_bug() {
        RhythmMatcher::new().record_capture(1.0);
    }

    #[test]
    #[should_panic(expected = "before begin_session")]
    fn sweep_before_session_is_a_bug() {
        RhythmMatcher::new().on_periodic_sweep(1.0);
    }

    #[test]
    fn completed_sessions_ignore_late_input() {
        let mut matcher = quarter_session(120.0, 2.0);
        matcher.record_capture(0.0);
        let first = matcher.end_session();

        assert_eq!(matcher.record_capture(0.5), CaptureOutcome::Discarded);
        assert!(matcher.on_periodic_sweep(10.0).is_empty());
        assert_eq!(matcher.captures().len(), 1);
        assert_eq!(matcher.phase(), SessionPhase::Completed);
        assert_eq!(matcher.end_session(), first);
    }

    #[test]
    fn shared_matcher_forwards_calls() {
        let shared = SharedMatcher::default();
        let pattern = RhythmPattern::eighth_pairs();
        shared
            .begin_session(TempoSpec::for_pattern(120.0, &pattern), &pattern, 2.0)
            .unwrap();

        let handle = shared.clone();
        std::thread::spawn(move || handle.record_capture(0.26).unwrap())
            .join()
            .unwrap();

        assert_eq!(shared.live_counts().unwrap().perfect, 1);
        assert_eq!(shared.phase().unwrap(), SessionPhase::Active);
        let result = shared.end_session().unwrap();
        assert_eq!(result.scorable_targets, 8);
    }
}
