//! Tempo, rhythm patterns and the target-beat timeline derived from them.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{Result, RhythmError};

pub const MIN_BPM: f64 = 40.0;
pub const MAX_BPM: f64 = 240.0;
pub const DEFAULT_BPM: f64 = 90.0;

/// Slack used when counting whole measures so that durations which are an
/// exact multiple of the measure length are not lost to rounding.
const MEASURE_EPSILON: f64 = 1e-9;

/// Clamps a tempo to the supported range. Non-finite input falls back to the
/// default tempo.
pub fn clamp_bpm(bpm: f64) -> f64 {
    if bpm.is_finite() {
        bpm.clamp(MIN_BPM, MAX_BPM)
    } else {
        DEFAULT_BPM
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TempoSpec {
    pub bpm: f64,
    pub pattern_subdivisions: u32,
}

impl TempoSpec {
    pub fn new(bpm: f64, pattern_subdivisions: u32) -> Self {
        Self {
            bpm: clamp_bpm(bpm),
            pattern_subdivisions: pattern_subdivisions.max(1),
        }
    }

    /// Tempo spec matching the subdivision count of `pattern`.
    pub fn for_pattern(bpm: f64, pattern: &RhythmPattern) -> Self {
        Self::new(bpm, pattern.subdivisions())
    }

    /// Copy with bpm re-clamped, for values that bypassed [`TempoSpec::new`].
    pub fn sanitized(self) -> Self {
        Self::new(self.bpm, self.pattern_subdivisions)
    }

    /// Seconds between consecutive main beats.
    pub fn beat_duration(&self) -> f64 {
        60.0 / clamp_bpm(self.bpm)
    }
}

impl Default for TempoSpec {
    fn default() -> Self {
        Self::new(DEFAULT_BPM, 1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BeatSlot {
    pub offset_fraction: f64,
    pub accented: bool,
    pub is_rest: bool,
}

impl BeatSlot {
    pub fn new(offset_fraction: f64, accented: bool, is_rest: bool) -> Self {
        Self {
            offset_fraction,
            accented,
            is_rest,
        }
    }

    pub fn note(offset_fraction: f64, accented: bool) -> Self {
        Self::new(offset_fraction, accented, false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PatternKind {
    QuarterNotes,
    EighthPairs,
    Triplets,
    SixteenthNotes,
    Syncopated,
    QuarterRests,
    EighthRests,
    Custom,
}

impl PatternKind {
    /// Every kind with a built-in preset.
    pub const PRESETS: [PatternKind; 7] = [
        PatternKind::QuarterNotes,
        PatternKind::EighthPairs,
        PatternKind::Triplets,
        PatternKind::SixteenthNotes,
        PatternKind::Syncopated,
        PatternKind::QuarterRests,
        PatternKind::EighthRests,
    ];

    /// Identifier used in configuration files and on the command line.
    pub fn slug(&self) -> &'static str {
        match self {
            PatternKind::QuarterNotes => "quarter-notes",
            PatternKind::EighthPairs => "eighth-pairs",
            PatternKind::Triplets => "triplets",
            PatternKind::SixteenthNotes => "sixteenth-notes",
            PatternKind::Syncopated => "syncopated",
            PatternKind::QuarterRests => "quarter-rests",
            PatternKind::EighthRests => "eighth-rests",
            PatternKind::Custom => "custom",
        }
    }

    /// Display name.
    pub fn name(&self) -> &'static str {
        match self {
            PatternKind::QuarterNotes => "Quarter Notes",
            PatternKind::EighthPairs => "Eighth Note Pairs",
            PatternKind::Triplets => "Triplets",
            PatternKind::SixteenthNotes => "Sixteenth Notes",
            PatternKind::Syncopated => "Syncopated",
            PatternKind::QuarterRests => "Quarter Rests",
            PatternKind::EighthRests => "Eighth Rests",
            PatternKind::Custom => "Custom",
        }
    }

    /// One-line counting guide shown in pattern listings.
    pub fn description(&self) -> &'static str {
        match self {
            PatternKind::QuarterNotes => "Basic quarter notes (1, 2, 3, 4)",
            PatternKind::EighthPairs => "Pairs of eighth notes (1 & 2 & 3 & 4 &)",
            PatternKind::Triplets => "Triplets (1-trip-let, 2-trip-let, 3-trip-let, 4-trip-let)",
            PatternKind::SixteenthNotes => "Sixteenth notes (1 e & a, 2 e & a, 3 e & a, 4 e & a)",
            PatternKind::Syncopated => "Syncopated rhythm with accents on the off-beats",
            PatternKind::QuarterRests => "Pattern with quarter rests (1, -, 3, -)",
            PatternKind::EighthRests => "Pattern with eighth rests (1, &, 2, -, 3, &, 4, -)",
            PatternKind::Custom => "Custom-defined rhythm pattern",
        }
    }

    /// Rough difficulty from 1 (easiest) to 4.
    pub fn difficulty(&self) -> u8 {
        match self {
            PatternKind::QuarterNotes => 1,
            PatternKind::EighthPairs | PatternKind::QuarterRests => 2,
            PatternKind::Triplets | PatternKind::EighthRests | PatternKind::Custom => 3,
            PatternKind::SixteenthNotes | PatternKind::Syncopated => 4,
        }
    }

    /// Builds the preset pattern. `Custom` has no preset and yields quarter
    /// notes relabelled as custom.
    pub fn pattern(&self) -> RhythmPattern {
        match self {
            PatternKind::QuarterNotes => RhythmPattern::quarter_notes(),
            PatternKind::EighthPairs => RhythmPattern::eighth_pairs(),
            PatternKind::Triplets => RhythmPattern::triplets(),
            PatternKind::SixteenthNotes => RhythmPattern::sixteenth_notes(),
            PatternKind::Syncopated => RhythmPattern::syncopated(),
            PatternKind::QuarterRests => RhythmPattern::quarter_rests(),
            PatternKind::EighthRests => RhythmPattern::eighth_rests(),
            PatternKind::Custom => RhythmPattern {
                kind: PatternKind::Custom,
                ..RhythmPattern::quarter_notes()
            },
        }
    }
}

impl fmt::Display for PatternKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PatternKind {
    type Err = RhythmError;

    fn from_str(value: &str) -> Result<Self> {
        let wanted = value.trim().to_ascii_lowercase().replace('_', "-");
        PatternKind::PRESETS
            .into_iter()
            .chain([PatternKind::Custom])
            .find(|kind| kind.slug() == wanted)
            .ok_or_else(|| RhythmError::InvalidPattern(format!("unknown pattern `{value}`")))
    }
}

/// One measure worth of beat slots. Immutable once constructed; slots are
/// kept sorted by offset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RhythmPattern {
    kind: PatternKind,
    slots: Vec<BeatSlot>,
    subdivisions: u32,
}

impl RhythmPattern {
    /// Validates and builds a user-defined pattern.
    pub fn custom(slots: Vec<BeatSlot>, subdivisions: u32) -> Result<Self> {
        Self::build(PatternKind::Custom, slots, subdivisions)
    }

    fn build(kind: PatternKind, mut slots: Vec<BeatSlot>, subdivisions: u32) -> Result<Self> {
        if slots.is_empty() {
            return Err(RhythmError::InvalidPattern(
                "a pattern needs at least one slot".to_string(),
            ));
        }
        if subdivisions == 0 {
            return Err(RhythmError::InvalidPattern(
                "subdivisions must be at least 1".to_string(),
            ));
        }
        if let Some(slot) = slots
            .iter()
            .find(|slot| !(slot.offset_fraction.is_finite() && (0.0..1.0).contains(&slot.offset_fraction)))
        {
            return Err(RhythmError::InvalidPattern(format!(
                "slot offset {} is outside [0, 1)",
                slot.offset_fraction
            )));
        }

        slots.sort_by(|a, b| a.offset_fraction.total_cmp(&b.offset_fraction));
        Ok(Self {
            kind,
            slots,
            subdivisions,
        })
    }

    fn preset(kind: PatternKind, slots: Vec<BeatSlot>, subdivisions: u32) -> Self {
        Self {
            kind,
            slots,
            subdivisions,
        }
    }

    /// Four notes per measure, accent on the downbeat.
    pub fn quarter_notes() -> Self {
        let slots = (0..4)
            .map(|i| BeatSlot::note(i as f64 / 4.0, i == 0))
            .collect();
        Self::preset(PatternKind::QuarterNotes, slots, 1)
    }

    /// Eight eighth notes, every main beat accented.
    pub fn eighth_pairs() -> Self {
        let slots = (0..8)
            .map(|i| BeatSlot::note(i as f64 / 8.0, i % 2 == 0))
            .collect();
        Self::preset(PatternKind::EighthPairs, slots, 2)
    }

    /// Three notes per beat, accent on the first of each group.
    pub fn triplets() -> Self {
        let slots = (0..12)
            .map(|i| BeatSlot::note(i as f64 / 12.0, i % 3 == 0))
            .collect();
        Self::preset(PatternKind::Triplets, slots, 3)
    }

    /// Four notes per beat, accent on each main beat.
    pub fn sixteenth_notes() -> Self {
        let slots = (0..16)
            .map(|i| BeatSlot::note(i as f64 / 16.0, i % 4 == 0))
            .collect();
        Self::preset(PatternKind::SixteenthNotes, slots, 4)
    }

    /// Eighth-note grid accented on 1 and on the `&` of 2 and of 3.
    pub fn syncopated() -> Self {
        let accents = [true, false, false, true, false, true, false, false];
        let slots = accents
            .iter()
            .enumerate()
            .map(|(i, &accented)| BeatSlot::note(i as f64 / 8.0, accented))
            .collect();
        Self::preset(PatternKind::Syncopated, slots, 2)
    }

    /// Quarter notes with beats 2 and 4 silent.
    pub fn quarter_rests() -> Self {
        let slots = (0..4)
            .map(|i| BeatSlot::new(i as f64 / 4.0, i % 2 == 0, i % 2 == 1))
            .collect();
        Self::preset(PatternKind::QuarterRests, slots, 1)
    }

    /// Eighth notes with the `&` of 2 and of 4 silent.
    pub fn eighth_rests() -> Self {
        let slots = (0..8)
            .map(|i| BeatSlot::new(i as f64 / 8.0, i % 2 == 0, i % 4 == 3))
            .collect();
        Self::preset(PatternKind::EighthRests, slots, 2)
    }

    pub fn kind(&self) -> PatternKind {
        self.kind
    }

    /// Slots of one measure, in order of `offset_fraction`.
    pub fn slots(&self) -> &[BeatSlot] {
        &self.slots
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Slots per main beat.
    pub fn subdivisions(&self) -> u32 {
        self.subdivisions
    }

    /// Number of main beats covered by one measure.
    pub fn beats_per_measure(&self) -> f64 {
        self.slots.len() as f64 / self.subdivisions as f64
    }

    /// Length of one measure in seconds at `tempo`.
    pub fn measure_duration(&self, tempo: &TempoSpec) -> f64 {
        self.beats_per_measure() * tempo.beat_duration()
    }

    /// Number of whole measures that fit into `duration_seconds`.
    pub fn whole_measures(&self, tempo: &TempoSpec, duration_seconds: f64) -> usize {
        if !duration_seconds.is_finite() || duration_seconds <= 0.0 {
            return 0;
        }
        (duration_seconds / self.measure_duration(tempo) + MEASURE_EPSILON).floor() as usize
    }

    /// Target beat for the `sequence_index`-th slot counted from the session
    /// origin, with times relative to that origin.
    pub fn target_at(&self, tempo: &TempoSpec, sequence_index: usize) -> TargetBeat {
        let slot_count = self.slots.len();
        let measure_index = sequence_index / slot_count;
        let slot = self.slots[sequence_index % slot_count];
        let measure_duration = self.measure_duration(tempo);

        TargetBeat {
            time_seconds: measure_index as f64 * measure_duration
                + slot.offset_fraction * measure_duration,
            accented: slot.accented,
            is_rest: slot.is_rest,
            sequence_index,
        }
    }

    /// Materializes every target beat of a session lasting `duration_seconds`.
    /// Partial trailing measures are dropped.
    pub fn timeline(&self, tempo: &TempoSpec, duration_seconds: f64) -> Vec<TargetBeat> {
        let count = self.whole_measures(tempo, duration_seconds) * self.slots.len();
        (0..count).map(|index| self.target_at(tempo, index)).collect()
    }
}

impl Default for RhythmPattern {
    fn default() -> Self {
        Self::quarter_notes()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TargetBeat {
    pub time_seconds: f64,
    pub accented: bool,
    pub is_rest: bool,
    pub sequence_index: usize,
}

impl TargetBeat {
    pub fn is_scorable(&self) -> bool {
        !self.is_rest
    }
}

/// A detected onset or a manual tap, in session seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CapturedEvent {
    pub time_seconds: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_tempo_into_supported_range() {
        assert_eq!(TempoSpec::new(10.0, 1).bpm, MIN_BPM);
        assert_eq!(TempoSpec::new(400.0, 1).bpm, MAX_BPM);
        assert_eq!(TempoSpec::new(f64::NAN, 0).bpm, DEFAULT_BPM);
        assert_eq!(TempoSpec::new(120.0, 0).pattern_subdivisions, 1);
        assert!((TempoSpec::new(120.0, 1).beat_duration() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn timeline_counts_whole_measures_only() {
        for kind in PatternKind::PRESETS {
            let pattern = kind.pattern();
            for bpm in [40.0, 77.0, 100.0, 120.0, 183.0, 240.0] {
                let tempo = TempoSpec::for_pattern(bpm, &pattern);
                let measure = pattern.measure_duration(&tempo);
                for duration in [0.0, measure * 0.5, measure, measure * 3.7, 60.0] {
                    let expected =
                        (duration / measure + MEASURE_EPSILON).floor() as usize * pattern.slot_count();
                    assert_eq!(
                        pattern.timeline(&tempo, duration).len(),
                        expected,
                        "{kind} at {bpm} bpm for {duration}s"
                    );
                }
            }
        }
    }

    #[test]
    fn quarter_notes_land_on_every_beat() {
        let pattern = RhythmPattern::quarter_notes();
        let tempo = TempoSpec::for_pattern(120.0, &pattern);
        let timeline = pattern.timeline(&tempo, 60.0);

        assert_eq!(timeline.len(), 120);
        for (k, target) in timeline.iter().enumerate() {
            assert!((target.time_seconds - k as f64 * 0.5).abs() < 1e-9);
            assert_eq!(target.sequence_index, k);
            assert_eq!(target.accented, k % 4 == 0);
        }
    }

    #[test]
    fn subdivided_patterns_share_the_measure_length() {
        let tempo = TempoSpec::new(100.0, 1);
        let quarter = RhythmPattern::quarter_notes().measure_duration(&tempo);
        for kind in PatternKind::PRESETS {
            let pattern = kind.pattern();
            let measure = pattern.measure_duration(&TempoSpec::for_pattern(100.0, &pattern));
            assert!((measure - quarter).abs() < 1e-12, "{kind}");
        }

        let eighths = RhythmPattern::eighth_pairs();
        let timeline = eighths.timeline(&TempoSpec::for_pattern(100.0, &eighths), 2.4);
        assert_eq!(timeline.len(), 8);
        assert!((timeline[1].time_seconds - 0.3).abs() < 1e-9);
    }

    #[test]
    fn rests_stay_in_the_timeline() {
        let pattern = RhythmPattern::quarter_rests();
        let tempo = TempoSpec::for_pattern(90.0, &pattern);
        let timeline = pattern.timeline(&tempo, pattern.measure_duration(&tempo) * 2.0);

        assert_eq!(timeline.len(), 8);
        assert_eq!(timeline.iter().filter(|t| t.is_rest).count(), 4);
        assert!(timeline[1].is_rest && !timeline[1].is_scorable());
    }

    #[test]
    fn pattern_kinds_parse_from_their_slugs() {
        for kind in PatternKind::PRESETS {
            assert_eq!(kind.slug().parse::<PatternKind>().unwrap(), kind);
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.slug()));
        }
        assert_eq!("Eighth_Rests".parse::<PatternKind>().unwrap(), PatternKind::EighthRests);
        assert!("waltz".parse::<PatternKind>().is_err());
    }

    #[test]
    fn custom_patterns_are_validated_and_sorted() {
        let pattern = RhythmPattern::custom(
            vec![BeatSlot::note(0.5, false), BeatSlot::note(0.0, true)],
            1,
        )
        .unwrap();
        assert_eq!(pattern.kind(), PatternKind::Custom);
        assert_eq!(pattern.slots()[0].offset_fraction, 0.0);

        assert!(RhythmPattern::custom(Vec::new(), 1).is_err());
        assert!(RhythmPattern::custom(vec![BeatSlot::note(1.0, false)], 1).is_err());
        assert!(RhythmPattern::custom(vec![BeatSlot::note(0.0, false)], 0).is_err());
    }
}
