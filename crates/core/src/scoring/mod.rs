//! Accuracy tiers, per-beat results and the session aggregate.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::PatternKind;

/// Upper bounds (inclusive) of the fractional deviation for each hit tier.
pub const PERFECT_FRACTION: f64 = 0.15;
pub const GOOD_FRACTION: f64 = 0.30;
pub const INACCURATE_FRACTION: f64 = 0.50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccuracyTier {
    Perfect,
    Good,
    Inaccurate,
    Miss,
}

impl AccuracyTier {
    pub fn points(&self) -> u32 {
        match self {
            AccuracyTier::Perfect => 100,
            AccuracyTier::Good => 75,
            AccuracyTier::Inaccurate => 25,
            AccuracyTier::Miss => 0,
        }
    }

    /// Classifies a deviation expressed as a fraction of the beat duration.
    /// Returns `None` when the capture is too far away to belong to the beat.
    pub fn classify(fractional_deviation: f64) -> Option<Self> {
        let magnitude = fractional_deviation.abs();
        if !magnitude.is_finite() {
            return None;
        }

        if magnitude <= PERFECT_FRACTION {
            Some(AccuracyTier::Perfect)
        } else if magnitude <= GOOD_FRACTION {
            Some(AccuracyTier::Good)
        } else if magnitude <= INACCURATE_FRACTION {
            Some(AccuracyTier::Inaccurate)
        } else {
            None
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            AccuracyTier::Perfect => "Perfect",
            AccuracyTier::Good => "Good",
            AccuracyTier::Inaccurate => "Inaccurate",
            AccuracyTier::Miss => "Miss",
        }
    }
}

impl fmt::Display for AccuracyTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BeatResult {
    pub target_index: usize,
    pub target_time: f64,
    pub actual_time: Option<f64>,
    pub accuracy: AccuracyTier,
    /// Signed capture error, `actual - target`. Negative means early.
    pub deviation_seconds: f64,
}

impl BeatResult {
    pub fn hit(target_index: usize, target_time: f64, actual_time: f64, accuracy: AccuracyTier) -> Self {
        Self {
            target_index,
            target_time,
            actual_time: Some(actual_time),
            accuracy,
            deviation_seconds: actual_time - target_time,
        }
    }

    pub fn miss(target_index: usize, target_time: f64) -> Self {
        Self {
            target_index,
            target_time,
            actual_time: None,
            accuracy: AccuracyTier::Miss,
            deviation_seconds: 0.0,
        }
    }

    pub fn is_hit(&self) -> bool {
        self.accuracy != AccuracyTier::Miss && self.actual_time.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Grade {
    #[serde(rename = "A+")]
    APlus,
    A,
    #[serde(rename = "A-")]
    AMinus,
    #[serde(rename = "B+")]
    BPlus,
    B,
    #[serde(rename = "B-")]
    BMinus,
    #[serde(rename = "C+")]
    CPlus,
    C,
    D,
    F,
}

impl Grade {
    const BANDS: [(f64, Grade); 9] = [
        (95.0, Grade::APlus),
        (90.0, Grade::A),
        (85.0, Grade::AMinus),
        (80.0, Grade::BPlus),
        (75.0, Grade::B),
        (70.0, Grade::BMinus),
        (65.0, Grade::CPlus),
        (60.0, Grade::C),
        (50.0, Grade::D),
    ];

    pub fn from_percentage(percentage: f64) -> Self {
        Self::BANDS
            .iter()
            .find(|(floor, _)| percentage >= *floor)
            .map(|(_, grade)| *grade)
            .unwrap_or(Grade::F)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Grade::APlus => "A+",
            Grade::A => "A",
            Grade::AMinus => "A-",
            Grade::BPlus => "B+",
            Grade::B => "B",
            Grade::BMinus => "B-",
            Grade::CPlus => "C+",
            Grade::C => "C",
            Grade::D => "D",
            Grade::F => "F",
        }
    }
}

impl fmt::Display for Grade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Running per-tier counts, also used for live feedback during a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierCounts {
    pub perfect: usize,
    pub good: usize,
    pub inaccurate: usize,
    pub miss: usize,
}

impl TierCounts {
    pub fn tally<'a>(results: impl IntoIterator<Item = &'a BeatResult>) -> Self {
        let mut counts = Self::default();
        for result in results {
            counts.add(result.accuracy);
        }
        counts
    }

    pub fn add(&mut self, tier: AccuracyTier) {
        match tier {
            AccuracyTier::Perfect => self.perfect += 1,
            AccuracyTier::Good => self.good += 1,
            AccuracyTier::Inaccurate => self.inaccurate += 1,
            AccuracyTier::Miss => self.miss += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.perfect + self.good + self.inaccurate + self.miss
    }

    pub fn points(&self) -> u64 {
        (self.perfect as u64 * AccuracyTier::Perfect.points() as u64)
            + (self.good as u64 * AccuracyTier::Good.points() as u64)
            + (self.inaccurate as u64 * AccuracyTier::Inaccurate.points() as u64)
    }
}

/// Final, read-only outcome of a practice session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionResult {
    pub bpm: f64,
    pub pattern: PatternKind,
    pub duration_seconds: f64,
    pub counts: TierCounts,
    pub scorable_targets: usize,
    pub accuracy_percentage: f64,
    pub average_deviation_ms: f64,
    pub early_hits: usize,
    pub late_hits: usize,
    pub grade: Grade,
    pub results: Vec<BeatResult>,
}

impl SessionResult {
    /// Aggregates resolved beat results. `scorable_targets` is the number of
    /// non-rest targets in the session and forms the denominator of the
    /// accuracy percentage.
    pub fn aggregate(
        bpm: f64,
        pattern: PatternKind,
        duration_seconds: f64,
        scorable_targets: usize,
        mut results: Vec<BeatResult>,
    ) -> Self {
        results.sort_by_key(|result| result.target_index);
        let counts = TierCounts::tally(&results);

        let accuracy_percentage = if scorable_targets == 0 {
            0.0
        } else {
            counts.points() as f64 / (scorable_targets as f64 * 100.0) * 100.0
        };

        let hits: Vec<&BeatResult> = results.iter().filter(|result| result.is_hit()).collect();
        let average_deviation_ms = if hits.is_empty() {
            0.0
        } else {
            hits.iter()
                .map(|result| result.deviation_seconds.abs())
                .sum::<f64>()
                / hits.len() as f64
                * 1000.0
        };
        let early_hits = hits.iter().filter(|r| r.deviation_seconds < 0.0).count();
        let late_hits = hits.iter().filter(|r| r.deviation_seconds > 0.0).count();

        Self {
            bpm,
            pattern,
            duration_seconds,
            counts,
            scorable_targets,
            accuracy_percentage,
            average_deviation_ms,
            early_hits,
            late_hits,
            grade: Grade::from_percentage(accuracy_percentage),
            results,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_by_fraction_of_beat() {
        assert_eq!(AccuracyTier::classify(0.0), Some(AccuracyTier::Perfect));
        assert_eq!(AccuracyTier::classify(-0.15), Some(AccuracyTier::Perfect));
        assert_eq!(AccuracyTier::classify(0.2), Some(AccuracyTier::Good));
        assert_eq!(AccuracyTier::classify(-0.3), Some(AccuracyTier::Good));
        assert_eq!(AccuracyTier::classify(0.45), Some(AccuracyTier::Inaccurate));
        assert_eq!(AccuracyTier::classify(0.5), Some(AccuracyTier::Inaccurate));
        assert_eq!(AccuracyTier::classify(0.51), None);
        assert_eq!(AccuracyTier::classify(f64::NAN), None);
    }

    #[test]
    fn grade_boundaries() {
        assert_eq!(Grade::from_percentage(100.0), Grade::APlus);
        assert_eq!(Grade::from_percentage(95.0), Grade::APlus);
        assert_eq!(Grade::from_percentage(90.0).to_string(), "A");
        assert_eq!(Grade::from_percentage(89.9).to_string(), "A-");
        assert_eq!(Grade::from_percentage(75.0), Grade::B);
        assert_eq!(Grade::from_percentage(50.0), Grade::D);
        assert_eq!(Grade::from_percentage(49.99), Grade::F);
        assert_eq!(Grade::from_percentage(f64::NAN), Grade::F);
    }

    #[test]
    fn aggregates_points_against_scorable_targets() {
        let results = vec![
            BeatResult::hit(0, 0.0, 0.02, AccuracyTier::Perfect),
            BeatResult::hit(1, 0.5, 0.4, AccuracyTier::Good),
            BeatResult::miss(2, 1.0),
            BeatResult::hit(3, 1.5, 1.7, AccuracyTier::Inaccurate),
        ];
        let result = SessionResult::aggregate(120.0, PatternKind::QuarterNotes, 2.0, 4, results);

        assert_eq!(result.counts.total(), 4);
        assert!((result.accuracy_percentage - 50.0).abs() < 1e-9);
        assert_eq!(result.grade, Grade::D);
        // (20 + 100 + 200) / 3
        assert!((result.average_deviation_ms - 320.0 / 3.0).abs() < 1e-6);
        assert_eq!(result.early_hits, 1);
        assert_eq!(result.late_hits, 2);
    }

    #[test]
    fn empty_sessions_score_zero() {
        let result = SessionResult::aggregate(90.0, PatternKind::Custom, 0.0, 0, Vec::new());
        assert_eq!(result.accuracy_percentage, 0.0);
        assert_eq!(result.average_deviation_ms, 0.0);
        assert_eq!(result.grade, Grade::F);
    }

    #[test]
    fn grade_serializes_as_label() {
        let json = serde_json::to_string(&Grade::AMinus).unwrap();
        assert_eq!(json, "\"A-\"");
    }
}
