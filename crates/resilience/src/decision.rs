//! Level decision: per-probe verdicts plus the overall score to a `DegradationLevel`.
//!
//! Structural rules run first, in priority order (database > inference >
//! auxiliaries); the score fallback only applies when none of them match. The
//! function is pure, so a given snapshot always yields the same level.

use serde::{Deserialize, Serialize};

use crate::health::ProbeTier;
use crate::level::DegradationLevel;

/// One probe's verdict from the latest evaluation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeVerdict {
    pub tier: ProbeTier,
    pub healthy: bool,
}

impl ProbeVerdict {
    pub fn new(tier: ProbeTier, healthy: bool) -> Self {
        Self { tier, healthy }
    }
}

/// Counts derived from a verdict snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct FailureSummary {
    failed: usize,
    healthy: usize,
    critical_failed: bool,
    primary_failed: bool,
    non_critical_failed: usize,
}

impl FailureSummary {
    fn of(verdicts: &[ProbeVerdict]) -> Self {
        verdicts.iter().fold(Self::default(), |mut acc, v| {
            if v.healthy {
                acc.healthy += 1;
                return acc;
            }
            acc.failed += 1;
            match v.tier {
                ProbeTier::Critical => acc.critical_failed = true,
                ProbeTier::Primary => acc.primary_failed = true,
                ProbeTier::NonCritical => acc.non_critical_failed += 1,
            }
            acc
        })
    }
}

/// Map a verdict snapshot and overall score (`0..=100`) to a level.
pub fn decide_level(verdicts: &[ProbeVerdict], score: f64) -> DegradationLevel {
    let s = FailureSummary::of(verdicts);

    if s.failed == 0 && score >= 90.0 {
        return DegradationLevel::Optimal;
    }

    if s.failed == 1 && s.non_critical_failed == 1 && score >= 70.0 {
        return DegradationLevel::Degraded;
    }

    if !s.critical_failed && ((s.primary_failed && score >= 60.0) || s.failed == 2) {
        return DegradationLevel::Limited;
    }

    if s.critical_failed || s.failed >= 3 {
        return if score >= 40.0 && s.healthy > 0 {
            DegradationLevel::Minimal
        } else {
            DegradationLevel::Emergency
        };
    }

    level_for_score(score)
}

/// Score-only fallback.
pub fn level_for_score(score: f64) -> DegradationLevel {
    if score < 30.0 {
        DegradationLevel::Emergency
    } else if score < 50.0 {
        DegradationLevel::Minimal
    } else if score < 70.0 {
        DegradationLevel::Limited
    } else {
        DegradationLevel::Degraded
    }
}
