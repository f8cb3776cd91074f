//! Degradation levels and their ordering.

use serde::{Deserialize, Serialize};

/// System-wide operating level, from fully capable to bare survival.
///
/// The ordering is total and is the only thing feature gating looks at: a lower
/// level is a more capable system.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DegradationLevel {
    #[default]
    Optimal = 1,
    Degraded = 2,
    Limited = 3,
    Minimal = 4,
    Emergency = 5,
}

impl DegradationLevel {
    pub const COUNT: usize = 5;

    pub const ALL: [DegradationLevel; Self::COUNT] = [
        DegradationLevel::Optimal,
        DegradationLevel::Degraded,
        DegradationLevel::Limited,
        DegradationLevel::Minimal,
        DegradationLevel::Emergency,
    ];

    /// Numeric value (1 = Optimal … 5 = Emergency).
    pub const fn value(self) -> u8 {
        self as u8
    }

    /// Zero-based position, for indexing per-level tables.
    pub const fn index(self) -> usize {
        self as usize - 1
    }

    pub const fn name(self) -> &'static str {
        match self {
            DegradationLevel::Optimal => "OPTIMAL",
            DegradationLevel::Degraded => "DEGRADED",
            DegradationLevel::Limited => "LIMITED",
            DegradationLevel::Minimal => "MINIMAL",
            DegradationLevel::Emergency => "EMERGENCY",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|level| level.name().eq_ignore_ascii_case(name))
    }

    /// Whether this level is strictly more capable than `other`.
    pub fn is_better_than(self, other: DegradationLevel) -> bool {
        self < other
    }
}

impl core::fmt::Display for DegradationLevel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}
