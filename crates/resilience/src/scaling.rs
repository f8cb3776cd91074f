//! Per-level resource scaling table.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::level::DegradationLevel;

/// Resource knobs for one operating level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScalingProfile {
    /// Multiplier applied to the configured connection-pool size.
    pub pool_multiplier: f64,
    /// Cache entry lifetime in seconds; longer when the backend is struggling.
    pub cache_ttl_secs: u64,
    /// Multiplier applied to batch sizes.
    pub batch_multiplier: f64,
}

impl ScalingProfile {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

/// Immutable lookup table from level to [`ScalingProfile`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoScalingConfig {
    profiles: [ScalingProfile; DegradationLevel::COUNT],
}

impl Default for AutoScalingConfig {
    fn default() -> Self {
        let profile = |pool_multiplier: f64, cache_ttl_secs: u64, batch_multiplier: f64| ScalingProfile {
            pool_multiplier,
            cache_ttl_secs,
            batch_multiplier,
        };
        Self {
            profiles: [
                profile(1.0, 300, 1.0),
                profile(0.8, 600, 0.8),
                profile(0.6, 900, 0.5),
                profile(0.4, 1800, 0.3),
                profile(0.2, 3600, 0.1),
            ],
        }
    }
}

impl AutoScalingConfig {
    pub fn new(profiles: [ScalingProfile; DegradationLevel::COUNT]) -> Self {
        Self { profiles }
    }

    pub fn for_level(&self, level: DegradationLevel) -> ScalingProfile {
        self.profiles[level.index()]
    }

    /// Lookup by level name (`"OPTIMAL"`, …), case-insensitive.
    pub fn by_level_name(&self, name: &str) -> Option<ScalingProfile> {
        DegradationLevel::from_name(name).map(|level| self.for_level(level))
    }
}
