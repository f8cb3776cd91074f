//! Feature gate: which capabilities are permitted at which operating level.

use serde::{Deserialize, Serialize};

use crate::level::DegradationLevel;

/// Closed set of gated capabilities.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    ReadOperations,
    WriteOperations,
    DocumentRecognition,
    AiAnalytics,
    RealTimeUpdates,
    Reporting,
    BulkImport,
}

impl Feature {
    pub const ALL: [Feature; 7] = [
        Feature::ReadOperations,
        Feature::WriteOperations,
        Feature::DocumentRecognition,
        Feature::AiAnalytics,
        Feature::RealTimeUpdates,
        Feature::Reporting,
        Feature::BulkImport,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Feature::ReadOperations => "read_operations",
            Feature::WriteOperations => "write_operations",
            Feature::DocumentRecognition => "document_recognition",
            Feature::AiAnalytics => "ai_analytics",
            Feature::RealTimeUpdates => "real_time_updates",
            Feature::Reporting => "reporting",
            Feature::BulkImport => "bulk_import",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.name() == name)
    }

    /// Least capable level at which the feature still runs.
    pub const fn required_level(self) -> DegradationLevel {
        match self {
            Feature::ReadOperations => DegradationLevel::Emergency,
            Feature::WriteOperations => DegradationLevel::Limited,
            Feature::Reporting => DegradationLevel::Limited,
            Feature::DocumentRecognition => DegradationLevel::Degraded,
            Feature::RealTimeUpdates => DegradationLevel::Degraded,
            Feature::AiAnalytics => DegradationLevel::Optimal,
            Feature::BulkImport => DegradationLevel::Optimal,
        }
    }

    /// Availability at every level, indexed by [`DegradationLevel::index`].
    pub const fn availability(self) -> [bool; DegradationLevel::COUNT] {
        let required = self.required_level().value();
        let mut row = [false; DegradationLevel::COUNT];
        let mut i = 0;
        while i < DegradationLevel::COUNT {
            row[i] = (i as u8 + 1) <= required;
            i += 1;
        }
        row
    }

    pub const fn is_available_at(self, level: DegradationLevel) -> bool {
        self.availability()[level.index()]
    }
}

impl core::fmt::Display for Feature {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

/// Whether `name` is permitted at `level`. Unknown names require `Optimal`.
pub fn is_named_feature_available(name: &str, level: DegradationLevel) -> bool {
    match Feature::from_name(name) {
        Some(feature) => feature.is_available_at(level),
        None => level <= DegradationLevel::Optimal,
    }
}

/// Read side of the feature gate, as consumed by the stock service.
pub trait FeatureGate: Send + Sync {
    fn current_level(&self) -> DegradationLevel;

    fn allows(&self, feature: Feature) -> bool {
        feature.is_available_at(self.current_level())
    }
}

/// A gate pinned to one level (tests, tools, single-node setups).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct FixedGate(pub DegradationLevel);

impl FeatureGate for FixedGate {
    fn current_level(&self) -> DegradationLevel {
        self.0
    }
}
