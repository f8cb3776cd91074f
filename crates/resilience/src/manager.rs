//! Graceful-degradation manager.
//!
//! State is split by capability:
//!
//! - [`DegradationManager`] is the single writer. It owns the probes and the
//!   transition handlers and is the only type that can change the current level.
//!   It is not `Clone`; the recovery loop takes it by value.
//! - [`DegradationView`] is a cheap, cloneable read handle for everything else
//!   (status reporting, feature gating).

use std::any::Any;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::decision::{ProbeVerdict, decide_level};
use crate::features::{Feature, FeatureGate, is_named_feature_available};
use crate::health::{ComponentHealth, HealthCheckResult, HealthProbe, ProbeError, ProbeTier};
use crate::level::DegradationLevel;
use crate::scaling::{AutoScalingConfig, ScalingProfile};

/// Transition records kept for prediction and reporting.
pub const TRANSITION_HISTORY_CAPACITY: usize = 100;
/// Degrade→recover cycles averaged by the predictor.
pub const RECOVERY_SAMPLE_CAPACITY: usize = 20;
/// Transitions included in a status snapshot.
pub const STATUS_HISTORY_LEN: usize = 10;

/// Handler invoked when the system enters a level.
pub type TransitionHandler = Box<dyn Fn(&TransitionRecord) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ManagerError {
    #[error("probe '{name}' has invalid weight {weight}; weights must be positive")]
    InvalidWeight { name: String, weight: f64 },

    #[error("probe '{0}' is already registered")]
    DuplicateProbe(String),
}

/// One level change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub timestamp: DateTime<Utc>,
    pub from_level: DegradationLevel,
    pub to_level: DegradationLevel,
    pub health_score: f64,
}

impl TransitionRecord {
    pub fn is_recovery(&self) -> bool {
        self.to_level.is_better_than(self.from_level)
    }
}

/// A component as reported in a status snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentStatus {
    #[serde(flatten)]
    pub health: ComponentHealth,
    pub health_score: f64,
}

/// Health/status snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub current_level: DegradationLevel,
    pub overall_health_score: f64,
    pub components: BTreeMap<String, ComponentStatus>,
    /// Seconds since the system last left `Optimal`, if it is degraded now.
    pub degradation_duration_secs: Option<f64>,
    pub predicted_recovery_seconds: Option<f64>,
    pub transition_history: Vec<TransitionRecord>,
    pub resource_scaling_config: ScalingProfile,
    pub last_evaluation: Option<DateTime<Utc>>,
}

impl HealthStatus {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

fn run_probe(probe: &dyn HealthProbe) -> HealthCheckResult {
    panic::catch_unwind(AssertUnwindSafe(|| probe.check()))
        .unwrap_or_else(|payload| Err(ProbeError::new(format!("probe panicked: {}", panic_message(payload.as_ref())))))
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// Weighted mean of component scores; 100 when nothing is registered.
pub fn weighted_health_score(components: &[ComponentHealth]) -> f64 {
    let total_weight: f64 = components.iter().map(|c| c.weight).sum();
    if components.is_empty() || total_weight <= 0.0 {
        return 100.0;
    }
    let weighted: f64 = components.iter().map(|c| c.health_score() * c.weight).sum();
    (weighted / total_weight).clamp(0.0, 100.0)
}

#[derive(Debug)]
struct SharedState {
    current_level: DegradationLevel,
    components: Vec<ComponentHealth>,
    overall_score: f64,
    history: VecDeque<TransitionRecord>,
    recovery_samples: VecDeque<Duration>,
    /// Start of the open degrade→recover cycle, if any.
    cycle_started: Option<DateTime<Utc>>,
    /// When the system last left `Optimal`.
    degraded_since: Option<DateTime<Utc>>,
    last_evaluation: Option<DateTime<Utc>>,
}

impl SharedState {
    fn new() -> Self {
        Self {
            current_level: DegradationLevel::Optimal,
            components: Vec::new(),
            overall_score: 100.0,
            history: VecDeque::with_capacity(TRANSITION_HISTORY_CAPACITY),
            recovery_samples: VecDeque::with_capacity(RECOVERY_SAMPLE_CAPACITY),
            cycle_started: None,
            degraded_since: None,
            last_evaluation: None,
        }
    }

    fn record_transition(&mut self, record: TransitionRecord) {
        let now = record.timestamp;

        if record.is_recovery() {
            if let Some(started) = self.cycle_started.take() {
                let elapsed = (now - started).to_std().unwrap_or_default();
                if self.recovery_samples.len() == RECOVERY_SAMPLE_CAPACITY {
                    self.recovery_samples.pop_front();
                }
                self.recovery_samples.push_back(elapsed);
            }
        } else if self.cycle_started.is_none() {
            self.cycle_started = Some(now);
        }

        if record.from_level == DegradationLevel::Optimal {
            self.degraded_since = Some(now);
        } else if record.to_level == DegradationLevel::Optimal {
            self.degraded_since = None;
        }

        self.current_level = record.to_level;
        if self.history.len() == TRANSITION_HISTORY_CAPACITY {
            self.history.pop_front();
        }
        self.history.push_back(record);
    }

    fn predict_recovery_time(&self) -> Option<Duration> {
        if self.history.len() < 2 || self.recovery_samples.is_empty() {
            return None;
        }
        let total: Duration = self.recovery_samples.iter().sum();
        Some(total / self.recovery_samples.len() as u32)
    }
}

fn read(state: &RwLock<SharedState>) -> RwLockReadGuard<'_, SharedState> {
    state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write(state: &RwLock<SharedState>) -> RwLockWriteGuard<'_, SharedState> {
    state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct RegisteredProbe {
    name: String,
    probe: Box<dyn HealthProbe>,
}

/// Single-writer degradation manager.
pub struct DegradationManager {
    state: Arc<RwLock<SharedState>>,
    scaling: Arc<AutoScalingConfig>,
    probes: Vec<RegisteredProbe>,
    handlers: HashMap<DegradationLevel, TransitionHandler>,
}

impl core::fmt::Debug for DegradationManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DegradationManager")
            .field("probes", &self.probes.iter().map(|p| &p.name).collect::<Vec<_>>())
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .field("current_level", &self.current_level())
            .finish()
    }
}

impl Default for DegradationManager {
    fn default() -> Self {
        Self::new(AutoScalingConfig::default())
    }
}

impl DegradationManager {
    pub fn new(scaling: AutoScalingConfig) -> Self {
        Self {
            state: Arc::new(RwLock::new(SharedState::new())),
            scaling: Arc::new(scaling),
            probes: Vec::new(),
            handlers: HashMap::new(),
        }
    }

    /// Read-only handle sharing this manager's state.
    pub fn view(&self) -> DegradationView {
        DegradationView {
            state: Arc::clone(&self.state),
            scaling: Arc::clone(&self.scaling),
        }
    }

    pub fn current_level(&self) -> DegradationLevel {
        read(&self.state).current_level
    }

    /// Register a health probe for a named dependency.
    pub fn register_probe<P>(
        &mut self,
        name: impl Into<String>,
        tier: ProbeTier,
        probe: P,
        weight: f64,
    ) -> Result<(), ManagerError>
    where
        P: HealthProbe + 'static,
    {
        let name = name.into();
        if !(weight.is_finite() && weight > 0.0) {
            return Err(ManagerError::InvalidWeight { name, weight });
        }
        if self.probes.iter().any(|p| p.name == name) {
            return Err(ManagerError::DuplicateProbe(name));
        }

        write(&self.state)
            .components
            .push(ComponentHealth::new(name.clone(), tier, weight));
        info!(component = %name, ?tier, weight, "health probe registered");
        self.probes.push(RegisteredProbe {
            name,
            probe: Box::new(probe),
        });
        Ok(())
    }

    /// Register the handler run when the system enters `level` (replaces any previous one).
    pub fn on_transition<F>(&mut self, level: DegradationLevel, handler: F)
    where
        F: Fn(&TransitionRecord) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.handlers.insert(level, Box::new(handler));
    }

    /// Run every probe, update component records and compute the level they imply.
    ///
    /// Never fails and never changes the current level; see [`Self::set_level`].
    /// A panicking probe is recorded as a failed check.
    pub fn evaluate_health(&mut self) -> DegradationLevel {
        let outcomes: Vec<_> = self
            .probes
            .iter()
            .map(|p| {
                let started = Instant::now();
                let result = run_probe(p.probe.as_ref());
                (result, started.elapsed().as_secs_f64() * 1000.0)
            })
            .collect();

        let mut state = write(&self.state);
        for ((result, latency_ms), component) in outcomes.into_iter().zip(state.components.iter_mut()) {
            match result {
                Ok(true) => component.record_success(latency_ms),
                Ok(false) => {
                    warn!(component = %component.name, "health probe reported unhealthy");
                    component.record_failure("probe reported unhealthy");
                }
                Err(err) => {
                    warn!(component = %component.name, error = %err, "health probe failed");
                    component.record_failure(err.to_string());
                }
            }
        }

        let score = weighted_health_score(&state.components);
        state.overall_score = score;
        state.last_evaluation = Some(Utc::now());

        let verdicts: Vec<_> = state
            .components
            .iter()
            .map(|c| ProbeVerdict::new(c.tier, c.is_healthy))
            .collect();
        let level = decide_level(&verdicts, score);
        debug!(score, %level, "health evaluated");
        level
    }

    /// Weighted mean of the current component scores, in `[0, 100]`.
    pub fn calculate_overall_health_score(&self) -> f64 {
        weighted_health_score(&read(&self.state).components)
    }

    /// Move the system to `new_level`. Returns `false` if it was already there.
    pub fn set_level(&mut self, new_level: DegradationLevel) -> bool {
        self.set_level_at(new_level, Utc::now())
    }

    fn set_level_at(&mut self, new_level: DegradationLevel, now: DateTime<Utc>) -> bool {
        let (old_level, health_score) = {
            let state = read(&self.state);
            (state.current_level, state.overall_score)
        };
        if old_level == new_level {
            return false;
        }

        let record = TransitionRecord {
            timestamp: now,
            from_level: old_level,
            to_level: new_level,
            health_score,
        };

        if let Some(handler) = self.handlers.get(&new_level) {
            match panic::catch_unwind(AssertUnwindSafe(|| handler(&record))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(from = %old_level, to = %new_level, error = %err, "transition handler failed");
                }
                Err(payload) => {
                    warn!(
                        from = %old_level,
                        to = %new_level,
                        panic = %panic_message(payload.as_ref()),
                        "transition handler panicked"
                    );
                }
            }
        }

        write(&self.state).record_transition(record);
        if new_level.is_better_than(old_level) {
            info!(from = %old_level, to = %new_level, health_score, "system recovering");
        } else {
            warn!(from = %old_level, to = %new_level, health_score, "system degrading");
        }
        true
    }

    pub fn get_status(&self) -> HealthStatus {
        self.view().get_status()
    }
}

/// Cloneable read-only view of the manager's state.
#[derive(Debug, Clone)]
pub struct DegradationView {
    state: Arc<RwLock<SharedState>>,
    scaling: Arc<AutoScalingConfig>,
}

impl DegradationView {
    pub fn current_level(&self) -> DegradationLevel {
        read(&self.state).current_level
    }

    pub fn overall_health_score(&self) -> f64 {
        read(&self.state).overall_score
    }

    pub fn component(&self, name: &str) -> Option<ComponentHealth> {
        read(&self.state)
            .components
            .iter()
            .find(|c| c.name == name)
            .cloned()
    }

    /// Whether the named feature is permitted now. Unknown names require `Optimal`.
    pub fn is_feature_available(&self, feature_name: &str) -> bool {
        is_named_feature_available(feature_name, self.current_level())
    }

    pub fn predict_recovery_time(&self) -> Option<Duration> {
        read(&self.state).predict_recovery_time()
    }

    pub fn get_resource_scaling_config(&self) -> ScalingProfile {
        self.scaling.for_level(self.current_level())
    }

    /// Most recent transitions, oldest first.
    pub fn transition_history(&self, limit: usize) -> Vec<TransitionRecord> {
        let state = read(&self.state);
        let skip = state.history.len().saturating_sub(limit);
        state.history.iter().skip(skip).cloned().collect()
    }

    pub fn get_status(&self) -> HealthStatus {
        let state = read(&self.state);
        let now = Utc::now();

        let components = state
            .components
            .iter()
            .map(|c| {
                (
                    c.name.clone(),
                    ComponentStatus {
                        health: c.clone(),
                        health_score: c.health_score(),
                    },
                )
            })
            .collect();

        let skip = state.history.len().saturating_sub(STATUS_HISTORY_LEN);

        HealthStatus {
            current_level: state.current_level,
            overall_health_score: state.overall_score,
            components,
            degradation_duration_secs: state
                .degraded_since
                .map(|since| (now - since).to_std().unwrap_or_default().as_secs_f64()),
            predicted_recovery_seconds: state.predict_recovery_time().map(|d| d.as_secs_f64()),
            transition_history: state.history.iter().skip(skip).cloned().collect(),
            resource_scaling_config: self.scaling.for_level(state.current_level),
            last_evaluation: state.last_evaluation,
        }
    }
}

impl FeatureGate for DegradationView {
    fn current_level(&self) -> DegradationLevel {
        DegradationView::current_level(self)
    }

    fn allows(&self, feature: Feature) -> bool {
        feature.is_available_at(DegradationView::current_level(self))
    }
}
