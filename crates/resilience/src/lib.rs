//! Health tracking and graceful degradation.
//!
//! - `health`: probes and per-component rolling health
//! - `decision`: pure mapping from probe verdicts + score to a level
//! - `features` / `scaling`: what each level permits and how resources shrink
//! - `circuit_breaker`: per-dependency fail-fast wrapper
//! - `manager`: the stateful single-writer manager and its read view

pub mod circuit_breaker;
pub mod decision;
pub mod features;
pub mod health;
pub mod level;
pub mod manager;
pub mod scaling;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerSnapshot, CircuitState,
};
pub use decision::{ProbeVerdict, decide_level, level_for_score};
pub use features::{Feature, FeatureGate, FixedGate, is_named_feature_available};
pub use health::{ComponentHealth, HealthCheckResult, HealthProbe, ProbeError, ProbeTier, probe_fn};
pub use level::DegradationLevel;
pub use manager::{
    ComponentStatus, DegradationManager, DegradationView, HealthStatus, ManagerError, TransitionHandler,
    TransitionRecord, weighted_health_score,
};
pub use scaling::{AutoScalingConfig, ScalingProfile};
