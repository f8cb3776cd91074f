use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use stockwarden_resilience::{DegradationLevel, DegradationManager, DegradationView};

use crate::config::RecoveryLoopConfig;

/// Upper bound on how long the loop sleeps before checking for shutdown.
const POLL: Duration = Duration::from_millis(50);

/// Periodic health evaluation driving the degradation manager.
///
/// The loop owns the manager while it runs, so it is the only writer of the
/// system level; everyone else reads through a [`DegradationView`].
#[derive(Debug, Clone)]
pub struct RecoveryLoop {
    pub interval: Duration,
    /// Consecutive passes an improvement must be seen before it is applied.
    pub recovery_confirmations: u32,
}

impl Default for RecoveryLoop {
    fn default() -> Self {
        Self::from(&RecoveryLoopConfig::default())
    }
}

impl From<&RecoveryLoopConfig> for RecoveryLoop {
    fn from(cfg: &RecoveryLoopConfig) -> Self {
        Self {
            interval: cfg.interval,
            recovery_confirmations: cfg.recovery_confirmations,
        }
    }
}

/// Handle for the running loop (shutdown + trigger hook).
#[derive(Debug)]
pub struct RecoveryLoopHandle {
    shutdown: mpsc::Sender<()>,
    trigger: mpsc::SyncSender<()>,
    join: thread::JoinHandle<DegradationManager>,
    view: DegradationView,
}

impl RecoveryLoopHandle {
    /// Request an evaluation pass now instead of waiting for the next tick.
    ///
    /// Triggers are coalesced; if a pass is already pending this is a no-op.
    pub fn trigger(&self) {
        let _ = self.trigger.try_send(());
    }

    pub fn view(&self) -> DegradationView {
        self.view.clone()
    }

    /// Stop the loop and take the manager back.
    ///
    /// Returns `None` only if the worker thread panicked. Probe and transition
    /// handler panics are caught by the manager and never reach the thread.
    pub fn shutdown(self) -> Option<DegradationManager> {
        let _ = self.shutdown.send(());
        self.join.join().ok()
    }
}

impl RecoveryLoop {
    /// Spawn the loop on a named thread. The first pass runs immediately.
    pub fn spawn(&self, name: &'static str, manager: DegradationManager) -> std::io::Result<RecoveryLoopHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let (trigger_tx, trigger_rx) = mpsc::sync_channel::<()>(1);
        let view = manager.view();

        let cfg = self.clone();
        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || recovery_loop(name, cfg, manager, shutdown_rx, trigger_rx))?;

        Ok(RecoveryLoopHandle {
            shutdown: shutdown_tx,
            trigger: trigger_tx,
            join,
            view,
        })
    }
}

fn recovery_loop(
    name: &'static str,
    cfg: RecoveryLoop,
    mut manager: DegradationManager,
    shutdown_rx: mpsc::Receiver<()>,
    trigger_rx: mpsc::Receiver<()>,
) -> DegradationManager {
    info!(
        worker = name,
        interval_ms = cfg.interval.as_millis() as u64,
        confirmations = cfg.recovery_confirmations,
        "recovery loop started"
    );

    let mut gate = RecoveryGate::new(cfg.recovery_confirmations);
    let mut next_tick = Instant::now();

    loop {
        let mut due = Instant::now() >= next_tick;
        // Coalesce any number of triggers into one pass.
        while trigger_rx.try_recv().is_ok() {
            due = true;
        }

        if due {
            let proposed = manager.evaluate_health();
            if let Some(level) = gate.admit(manager.current_level(), proposed) {
                manager.set_level(level);
            }
            next_tick = Instant::now() + cfg.interval;
        }

        let wait = next_tick.saturating_duration_since(Instant::now()).min(POLL);
        match shutdown_rx.recv_timeout(wait) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
    }

    info!(worker = name, level = %manager.current_level(), "recovery loop stopped");
    manager
}

/// Anti-flapping filter between the evaluated level and `set_level`.
///
/// Degradations pass straight through. An improvement is held back until it has
/// been proposed on `required` consecutive passes, and then the most
/// conservative level seen during that streak is applied.
#[derive(Debug)]
struct RecoveryGate {
    required: u32,
    streak: u32,
    candidate: Option<DegradationLevel>,
}

impl RecoveryGate {
    fn new(required: u32) -> Self {
        Self {
            required: required.max(1),
            streak: 0,
            candidate: None,
        }
    }

    fn admit(&mut self, current: DegradationLevel, proposed: DegradationLevel) -> Option<DegradationLevel> {
        if !proposed.is_better_than(current) {
            self.reset();
            return (proposed != current).then_some(proposed);
        }

        self.streak += 1;
        let candidate = self.candidate.map_or(proposed, |c| c.max(proposed));
        self.candidate = Some(candidate);

        if self.streak >= self.required {
            self.reset();
            Some(candidate)
        } else {
            debug!(
                current = %current,
                proposed = %candidate,
                streak = self.streak,
                required = self.required,
                "recovery pending confirmation"
            );
            None
        }
    }

    fn reset(&mut self) {
        self.streak = 0;
        self.candidate = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use stockwarden_resilience::{ProbeTier, probe_fn};

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        cond()
    }

    fn manager_with_database(healthy: &Arc<AtomicBool>) -> DegradationManager {
        let mut manager = DegradationManager::default();
        let flag = Arc::clone(healthy);
        manager
            .register_probe("database", ProbeTier::Critical, probe_fn(move || Ok(flag.load(Ordering::SeqCst))), 0.5)
            .unwrap();
        manager
            .register_probe("cache", ProbeTier::NonCritical, probe_fn(|| Ok(true)), 0.5)
            .unwrap();
        manager
    }

    #[test]
    fn first_pass_runs_immediately() {
        let db = Arc::new(AtomicBool::new(false));
        let runner = RecoveryLoop {
            interval: Duration::from_secs(3600),
            recovery_confirmations: 1,
        };
        let handle = runner.spawn("recovery-test", manager_with_database(&db)).unwrap();
        let view = handle.view();

        assert!(wait_until(|| view.current_level() == DegradationLevel::Minimal));
        let manager = handle.shutdown().unwrap();
        assert_eq!(manager.current_level(), DegradationLevel::Minimal);
    }

    #[test]
    fn trigger_forces_a_pass() {
        let db = Arc::new(AtomicBool::new(false));
        let runner = RecoveryLoop {
            interval: Duration::from_secs(3600),
            recovery_confirmations: 1,
        };
        let handle = runner.spawn("recovery-test", manager_with_database(&db)).unwrap();
        let view = handle.view();
        assert!(wait_until(|| view.current_level() == DegradationLevel::Minimal));

        db.store(true, Ordering::SeqCst);
        assert!(wait_until(|| {
            handle.trigger();
            view.current_level() == DegradationLevel::Optimal
        }));
        let manager = handle.shutdown().unwrap();
        assert!(manager.view().transition_history(10).len() >= 2);
    }

    #[test]
    fn panicking_health_check_does_not_stop_the_loop() {
        let db = Arc::new(AtomicBool::new(true));
        let mut manager = manager_with_database(&db);
        manager
            .register_probe(
                "object_store",
                ProbeTier::NonCritical,
                probe_fn(|| -> stockwarden_resilience::HealthCheckResult { panic!("bucket client poisoned") }),
                0.1,
            )
            .unwrap();
        let runner = RecoveryLoop {
            interval: Duration::from_secs(3600),
            recovery_confirmations: 1,
        };
        let handle = runner.spawn("recovery-test", manager).unwrap();
        let view = handle.view();
        assert!(wait_until(|| view.current_level() == DegradationLevel::Degraded));

        db.store(false, Ordering::SeqCst);
        assert!(wait_until(|| {
            handle.trigger();
            view.current_level() == DegradationLevel::Minimal
        }));
        assert!(handle.shutdown().is_some());
    }

    #[test]
    fn shutdown_is_prompt_with_long_interval() {
        let runner = RecoveryLoop {
            interval: Duration::from_secs(3600),
            recovery_confirmations: 1,
        };
        let handle = runner.spawn("recovery-test", DegradationManager::default()).unwrap();
        let started = Instant::now();
        assert!(handle.shutdown().is_some());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn degradations_apply_immediately() {
        let mut gate = RecoveryGate::new(3);
        assert_eq!(
            gate.admit(DegradationLevel::Optimal, DegradationLevel::Limited),
            Some(DegradationLevel::Limited)
        );
        assert_eq!(gate.admit(DegradationLevel::Limited, DegradationLevel::Limited), None);
    }

    #[test]
    fn improvements_wait_for_confirmation() {
        let mut gate = RecoveryGate::new(3);
        let current = DegradationLevel::Emergency;
        assert_eq!(gate.admit(current, DegradationLevel::Optimal), None);
        assert_eq!(gate.admit(current, DegradationLevel::Limited), None);
        // Most conservative level seen during the streak wins.
        assert_eq!(gate.admit(current, DegradationLevel::Optimal), Some(DegradationLevel::Limited));
    }

    #[test]
    fn a_relapse_resets_the_streak() {
        let mut gate = RecoveryGate::new(2);
        let current = DegradationLevel::Minimal;
        assert_eq!(gate.admit(current, DegradationLevel::Optimal), None);
        assert_eq!(gate.admit(current, DegradationLevel::Minimal), None);
        assert_eq!(gate.admit(current, DegradationLevel::Optimal), None);
        assert_eq!(gate.admit(current, DegradationLevel::Optimal), Some(DegradationLevel::Optimal));
    }

    #[test]
    fn single_confirmation_applies_at_once() {
        let mut gate = RecoveryGate::new(0);
        assert_eq!(
            gate.admit(DegradationLevel::Degraded, DegradationLevel::Optimal),
            Some(DegradationLevel::Optimal)
        );
    }
}
