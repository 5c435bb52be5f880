//! Calibration DAG Scheduler (spec.md §4.8): a Checker/Calibrator pair that
//! walks a DAG of calibration methods when a checked parameter drifts.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use serde_json::json;

use crate::registry::Registry;

/// Ring-buffer bound for a target's fitted-value history (spec.md §3 "History
/// ring-buffer size ≤ N (e.g. 10)"; the concrete constant is a supplement
/// grounded in `original_source/quark/dag/scheduler.py`).
pub const HISTORY_BOUND: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Failed,
    Unknown,
}

impl Status {
    fn as_str(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::Failed => "Failed",
            Status::Unknown => "Unknown",
        }
    }
}

/// One node of the calibration DAG: a method name, its parent in the
/// recalibration chain (`parents(method)[0]` of spec.md §4.8 — this
/// implementation carries a single parent, matching the spec's "walks one
/// edge toward its parent"), its check period and tolerance.
#[derive(Debug, Clone)]
pub struct CalibNode {
    pub method: String,
    pub parent: Option<String>,
    pub period: Duration,
    pub tolerance: f64,
}

/// Static grouping of chip targets checked together (spec.md §3).
#[derive(Debug, Clone)]
pub struct ChipGroup {
    pub id: String,
    pub targets: Vec<String>,
}

/// The external collaborator that actually runs a calibration/check method
/// against a target — in production this submits a task through the Task
/// Server and fits the result; here it's a narrow trait so the scheduler can
/// be tested with a stub (same pattern as [`crate::compiler::CircuitCompiler`]).
pub trait CalibrationExecutor: Send + Sync {
    fn execute(&self, method: &str, target: &str) -> Result<f64, String>;
}

fn status_path(target: &str, method: &str) -> String {
    format!("{target}.{method}")
}

fn record_status(registry: &Registry, target: &str, method: &str, status: Status, tolerance: f64, fitted: Option<f64>, tick: u64) {
    let base = status_path(target, method);
    registry.update(&format!("{base}.status"), json!(status.as_str())).ok();
    registry.update(&format!("{base}.tolerance"), json!(tolerance)).ok();
    registry.update(&format!("{base}.last_updated"), json!(tick)).ok();
    if let Some(value) = fitted {
        let mut history: VecDeque<f64> = registry
            .query(&format!("{base}.history"), None)
            .and_then(|v| v.as_array().cloned())
            .map(|arr| arr.iter().filter_map(|v| v.as_f64()).collect())
            .unwrap_or_default();
        history.push_back(value);
        while history.len() > HISTORY_BOUND {
            history.pop_front();
        }
        let history: Vec<f64> = history.into_iter().collect();
        registry.update(&format!("{base}.history"), json!(history)).ok();
    }
}

/// Owns the DAG, the chip groups, and the Checker→Calibrator handoff queue.
/// Construct once, call [`Scheduler::seed`], then [`Scheduler::spawn`] to
/// start the background threads.
pub struct Scheduler {
    registry: Arc<Registry>,
    dag: BTreeMap<String, CalibNode>,
    groups: Vec<ChipGroup>,
    executor: Arc<dyn CalibrationExecutor>,
    /// Held for the duration of one Checker tick or one Calibrator batch, so
    /// "the Checker never runs while the Calibrator holds a failure set"
    /// (spec.md §4.8) is a real mutual-exclusion guarantee, not a convention.
    exclusive: Arc<Mutex<()>>,
    tick: Arc<AtomicU64>,
    stop: Arc<AtomicBool>,
    tx: Sender<BTreeMap<String, String>>,
    rx: Receiver<BTreeMap<String, String>>,
}

impl Scheduler {
    pub fn new(registry: Arc<Registry>, dag: Vec<CalibNode>, groups: Vec<ChipGroup>, executor: Arc<dyn CalibrationExecutor>) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(64);
        Scheduler {
            registry,
            dag: dag.into_iter().map(|n| (n.method.clone(), n)).collect(),
            groups,
            executor,
            exclusive: Arc::new(Mutex::new(())),
            tick: Arc::new(AtomicU64::new(0)),
            stop: Arc::new(AtomicBool::new(false)),
            tx,
            rx,
        }
    }

    /// Seeds a per-`(target, method)` status record for every target in
    /// every group, against every node in the DAG (spec.md §4.8 supplement,
    /// ground: `scheduler.py`'s `for n1 in group.values(): for n2 in
    /// tmgr.nodes: cmgr.update(...)` construction-time seeding loop).
    pub fn seed(&self) {
        for group in &self.groups {
            for target in &group.targets {
                for node in self.dag.values() {
                    record_status(&self.registry, target, &node.method, Status::Unknown, node.tolerance, None, 0);
                }
            }
        }
    }

    pub fn status_of(&self, target: &str, method: &str) -> Option<Status> {
        let s = self.registry.query(&format!("{}.status", status_path(target, method)), None)?;
        match s.as_str()? {
            "OK" => Some(Status::Ok),
            "Failed" => Some(Status::Failed),
            _ => Some(Status::Unknown),
        }
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Receives one Checker→Calibrator failure set, blocking up to
    /// `timeout`. Exposed so callers that drive [`Scheduler::checker_tick`]
    /// directly (rather than through [`Scheduler::spawn`]'s timer threads)
    /// can observe the handoff without running the Calibrator thread.
    pub fn recv_failures(&self, timeout: Duration) -> Option<BTreeMap<String, String>> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// One Checker tick for `method`: runs the check against every target of
    /// every group, records history/status, and hands any failures to the
    /// Calibrator as `{target -> method}` (spec.md §4.8). Public so an
    /// operator (or a test) can force an immediate check outside the
    /// `check.period` timer in [`Scheduler::spawn`].
    pub fn checker_tick(&self, method: &str) {
        let _guard = self.exclusive.lock();
        let tick = self.tick.fetch_add(1, Ordering::SeqCst);
        let node = match self.dag.get(method) {
            Some(n) => n.clone(),
            None => return,
        };
        let mut failures = BTreeMap::new();
        for group in &self.groups {
            for target in &group.targets {
                match self.executor.execute(method, target) {
                    Ok(value) => record_status(&self.registry, target, method, Status::Ok, node.tolerance, Some(value), tick),
                    Err(_) => {
                        record_status(&self.registry, target, method, Status::Failed, node.tolerance, None, tick);
                        failures.insert(target.clone(), method.to_string());
                    }
                }
            }
        }
        drop(_guard);
        if !failures.is_empty() {
            if let Err(TrySendError::Full(_)) = self.tx.try_send(failures) {
                log::warn!("calibration failure queue is full; dropping this tick's failures for `{method}`");
            }
        }
    }

    /// Spawns one timer thread per checkable DAG node (its own `check.period`)
    /// and one serial Calibrator thread consuming the shared failure queue.
    /// Returns the join handles so callers (tests, `qcored`) can await a
    /// clean shutdown after calling [`Scheduler::stop`].
    pub fn spawn(self: &Arc<Self>) -> Vec<thread::JoinHandle<()>> {
        let mut handles = Vec::new();
        for method in self.dag.keys().cloned().collect::<Vec<_>>() {
            let scheduler = self.clone();
            let period = self.dag[&method].period;
            handles.push(thread::spawn(move || {
                while !scheduler.stop.load(Ordering::SeqCst) {
                    thread::sleep(period);
                    if scheduler.stop.load(Ordering::SeqCst) {
                        break;
                    }
                    scheduler.checker_tick(&method);
                }
            }));
        }

        let scheduler = self.clone();
        handles.push(thread::spawn(move || scheduler.calibrator_loop()));
        handles
    }

    /// Serial consumer: never runs two methods concurrently (spec.md §8
    /// invariant 5 — this is the single dedicated thread that makes that
    /// true), retries each failing `(target, method)` by walking to its
    /// parent until one succeeds or the chain is exhausted.
    fn calibrator_loop(&self) {
        while !self.stop.load(Ordering::SeqCst) {
            let Ok(failures) = self.rx.recv_timeout(Duration::from_millis(200)) else {
                continue;
            };
            let _guard = self.exclusive.lock();
            for (target, method) in failures {
                self.retry_chain(&target, &method);
            }
        }
    }

    /// Repeatedly executes `failing_method` against `target`; on failure,
    /// walks one edge toward its parent in the DAG and retries. Once an
    /// ancestor recalibration succeeds, `failing_method` itself is
    /// re-executed once to confirm the recovery and record its own final
    /// status (spec.md §8 S5: "assert final status for Q1 is OK" — a parent
    /// succeeding is not itself a statement about the child). The chain
    /// terminates once that confirmation runs, or as soon as a method has no
    /// parent left to walk to. Public so the Calibrator's retry behavior can
    /// be driven directly in tests without running [`Scheduler::spawn`]'s
    /// background thread.
    pub fn retry_chain(&self, target: &str, failing_method: &str) {
        let mut current = failing_method.to_string();
        loop {
            let tick = self.tick.fetch_add(1, Ordering::SeqCst);
            let tolerance = self.dag.get(&current).map(|n| n.tolerance).unwrap_or(0.0);
            match self.executor.execute(&current, target) {
                Ok(value) => {
                    record_status(&self.registry, target, &current, Status::Ok, tolerance, Some(value), tick);
                    if current != failing_method {
                        self.confirm_recovery(target, failing_method);
                    }
                    return;
                }
                Err(_) => {
                    record_status(&self.registry, target, &current, Status::Failed, tolerance, None, tick);
                    match self.dag.get(&current).and_then(|n| n.parent.clone()) {
                        Some(parent) => current = parent,
                        None => return,
                    }
                }
            }
        }
    }

    /// Re-executes the originally failing method once, after an ancestor's
    /// recalibration has succeeded, and records whatever status that run
    /// produces. This is the step that actually lets `failing_method` itself
    /// report `OK` once its dependency has been fixed.
    fn confirm_recovery(&self, target: &str, failing_method: &str) {
        let tick = self.tick.fetch_add(1, Ordering::SeqCst);
        let tolerance = self.dag.get(failing_method).map(|n| n.tolerance).unwrap_or(0.0);
        match self.executor.execute(failing_method, target) {
            Ok(value) => record_status(&self.registry, target, failing_method, Status::Ok, tolerance, Some(value), tick),
            Err(_) => record_status(&self.registry, target, failing_method, Status::Failed, tolerance, None, tick),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Ramsey fails for Q1 until PowerRabi has run once (spec.md §8 S5).
    struct FlakyExecutor {
        powerrabi_runs: AtomicUsize,
        ramsey_fixed: AtomicBool,
    }

    impl CalibrationExecutor for FlakyExecutor {
        fn execute(&self, method: &str, _target: &str) -> Result<f64, String> {
            match method {
                "PowerRabi" => {
                    self.powerrabi_runs.fetch_add(1, Ordering::SeqCst);
                    self.ramsey_fixed.store(true, Ordering::SeqCst);
                    Ok(1.0)
                }
                "Ramsey" => {
                    if self.ramsey_fixed.load(Ordering::SeqCst) {
                        Ok(1.0)
                    } else {
                        Err("drifted".into())
                    }
                }
                _ => Ok(0.0),
            }
        }
    }

    fn dag() -> Vec<CalibNode> {
        vec![
            CalibNode { method: "S21".into(), parent: None, period: Duration::from_secs(3600), tolerance: 0.1 },
            CalibNode { method: "Spectrum".into(), parent: Some("S21".into()), period: Duration::from_secs(3600), tolerance: 0.1 },
            CalibNode { method: "PowerRabi".into(), parent: Some("Spectrum".into()), period: Duration::from_secs(3600), tolerance: 0.1 },
            CalibNode { method: "Ramsey".into(), parent: Some("PowerRabi".into()), period: Duration::from_secs(3600), tolerance: 0.1 },
        ]
    }

    #[test]
    fn retry_chain_walks_to_parent_and_recovers() {
        let registry = Arc::new(Registry::new());
        let executor = Arc::new(FlakyExecutor { powerrabi_runs: AtomicUsize::new(0), ramsey_fixed: AtomicBool::new(false) });
        let groups = vec![ChipGroup { id: "g0".into(), targets: vec!["Q1".into()] }];
        let scheduler = Scheduler::new(registry, dag(), groups, executor.clone());
        scheduler.seed();
        assert_eq!(scheduler.status_of("Q1", "Ramsey"), Some(Status::Unknown));

        scheduler.retry_chain("Q1", "Ramsey");

        assert_eq!(executor.powerrabi_runs.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.status_of("Q1", "PowerRabi"), Some(Status::Ok));
    }

    #[test]
    fn seed_creates_a_status_record_for_every_target_and_method() {
        let registry = Arc::new(Registry::new());
        let executor = Arc::new(FlakyExecutor { powerrabi_runs: AtomicUsize::new(0), ramsey_fixed: AtomicBool::new(false) });
        let groups = vec![ChipGroup { id: "g0".into(), targets: vec!["Q0".into(), "Q1".into()] }];
        let scheduler = Scheduler::new(registry, dag(), groups, executor);
        scheduler.seed();
        for target in ["Q0", "Q1"] {
            for method in ["S21", "Spectrum", "PowerRabi", "Ramsey"] {
                assert_eq!(scheduler.status_of(target, method), Some(Status::Unknown));
            }
        }
    }

    #[test]
    fn checker_tick_hands_failures_to_the_calibrator_queue() {
        let registry = Arc::new(Registry::new());
        let executor = Arc::new(FlakyExecutor { powerrabi_runs: AtomicUsize::new(0), ramsey_fixed: AtomicBool::new(false) });
        let groups = vec![ChipGroup { id: "g0".into(), targets: vec!["Q1".into()] }];
        let scheduler = Scheduler::new(registry, dag(), groups, executor);
        scheduler.seed();
        scheduler.checker_tick("Ramsey");
        let failures = scheduler.rx.recv_timeout(Duration::from_millis(50)).unwrap();
        assert_eq!(failures.get("Q1"), Some(&"Ramsey".to_string()));
    }
}
