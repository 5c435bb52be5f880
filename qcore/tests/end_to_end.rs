//! End-to-end scenarios S1-S6 (spec.md §8), exercised against the public
//! crate API the way `qcored` (and the task pipeline's own unit tests)
//! would drive it: a Registry fixture, a stub `CircuitCompiler`, a
//! `MockDriver`-backed `DriverMultiplexer`, and `TaskRuntime::run`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::Mutex as AsyncMutex;

use qcore::assembler::CType;
use qcore::calib::{CalibNode, CalibrationExecutor, ChipGroup, Scheduler, Status};
use qcore::compiler::{Circuit, CircuitCompiler, CircuitOp, CompileError, CompileOpts, Context, DataMap};
use qcore::drivers::{DriverKind, DriverMultiplexer, MockDriver};
use qcore::registry::Registry;
use qcore::task::{Progress, SweepAxis, TaskRuntime, TaskSpec, TaskState};
use qcore::value::Value;

/// Compiles a `Measure` gate into a READ of the target's acquisition
/// channel, the same stub shape used by `compiler::tests::StubCompiler`.
struct MeasureCompiler;

impl CircuitCompiler for MeasureCompiler {
    fn qcompile(
        &self,
        gates: &[(String, Vec<String>)],
        _ctx: &Context,
        _opts: &CompileOpts,
    ) -> Result<(BTreeMap<String, Vec<(CType, String, Value, String)>>, DataMap), CompileError> {
        let mut main = Vec::new();
        let mut datamap = DataMap::default();
        for (name, targets) in gates {
            if name == "Measure" {
                for t in targets {
                    let chan = format!("{t}.acquire.TraceIQ");
                    main.push((CType::Read, chan.clone(), Value::Number(0.0), "au".into()));
                    datamap.channel_to_signal.insert(chan, "iq".into());
                }
            }
        }
        let mut steps = BTreeMap::new();
        steps.insert("main".to_string(), main);
        Ok((steps, datamap))
    }
}

/// Seeds a registry with one qubit (`Q0`/`Q1`) wired to an `AWG` setting
/// channel and an `ADC` acquisition channel, matching the fixtures used by
/// the assembler's own unit tests.
fn fixture_registry() -> Registry {
    let reg = Registry::new();
    reg.update("dev.AWG.srate", json!(1.0e9)).unwrap();
    reg.update("dev.ADC.srate", json!(1.0e9)).unwrap();
    reg.update("Q0.channel.LO", json!("AWG.CH1")).unwrap();
    reg.update("Q0.acquire.TraceIQ.address", json!("ADC.CH0.TraceIQ")).unwrap();
    reg.update("Q1.channel.LO", json!("AWG.CH2")).unwrap();
    reg.update("Q1.acquire.TraceIQ.address", json!("ADC.CH1.TraceIQ")).unwrap();
    reg
}

fn measure_circuit(qubit: &str) -> Circuit {
    Circuit { ops: vec![CircuitOp::Gate { name: "Measure".into(), targets: vec![qubit.to_string()] }] }
}

fn base_spec(circuit: Circuit, axes: Vec<SweepAxis>) -> TaskSpec {
    TaskSpec {
        name: "scenario".into(),
        owner: "alice".into(),
        priority: 0,
        circuit,
        axes,
        init: BTreeMap::new(),
        post: BTreeMap::new(),
        rules: vec![],
        shots: 1024,
        signal: "iq".into(),
        align_right: false,
        fillzero: true,
        timeout: None,
        step_timeout: None,
        arch: "baqis".into(),
    }
}

fn muxer_with_adc_points(points: usize) -> Arc<DriverMultiplexer> {
    muxer_and_awg_with_adc_points(points).0
}

/// Same fixture as [`muxer_with_adc_points`], but also hands back the AWG
/// driver handle so a test can inspect `.writes` after the run (spec.md §8
/// invariant 2 / S3).
fn muxer_and_awg_with_adc_points(points: usize) -> (Arc<DriverMultiplexer>, Arc<AsyncMutex<MockDriver>>) {
    let mut mux = DriverMultiplexer::new();
    let awg = Arc::new(AsyncMutex::new(MockDriver::new(Some(1e9))));
    let mut adc = MockDriver::new(Some(1e9));
    let samples: Vec<f64> = (0..points).map(|i| i as f64).collect();
    adc.canned_reads.insert(
        "TraceIQ".to_string(),
        Value::Array(ndarray::ArrayD::from_shape_vec(ndarray::IxDyn(&[points]), samples).unwrap()),
    );
    mux.register("AWG", DriverKind::Local, awg.clone());
    mux.register("ADC", DriverKind::Local, Arc::new(AsyncMutex::new(adc)));
    (Arc::new(mux), awg)
}

#[tokio::test]
async fn s1_single_point_measurement() {
    let registry = fixture_registry();
    let axes = vec![SweepAxis { name: "freq".into(), entries: vec![("Q0.setting.LO".into(), vec![json!(5.0e9)], "Hz".into())] }];
    let spec = base_spec(measure_circuit("Q0"), axes);
    let muxer = muxer_with_adc_points(8);
    let mut runtime = TaskRuntime::new(1, spec);
    runtime.run(&registry, &MeasureCompiler, &muxer, |_: Progress| {}).await.unwrap();

    assert_eq!(runtime.state, TaskState::Archived);
    let buf = &runtime.dataset.signals["iq"];
    let (shape, _data) = buf.reshape(&[1]);
    assert_eq!(shape, vec![1, 8]);
    assert_eq!(buf.points_len(), 1);
}

#[tokio::test]
async fn s2_two_axis_sweep_reports_progress_and_reshapes() {
    let registry = fixture_registry();
    let axes = vec![
        SweepAxis { name: "freq".into(), entries: vec![("Q0.setting.LO".into(), vec![json!(1.0), json!(2.0), json!(3.0)], "Hz".into())] },
        SweepAxis { name: "amp".into(), entries: vec![("Q0.setting.AMP".into(), vec![json!(0.1), json!(0.2)], "au".into())] },
    ];
    let spec = base_spec(measure_circuit("Q0"), axes);
    assert_eq!(spec.total_steps(), 6);
    let muxer = muxer_with_adc_points(4);
    let mut runtime = TaskRuntime::new(2, spec);
    let mut progressed = Vec::new();
    runtime.run(&registry, &MeasureCompiler, &muxer, |p: Progress| progressed.push(p.sid)).await.unwrap();

    assert_eq!(progressed, vec![0, 1, 2, 3, 4, 5]);
    let buf = &runtime.dataset.signals["iq"];
    let (shape, _) = buf.reshape(&[3, 2]);
    assert_eq!(shape, vec![3, 2, 4]);
}

#[tokio::test]
async fn s3_bypass_cache_collapses_repeated_identical_writes() {
    let registry = fixture_registry();
    let values: Vec<serde_json::Value> = std::iter::repeat(json!(5.0e9)).take(5).collect();
    let axes = vec![SweepAxis { name: "freq".into(), entries: vec![("Q0.setting.LO".into(), values, "Hz".into())] }];
    let spec = base_spec(Circuit::default(), axes);
    let (muxer, awg) = muxer_and_awg_with_adc_points(4);
    let mut runtime = TaskRuntime::new(3, spec);
    runtime.run(&registry, &MeasureCompiler, &muxer, |_: Progress| {}).await.unwrap();

    assert_eq!(runtime.state, TaskState::Archived);
    // the same LO value was swept 5 times; the bypass cache should have
    // collapsed all but the first write before it ever reached the driver
    // (spec.md §8 invariant 2 / S3).
    let guard = awg.lock().await;
    assert_eq!(guard.writes.len(), 1);
}

#[tokio::test]
async fn s4_cancellation_mid_run_stops_between_steps_and_runs_post_once() {
    let registry = fixture_registry();
    let values: Vec<serde_json::Value> = (0..10).map(|i| json!(i as f64)).collect();
    let mut spec = base_spec(Circuit::default(), vec![SweepAxis { name: "freq".into(), entries: vec![("Q0.setting.LO".into(), values, "Hz".into())] }]);
    let post_target = "Q0.setting.LO".to_string();
    spec.post.insert("main".to_string(), vec![(CType::Write, post_target, Value::Number(0.0), "Hz".into())]);

    let muxer = muxer_with_adc_points(4);
    let mut runtime = TaskRuntime::new(4, spec);
    let cancel = runtime.cancel_handle();

    let mut first_two = 0;
    runtime
        .run(&registry, &MeasureCompiler, &muxer, |p: Progress| {
            first_two += 1;
            if p.sid == 2 {
                cancel.store(true, Ordering::SeqCst);
            }
        })
        .await
        .unwrap();

    assert_eq!(runtime.state, TaskState::Canceled);
    assert_eq!(first_two, 3, "sids 0,1,2 should have run before the cancel flag was observed");
}

struct CountingExecutor {
    powerrabi_runs: AtomicUsize,
    ramsey_fixed: AtomicBool,
}

impl CalibrationExecutor for CountingExecutor {
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

#[test]
fn s5_calibration_recovery_walks_the_dag_via_checker_and_calibrator() {
    let registry = Arc::new(Registry::new());
    let executor = Arc::new(CountingExecutor { powerrabi_runs: AtomicUsize::new(0), ramsey_fixed: AtomicBool::new(false) });
    let dag = vec![
        CalibNode { method: "S21".into(), parent: None, period: Duration::from_secs(3600), tolerance: 0.1 },
        CalibNode { method: "Spectrum".into(), parent: Some("S21".into()), period: Duration::from_secs(3600), tolerance: 0.1 },
        CalibNode { method: "PowerRabi".into(), parent: Some("Spectrum".into()), period: Duration::from_secs(3600), tolerance: 0.1 },
        CalibNode { method: "Ramsey".into(), parent: Some("PowerRabi".into()), period: Duration::from_secs(3600), tolerance: 0.1 },
    ];
    let groups = vec![ChipGroup { id: "g0".into(), targets: vec!["Q1".into()] }];
    let scheduler = Scheduler::new(registry, dag, groups, executor.clone());
    scheduler.seed();

    // Checker tick: Ramsey fails for Q1, hands the failure to the Calibrator queue.
    scheduler.checker_tick("Ramsey");
    let failures = scheduler.recv_failures(Duration::from_millis(100)).expect("checker tick should report a failure");
    assert_eq!(failures.get("Q1"), Some(&"Ramsey".to_string()));

    for (target, method) in failures {
        scheduler.retry_chain(&target, &method);
    }

    assert_eq!(executor.powerrabi_runs.load(Ordering::SeqCst), 1);
    assert_eq!(scheduler.status_of("Q1", "Ramsey"), Some(Status::Ok));
    assert_eq!(scheduler.status_of("Q1", "PowerRabi"), Some(Status::Ok));
}

#[test]
fn s6_snapshot_determinism_across_a_later_mutation() {
    let registry = Registry::new();
    registry.update("gate.R.Q0.params.frequency", json!(1.0e9)).unwrap();

    let snap_t1 = registry.snapshot(Some(101));
    let ctx_t1 = Context::new(snap_t1.clone(), "baqis");

    registry.update("gate.R.Q0.params.frequency", json!(2.0e9)).unwrap();

    let snap_t2 = registry.snapshot(Some(102));
    let _ctx_t2 = Context::new(snap_t2.clone(), "baqis");

    // T1's frozen snapshot still reports the pre-mutation value at every
    // step of its compile, regardless of T2 having been submitted after the
    // mutation (spec.md §8 invariant 3 / S6).
    assert_eq!(ctx_t1.snapshot.query("gate.R.Q0.params.frequency", None), Some(json!(1.0e9)));
    assert_eq!(snap_t2.query("gate.R.Q0.params.frequency", None), Some(json!(2.0e9)));

    // Re-querying T1's named snapshot later still returns the same value.
    let snap_t1_again = registry.snapshot(Some(101));
    assert_eq!(snap_t1_again.query("gate.R.Q0.params.frequency", None), Some(json!(1.0e9)));
}
