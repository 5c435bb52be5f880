//! Task Runtime (spec.md §4.6): owns the lifecycle of one submitted task.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::assembler::{AssembleOpts, Assembler, BypassCache, CType, RawCommand};
use crate::compiler::{Circuit, CircuitCompiler, CompileOpts, Context, DataMap};
use crate::dataset::Dataset;
use crate::drivers::DriverMultiplexer;
use crate::error::TaskError;
use crate::registry::Registry;
use crate::rule::Rule;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Pending,
    Running,
    Finished,
    Failed,
    Canceled,
    Archived,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Finished | TaskState::Failed | TaskState::Canceled | TaskState::Archived)
    }
}

/// One axis of the sweep (spec.md §3): a name plus `(path, values, unit)`
/// entries, all sharing the same length.
#[derive(Debug, Clone)]
pub struct SweepAxis {
    pub name: String,
    pub entries: Vec<(String, Vec<Json>, String)>,
}

impl SweepAxis {
    pub fn len(&self) -> usize {
        self.entries.first().map(|(_, v, _)| v.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The wire-facing task description (spec.md §6 "Task description"),
/// distinct from the runtime bookkeeping kept in [`TaskRuntime`] — see
/// SPEC_FULL.md's note on splitting `TaskSpec`/`TaskRecord`.
#[derive(Clone)]
pub struct TaskSpec {
    pub name: String,
    pub owner: String,
    pub priority: i64,
    pub circuit: Circuit,
    pub axes: Vec<SweepAxis>,
    pub init: BTreeMap<String, Vec<RawCommand>>,
    pub post: BTreeMap<String, Vec<RawCommand>>,
    pub rules: Vec<String>,
    pub shots: u32,
    pub signal: String,
    pub align_right: bool,
    pub fillzero: bool,
    pub timeout: Option<Duration>,
    pub step_timeout: Option<Duration>,
    pub arch: String,
}

impl TaskSpec {
    /// Total step count `prod(axis-lengths)` (spec.md §3, §8 invariant 1).
    pub fn total_steps(&self) -> usize {
        self.axes.iter().map(|a| a.len().max(1)).product()
    }

    pub fn axis_lengths(&self) -> Vec<usize> {
        self.axes.iter().map(|a| a.len()).collect()
    }
}

/// Row-major coordinate for `sid` over `axis_lengths` (spec.md §4.6 step 1):
/// the last axis varies fastest.
pub fn coordinate_for(sid: usize, axis_lengths: &[usize]) -> Vec<usize> {
    let mut coord = vec![0usize; axis_lengths.len()];
    let mut rem = sid;
    for (i, &len) in axis_lengths.iter().enumerate().rev() {
        if len == 0 {
            coord[i] = 0;
            continue;
        }
        coord[i] = rem % len;
        rem /= len;
    }
    coord
}

pub struct Progress {
    pub tid: u64,
    pub sid: usize,
    pub total: usize,
}

/// Stored intermediate artifacts for one sid, returned verbatim by
/// `TaskServer::review` (spec.md §4.7): `{circ, ini, raw, ctx, byp, debug,
/// trace}`. Kept as debug strings rather than re-deriving structured access
/// to internal assembler/compiler types — this is a diagnostics bundle, not a
/// re-entrant data structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepArtifacts {
    pub circ: String,
    pub ini: String,
    pub raw: String,
    pub ctx: String,
    pub byp: String,
    pub debug: String,
    pub trace: Vec<String>,
}

/// Owns one task's lifecycle: sweep iteration, per-step pipeline, result
/// accumulation, progress reporting, cancellation (spec.md §4.6).
pub struct TaskRuntime {
    pub tid: u64,
    pub spec: TaskSpec,
    pub state: TaskState,
    pub dataset: Dataset,
    pub index: usize,
    pub artifacts: BTreeMap<usize, StepArtifacts>,
    cancel: Arc<AtomicBool>,
}

impl TaskRuntime {
    pub fn new(tid: u64, spec: TaskSpec) -> Self {
        TaskRuntime { tid, spec, state: TaskState::Pending, dataset: Dataset::new(), index: 0, artifacts: BTreeMap::new(), cancel: Arc::new(AtomicBool::new(false)) }
    }

    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Runs the per-step loop (spec.md §4.6) to completion, cancellation, or
    /// a fatal error. `compiler` and `registry`/`muxer` are the external
    /// collaborators this core consumes.
    pub async fn run(
        &mut self,
        registry: &Registry,
        compiler: &dyn CircuitCompiler,
        muxer: &DriverMultiplexer,
        mut on_progress: impl FnMut(Progress),
    ) -> Result<(), TaskError> {
        self.state = TaskState::Running;
        let snapshot = registry.snapshot(Some(self.tid));
        let mut ctx = Context::new(snapshot, self.spec.arch.clone());
        let assembler = Assembler::default();
        let mut bypass = BypassCache::new();
        let axis_lengths = self.spec.axis_lengths();
        let total = self.spec.total_steps();
        let start = Instant::now();

        for sid in 0..total {
            if self.is_cancelled() {
                self.state = TaskState::Canceled;
                break;
            }
            if let Some(deadline) = self.spec.timeout {
                if start.elapsed() > deadline {
                    self.state = TaskState::Failed;
                    self.run_post(registry, &assembler, &mut bypass, muxer).await;
                    return Err(TaskError::Timeout { sid });
                }
            }

            let step_started = Instant::now();
            let coord = coordinate_for(sid, &axis_lengths);

            let mut accumulator: BTreeMap<String, Vec<RawCommand>> = BTreeMap::new();
            if sid == 0 {
                for (step, cmds) in &self.spec.init {
                    accumulator.entry(step.clone()).or_default().extend(cmds.iter().cloned());
                }
            }

            self.apply_axis_writes(registry, &coord)?;
            self.apply_rules(registry)?;

            let datamap = crate::compiler::compile(
                sid,
                &mut accumulator,
                &self.spec.circuit,
                &mut ctx,
                compiler,
                &CompileOpts { arch: self.spec.arch.clone(), autoclear: sid == 0, autoclear_capabilities: vec!["drive".into(), "flux".into()], signal: Some(self.spec.signal.clone()), prep: true },
            )
            .map_err(TaskError::Compile)?;

            let raw = format!("{accumulator:?}");
            let assembled = assembler
                .assemble(sid, accumulator, registry, &mut bypass, AssembleOpts { prep: true, hold: false })
                .map_err(|source| TaskError::Assemble { sid, source })?;

            let reads = self.dispatch_step(sid, &assembled, muxer).await?;
            self.collect(sid, &reads, &datamap);

            let trace: Vec<String> = assembled.values().flat_map(|c| c.keys().cloned()).collect();
            self.artifacts.insert(
                sid,
                StepArtifacts {
                    circ: format!("{:?}", self.spec.circuit.ops),
                    ini: if sid == 0 { format!("{:?}", self.spec.init) } else { String::new() },
                    raw,
                    ctx: format!("snapshot v{}", ctx.snapshot.version),
                    byp: format!("{} channels cached", trace.len()),
                    debug: format!("coord={coord:?}"),
                    trace,
                },
            );

            self.index = sid + 1;
            on_progress(Progress { tid: self.tid, sid, total });

            if let Some(step_deadline) = self.spec.step_timeout {
                if step_started.elapsed() > step_deadline {
                    self.state = TaskState::Failed;
                    self.run_post(registry, &assembler, &mut bypass, muxer).await;
                    return Err(TaskError::Timeout { sid });
                }
            }
        }

        if self.state == TaskState::Running {
            self.state = TaskState::Finished;
        }
        self.run_post(registry, &assembler, &mut bypass, muxer).await;
        if self.state == TaskState::Finished {
            self.state = TaskState::Archived;
            registry.checkpoint(self.tid);
        }
        Ok(())
    }

    fn apply_axis_writes(&self, registry: &Registry, coord: &[usize]) -> Result<(), TaskError> {
        for (axis, &idx) in self.spec.axes.iter().zip(coord) {
            for (path, values, _unit) in &axis.entries {
                if let Some(v) = values.get(idx) {
                    registry.update(path, v.clone()).map_err(|e| TaskError::Assemble { sid: self.index, source: crate::error::AssembleError::Kernel(crate::error::KernelError::BadExpr(e.to_string())) })?;
                }
            }
        }
        Ok(())
    }

    fn apply_rules(&self, registry: &Registry) -> Result<(), TaskError> {
        for rule_text in &self.spec.rules {
            let Ok(rule) = Rule::parse(rule_text) else { continue };
            let resolved = rule.evaluate(|p| registry.query(p, None).and_then(|v| v.as_f64()));
            if let Ok(value) = resolved {
                let _ = registry.update(&rule.target, Json::from(value));
            }
        }
        Ok(())
    }

    async fn dispatch_step(
        &self,
        sid: usize,
        assembled: &crate::assembler::AssembledInstruction,
        muxer: &DriverMultiplexer,
    ) -> Result<BTreeMap<String, Value>, TaskError> {
        let mut reads = BTreeMap::new();
        // Within a single sid, dispatch in assembler-emitted order
        // (spec.md §5); BTreeMap iterates in target-name order which is the
        // assembler's emission order for this implementation.
        for channels in assembled.values() {
            for (hw_target, cmd) in channels {
                if self.is_cancelled() {
                    break;
                }
                match muxer.dispatch(hw_target, cmd).await {
                    // Keyed by the pre-resolution logical target (`origin`),
                    // which is what the datamap's `channel_to_signal` names.
                    Ok(Some(value)) => {
                        reads.insert(cmd.origin.clone(), value);
                    }
                    Ok(None) => {}
                    Err(source) => return Err(TaskError::Driver { sid, source }),
                }
            }
        }
        Ok(reads)
    }

    fn collect(&mut self, _sid: usize, reads: &BTreeMap<String, Value>, datamap: &DataMap) {
        for (channel, value) in reads {
            let Some(signal) = datamap.channel_to_signal.get(channel) else { continue };
            let point: Vec<f64> = match value {
                Value::Number(n) => vec![*n],
                Value::Array(arr) => arr.iter().copied().collect(),
                _ => vec![0.0],
            };
            let point_shape = vec![point.len()];
            self.dataset.signal_mut(signal, &point_shape).push_point(&point);
        }
    }

    async fn run_post(&self, registry: &Registry, assembler: &Assembler, bypass: &mut BypassCache, muxer: &DriverMultiplexer) {
        if self.spec.post.is_empty() {
            return;
        }
        let sid = self.index;
        let assembled = match assembler.assemble(sid, self.spec.post.clone(), registry, bypass, AssembleOpts { prep: true, hold: true }) {
            Ok(a) => a,
            Err(e) => {
                log::error!("failed to assemble post commands for tid {}: {e}", self.tid);
                return;
            }
        };
        for channels in assembled.values() {
            for (hw_target, cmd) in channels {
                if let Err(e) = muxer.dispatch(hw_target, cmd).await {
                    log::error!("post command to `{hw_target}` failed: {e}");
                }
            }
        }
    }
}
