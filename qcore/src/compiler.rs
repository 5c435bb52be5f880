//! Compiler Adapter (spec.md §4.3): wraps the external circuit compiler.
//!
//! The external gate-to-pulse compiler itself is an external collaborator
//! (spec.md §1) — consumed here only through the [`CircuitCompiler`] trait,
//! the way `rigetti-qcs-sdk-rust` wraps `quilc` behind a narrow function
//! boundary (`qpu::quilc::compile_program`) instead of embedding it.

use std::collections::BTreeMap;

use crate::error::CompileError;
use crate::registry::Snapshot;
use crate::value::Value;

pub type CType = crate::assembler::CType;

/// One gate or pseudo-op in a circuit. `Set`/`Get` are the "embedded SET/GET
/// pseudo-ops" that bypass the external compiler entirely and become direct
/// WRITE/READ commands (spec.md §4.3).
#[derive(Debug, Clone)]
pub enum CircuitOp {
    Gate { name: String, targets: Vec<String> },
    Set { path: String, value: Value, unit: String },
    Get { path: String, unit: String },
}

/// Pure, side-effect-free pulse-level program: an ordered sequence of ops
/// (spec.md §3).
#[derive(Debug, Clone, Default)]
pub struct Circuit {
    pub ops: Vec<CircuitOp>,
}

/// Compile-time knobs (spec.md §4.3): architecture name, the "autoclear"
/// option, and the channel capabilities autoclear should target.
#[derive(Debug, Clone, Default)]
pub struct CompileOpts {
    pub arch: String,
    pub autoclear: bool,
    pub autoclear_capabilities: Vec<String>,
    pub signal: Option<String>,
    pub prep: bool,
}

/// One compiled step's commands plus the datamap telling the post-processor
/// how to reassemble raw device output (spec.md §3, §4.3).
#[derive(Debug, Clone, Default)]
pub struct DataMap {
    /// device channel -> logical signal name
    pub channel_to_signal: BTreeMap<String, String>,
}

/// Per-task compilation context. One per task — no process-wide singleton
/// (spec.md §9: "Global mutable compiler context ... maps to one Context
/// object per task, threaded explicitly"). Holds the frozen snapshot and a
/// gate cache cleared at the start of every `compile` call (spec.md §4.3).
pub struct Context {
    pub snapshot: Snapshot,
    pub arch: String,
    gate_cache: BTreeMap<String, Value>,
}

impl Context {
    pub fn new(snapshot: Snapshot, arch: impl Into<String>) -> Self {
        Context { snapshot, arch: arch.into(), gate_cache: BTreeMap::new() }
    }

    fn clear_gate_cache(&mut self) {
        self.gate_cache.clear();
    }
}

/// The external gate-to-pulse compiler boundary.
pub trait CircuitCompiler: Send + Sync {
    /// Compiles the *true gate* operations of a circuit (SET/GET pseudo-ops
    /// are stripped out before this is called) into `(ctype, address, value,
    /// unit)` tuples per step, plus a datamap.
    fn qcompile(
        &self,
        gates: &[(String, Vec<String>)],
        ctx: &Context,
        opts: &CompileOpts,
    ) -> Result<(BTreeMap<String, Vec<(CType, String, Value, String)>>, DataMap), CompileError>;
}

/// `initialize(snapshot, arch, opts) -> Context` (spec.md §4.3).
pub fn initialize(snapshot: Snapshot, arch: impl Into<String>) -> Context {
    Context::new(snapshot, arch)
}

/// `compile(sid, instructionAccumulator, circuit, opts) -> (instruction, datamap)`
/// (spec.md §4.3).
///
/// Splits SET/GET pseudo-ops into direct WRITE/READ commands; only true gate
/// ops reach `compiler`. If `autoclear` is set, prepends writes that zero
/// every channel the snapshot mentions for the selected capabilities, so no
/// stale waveform bleeds across steps.
pub fn compile(
    sid: usize,
    accumulator: &mut BTreeMap<String, Vec<(CType, String, Value, String)>>,
    circuit: &Circuit,
    ctx: &mut Context,
    compiler: &dyn CircuitCompiler,
    opts: &CompileOpts,
) -> Result<DataMap, CompileError> {
    ctx.clear_gate_cache();

    let mut gates = Vec::new();
    let mut direct: Vec<(CType, String, Value, String)> = Vec::new();

    if opts.autoclear {
        for chan in autoclear_channels(ctx, &opts.autoclear_capabilities) {
            direct.push((CType::Write, chan, Value::PulseExpr("zero()".into()), "au".into()));
        }
    }

    for op in &circuit.ops {
        match op {
            CircuitOp::Gate { name, targets } => gates.push((name.clone(), targets.clone())),
            CircuitOp::Set { path, value, unit } => {
                direct.push((CType::Write, path.clone(), value.clone(), unit.clone()));
            }
            CircuitOp::Get { path, unit } => {
                direct.push((CType::Read, path.clone(), Value::Number(0.0), unit.clone()));
            }
        }
    }

    let (compiled, datamap) = if gates.is_empty() {
        (BTreeMap::new(), DataMap::default())
    } else {
        compiler.qcompile(&gates, ctx, opts)?
    };

    let main = accumulator.entry("main".to_string()).or_default();
    main.splice(0..0, direct);
    for (step, cmds) in compiled {
        accumulator.entry(step).or_default().extend(cmds);
    }

    log::info!("step {sid} compiled ({} steps in accumulator)", accumulator.len());
    Ok(datamap)
}

fn autoclear_channels(ctx: &Context, capabilities: &[String]) -> Vec<String> {
    let mut out = Vec::new();
    let Some(devices) = ctx.snapshot.as_json().get("dev").and_then(|d| d.as_object()) else {
        return out;
    };
    for (dev_name, dev) in devices {
        let Some(caps) = dev.get("capabilities").and_then(|c| c.as_array()) else { continue };
        let matches = caps
            .iter()
            .filter_map(|c| c.as_str())
            .any(|c| capabilities.iter().any(|want| want == c));
        if matches {
            out.push(format!("{dev_name}.CH0.Waveform"));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use serde_json::json;

    struct StubCompiler;
    impl CircuitCompiler for StubCompiler {
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

    #[test]
    fn set_get_pseudo_ops_bypass_the_external_compiler() {
        let reg = Registry::new();
        reg.update("dev", json!({})).unwrap();
        let snap = reg.snapshot(Some(1));
        let mut ctx = initialize(snap, "baqis");
        let circuit = Circuit {
            ops: vec![
                CircuitOp::Set { path: "Q0.setting.LO".into(), value: Value::Number(5.0e9), unit: "Hz".into() },
                CircuitOp::Gate { name: "Measure".into(), targets: vec!["Q0".into()] },
            ],
        };
        let mut acc = BTreeMap::new();
        let datamap = compile(0, &mut acc, &circuit, &mut ctx, &StubCompiler, &CompileOpts::default()).unwrap();
        let main = &acc["main"];
        assert!(main.iter().any(|(ctype, target, _, _)| *ctype == CType::Write && target == "Q0.setting.LO"));
        assert!(main.iter().any(|(ctype, target, _, _)| *ctype == CType::Read && target == "Q0.acquire.TraceIQ"));
        assert_eq!(datamap.channel_to_signal.get("Q0.acquire.TraceIQ"), Some(&"iq".to_string()));
    }
}
