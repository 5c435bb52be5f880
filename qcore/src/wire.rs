//! Task-description wire format (spec.md §6) and its decoding into a
//! [`TaskSpec`](crate::task::TaskSpec).
//!
//! The submitted object is `meta {name, priority, other {shots, signal,
//! align_right, fillzero, waveform_length, shape}} | body {step, init, post,
//! cirq, rule, loop}`. `step`/`init`/`post` use the instruction wire format
//! (`{step-name: [(ctype, target, value, unit), ...]}`); `cirq` is a flat
//! list of gate/pseudo-op tuples; `loop` is an ordered map of axis-name to
//! `(path, values, unit)` entries; `rule` is a list of `⟨path⟩ = expr`
//! strings (spec.md §3 "dependency rules").

use std::time::Duration;

use serde_json::Value as Json;
use thiserror::Error;

use crate::assembler::{CType, RawCommand};
use crate::compiler::{Circuit, CircuitOp};
use crate::task::{SweepAxis, TaskSpec};
use crate::value::Value;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("field `{0}` has the wrong shape: {1}")]
    BadShape(&'static str, String),
    #[error("unknown ctype `{0}`")]
    UnknownCType(String),
    #[error("unknown circuit op `{0}`")]
    UnknownOp(String),
}

fn field<'a>(obj: &'a Json, name: &'static str) -> Result<&'a Json, WireError> {
    obj.get(name).ok_or(WireError::MissingField(name))
}

fn parse_ctype(s: &str) -> Result<CType, WireError> {
    match s {
        "WRITE" => Ok(CType::Write),
        "READ" => Ok(CType::Read),
        "WAIT" => Ok(CType::Wait),
        other => Err(WireError::UnknownCType(other.to_string())),
    }
}

/// Decodes one instruction-wire-format map: `{step-name: [[ctype, target,
/// value, unit], ...]}` (spec.md §6).
fn parse_instruction_map(json: &Json) -> Result<std::collections::BTreeMap<String, Vec<RawCommand>>, WireError> {
    let obj = json.as_object().ok_or_else(|| WireError::BadShape("step/init/post", "expected an object".into()))?;
    let mut out = std::collections::BTreeMap::new();
    for (step_name, cmds) in obj {
        let cmds = cmds.as_array().ok_or_else(|| WireError::BadShape("step/init/post", format!("`{step_name}` is not an array")))?;
        let mut parsed = Vec::with_capacity(cmds.len());
        for cmd in cmds {
            let tuple = cmd.as_array().ok_or_else(|| WireError::BadShape("step/init/post", "expected a 4-tuple".into()))?;
            let ctype = tuple.first().and_then(|v| v.as_str()).ok_or_else(|| WireError::BadShape("step/init/post", "missing ctype".into()))?;
            let target = tuple.get(1).and_then(|v| v.as_str()).unwrap_or_default().to_string();
            let value = tuple.get(2).map(Value::from_json).unwrap_or(Value::Number(0.0));
            let unit = tuple.get(3).and_then(|v| v.as_str()).unwrap_or("au").to_string();
            parsed.push((parse_ctype(ctype)?, target, value, unit));
        }
        out.insert(step_name.clone(), parsed);
    }
    Ok(out)
}

/// Decodes `body.cirq`: a flat list of `["GateName", ["Q0", "Q1"]]` gate
/// tuples, or `["SET", "path", value, "unit"]` / `["GET", "path", "unit"]`
/// pseudo-ops (spec.md §4.3 "embedded SET/GET pseudo-ops").
fn parse_circuit(json: &Json) -> Result<Circuit, WireError> {
    let ops_json = json.as_array().ok_or_else(|| WireError::BadShape("cirq", "expected an array".into()))?;
    let mut ops = Vec::with_capacity(ops_json.len());
    for op in ops_json {
        let tuple = op.as_array().ok_or_else(|| WireError::BadShape("cirq", "expected an op tuple".into()))?;
        let head = tuple.first().and_then(|v| v.as_str()).ok_or_else(|| WireError::BadShape("cirq", "missing op name".into()))?;
        let op = match head {
            "SET" => CircuitOp::Set {
                path: tuple.get(1).and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                value: tuple.get(2).map(Value::from_json).unwrap_or(Value::Number(0.0)),
                unit: tuple.get(3).and_then(|v| v.as_str()).unwrap_or("au").to_string(),
            },
            "GET" => CircuitOp::Get {
                path: tuple.get(1).and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                unit: tuple.get(2).and_then(|v| v.as_str()).unwrap_or("au").to_string(),
            },
            name => {
                let targets = tuple
                    .get(1)
                    .and_then(|v| v.as_array())
                    .map(|arr| arr.iter().filter_map(|v| v.as_str()).map(str::to_string).collect())
                    .unwrap_or_default();
                CircuitOp::Gate { name: name.to_string(), targets }
            }
        };
        ops.push(op);
    }
    Ok(Circuit { ops })
}

/// Decodes `body.loop`: an ordered map of axis-name to `[path, values,
/// unit]` entries sharing one length (spec.md §3 "SweepAxis").
fn parse_axes(json: &Json) -> Result<Vec<SweepAxis>, WireError> {
    let obj = json.as_object().ok_or_else(|| WireError::BadShape("loop", "expected an object".into()))?;
    let mut axes = Vec::with_capacity(obj.len());
    for (name, entries_json) in obj {
        let entries_json = entries_json.as_array().ok_or_else(|| WireError::BadShape("loop", format!("axis `{name}` is not an array")))?;
        let mut entries = Vec::with_capacity(entries_json.len());
        for entry in entries_json {
            let tuple = entry.as_array().ok_or_else(|| WireError::BadShape("loop", "expected a (path, values, unit) triple".into()))?;
            let path = tuple.first().and_then(|v| v.as_str()).unwrap_or_default().to_string();
            let values = tuple.get(1).and_then(|v| v.as_array()).cloned().unwrap_or_default();
            let unit = tuple.get(2).and_then(|v| v.as_str()).unwrap_or("au").to_string();
            entries.push((path, values, unit));
        }
        axes.push(SweepAxis { name: name.clone(), entries });
    }
    Ok(axes)
}

/// Decodes a submitted task description (spec.md §6) into a [`TaskSpec`].
/// `owner` and `backend` are supplied by the caller (session/admission
/// context), not carried in the wire object itself.
pub fn parse_task_spec(owner: impl Into<String>, arch: impl Into<String>, json: &Json) -> Result<TaskSpec, WireError> {
    let meta = field(json, "meta")?;
    let body = field(json, "body")?;
    let other = meta.get("other").cloned().unwrap_or(Json::Null);

    let name = meta.get("name").and_then(|v| v.as_str()).unwrap_or("unnamed").to_string();
    let priority = meta.get("priority").and_then(|v| v.as_i64()).unwrap_or(0);
    let shots = other.get("shots").and_then(|v| v.as_u64()).unwrap_or(1024) as u32;
    let signal = other.get("signal").and_then(|v| v.as_str()).unwrap_or("iq").to_string();
    let align_right = other.get("align_right").and_then(|v| v.as_bool()).unwrap_or(false);
    let fillzero = other.get("fillzero").and_then(|v| v.as_bool()).unwrap_or(true);
    let timeout = other.get("timeout").and_then(|v| v.as_f64()).map(Duration::from_secs_f64);
    let step_timeout = other.get("step_timeout").and_then(|v| v.as_f64()).map(Duration::from_secs_f64);

    let circuit = body.get("cirq").map(parse_circuit).transpose()?.unwrap_or_default();
    let axes = body.get("loop").map(parse_axes).transpose()?.unwrap_or_default();
    let init = body.get("init").map(parse_instruction_map).transpose()?.unwrap_or_default();
    let post = body.get("post").map(parse_instruction_map).transpose()?.unwrap_or_default();
    let rules = body
        .get("rule")
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_str()).map(str::to_string).collect())
        .unwrap_or_default();

    Ok(TaskSpec {
        name,
        owner: owner.into(),
        priority,
        circuit,
        axes,
        init,
        post,
        rules,
        shots,
        signal,
        align_right,
        fillzero,
        timeout,
        step_timeout,
        arch: arch.into(),
    })
}
