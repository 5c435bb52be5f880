//! Tagged value model (spec.md §9, "Dynamic-typed value cells").
//!
//! The Python prototype lets any command value be a Python object: a number,
//! a numpy array, a pulse expression string, a `Waveform`/`WaveVStack`
//! object, or a shared-memory handle. Here that becomes one tagged enum the
//! Assembler and Kernel dispatch on explicitly.

use ndarray::ArrayD;
use serde_json::Value as Json;
use std::collections::BTreeMap;

/// One term of a pulse algebra expression: a named envelope applied with a
/// given amplitude. Waveform math itself (the actual envelope shapes) is out
/// of scope (spec.md Non-goals); what matters here is that two pulse objects
/// combine by merging terms and compare equal irrespective of their
/// start/stop window, which is what the bypass cache and instruction cache
/// invariants (spec.md §8, invariant 2) depend on.
#[derive(Debug, Clone, PartialEq)]
pub struct PulseObject {
    pub start: f64,
    pub end: f64,
    /// term label -> summed amplitude
    terms: BTreeMap<String, f64>,
}

impl PulseObject {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end, terms: BTreeMap::new() }
    }

    pub fn with_term(mut self, label: impl Into<String>, amp: f64) -> Self {
        *self.terms.entry(label.into()).or_insert(0.0) += amp;
        self
    }

    /// Symbolic expression parse, grounded in `original_source`'s
    /// `Pulse.fromstr`. The grammar here is deliberately tiny: a
    /// `label*amp+label*amp+...` sum, enough to exercise pulse algebra
    /// without implementing real waveform math.
    pub fn parse(expr: &str) -> Self {
        let mut obj = PulseObject::new(0.0, 1.0);
        for term in expr.split('+') {
            let term = term.trim();
            if term.is_empty() {
                continue;
            }
            if let Some((label, amp)) = term.split_once('*') {
                let amp: f64 = amp.trim().parse().unwrap_or(1.0);
                obj = obj.with_term(label.trim(), amp);
            } else {
                obj = obj.with_term(term, 1.0);
            }
        }
        obj
    }

    /// Pulse algebra addition: merge terms, keep the widest window.
    pub fn add(&self, other: &PulseObject) -> PulseObject {
        let mut terms = self.terms.clone();
        for (label, amp) in &other.terms {
            *terms.entry(label.clone()).or_insert(0.0) += amp;
        }
        PulseObject { start: self.start.min(other.start), end: self.end.max(other.end), terms }
    }

    /// Equality used by the bypass cache / instruction cache (spec.md §4.2):
    /// "waveform objects are compared after multiplication by a fixed window
    /// to strip out start/stop metadata". Concretely: compare the term sums,
    /// ignore `start`/`end`.
    pub fn equal_ignoring_window(&self, other: &PulseObject) -> bool {
        self.terms == other.terms
    }

    pub fn sample_count(&self, srate: f64) -> usize {
        ((self.end - self.start) * srate).round() as usize
    }
}

impl std::ops::Add for PulseObject {
    type Output = PulseObject;
    fn add(self, rhs: PulseObject) -> PulseObject {
        PulseObject::add(&self, &rhs)
    }
}

/// A handle to an out-of-band (e.g. shared-memory) data segment, substituted
/// for a large array value when shared-memory handoff is enabled
/// (spec.md §4.4.1).
#[derive(Debug, Clone, PartialEq)]
pub struct CommandHandle {
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: String,
}

/// The value carried by one command. See spec.md §9.
#[derive(Debug, Clone)]
pub enum Value {
    Number(f64),
    Array(ArrayD<f64>),
    /// A vstack of raw sample arrays to be concatenated at sample time.
    /// Per spec.md §4.2, vstacks are always unequal to force fresh sampling.
    ArrayStack(Vec<ArrayD<f64>>),
    PulseExpr(String),
    Pulse(PulseObject),
    Command(CommandHandle),
    Text(String),
}

impl Value {
    /// The Kernel's equality predicate (spec.md §4.2), used by the bypass
    /// cache (spec.md §4.4.1) and by round-trip property R2.
    pub fn equal(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::ArrayStack(_), _) | (_, Value::ArrayStack(_)) => false,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Pulse(a), Value::Pulse(b)) => a.equal_ignoring_window(b),
            (Value::PulseExpr(a), Value::PulseExpr(b)) => {
                PulseObject::parse(a).equal_ignoring_window(&PulseObject::parse(b))
            }
            (Value::Pulse(a), Value::PulseExpr(b)) | (Value::PulseExpr(b), Value::Pulse(a)) => {
                a.equal_ignoring_window(&PulseObject::parse(b))
            }
            (Value::Command(a), Value::Command(b)) => a == b,
            _ => false,
        }
    }

    pub fn as_pulse(&self) -> Option<PulseObject> {
        match self {
            Value::Pulse(p) => Some(p.clone()),
            Value::PulseExpr(s) => Some(PulseObject::parse(s)),
            _ => None,
        }
    }

    pub fn is_waveform_like(&self) -> bool {
        matches!(self, Value::Pulse(_) | Value::PulseExpr(_) | Value::ArrayStack(_) | Value::Array(_))
    }

    /// Decodes one wire-format command value (spec.md §6): a bare number, a
    /// string (treated as a symbolic pulse expression if it looks like one,
    /// a plain text value otherwise), or a flat JSON array of numbers (a raw
    /// sample array). Used by the task-description parser (`wire` module) to
    /// turn a submitted task's JSON body into [`Value`]s.
    pub fn from_json(json: &Json) -> Value {
        match json {
            Json::Number(n) => Value::Number(n.as_f64().unwrap_or(0.0)),
            Json::String(s) => {
                if s.contains('*') || s.contains('+') {
                    Value::PulseExpr(s.clone())
                } else {
                    Value::Text(s.clone())
                }
            }
            Json::Array(items) => {
                let flat: Vec<f64> = items.iter().filter_map(|v| v.as_f64()).collect();
                Value::Array(ArrayD::from_shape_vec(ndarray::IxDyn(&[flat.len()]), flat).unwrap())
            }
            Json::Bool(b) => Value::Number(if *b { 1.0 } else { 0.0 }),
            _ => Value::Text(String::new()),
        }
    }

    /// Inverse of a subset of [`Value::from_json`], sufficient for values the
    /// Registry can hold (numbers and text); waveform/array values are
    /// never themselves written back into the Registry (spec.md §4.4 step
    /// 1 only ever sends scalar `update` commands).
    pub fn to_json(&self) -> Option<Json> {
        match self {
            Value::Number(n) => serde_json::Number::from_f64(*n).map(Json::Number),
            Value::Text(s) => Some(Json::String(s.clone())),
            _ => None,
        }
    }
}
