//! A stand-in for the external gate-to-pulse circuit compiler (spec.md §1,
//! §4.3 `CircuitCompiler`). The real compiler library is an external
//! collaborator consumed only through the trait boundary; this
//! implementation accepts circuits that carry no true gate operations (only
//! `SET`/`GET` pseudo-ops, which the Compiler Adapter already strips out
//! before calling into this trait) and otherwise reports a
//! [`CompileError`], so `qcored` is runnable end-to-end against registry-only
//! circuits without vendoring a real compiler.

use std::collections::BTreeMap;

use qcore::compiler::{CType, CircuitCompiler, CompileOpts, Context, DataMap};
use qcore::error::CompileError;
use qcore::value::Value;

pub struct NullCompiler;

impl CircuitCompiler for NullCompiler {
    fn qcompile(
        &self,
        gates: &[(String, Vec<String>)],
        _ctx: &Context,
        _opts: &CompileOpts,
    ) -> Result<(BTreeMap<String, Vec<(CType, String, Value, String)>>, DataMap), CompileError> {
        if gates.is_empty() {
            return Ok((BTreeMap::new(), DataMap::default()));
        }
        Err(CompileError::IllFormed(format!(
            "no circuit compiler configured; cannot compile gate op `{}`",
            gates[0].0
        )))
    }
}
