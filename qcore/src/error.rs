//! Error taxonomy for the core pipeline (spec.md §7).
//!
//! Each component gets its own `thiserror` enum; [`CoreError`] aggregates them
//! so the task runtime can classify a failure without downcasting.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no value at path `{0}`")]
    Miss(String),
    #[error("path `{0}` does not resolve to an object while auto-creating")]
    NotAnObject(String),
}

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("pulse expression `{0}` failed to parse")]
    BadExpr(String),
    #[error("sample count mismatch: expected {expected}, got {got}")]
    SampleCountMismatch { expected: usize, got: usize },
    #[error("distortion filter failed numerically: {0}")]
    FilterDiverged(String),
}

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("circuit ill-formed for current snapshot: {0}")]
    IllFormed(String),
}

#[derive(Debug, Error)]
pub enum AssembleError {
    #[error("target `{0}` did not resolve to a hardware channel")]
    TargetUnmapped(String),
    #[error("{0}")]
    Kernel(#[from] KernelError),
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("transient I/O error on `{alias}`: {source}")]
    Transient {
        alias: String,
        #[source]
        source: std::io::Error,
    },
    #[error("logical error on `{alias}`: {reason}")]
    Logical { alias: String, reason: String },
    #[error("no driver registered for alias `{0}`")]
    NoSuchDriver(String),
}

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("compiler error before step 0: {0}")]
    Compile(#[from] CompileError),
    #[error("assembler error at step {sid}: {source}")]
    Assemble { sid: usize, source: AssembleError },
    #[error("driver error at step {sid}: {source}")]
    Driver { sid: usize, source: DriverError },
    #[error("task-level or step-level deadline exceeded at step {sid}")]
    Timeout { sid: usize },
    #[error("task was cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("{0}")]
    Registry(#[from] RegistryError),
    #[error("{0}")]
    Kernel(#[from] KernelError),
    #[error("{0}")]
    Compile(#[from] CompileError),
    #[error("{0}")]
    Assemble(#[from] AssembleError),
    #[error("{0}")]
    Driver(#[from] DriverError),
    #[error("{0}")]
    Task(#[from] TaskError),
    #[error("{0}")]
    Wire(#[from] crate::wire::WireError),
}
