//! Shared-memory data handoff (spec.md §4.4.1, §9).
//!
//! Large array values can be moved to a named segment and replaced with a
//! `(SharedMemory, name, shape, dtype)` descriptor instead of being copied
//! inline into the instruction stream. Real shared memory is a physical-
//! device/OS concern (spec.md Non-goals); what's implemented here is the
//! refcount protocol the design notes call for: the producer increments on
//! put, consumers decrement on release, and the last decrement unlinks the
//! segment.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ndarray::ArrayD;
use parking_lot::Mutex;

use crate::value::CommandHandle;

struct Segment {
    data: ArrayD<f64>,
    dtype: &'static str,
    refcount: AtomicUsize,
}

/// Threshold above which an array value is moved out of line (spec.md
/// §4.4.1 "large array values"). Arbitrary but fixed so behavior is
/// deterministic across runs.
pub const LARGE_ARRAY_THRESHOLD: usize = 4096;

#[derive(Default)]
pub struct SharedMemoryTable {
    segments: Mutex<HashMap<String, Arc<Segment>>>,
    next_id: AtomicUsize,
}

impl SharedMemoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Producer puts an array, gets back a descriptor with refcount 1.
    pub fn put(&self, array: ArrayD<f64>) -> CommandHandle {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let name = format!("qcore-shm-{id}");
        let shape = array.shape().to_vec();
        let segment = Arc::new(Segment { data: array, dtype: "f64", refcount: AtomicUsize::new(1) });
        self.segments.lock().insert(name.clone(), segment);
        CommandHandle { name, shape, dtype: "f64".to_string() }
    }

    /// A consumer takes a reference, bumping the refcount.
    pub fn acquire(&self, name: &str) -> Option<ArrayD<f64>> {
        let segments = self.segments.lock();
        let seg = segments.get(name)?;
        seg.refcount.fetch_add(1, Ordering::SeqCst);
        Some(seg.data.clone())
    }

    /// A consumer releases its reference; the last release unlinks the
    /// segment from the table.
    pub fn release(&self, name: &str) {
        let mut segments = self.segments.lock();
        let Some(seg) = segments.get(name) else { return };
        if seg.refcount.fetch_sub(1, Ordering::SeqCst) == 1 {
            segments.remove(name);
        }
    }

    pub fn len(&self) -> usize {
        self.segments.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
