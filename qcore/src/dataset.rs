//! Per-signal result arrays (spec.md §3 "Dataset").

use std::collections::BTreeMap;

/// A single named signal's accumulated data: appended point-by-point during
/// the run, reshaped once at the end (spec.md §4.6 "Reshape contract").
#[derive(Debug, Clone, Default)]
pub struct SignalBuffer {
    /// Flat, append-only storage: one `point_len` chunk per completed step.
    flat: Vec<f64>,
    pub point_shape: Vec<usize>,
}

impl SignalBuffer {
    pub fn new(point_shape: Vec<usize>) -> Self {
        SignalBuffer { flat: Vec::new(), point_shape }
    }

    fn point_len(&self) -> usize {
        self.point_shape.iter().product::<usize>().max(1)
    }

    pub fn push_point(&mut self, values: &[f64]) {
        debug_assert_eq!(values.len(), self.point_len());
        self.flat.extend_from_slice(values);
    }

    pub fn points_len(&self) -> usize {
        self.flat.len() / self.point_len()
    }

    /// Reshapes the flat append log into `(*axis_lengths, ...point_shape)`.
    /// Points beyond the last completed step are zero-filled (spec.md §4.6).
    pub fn reshape(&self, axis_lengths: &[usize]) -> (Vec<usize>, Vec<f64>) {
        let total_points: usize = axis_lengths.iter().product();
        let point_len = self.point_len();
        let mut out = vec![0.0; total_points * point_len];
        let completed = self.flat.len().min(out.len());
        out[..completed].copy_from_slice(&self.flat[..completed]);
        let mut shape = axis_lengths.to_vec();
        shape.extend_from_slice(&self.point_shape);
        (shape, out)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Dataset {
    pub signals: BTreeMap<String, SignalBuffer>,
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal_mut(&mut self, name: &str, point_shape: &[usize]) -> &mut SignalBuffer {
        self.signals.entry(name.to_string()).or_insert_with(|| SignalBuffer::new(point_shape.to_vec()))
    }
}
