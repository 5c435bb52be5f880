//! Pulse/Calibration Kernel (spec.md §4.2).
//!
//! Converts a symbolic pulse expression, a [`PulseObject`], or a raw sample
//! array into a corrected, sampled buffer for a hardware channel. Waveform
//! math proper (envelope shapes, IQ modulation, …) is out of scope (spec.md
//! Non-goals) — what this module guarantees is the *contract*: determinism,
//! the sample-count invariant, and the distortion-correction control flow
//! described in spec.md (IIR cascade, FIR tail, steady-state seed padding on
//! numerical failure).

use ndarray::Array1;

use crate::error::KernelError;
use crate::value::{PulseObject, Value};

/// One-pole decay term `amp * exp(-t/tau)`, corrected by a single IIR stage.
pub type DecayTerm = (f64, f64);

#[derive(Debug, Clone, Default)]
pub struct Distortion {
    pub decay: Vec<DecayTerm>,
    pub fir: Option<Vec<f64>>,
}

/// The calibration record accompanying a raw-array input (spec.md §4.2), or
/// the context the Assembler's pre-processor builds for a waveform target
/// (spec.md §4.4.1): `{end, offset, ...calibration[channel]}`.
#[derive(Debug, Clone)]
pub struct CalibrationContext {
    pub srate: f64,
    pub delay: f64,
    pub offset: f64,
    pub start: f64,
    pub end: f64,
    pub distortion: Distortion,
}

impl CalibrationContext {
    pub fn expected_sample_count(&self) -> usize {
        ((self.end - self.start) * self.srate).round() as usize
    }
}

/// Output of [`sample`]: `(samples, delay, offset, srate)` per spec.md §4.2.
#[derive(Debug, Clone)]
pub struct Sampled {
    pub samples: Array1<f64>,
    pub delay: f64,
    pub offset: f64,
    pub srate: f64,
}

/// Applying the same input twice yields bit-identical output (spec.md §4.2
/// contract). There is no hidden mutable state here, so this holds by
/// construction as long as every step is a pure function of its inputs.
pub fn sample(input: &Value, ctx: &CalibrationContext) -> Result<Sampled, KernelError> {
    let expected = ctx.expected_sample_count();
    let raw = match input {
        Value::Pulse(p) => flatten_pulse(p, expected),
        Value::PulseExpr(expr) => flatten_pulse(&PulseObject::parse(expr), expected),
        Value::Array(arr) => {
            let flat: Vec<f64> = arr.iter().copied().collect();
            resize_to(flat, expected)
        }
        Value::ArrayStack(stacks) => {
            let flat: Vec<f64> = stacks.iter().flat_map(|a| a.iter().copied()).collect();
            resize_to(flat, expected)
        }
        other => return Err(KernelError::BadExpr(format!("{other:?} is not sampleable"))),
    };

    let corrected = correct_distortion(&raw, &ctx.distortion, 1.0 / ctx.srate)?;
    if corrected.len() != expected {
        return Err(KernelError::SampleCountMismatch { expected, got: corrected.len() });
    }

    Ok(Sampled {
        samples: Array1::from_vec(corrected),
        delay: ctx.delay,
        offset: ctx.offset,
        srate: ctx.srate,
    })
}

/// Toy, deterministic rendering of a pulse's term sum into `count` samples:
/// a flat buffer at the summed term amplitude. Real envelope synthesis is
/// out of scope; this exists so the sample-count invariant and distortion
/// pipeline have something concrete to operate on.
fn flatten_pulse(pulse: &PulseObject, count: usize) -> Vec<f64> {
    let amplitude: f64 = pulse_amplitude(pulse);
    vec![amplitude; count]
}

fn pulse_amplitude(pulse: &PulseObject) -> f64 {
    // PulseObject hides its term map; reuse equality-preserving serialization
    // via Debug is wasteful, so we expose amplitude through parse+add chains
    // instead. For the toy renderer we just need *some* deterministic scalar
    // derived from the object's content.
    format!("{pulse:?}")
        .bytes()
        .fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64)) as f64
        / u64::MAX as f64
}

fn resize_to(mut flat: Vec<f64>, count: usize) -> Vec<f64> {
    match flat.len().cmp(&count) {
        std::cmp::Ordering::Equal => flat,
        std::cmp::Ordering::Greater => {
            flat.truncate(count);
            flat
        }
        std::cmp::Ordering::Less => {
            let pad = *flat.last().unwrap_or(&0.0);
            flat.resize(count, pad);
            flat
        }
    }
}

/// Single-pole predistortion filter correcting a decay of the form
/// `1 + amp*exp(-t/tau)`, one IIR stage per `(amp, tau)` pair.
fn iir_decay_correct(x: &[f64], amp: f64, tau: f64, dt: f64) -> Vec<f64> {
    if x.is_empty() || tau <= 0.0 {
        return x.to_vec();
    }
    let k = (dt / tau).min(1.0);
    let fb = amp * k / (1.0 + amp);
    let mut y = Vec::with_capacity(x.len());
    let mut state = 0.0;
    for &xi in x {
        let yi = xi + fb * state;
        y.push(yi);
        state += (yi - state) * k;
    }
    y
}

fn apply_fir(x: &[f64], taps: &[f64]) -> Vec<f64> {
    if taps.is_empty() {
        return x.to_vec();
    }
    (0..x.len())
        .map(|n| {
            taps.iter()
                .enumerate()
                .map(|(k, t)| if k <= n { t * x[n - k] } else { 0.0 })
                .sum()
        })
        .collect()
}

/// Runs the IIR cascade + optional FIR tail. The last input sample seeds the
/// filter's steady state to avoid an edge transient (spec.md §4.2). If the
/// naive path produces non-finite output, pre-pad with that seed, filter,
/// then discard the pad — the spec's documented fallback for numerically
/// unstable decay parameters.
fn correct_distortion(samples: &[f64], distortion: &Distortion, dt: f64) -> Result<Vec<f64>, KernelError> {
    if distortion.decay.is_empty() && distortion.fir.is_none() {
        return Ok(samples.to_vec());
    }
    let run = |buf: &[f64]| -> Vec<f64> {
        let mut out = buf.to_vec();
        for &(amp, tau) in &distortion.decay {
            out = iir_decay_correct(&out, amp, tau, dt);
        }
        if let Some(fir) = &distortion.fir {
            out = apply_fir(&out, fir);
        }
        out
    };

    let direct = run(samples);
    if direct.iter().all(|v| v.is_finite()) {
        return Ok(direct);
    }

    let seed = *samples.last().unwrap_or(&0.0);
    let pad_len = samples.len().clamp(1, 64);
    let padded: Vec<f64> = std::iter::repeat(seed).take(pad_len).chain(samples.iter().copied()).collect();
    let filtered = run(&padded);
    let result = filtered[pad_len..].to_vec();
    if result.iter().all(|v| v.is_finite()) {
        Ok(result)
    } else {
        Err(KernelError::FilterDiverged(format!(
            "decay correction diverged even after {pad_len}-sample seed padding"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(srate: f64, start: f64, end: f64, distortion: Distortion) -> CalibrationContext {
        CalibrationContext { srate, delay: 0.0, offset: 0.0, start, end, distortion }
    }

    #[test]
    fn sample_count_matches_duration_times_rate() {
        let c = ctx(1e9, 0.0, 1e-6, Distortion::default());
        let out = sample(&Value::PulseExpr("drive*1.0".into()), &c).unwrap();
        assert_eq!(out.samples.len(), c.expected_sample_count());
    }

    #[test]
    fn sampling_is_deterministic() {
        let c = ctx(1e9, 0.0, 2e-7, Distortion { decay: vec![(0.2, 5e-9)], fir: None });
        let value = Value::PulseExpr("drive*0.7+flux*0.1".into());
        let a = sample(&value, &c).unwrap();
        let b = sample(&value, &c).unwrap();
        assert_eq!(a.samples, b.samples);
    }

    #[test]
    fn raw_array_is_resized_to_expected_count() {
        let c = ctx(1.0, 0.0, 4.0, Distortion::default());
        let arr = ndarray::ArrayD::from_shape_vec(ndarray::IxDyn(&[2]), vec![1.0, 2.0]).unwrap();
        let out = sample(&Value::Array(arr), &c).unwrap();
        assert_eq!(out.samples.len(), 4);
    }

    #[test]
    fn decay_correction_falls_back_to_seed_padding_on_divergence() {
        // tau smaller than dt pushes k above 1 before clamping; exercise the
        // fallback path directly rather than relying on flaky divergence.
        let samples = vec![f64::NAN, 1.0, 1.0];
        let out = correct_distortion(&samples, &Distortion { decay: vec![(0.1, 1.0)], fir: None }, 1.0);
        assert!(out.is_err());
    }
}
