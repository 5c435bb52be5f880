//! Driver Multiplexer (spec.md §4.5) and the Driver contract (spec.md §6).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;

use crate::assembler::{AssembledCommand, CType};
use crate::error::DriverError;
use crate::kernel::{self, Sampled};
use crate::value::Value;

/// A quantity descriptor (spec.md §6): name, default, channel-scope, unit.
#[derive(Debug, Clone)]
pub struct QuantDescriptor {
    pub name: String,
    pub default: Option<Value>,
    pub channel_scoped: bool,
    pub unit: String,
}

/// The Driver contract (spec.md §6): `open`, `close`, `read`, `write`, plus
/// `CHs`/`quants`/`srate` class attributes. Implementors are local
/// (in-process) drivers; remote drivers are distinguished by
/// [`DriverKind::Remote`] and proxied over RPC instead of implementing this
/// trait directly.
pub trait Driver: Send {
    fn open(&mut self) -> Result<(), DriverError>;
    fn close(&mut self) -> Result<(), DriverError>;
    fn read(&mut self, quantity: &str, channel: Option<u32>) -> Result<Value, DriverError>;
    fn write(&mut self, quantity: &str, value: Value, channel: Option<u32>) -> Result<(), DriverError>;
    fn channels(&self) -> &[u32];
    fn quants(&self) -> &[QuantDescriptor];
    fn srate(&self) -> Option<f64>;

    /// Retry policy for READ (spec.md §9 Open Question c): "no retry unless
    /// the driver opts in".
    fn supports_read_retry(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverKind {
    Local,
    Remote,
}

struct Entry {
    kind: DriverKind,
    driver: Arc<AsyncMutex<dyn Driver>>,
}

/// Maximum number of retries for a transient I/O error (spec.md §4.5, §7).
pub const MAX_TRANSIENT_RETRIES: u32 = 3;

/// One logical driver per device address, identified by alias. Enforces
/// per-device serialization (exactly one concurrent caller per alias) via
/// the per-entry async mutex.
#[derive(Default)]
pub struct DriverMultiplexer {
    drivers: HashMap<String, Entry>,
}

impl DriverMultiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, alias: impl Into<String>, kind: DriverKind, driver: Arc<AsyncMutex<dyn Driver>>) {
        self.drivers.insert(alias.into(), Entry { kind, driver });
    }

    pub fn kind_of(&self, alias: &str) -> Option<DriverKind> {
        self.drivers.get(alias).map(|e| e.kind)
    }

    /// Dispatches one assembled command: realises any still-symbolic
    /// waveform via the Kernel against the stamped `srate`/calibration
    /// context, then calls `write` or `read`; `WAIT` sleeps for the given
    /// seconds (spec.md §4.5).
    pub async fn dispatch(&self, hw_target: &str, cmd: &AssembledCommand) -> Result<Option<Value>, DriverError> {
        if matches!(cmd.ctype, CType::Wait) {
            let secs = match &cmd.value {
                Value::Number(n) => *n,
                _ => 0.0,
            };
            tokio::time::sleep(Duration::from_secs_f64(secs.max(0.0))).await;
            return Ok(None);
        }

        let (alias, quantity, channel) = split_hw_target(hw_target)?;
        let entry = self.drivers.get(alias).ok_or_else(|| DriverError::NoSuchDriver(alias.to_string()))?;

        let value = if cmd.value.is_waveform_like() {
            if let Some(calib) = &cmd.calibration {
                let sampled = kernel::sample(&cmd.value, calib).map_err(|e| DriverError::Logical { alias: alias.to_string(), reason: e.to_string() })?;
                sampled_to_value(&sampled)
            } else {
                cmd.value.clone()
            }
        } else {
            cmd.value.clone()
        };

        match cmd.ctype {
            CType::Write => {
                self.with_retry(alias, entry, false, |driver| driver.write(quantity, value.clone(), channel)).await?;
                Ok(None)
            }
            CType::Read => {
                let retryable = entry.driver.lock().await.supports_read_retry();
                let result = self.with_retry(alias, entry, retryable, |driver| driver.read(quantity, channel)).await?;
                Ok(Some(result))
            }
            CType::Wait => unreachable!(),
        }
    }

    async fn with_retry<T>(
        &self,
        alias: &str,
        entry: &Entry,
        retry_transient: bool,
        mut op: impl FnMut(&mut dyn Driver) -> Result<T, DriverError>,
    ) -> Result<T, DriverError> {
        let mut attempts = 0;
        loop {
            let mut guard = entry.driver.lock().await;
            match op(&mut *guard) {
                Ok(v) => return Ok(v),
                Err(DriverError::Transient { .. }) if retry_transient && attempts < MAX_TRANSIENT_RETRIES => {
                    attempts += 1;
                    drop(guard);
                    log::warn!("transient driver error on `{alias}`, retry {attempts}/{MAX_TRANSIENT_RETRIES}");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn split_hw_target(hw_target: &str) -> Result<(&str, &str, Option<u32>), DriverError> {
    let mut parts = hw_target.splitn(3, '.');
    let alias = parts.next().ok_or_else(|| DriverError::NoSuchDriver(hw_target.to_string()))?;
    let chan_part = parts.next().unwrap_or("");
    let quantity = parts.next().unwrap_or(chan_part);
    let channel = chan_part.trim_start_matches(|c: char| !c.is_ascii_digit()).parse::<u32>().ok();
    Ok((alias, quantity, channel))
}

fn sampled_to_value(sampled: &Sampled) -> Value {
    Value::Array(ndarray::ArrayD::from_shape_vec(ndarray::IxDyn(&[sampled.samples.len()]), sampled.samples.to_vec()).unwrap())
}

/// A minimal in-memory driver used throughout the test suite, grounded in
/// the `SimulatorDevice` shape from the pack's quantum device abstraction
/// example: it records writes and returns canned reads.
pub struct MockDriver {
    pub channels: Vec<u32>,
    pub quants: Vec<QuantDescriptor>,
    pub srate: Option<f64>,
    pub writes: Vec<(String, Value, Option<u32>)>,
    pub canned_reads: HashMap<String, Value>,
    pub opened: bool,
}

impl MockDriver {
    pub fn new(srate: Option<f64>) -> Self {
        MockDriver { channels: vec![0, 1], quants: Vec::new(), srate, writes: Vec::new(), canned_reads: HashMap::new(), opened: false }
    }
}

impl Driver for MockDriver {
    fn open(&mut self) -> Result<(), DriverError> {
        self.opened = true;
        Ok(())
    }
    fn close(&mut self) -> Result<(), DriverError> {
        self.opened = false;
        Ok(())
    }
    fn read(&mut self, quantity: &str, _channel: Option<u32>) -> Result<Value, DriverError> {
        Ok(self.canned_reads.get(quantity).cloned().unwrap_or(Value::Number(0.0)))
    }
    fn write(&mut self, quantity: &str, value: Value, channel: Option<u32>) -> Result<(), DriverError> {
        self.writes.push((quantity.to_string(), value, channel));
        Ok(())
    }
    fn channels(&self) -> &[u32] {
        &self.channels
    }
    fn quants(&self) -> &[QuantDescriptor] {
        &self.quants
    }
    fn srate(&self) -> Option<f64> {
        self.srate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{CalibrationContext, Distortion};

    #[tokio::test]
    async fn write_dispatches_to_the_right_alias() {
        let mut mux = DriverMultiplexer::new();
        let driver = Arc::new(AsyncMutex::new(MockDriver::new(Some(1e9))));
        mux.register("AWG", DriverKind::Local, driver.clone());

        let cmd = AssembledCommand {
            ctype: CType::Write,
            value: Value::Number(5.0e9),
            unit: "Hz".into(),
            sid: 0,
            origin: "Q0.setting.LO".into(),
            srate: None,
            calibration: None,
        };
        mux.dispatch("AWG.CH1.Frequency", &cmd).await.unwrap();
        let guard = driver.lock().await;
        assert_eq!(guard.writes.len(), 1);
        assert_eq!(guard.writes[0].0, "Frequency");
    }

    #[tokio::test]
    async fn wait_sleeps_and_returns_nothing() {
        let mux = DriverMultiplexer::new();
        let cmd = AssembledCommand { ctype: CType::Wait, value: Value::Number(0.0), unit: "s".into(), sid: 0, origin: "".into(), srate: None, calibration: None };
        let out = mux.dispatch("anything", &cmd).await.unwrap();
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn waveform_writes_are_realised_through_the_kernel() {
        let mut mux = DriverMultiplexer::new();
        let driver = Arc::new(AsyncMutex::new(MockDriver::new(Some(1e9))));
        mux.register("AWG", DriverKind::Local, driver.clone());
        let calib = CalibrationContext { srate: 1e9, delay: 0.0, offset: 0.0, start: 0.0, end: 1e-8, distortion: Distortion::default() };
        let cmd = AssembledCommand {
            ctype: CType::Write,
            value: Value::PulseExpr("drive*1.0".into()),
            unit: "au".into(),
            sid: 0,
            origin: "Q0.waveform.Z".into(),
            srate: Some(1e9),
            calibration: Some(calib),
        };
        mux.dispatch("AWG.CH1.Waveform", &cmd).await.unwrap();
        let guard = driver.lock().await;
        match &guard.writes[0].1 {
            Value::Array(arr) => assert_eq!(arr.len(), 10),
            other => panic!("expected realised samples, got {other:?}"),
        }
    }
}
