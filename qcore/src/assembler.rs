//! Assembler (spec.md §4.4) and its pre-processor / BypassCache (§4.4.1).

use std::collections::BTreeMap;

use serde_json::Value as Json;

use crate::error::AssembleError;
use crate::kernel::{CalibrationContext, Distortion};
use crate::registry::Registry;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CType {
    Read,
    Write,
    Wait,
}

/// One raw `(ctype, target, value, unit)` tuple as produced by the Compiler
/// Adapter, before resolution to a hardware channel.
pub type RawCommand = (CType, String, Value, String);

/// `{step-name -> target -> (ctype, value, unit, kwds)}` after channel
/// resolution and merging (spec.md §3 "Instruction").
pub type AssembledInstruction = BTreeMap<String, BTreeMap<String, AssembledCommand>>;

#[derive(Debug, Clone)]
pub struct AssembledCommand {
    pub ctype: CType,
    pub value: Value,
    pub unit: String,
    pub sid: usize,
    /// The logical target this command was resolved from, kept for review
    /// tooling and the bypass cache's `origin` field (spec.md §3).
    pub origin: String,
    pub srate: Option<f64>,
    pub calibration: Option<CalibrationContext>,
}

/// Per-task cache eliding redundant hardware writes between steps
/// (spec.md §3, §4.4.1). Owned by the task worker — never shared.
#[derive(Default)]
pub struct BypassCache {
    last: BTreeMap<String, (Value, String)>,
}

impl BypassCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.last.clear();
    }

    /// Returns `true` if this write should be dropped (value unchanged since
    /// the last write to this hardware channel), recording the new value
    /// either way per spec.md §4.4.1 ("record `(value, origin)` in
    /// BypassCache" happens regardless of the outcome described there — the
    /// source always updates the cache on a fresh comparison).
    pub fn check_and_record(&mut self, hw_target: &str, value: &Value, origin: &str, write_sensitive_suffixes: &[&str]) -> bool {
        let sensitive = write_sensitive_suffixes.iter().any(|s| hw_target.ends_with(s));
        if sensitive {
            if let Some((prev, _)) = self.last.get(hw_target) {
                if prev.equal(value) {
                    return true;
                }
            }
        }
        self.last.insert(hw_target.to_string(), (value.clone(), origin.to_string()));
        false
    }
}

/// The legacy `logical-suffix -> hardware-suffix` mapping table, carried
/// over verbatim from `original_source/quark/runtime/assembler.py::MAPPING`
/// (spec.md §4.4 step 3 names the mechanism; the concrete table is a
/// supplement grounded in the Python prototype).
pub fn legacy_mapping() -> BTreeMap<&'static str, &'static str> {
    BTreeMap::from([
        ("setting_LO", "LO.Frequency"),
        ("setting_POW", "LO.Power"),
        ("setting_OFFSET", "ZBIAS.Offset"),
        ("waveform_RF_I", "I.Waveform"),
        ("waveform_RF_Q", "Q.Waveform"),
        ("waveform_TRIG", "TRIG.Marker1"),
        ("waveform_DDS", "DDS.Waveform"),
        ("waveform_SW", "SW.Marker1"),
        ("waveform_Z", "Z.Waveform"),
        ("setting_PNT", "ADC.PointNumber"),
        ("setting_SHOT", "ADC.Shot"),
        ("setting_TRIGD", "ADC.TriggerDelay"),
    ])
}

/// Write-sensitive suffixes (spec.md §4.4.1), defaulted from
/// `original_source`'s `SUFFIX` constant.
pub const DEFAULT_WRITE_SENSITIVE_SUFFIXES: &[&str] = &["Waveform", "Shot"];

pub struct Assembler {
    /// Gate/opaque segments that are never physical channels, e.g. gate
    /// names appearing in the path (`Measure`, `R`, `Barrier`).
    pub opaque_segments: Vec<String>,
    pub mapping: BTreeMap<&'static str, &'static str>,
    pub write_sensitive_suffixes: Vec<&'static str>,
}

impl Default for Assembler {
    fn default() -> Self {
        Assembler {
            opaque_segments: vec!["Measure".into(), "R".into(), "Barrier".into()],
            mapping: legacy_mapping(),
            write_sensitive_suffixes: DEFAULT_WRITE_SENSITIVE_SUFFIXES.to_vec(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AssembleOpts {
    pub prep: bool,
    pub hold: bool,
}

impl Assembler {
    /// `iscmd(target)`: true unless the path contains one of the declared
    /// opaque segments (spec.md §4.4 step 2).
    pub fn iscmd(&self, target: &str) -> bool {
        !target.split('.').any(|seg| self.opaque_segments.iter().any(|o| o == seg))
    }

    fn resolve_channel(&self, registry: &Registry, target: &str) -> Result<Option<String>, AssembleError> {
        if target.contains("CH") {
            return Ok(Some(target.to_string()));
        }
        if !self.iscmd(target) {
            return Ok(None);
        }

        // Direct address lookup on the target's own context, if present.
        if let Some(addr) = registry.query(target, None).and_then(|v| v.get("address").cloned()).and_then(|v| v.as_str().map(str::to_string)) {
            return Ok(Some(addr));
        }

        // Legacy mapping table, consulted after substituting `.` for `_`.
        let Some((head, rest)) = target.split_once('.') else {
            return Err(AssembleError::TargetUnmapped(target.to_string()));
        };
        let mkey = rest.replace('.', "_");
        let Some(mapped) = self.mapping.get(mkey.as_str()) else {
            return Err(AssembleError::TargetUnmapped(target.to_string()));
        };
        let (chkey, quantity) = mapped.split_once('.').unwrap_or((mapped, ""));

        let context = registry.query(head, None).unwrap_or(Json::Null);
        let channel = context
            .get("channel")
            .and_then(|c| c.get(chkey))
            .and_then(|c| c.as_str());
        let Some(channel) = channel else {
            return Err(AssembleError::TargetUnmapped(target.to_string()));
        };

        // If the channel resolves to a marker bit, the quantity suffix is
        // omitted (spec.md §4.4 step 3).
        if channel.contains("Marker") || quantity.is_empty() {
            Ok(Some(channel.to_string()))
        } else {
            Ok(Some(format!("{channel}.{quantity}")))
        }
    }

    /// `assemble(sid, instruction, prep?, hold?)` (spec.md §4.4).
    pub fn assemble(
        &self,
        sid: usize,
        instruction: BTreeMap<String, Vec<RawCommand>>,
        registry: &Registry,
        bypass: &mut BypassCache,
        opts: AssembleOpts,
    ) -> Result<AssembledInstruction, AssembleError> {
        if sid == 0 {
            bypass.clear();
        }

        let mut out: AssembledInstruction = BTreeMap::new();
        for (step, ops) in instruction {
            if step.eq_ignore_ascii_case("update") {
                for (_, target, value, _) in ops {
                    if let Some(json) = value.to_json() {
                        let _ = registry.update(&target, json);
                    }
                }
                continue;
            }

            let mut scmd: BTreeMap<String, AssembledCommand> = BTreeMap::new();
            for (ctype, target, value, unit) in ops {
                let hw_target = match self.resolve_channel(registry, &target) {
                    Ok(Some(hw_target)) => hw_target,
                    Ok(None) => {
                        log::error!("target `{target}` did not resolve to a hardware channel; skipping");
                        continue;
                    }
                    Err(e) => {
                        log::error!("failed to resolve target `{target}`: {e}; skipping command");
                        continue;
                    }
                };

                let srate = if matches!(ctype, CType::Wait) {
                    None
                } else {
                    let parts: Vec<&str> = hw_target.split('.').collect();
                    if parts.len() != 3 {
                        log::error!("wrong address: {hw_target}");
                        None
                    } else {
                        let dev = parts[0];
                        let srate = registry.query(&format!("dev.{dev}.srate"), None).and_then(|v| v.as_f64());
                        if srate.is_none() {
                            log::error!("failed to get srate for device `{dev}` (target `{target}`)");
                        }
                        srate
                    }
                };

                let mut cmd = AssembledCommand {
                    ctype,
                    value,
                    unit,
                    sid,
                    origin: target.clone(),
                    srate,
                    calibration: None,
                };

                // Channel-merge rule: waveform writes to an already-occupied
                // channel are summed via pulse algebra; everything else
                // replaces (spec.md §4.4 step 5; Open Question (b) resolved
                // as "sum" in SPEC_FULL.md / DESIGN.md).
                if let Some(existing) = scmd.get(&hw_target) {
                    if hw_target.to_lowercase().contains("waveform") {
                        if let (Some(a), Some(b)) = (existing.value.as_pulse(), cmd.value.as_pulse()) {
                            cmd.value = crate::value::Value::Pulse(a.add(&b));
                        }
                    }
                }
                scmd.insert(hw_target, cmd);
            }
            out.insert(step, scmd);
        }

        if opts.prep {
            self.preprocess(sid, &mut out, registry, bypass);
        }
        let _ = opts.hold;
        Ok(out)
    }

    /// Pre-processor (spec.md §4.4.1): bypass cache filtering and
    /// calibration-context construction.
    fn preprocess(&self, sid: usize, instruction: &mut AssembledInstruction, registry: &Registry, bypass: &mut BypassCache) {
        if sid == 0 {
            bypass.clear();
        }
        for (_, channels) in instruction.iter_mut() {
            channels.retain(|hw_target, cmd| {
                if matches!(cmd.ctype, CType::Write) {
                    let dropped = bypass.check_and_record(hw_target, &cmd.value, &cmd.origin, &self.write_sensitive_suffixes);
                    if dropped {
                        return false;
                    }
                }

                if let Some(srate) = cmd.srate {
                    let head = cmd.origin.split('.').next().unwrap_or_default();
                    let context = registry.query(head, None).unwrap_or(Json::Null);
                    let end = context.get("waveform").and_then(|w| w.get("LEN")).and_then(|v| v.as_f64()).unwrap_or(1.0);
                    let offset = context.get("setting").and_then(|s| s.get("OFFSET")).and_then(|v| v.as_f64()).unwrap_or(0.0);
                    let channel = hw_target.rsplit_once('.').map(|(_, q)| q).unwrap_or(hw_target);
                    let decay = context
                        .get("calibration")
                        .and_then(|c| c.get(channel))
                        .and_then(|c| c.get("distortion"))
                        .and_then(|d| d.get("decay"))
                        .and_then(|d| d.as_array())
                        .map(|arr| {
                            arr.iter()
                                .filter_map(|pair| {
                                    let pair = pair.as_array()?;
                                    Some((pair.first()?.as_f64()?, pair.get(1)?.as_f64()?))
                                })
                                .collect::<Vec<_>>()
                        })
                        .unwrap_or_default();
                    cmd.calibration = Some(CalibrationContext {
                        srate,
                        delay: 0.0,
                        offset,
                        start: 0.0,
                        end,
                        distortion: Distortion { decay, fir: None },
                    });
                }
                true
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry_with_device() -> Registry {
        let reg = Registry::new();
        reg.update("dev.AWG.srate", json!(2.0e9)).unwrap();
        reg.update(
            "Q0",
            json!({
                "channel": {"Z": "AWG.CH1"},
                "waveform": {"LEN": 1e-6},
                "setting": {"OFFSET": 0.0},
                "calibration": {"CH1": {}},
            }),
        )
        .unwrap();
        reg
    }

    #[test]
    fn legacy_mapping_resolves_logical_to_hardware_channel() {
        let reg = registry_with_device();
        let asm = Assembler::default();
        let mut instruction = BTreeMap::new();
        instruction.insert(
            "main".to_string(),
            vec![(CType::Write, "Q0.waveform.Z".to_string(), Value::PulseExpr("drive*1.0".into()), "au".to_string())],
        );
        let mut bypass = BypassCache::new();
        let out = asm.assemble(0, instruction, &reg, &mut bypass, AssembleOpts { prep: true, hold: false }).unwrap();
        let main = &out["main"];
        assert!(main.contains_key("AWG.CH1.Waveform"));
    }

    #[test]
    fn bypass_cache_elides_repeated_identical_writes() {
        let reg = registry_with_device();
        let asm = Assembler::default();
        let mut bypass = BypassCache::new();

        let mut instr = || {
            let mut m = BTreeMap::new();
            m.insert(
                "main".to_string(),
                vec![(CType::Write, "Q0.waveform.Z".to_string(), Value::PulseExpr("drive*1.0".into()), "au".to_string())],
            );
            m
        };

        let first = asm.assemble(0, instr(), &reg, &mut bypass, AssembleOpts { prep: true, hold: false }).unwrap();
        assert_eq!(first["main"].len(), 1);
        for sid in 1..5 {
            let out = asm.assemble(sid, instr(), &reg, &mut bypass, AssembleOpts { prep: true, hold: false }).unwrap();
            assert_eq!(out["main"].len(), 0, "sid {sid} should have been elided by the bypass cache");
        }
    }

    #[test]
    fn channel_merge_sums_two_logical_targets_on_the_same_hardware_channel() {
        let reg = registry_with_device();
        reg.update("Q1.channel.Z", json!("AWG.CH1")).unwrap();
        let asm = Assembler::default();
        let mut bypass = BypassCache::new();
        let mut instruction = BTreeMap::new();
        instruction.insert(
            "main".to_string(),
            vec![
                (CType::Write, "Q0.waveform.Z".to_string(), Value::PulseExpr("x*1.0".into()), "au".to_string()),
                (CType::Write, "Q1.waveform.Z".to_string(), Value::PulseExpr("x*0.5".into()), "au".to_string()),
            ],
        );
        let out = asm.assemble(0, instruction, &reg, &mut bypass, AssembleOpts { prep: false, hold: false }).unwrap();
        let merged = &out["main"]["AWG.CH1.Waveform"];
        let pulse = merged.value.as_pulse().unwrap();
        assert!(pulse.equal_ignoring_window(&crate::value::PulseObject::parse("x*1.5")));
    }
}
