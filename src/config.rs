//! Crate topology configuration: the populated `CrateConfig`/`ModuleConfig`
//! objects the facade's `import_config`/`export_config` operate on
//! (spec.md §4.9, §6).
//!
//! JSON (de)serialization uses `serde`/`serde_json`, grounded in the
//! teacher repo's sibling `eva-daemon` crate. The legacy fixed-order text
//! format has no serde precedent anywhere in the pack, so it gets a small
//! hand-rolled parser in the teacher's manual-parsing idiom (`Firmware::parse`
//! in `firmware.rs`, itself ported from `drive/boot.rs`'s line-oriented
//! config reads).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{ApiError, ErrorCode};

/// Crates never exceed this many modules (spec.md §6).
pub const SYS_MAX_NUM_MODULES: usize = 24;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DspPaths {
    pub ldr: String,
    pub par: String,
    pub var: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FpgaPaths {
    pub sys: String,
    pub fippi: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirmwareInfo {
    pub version: String,
    pub revision: u32,
    pub adc_msps: u32,
    pub adc_bits: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleConfig {
    pub slot: u32,
    pub dsp: DspPaths,
    pub fpga: FpgaPaths,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fw: Option<FirmwareInfo>,
}

/// Top-level JSON array of [`ModuleConfig`] (spec.md §6); `#[serde(transparent)]`
/// so the wire format is the bare array, not `{"modules": [...]}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CrateConfig {
    pub modules: Vec<ModuleConfig>,
}

impl CrateConfig {
    /// Array size 0 or > `SYS_MAX_NUM_MODULES` fails `config_invalid_param`.
    pub fn validate(&self) -> Result<(), ApiError> {
        if self.modules.is_empty() || self.modules.len() > SYS_MAX_NUM_MODULES {
            return Err(ApiError::new(
                ErrorCode::ConfigInvalidParam,
                format!("module count {} outside 1..={}", self.modules.len(), SYS_MAX_NUM_MODULES),
            ));
        }
        Ok(())
    }

    /// Malformed JSON syntax fails `config_parse_failure`; a well-formed
    /// document missing a required field fails `config_invalid_param`
    /// (spec.md §6).
    pub fn from_json(text: &str) -> Result<Self, ApiError> {
        let cfg: Self = serde_json::from_str(text).map_err(|e| {
            let code = if matches!(e.classify(), serde_json::error::Category::Data) {
                ErrorCode::ConfigInvalidParam
            } else {
                ErrorCode::ConfigParseFailure
            };
            ApiError::new(code, e.to_string())
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn to_json(&self) -> Result<String, ApiError> {
        serde_json::to_string_pretty(self).map_err(|e| ApiError::new(ErrorCode::ConfigParseFailure, e.to_string()))
    }
}

/// Legacy single-line-per-crate shared-firmware format (spec.md §6):
/// whitespace-separated `num_modules slot[0..n-1] ComFPGA SPFPGA Trig
/// DSPcode DSPpar DSPvar`, one firmware set shared by every module.
#[derive(Debug, Clone)]
pub struct LegacyCrateConfig {
    pub slots: Vec<u32>,
    pub com_fpga: String,
    pub sp_fpga: String,
    pub trig: String,
    pub dsp_code: String,
    pub dsp_par: String,
    pub dsp_var: String,
}

impl LegacyCrateConfig {
    pub fn parse(line: &str) -> Result<Self, ApiError> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.is_empty() {
            return Err(ApiError::new(ErrorCode::ConfigParseFailure, "empty legacy configuration line"));
        }
        let num_modules: usize = fields[0]
            .parse()
            .map_err(|_| ApiError::new(ErrorCode::ConfigParseFailure, format!("bad num_modules {:?}", fields[0])))?;
        let expected = 1 + num_modules + 6;
        if fields.len() != expected {
            return Err(ApiError::new(
                ErrorCode::ConfigParseFailure,
                format!("expected {} fields for {} modules, got {}", expected, num_modules, fields.len()),
            ));
        }
        let slots: Vec<u32> = fields[1..1 + num_modules]
            .iter()
            .map(|s| s.parse::<u32>().map_err(|_| ApiError::new(ErrorCode::ConfigParseFailure, format!("bad slot {:?}", s))))
            .collect::<Result<_, _>>()?;
        let rest = &fields[1 + num_modules..];
        Ok(Self {
            slots,
            com_fpga: rest[0].to_string(),
            sp_fpga: rest[1].to_string(),
            trig: rest[2].to_string(),
            dsp_code: rest[3].to_string(),
            dsp_par: rest[4].to_string(),
            dsp_var: rest[5].to_string(),
        })
    }

    pub fn to_line(&self) -> String {
        let mut fields = vec![self.slots.len().to_string()];
        fields.extend(self.slots.iter().map(u32::to_string));
        fields.push(self.com_fpga.clone());
        fields.push(self.sp_fpga.clone());
        fields.push(self.trig.clone());
        fields.push(self.dsp_code.clone());
        fields.push(self.dsp_par.clone());
        fields.push(self.dsp_var.clone());
        fields.join(" ")
    }
}

/// Parameter-state snapshot: per-module, per-channel parameter values,
/// the actual payload of `import_config`/`export_config` (spec.md §4.9).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParameterState {
    pub module_params: HashMap<usize, HashMap<String, f64>>,
    pub channel_params: HashMap<usize, HashMap<usize, HashMap<String, f64>>>,
}

impl ParameterState {
    pub fn to_json(&self) -> Result<String, ApiError> {
        serde_json::to_string_pretty(self).map_err(|e| ApiError::new(ErrorCode::ConfigParseFailure, e.to_string()))
    }

    pub fn from_json(text: &str) -> Result<Self, ApiError> {
        serde_json::from_str(text).map_err(|e| ApiError::new(ErrorCode::ConfigParseFailure, e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CrateConfig {
        CrateConfig {
            modules: vec![ModuleConfig {
                slot: 2,
                dsp: DspPaths { ldr: "p16dsp.ldr".into(), par: "default.par".into(), var: "p16dsp.var".into() },
                fpga: FpgaPaths { sys: "syspixie.bin".into(), fippi: "fippixie.bin".into() },
                fw: Some(FirmwareInfo { version: "1.0".into(), revision: 1000, adc_msps: 100, adc_bits: 14 }),
            }],
        }
    }

    #[test]
    fn json_round_trip() {
        let cfg = sample();
        let text = cfg.to_json().unwrap();
        let back = CrateConfig::from_json(&text).unwrap();
        assert_eq!(back.modules[0].slot, 2);
        assert_eq!(back.modules[0].dsp.ldr, "p16dsp.ldr");
    }

    #[test]
    fn json_is_a_bare_top_level_array() {
        let cfg = sample();
        let text = cfg.to_json().unwrap();
        assert!(text.trim_start().starts_with('['));
    }

    #[test]
    fn empty_array_is_invalid() {
        let err = CrateConfig::from_json("[]").unwrap_err();
        assert_eq!(err.code, ErrorCode::ConfigInvalidParam);
    }

    #[test]
    fn oversized_array_is_invalid() {
        let one = serde_json::to_string(&sample().modules[0]).unwrap();
        let many = format!("[{}]", vec![one; SYS_MAX_NUM_MODULES + 1].join(","));
        let err = CrateConfig::from_json(&many).unwrap_err();
        assert_eq!(err.code, ErrorCode::ConfigInvalidParam);
    }

    #[test]
    fn missing_required_field_is_invalid_param() {
        let err = CrateConfig::from_json(r#"[{"slot":2}]"#).unwrap_err();
        assert_eq!(err.code, ErrorCode::ConfigInvalidParam);
    }

    #[test]
    fn legacy_text_round_trip() {
        let legacy = LegacyCrateConfig {
            slots: vec![2, 3],
            com_fpga: "syscom.bin".into(),
            sp_fpga: "fippi.bin".into(),
            trig: "trig.bin".into(),
            dsp_code: "p16dsp.ldr".into(),
            dsp_par: "default.par".into(),
            dsp_var: "p16dsp.var".into(),
        };
        let line = legacy.to_line();
        let back = LegacyCrateConfig::parse(&line).unwrap();
        assert_eq!(back.slots, vec![2, 3]);
        assert_eq!(back.dsp_var, "p16dsp.var");
    }

    #[test]
    fn legacy_text_rejects_wrong_field_count() {
        let err = LegacyCrateConfig::parse("2 1000 42").unwrap_err();
        assert_eq!(err.code, ErrorCode::ConfigParseFailure);
    }

    #[test]
    fn parameter_state_json_round_trip() {
        let mut state = ParameterState::default();
        let mut chan0 = HashMap::new();
        chan0.insert("TRIGGER_THRESHOLD".to_string(), 500.0);
        let mut channels = HashMap::new();
        channels.insert(0usize, chan0);
        state.channel_params.insert(0, channels);

        let text = state.to_json().unwrap();
        let back = ParameterState::from_json(&text).unwrap();
        assert_eq!(back.channel_params[&0][&0]["TRIGGER_THRESHOLD"], 500.0);
    }
}
