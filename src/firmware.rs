//! Firmware images and the per-revision registry (spec.md §3, §4.2).
//!
//! Loading (`dma::load_firmware`'s magic/size validation in the teacher)
//! is generalized here from one fixed NPU image to the four device kinds
//! a Pixie-16 module boots, each keyed by `(version, revision, device)`.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;

use log::info;

use crate::error::{ApiError, ErrorCode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    Sys,
    Fippi,
    Dsp,
    Var,
}

impl Device {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sys" => Some(Self::Sys),
            "fippi" => Some(Self::Fippi),
            "dsp" => Some(Self::Dsp),
            "var" => Some(Self::Var),
            _ => None,
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Sys => "sys",
            Self::Fippi => "fippi",
            Self::Dsp => "dsp",
            Self::Var => "var",
        };
        write!(f, "{}", s)
    }
}

/// Firmware descriptor. Two descriptors are equal iff their triple matches
/// (filename and bytes are site-specific metadata, per spec.md §3).
#[derive(Debug, Clone)]
pub struct Firmware {
    pub version: String,
    pub revision: u32,
    pub device: Device,
    pub filename: String,
    /// Slots this image may load into; empty = default/generic.
    pub slots: Vec<u32>,
    image: Option<Vec<u8>>,
}

impl PartialEq for Firmware {
    fn eq(&self, other: &Self) -> bool {
        self.version == other.version && self.revision == other.revision && self.device == other.device
    }
}
impl Eq for Firmware {}

impl Firmware {
    pub fn new(version: impl Into<String>, revision: u32, device: Device, filename: impl Into<String>) -> Self {
        Self { version: version.into(), revision, device, filename: filename.into(), slots: Vec::new(), image: None }
    }

    pub fn with_slots(mut self, slots: Vec<u32>) -> Self {
        self.slots = slots;
        self
    }

    /// Strict parser for `version<d>rev<d>device<d>filename`, `d` one of
    /// `:`, `,`, or whitespace (spec.md §4.2, §6).
    pub fn parse(line: &str, delimiter: char) -> Result<Self, FirmwareError> {
        let fields: Vec<&str> = if delimiter.is_whitespace() {
            line.split_whitespace().collect()
        } else {
            line.split(delimiter).map(str::trim).collect()
        };
        if fields.len() < 4 {
            return Err(FirmwareError::MalformedLine(line.to_string()));
        }
        let version = fields[0].to_string();
        let revision: u32 = fields[1].parse().map_err(|_| FirmwareError::BadInteger(fields[1].to_string()))?;
        let device = Device::parse(fields[2]).ok_or_else(|| FirmwareError::UnknownDevice(fields[2].to_string()))?;
        let filename = fields[3].to_string();
        Ok(Self::new(version, revision, device, filename))
    }

    /// Read the file into the byte buffer, lazily. Idempotent.
    pub fn load(&mut self) -> Result<(), FirmwareError> {
        if self.image.is_some() {
            return Ok(());
        }
        let bytes = fs::read(&self.filename).map_err(|e| FirmwareError::Io(self.filename.clone(), e.to_string()))?;
        info!("loaded {} firmware from {} ({} bytes)", self.device, self.filename, bytes.len());
        self.image = Some(bytes);
        Ok(())
    }

    /// Release the buffer; the triple remains (spec.md §4.2).
    pub fn clear(&mut self) {
        self.image = None;
    }

    pub fn image(&self) -> Option<&[u8]> {
        self.image.as_deref()
    }

    pub fn is_loaded(&self) -> bool {
        self.image.is_some()
    }
}

#[derive(Debug)]
pub enum FirmwareError {
    MalformedLine(String),
    BadInteger(String),
    UnknownDevice(String),
    Io(String, String),
    AlreadyExists,
    NotFound { revision: u32, device: Device, slot: u32 },
}

impl fmt::Display for FirmwareError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedLine(l) => write!(f, "malformed firmware spec line: {:?}", l),
            Self::BadInteger(s) => write!(f, "expected integer, got {:?}", s),
            Self::UnknownDevice(s) => write!(f, "unknown firmware device tag {:?}", s),
            Self::Io(path, e) => write!(f, "failed to read firmware file {}: {}", path, e),
            Self::AlreadyExists => write!(f, "firmware with this (version, revision, device) triple already registered"),
            Self::NotFound { revision, device, slot } => {
                write!(f, "no firmware for revision {} device {} slot {}", revision, device, slot)
            }
        }
    }
}
impl std::error::Error for FirmwareError {}

impl From<FirmwareError> for ApiError {
    fn from(e: FirmwareError) -> Self {
        let code = match &e {
            FirmwareError::AlreadyExists => ErrorCode::ModuleInvalidFirmware,
            FirmwareError::NotFound { .. } => ErrorCode::FileNotFound,
            FirmwareError::Io(..) => ErrorCode::FileReadFailure,
            _ => ErrorCode::ConfigParseFailure,
        };
        ApiError::new(code, e.to_string())
    }
}

/// Crate-level registry: revision -> ordered firmware references.
/// Read-mostly; writers must be single-threaded before any boot begins
/// (spec.md §4.2, §5).
#[derive(Default)]
pub struct FirmwareRegistry {
    by_revision: HashMap<u32, Vec<Firmware>>,
}

impl FirmwareRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails if an equal-triple firmware already exists (spec.md §4.2, I-1).
    pub fn add(&mut self, fw: Firmware) -> Result<(), FirmwareError> {
        let entries = self.by_revision.entry(fw.revision).or_default();
        if entries.iter().any(|e| *e == fw) {
            return Err(FirmwareError::AlreadyExists);
        }
        entries.push(fw);
        Ok(())
    }

    pub fn check(&self, fw: &Firmware) -> bool {
        self.by_revision.get(&fw.revision).map(|v| v.iter().any(|e| e == fw)).unwrap_or(false)
    }

    pub fn revisions(&self) -> impl Iterator<Item = &u32> {
        self.by_revision.keys()
    }

    /// Prefer a slot-specific match over a default (empty slot list),
    /// else `file_not_found` (spec.md §4.2).
    pub fn find(&self, revision: u32, device: Device, slot: u32) -> Result<&Firmware, FirmwareError> {
        let entries = self
            .by_revision
            .get(&revision)
            .ok_or(FirmwareError::NotFound { revision, device, slot })?;
        entries
            .iter()
            .filter(|e| e.device == device)
            .find(|e| e.slots.contains(&slot))
            .or_else(|| entries.iter().filter(|e| e.device == device).find(|e| e.slots.is_empty()))
            .ok_or(FirmwareError::NotFound { revision, device, slot })
    }
}

/// Same lookup as [`FirmwareRegistry::find`], but scoped to the firmware
/// already bound to one module (spec.md §4.2's `find(module_firmwares, ...)`).
pub fn find_in<'a>(module_firmwares: &'a [Firmware], device: Device, slot: u32) -> Result<&'a Firmware, FirmwareError> {
    module_firmwares
        .iter()
        .filter(|e| e.device == device)
        .find(|e| e.slots.contains(&slot))
        .or_else(|| module_firmwares.iter().filter(|e| e.device == device).find(|e| e.slots.is_empty()))
        .ok_or(FirmwareError::NotFound { revision: 0, device, slot })
}

pub fn parse_spec_string(line: &str) -> Result<Firmware, FirmwareError> {
    for delim in [':', ','] {
        if line.contains(delim) {
            return Firmware::parse(line, delim);
        }
    }
    Firmware::parse(line, ' ')
}

pub fn firmware_path_exists(path: &str) -> bool {
    Path::new(path).exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_colon_delimited() {
        let fw = parse_spec_string("1.0:1000:dsp:p16dsp.ldr").unwrap();
        assert_eq!(fw.version, "1.0");
        assert_eq!(fw.revision, 1000);
        assert_eq!(fw.device, Device::Dsp);
        assert_eq!(fw.filename, "p16dsp.ldr");
    }

    #[test]
    fn parse_rejects_missing_fields() {
        assert!(Firmware::parse("1.0:1000:dsp", ':').is_err());
        assert!(Firmware::parse("1.0:abc:dsp:x.ldr", ':').is_err());
    }

    #[test]
    fn add_twice_fails() {
        let mut reg = FirmwareRegistry::new();
        let fw = Firmware::new("1.0", 1000, Device::Dsp, "a.ldr");
        reg.add(fw.clone()).unwrap();
        assert!(reg.check(&fw));
        assert!(matches!(reg.add(fw), Err(FirmwareError::AlreadyExists)));
    }

    #[test]
    fn find_prefers_slot_specific() {
        let mut reg = FirmwareRegistry::new();
        reg.add(Firmware::new("1.0", 1000, Device::Sys, "default.bin")).unwrap();
        reg.add(Firmware::new("1.0", 1000, Device::Sys, "slot2.bin").with_slots(vec![2])).unwrap();

        let found = reg.find(1000, Device::Sys, 2).unwrap();
        assert_eq!(found.filename, "slot2.bin");
        let found = reg.find(1000, Device::Sys, 5).unwrap();
        assert_eq!(found.filename, "default.bin");
    }

    #[test]
    fn find_missing_revision_fails() {
        let reg = FirmwareRegistry::new();
        assert!(reg.find(9999, Device::Dsp, 0).is_err());
    }
}
