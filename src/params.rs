//! Parameter / variable model (spec.md §3, §4.3).
//!
//! Three closed namespaces (system, module, channel); each logical name has
//! a descriptor (enum tag, read/write mode, DSP word-count, enable flag,
//! printable name, and for variables a DSP address). Parameters are
//! user-facing and map deterministically to one or more variables through a
//! small conversion-function table (spec.md's "tagged variant table, not a
//! class hierarchy", spec.md §9).
//!
//! Register-map idiom (named offsets + a decode helper) is ported from
//! `drive/hw_mtl.rs`; this module generalizes it from one flat register
//! file to descriptors whose addresses come from a parsed DSP VAR stream.

use std::collections::HashMap;
use std::io::BufRead;

use crate::error::{ApiError, ErrorCode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RwMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

/// Properties of the owning module needed by parameter<->variable
/// conversion functions (ADC MSPS drives filter-range clock factors).
#[derive(Debug, Clone, Copy)]
pub struct ModuleProps {
    pub adc_bits: u32,
    pub adc_msps: u32,
    pub num_channels: usize,
}

// ================================================================
// Module variables
// ================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleVarTag {
    ModCsrA,
    ModCsrB,
    MaxEvents,
    SynchWait,
    InSynch,
    SlowFilterRange,
    FastFilterRange,
    HostRunTimePresetLo,
    HostRunTimePresetHi,
    RunTask,
    ControlTask,
}

pub const MODULE_VAR_TAGS: &[ModuleVarTag] = &[
    ModuleVarTag::ModCsrA,
    ModuleVarTag::ModCsrB,
    ModuleVarTag::MaxEvents,
    ModuleVarTag::SynchWait,
    ModuleVarTag::InSynch,
    ModuleVarTag::SlowFilterRange,
    ModuleVarTag::FastFilterRange,
    ModuleVarTag::HostRunTimePresetLo,
    ModuleVarTag::HostRunTimePresetHi,
    ModuleVarTag::RunTask,
    ModuleVarTag::ControlTask,
];

impl ModuleVarTag {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ModCsrA => "ModCSRA",
            Self::ModCsrB => "ModCSRB",
            Self::MaxEvents => "MaxEvents",
            Self::SynchWait => "SynchWait",
            Self::InSynch => "InSynch",
            Self::SlowFilterRange => "SlowFilterRange",
            Self::FastFilterRange => "FastFilterRange",
            Self::HostRunTimePresetLo => "HostRunTimePresetLo",
            Self::HostRunTimePresetHi => "HostRunTimePresetHi",
            Self::RunTask => "RunTask",
            Self::ControlTask => "ControlTask",
        }
    }

    pub fn rw_mode(&self) -> RwMode {
        match self {
            Self::InSynch => RwMode::ReadOnly,
            Self::RunTask | Self::ControlTask => RwMode::WriteOnly,
            _ => RwMode::ReadWrite,
        }
    }

    pub fn size(&self) -> usize {
        1
    }
}

pub fn lookup_module_var(label: &str) -> Result<ModuleVarTag, ApiError> {
    MODULE_VAR_TAGS
        .iter()
        .find(|t| t.name() == label)
        .copied()
        .ok_or_else(|| ApiError::new(ErrorCode::ModuleInvalidVar, format!("unknown module variable {:?}", label)))
}

// ================================================================
// Channel variables
// ================================================================

/// Copy-filter groups (spec.md §4.3's `copy_parameters` mask bits).
bitflags::bitflags! {
    pub struct CopyFilter: u32 {
        const ENERGY = 1 << 0;
        const TRIGGER = 1 << 1;
        const ANALOG_SIGNAL_CONDITIONING = 1 << 2;
        const HISTOGRAM_CONTROL = 1 << 3;
        const DECAY_TIME = 1 << 4;
        const PULSE_SHAPE = 1 << 5;
        const BASELINE_CONTROL = 1 << 6;
        const CHANNEL_CSRA = 1 << 7;
        const CFD_TRIGGER = 1 << 8;
        const TRIGGER_STRETCH = 1 << 9;
        const FIFO_DELAYS = 1 << 10;
        const MULTIPLICITY = 1 << 11;
        const QDC = 1 << 12;
        const ALL = (1 << 13) - 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelVarTag {
    SlowLength,
    SlowGap,
    FastThresh,
    FastLength,
    FastGap,
    VOffset,
    TraceDelay,
    Binn,
    EnergyLow,
    PreampTau,
    PulseShapeMode,
    BlCut,
    BaselinePercent,
    ChanCsrA,
    ChanCsrB,
    CfdThresh,
    CfdDelay,
    ExternDelayLen,
    FifoDelay,
    MultiplicityMaskL,
    MultiplicityMaskH,
    QdcLen0,
    QdcLen1,
    QdcLen2,
    QdcLen3,
    QdcLen4,
    QdcLen5,
    QdcLen6,
    QdcLen7,
}

pub const CHANNEL_VAR_TAGS: &[ChannelVarTag] = &[
    ChannelVarTag::SlowLength,
    ChannelVarTag::SlowGap,
    ChannelVarTag::FastThresh,
    ChannelVarTag::FastLength,
    ChannelVarTag::FastGap,
    ChannelVarTag::VOffset,
    ChannelVarTag::TraceDelay,
    ChannelVarTag::Binn,
    ChannelVarTag::EnergyLow,
    ChannelVarTag::PreampTau,
    ChannelVarTag::PulseShapeMode,
    ChannelVarTag::BlCut,
    ChannelVarTag::BaselinePercent,
    ChannelVarTag::ChanCsrA,
    ChannelVarTag::ChanCsrB,
    ChannelVarTag::CfdThresh,
    ChannelVarTag::CfdDelay,
    ChannelVarTag::ExternDelayLen,
    ChannelVarTag::FifoDelay,
    ChannelVarTag::MultiplicityMaskL,
    ChannelVarTag::MultiplicityMaskH,
    ChannelVarTag::QdcLen0,
    ChannelVarTag::QdcLen1,
    ChannelVarTag::QdcLen2,
    ChannelVarTag::QdcLen3,
    ChannelVarTag::QdcLen4,
    ChannelVarTag::QdcLen5,
    ChannelVarTag::QdcLen6,
    ChannelVarTag::QdcLen7,
];

impl ChannelVarTag {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SlowLength => "SlowLength",
            Self::SlowGap => "SlowGap",
            Self::FastThresh => "FastThresh",
            Self::FastLength => "FastLength",
            Self::FastGap => "FastGap",
            Self::VOffset => "VOffset",
            Self::TraceDelay => "TraceDelay",
            Self::Binn => "Binn",
            Self::EnergyLow => "EnergyLow",
            Self::PreampTau => "PreampTau",
            Self::PulseShapeMode => "PSM",
            Self::BlCut => "BLCut",
            Self::BaselinePercent => "BaselinePercent",
            Self::ChanCsrA => "ChanCSRa",
            Self::ChanCsrB => "ChanCSRb",
            Self::CfdThresh => "CFDThresh",
            Self::CfdDelay => "CFDDelay",
            Self::ExternDelayLen => "ExternDelayLen",
            Self::FifoDelay => "FIFODelay",
            Self::MultiplicityMaskL => "MultiplicityMaskL",
            Self::MultiplicityMaskH => "MultiplicityMaskH",
            Self::QdcLen0 => "QDCLen0",
            Self::QdcLen1 => "QDCLen1",
            Self::QdcLen2 => "QDCLen2",
            Self::QdcLen3 => "QDCLen3",
            Self::QdcLen4 => "QDCLen4",
            Self::QdcLen5 => "QDCLen5",
            Self::QdcLen6 => "QDCLen6",
            Self::QdcLen7 => "QDCLen7",
        }
    }

    pub fn group(&self) -> CopyFilter {
        match self {
            Self::SlowLength | Self::SlowGap | Self::EnergyLow => CopyFilter::ENERGY,
            Self::FastThresh => CopyFilter::TRIGGER,
            Self::FastLength | Self::FastGap | Self::ExternDelayLen => CopyFilter::TRIGGER_STRETCH,
            Self::VOffset | Self::TraceDelay => CopyFilter::ANALOG_SIGNAL_CONDITIONING,
            Self::Binn => CopyFilter::HISTOGRAM_CONTROL,
            Self::PreampTau => CopyFilter::DECAY_TIME,
            Self::PulseShapeMode => CopyFilter::PULSE_SHAPE,
            Self::BlCut | Self::BaselinePercent => CopyFilter::BASELINE_CONTROL,
            Self::ChanCsrA | Self::ChanCsrB => CopyFilter::CHANNEL_CSRA,
            Self::CfdThresh | Self::CfdDelay => CopyFilter::CFD_TRIGGER,
            Self::FifoDelay => CopyFilter::FIFO_DELAYS,
            Self::MultiplicityMaskL | Self::MultiplicityMaskH => CopyFilter::MULTIPLICITY,
            Self::QdcLen0
            | Self::QdcLen1
            | Self::QdcLen2
            | Self::QdcLen3
            | Self::QdcLen4
            | Self::QdcLen5
            | Self::QdcLen6
            | Self::QdcLen7 => CopyFilter::QDC,
        }
    }

    /// Word-mask preserving reserved bits on copy (spec.md §4.3). Only the
    /// CSRs reserve bits in this model; everything else is full-word.
    pub fn word_mask(&self) -> u32 {
        match self {
            Self::ChanCsrA | Self::ChanCsrB => 0x0000_FFFF,
            _ => 0xFFFF_FFFF,
        }
    }

    pub fn rw_mode(&self) -> RwMode {
        RwMode::ReadWrite
    }

    pub fn size(&self) -> usize {
        1
    }
}

pub fn lookup_channel_var(label: &str) -> Result<ChannelVarTag, ApiError> {
    CHANNEL_VAR_TAGS
        .iter()
        .find(|t| t.name() == label)
        .copied()
        .ok_or_else(|| ApiError::new(ErrorCode::ChannelInvalidVar, format!("unknown channel variable {:?}", label)))
}

// ================================================================
// Descriptors and the address map
// ================================================================

#[derive(Debug, Clone)]
pub struct VarDescriptor {
    pub rw_mode: RwMode,
    pub size: usize,
    pub enabled: bool,
    pub name: &'static str,
    pub address: Option<usize>,
}

/// Derived once per boot from the loaded variable descriptors (spec.md §3).
#[derive(Debug, Clone, Default)]
pub struct AddressMap {
    pub module_in: (usize, usize),
    pub module_out: (usize, usize),
    pub channels_in: (usize, usize),
    pub channels_out: (usize, usize),
    pub vars_per_channel: usize,
    pub num_channels: usize,
}

impl AddressMap {
    pub fn channel_base(&self, ch: usize) -> usize {
        self.channels_in.0 + ch * self.vars_per_channel
    }

    /// Invariant check (spec.md I-6): no overlap, uniform channel stride.
    pub fn validate(&self) -> Result<(), ApiError> {
        let ranges = [self.module_in, self.module_out, self.channels_in, self.channels_out];
        for i in 0..ranges.len() {
            for j in (i + 1)..ranges.len() {
                let (a0, a1) = ranges[i];
                let (b0, b1) = ranges[j];
                if a0 < b1 && b0 < a1 {
                    return Err(ApiError::new(ErrorCode::InternalFailure, "address map ranges overlap"));
                }
            }
        }
        for i in 0..self.num_channels.saturating_sub(1) {
            if self.channel_base(i + 1) - self.channel_base(i) != self.vars_per_channel {
                return Err(ApiError::new(ErrorCode::InternalFailure, "non-uniform channel stride"));
            }
        }
        Ok(())
    }
}

/// Parsed form of a DSP VAR file: one `name base_addr_hex` pair per line.
/// The VAR file is authoritative for addresses; names it omits get disabled
/// descriptors rather than a load failure (spec.md §4.3).
pub fn load_var_file<R: BufRead>(reader: R, num_channels: usize) -> Result<(HashMap<ModuleVarTag, VarDescriptor>, HashMap<ChannelVarTag, VarDescriptor>, AddressMap), ApiError> {
    let mut addrs: HashMap<String, usize> = HashMap::new();
    for line in reader.lines() {
        let line = line.map_err(|e| ApiError::new(ErrorCode::FileReadFailure, e.to_string()))?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.split_whitespace();
        let name = match parts.next() {
            Some(n) => n,
            None => continue,
        };
        let addr_str = match parts.next() {
            Some(a) => a,
            None => continue,
        };
        let addr = usize::from_str_radix(addr_str.trim_start_matches("0x"), 16)
            .map_err(|_| ApiError::new(ErrorCode::FileFormatInvalid, format!("bad hex address for {}: {}", name, addr_str)))?;
        addrs.insert(name.to_string(), addr);
    }

    let mut module_descs = HashMap::new();
    let mut min_mod = usize::MAX;
    let mut max_mod = 0usize;
    for tag in MODULE_VAR_TAGS {
        let addr = addrs.get(tag.name()).copied();
        let enabled = addr.is_some();
        if let Some(a) = addr {
            min_mod = min_mod.min(a);
            max_mod = max_mod.max(a + tag.size());
        }
        module_descs.insert(*tag, VarDescriptor { rw_mode: tag.rw_mode(), size: tag.size(), enabled, name: tag.name(), address: addr });
    }
    if min_mod == usize::MAX {
        min_mod = 0;
        max_mod = 0;
    }

    let mut channel_descs = HashMap::new();
    let mut min_ch = usize::MAX;
    let mut max_ch = 0usize;
    for tag in CHANNEL_VAR_TAGS {
        let addr = addrs.get(tag.name()).copied();
        let enabled = addr.is_some();
        if let Some(a) = addr {
            min_ch = min_ch.min(a);
            max_ch = max_ch.max(a + tag.size());
        }
        channel_descs.insert(*tag, VarDescriptor { rw_mode: tag.rw_mode(), size: tag.size(), enabled, name: tag.name(), address: addr });
    }
    let vars_per_channel = if min_ch == usize::MAX { 0 } else { max_ch - min_ch };
    if min_ch == usize::MAX {
        min_ch = 0;
        max_ch = 0;
    }

    let channels_end = min_ch + vars_per_channel * num_channels.max(1);
    let map = AddressMap {
        module_in: (min_mod, max_mod),
        module_out: (max_mod, max_mod),
        channels_in: (min_ch, channels_end),
        channels_out: (channels_end, channels_end),
        vars_per_channel,
        num_channels,
    };
    map.validate()?;

    Ok((module_descs, channel_descs, map))
}

// ================================================================
// Value store: dirty-tracked word cells (spec.md §3 "variable value cell")
// ================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct Cell {
    pub value: u32,
    pub dirty: bool,
}

#[derive(Debug, Default)]
pub struct ValueStore {
    pub module: HashMap<ModuleVarTag, Vec<Cell>>,
    /// channel -> (var -> cells)
    pub channels: Vec<HashMap<ChannelVarTag, Vec<Cell>>>,
}

impl ValueStore {
    pub fn new(num_channels: usize) -> Self {
        let mut module = HashMap::new();
        for tag in MODULE_VAR_TAGS {
            module.insert(*tag, vec![Cell::default(); tag.size()]);
        }
        let mut channels = Vec::with_capacity(num_channels);
        for _ in 0..num_channels {
            let mut m = HashMap::new();
            for tag in CHANNEL_VAR_TAGS {
                m.insert(*tag, vec![Cell::default(); tag.size()]);
            }
            channels.push(m);
        }
        Self { module, channels }
    }

    pub fn write_module(&mut self, tag: ModuleVarTag, words: &[u32]) {
        let cells = self.module.entry(tag).or_insert_with(|| vec![Cell::default(); tag.size()]);
        for (c, w) in cells.iter_mut().zip(words.iter()) {
            c.value = *w;
            c.dirty = true;
        }
    }

    pub fn read_module(&self, tag: ModuleVarTag) -> Vec<u32> {
        self.module.get(&tag).map(|c| c.iter().map(|x| x.value).collect()).unwrap_or_default()
    }

    pub fn write_channel(&mut self, ch: usize, tag: ChannelVarTag, words: &[u32]) {
        let cells = self.channels[ch].entry(tag).or_insert_with(|| vec![Cell::default(); tag.size()]);
        for (c, w) in cells.iter_mut().zip(words.iter()) {
            c.value = *w;
            c.dirty = true;
        }
    }

    pub fn read_channel(&self, ch: usize, tag: ChannelVarTag) -> Vec<u32> {
        self.channels[ch].get(&tag).map(|c| c.iter().map(|x| x.value).collect()).unwrap_or_default()
    }

    pub fn dirty_count(&self) -> usize {
        let m = self.module.values().flatten().filter(|c| c.dirty).count();
        let c: usize = self.channels.iter().map(|m| m.values().flatten().filter(|c| c.dirty).count()).sum();
        m + c
    }

    pub fn clear_all_dirty(&mut self) {
        for cells in self.module.values_mut() {
            cells.iter_mut().for_each(|c| c.dirty = false);
        }
        for ch in self.channels.iter_mut() {
            for cells in ch.values_mut() {
                cells.iter_mut().for_each(|c| c.dirty = false);
            }
        }
    }
}

/// `copy_parameters`: copies variables in `filter` from one channel's store
/// to another, honoring each variable's word-mask and leaving dirty flags
/// set for a later `sync_vars` flush (spec.md §4.3).
pub fn copy_parameters(filter: CopyFilter, src: &HashMap<ChannelVarTag, Vec<Cell>>, dst: &mut HashMap<ChannelVarTag, Vec<Cell>>) {
    for tag in CHANNEL_VAR_TAGS {
        if !filter.contains(tag.group()) {
            continue;
        }
        let mask = tag.word_mask();
        if let Some(src_cells) = src.get(tag) {
            let dst_cells = dst.entry(*tag).or_insert_with(|| vec![Cell::default(); tag.size()]);
            for (d, s) in dst_cells.iter_mut().zip(src_cells.iter()) {
                d.value = (d.value & !mask) | (s.value & mask);
                d.dirty = true;
            }
        }
    }
}

// ================================================================
// User-facing parameters
// ================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleParam {
    ModuleCsrA,
    MaxEvents,
    SynchWait,
    InSynch,
    SlowFilterRange,
    FastFilterRange,
    HostRtPreset,
}

pub const MODULE_PARAMS: &[ModuleParam] = &[
    ModuleParam::ModuleCsrA,
    ModuleParam::MaxEvents,
    ModuleParam::SynchWait,
    ModuleParam::InSynch,
    ModuleParam::SlowFilterRange,
    ModuleParam::FastFilterRange,
    ModuleParam::HostRtPreset,
];

impl ModuleParam {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ModuleCsrA => "MODULE_CSRA",
            Self::MaxEvents => "MAX_EVENTS",
            Self::SynchWait => "SYNCH_WAIT",
            Self::InSynch => "IN_SYNCH",
            Self::SlowFilterRange => "SLOW_FILTER_RANGE",
            Self::FastFilterRange => "FAST_FILTER_RANGE",
            Self::HostRtPreset => "HOST_RT_PRESET",
        }
    }

    /// Deterministic routing to the underlying variable(s) (spec.md §4.3
    /// `map_module_param`).
    pub fn variable(&self) -> ModuleVarTag {
        match self {
            Self::ModuleCsrA => ModuleVarTag::ModCsrA,
            Self::MaxEvents => ModuleVarTag::MaxEvents,
            Self::SynchWait => ModuleVarTag::SynchWait,
            Self::InSynch => ModuleVarTag::InSynch,
            Self::SlowFilterRange => ModuleVarTag::SlowFilterRange,
            Self::FastFilterRange => ModuleVarTag::FastFilterRange,
            Self::HostRtPreset => ModuleVarTag::HostRunTimePresetLo,
        }
    }

    pub fn is_multiword_time(&self) -> bool {
        matches!(self, Self::HostRtPreset)
    }

    /// Param -> DSP words. `HOST_RT_PRESET` spans two words (64-bit tick
    /// count at an assumed 1 GHz system clock) to exercise multi-word,
    /// atomic-from-the-host's-standpoint variable writes (spec.md §4.5).
    pub fn to_words(&self, value: f64) -> Result<Vec<u32>, ApiError> {
        match self {
            Self::HostRtPreset => {
                if value < 0.0 {
                    return Err(ApiError::new(ErrorCode::InvalidValue, "HOST_RT_PRESET must be non-negative"));
                }
                let ticks = (value * 1e9) as u64;
                Ok(vec![ticks as u32, (ticks >> 32) as u32])
            }
            Self::SynchWait | Self::InSynch => {
                let v = value as i64;
                if !(0..=1).contains(&v) {
                    return Err(ApiError::new(ErrorCode::InvalidValue, format!("{} must be 0 or 1", self.name())));
                }
                Ok(vec![v as u32])
            }
            _ => {
                let v = value as i64;
                if v < 0 || v > u32::MAX as i64 {
                    return Err(ApiError::new(ErrorCode::InvalidValue, format!("{} out of range", self.name())));
                }
                Ok(vec![v as u32])
            }
        }
    }

    pub fn from_words(&self, words: &[u32]) -> f64 {
        match self {
            Self::HostRtPreset => {
                let lo = *words.first().unwrap_or(&0) as u64;
                let hi = *words.get(1).unwrap_or(&0) as u64;
                ((hi << 32) | lo) as f64 / 1e9
            }
            _ => *words.first().unwrap_or(&0) as f64,
        }
    }
}

pub fn lookup_module_param(label: &str) -> Result<ModuleParam, ApiError> {
    MODULE_PARAMS
        .iter()
        .find(|p| p.name() == label)
        .copied()
        .ok_or_else(|| ApiError::new(ErrorCode::ModuleInvalidParam, format!("unknown module parameter {:?}", label)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelParam {
    TriggerThreshold,
    EnergyRisetime,
    EnergyFlattop,
    TriggerRisetime,
    TriggerFlattop,
    Tau,
    TraceDelay,
    Voffset,
    BlCut,
    BaselinePercent,
    ChannelCsrA,
    ChannelCsrB,
    CfdThreshold,
    CfdDelay,
    FifoDelay,
    MultiplicityMaskL,
    MultiplicityMaskH,
    BinFactor,
    EnergyLow,
    QdcLen(u8),
}

pub const CHANNEL_PARAM_NAMES: &[&str] = &[
    "TRIGGER_THRESHOLD",
    "ENERGY_RISETIME",
    "ENERGY_FLATTOP",
    "TRIGGER_RISETIME",
    "TRIGGER_FLATTOP",
    "TAU",
    "TRACE_DELAY",
    "VOFFSET",
    "BLCUT",
    "BASELINE_PERCENT",
    "CHANNEL_CSRA",
    "CHANNEL_CSRB",
    "CFD_THRESHOLD",
    "CFD_DELAY",
    "FIFO_DELAY",
    "MULTIPLICITY_MASKL",
    "MULTIPLICITY_MASKH",
    "BINFACTOR",
    "ENERGY_LOW",
];

impl ChannelParam {
    pub fn name(&self) -> String {
        match self {
            Self::TriggerThreshold => "TRIGGER_THRESHOLD".into(),
            Self::EnergyRisetime => "ENERGY_RISETIME".into(),
            Self::EnergyFlattop => "ENERGY_FLATTOP".into(),
            Self::TriggerRisetime => "TRIGGER_RISETIME".into(),
            Self::TriggerFlattop => "TRIGGER_FLATTOP".into(),
            Self::Tau => "TAU".into(),
            Self::TraceDelay => "TRACE_DELAY".into(),
            Self::Voffset => "VOFFSET".into(),
            Self::BlCut => "BLCUT".into(),
            Self::BaselinePercent => "BASELINE_PERCENT".into(),
            Self::ChannelCsrA => "CHANNEL_CSRA".into(),
            Self::ChannelCsrB => "CHANNEL_CSRB".into(),
            Self::CfdThreshold => "CFD_THRESHOLD".into(),
            Self::CfdDelay => "CFD_DELAY".into(),
            Self::FifoDelay => "FIFO_DELAY".into(),
            Self::MultiplicityMaskL => "MULTIPLICITY_MASKL".into(),
            Self::MultiplicityMaskH => "MULTIPLICITY_MASKH".into(),
            Self::BinFactor => "BINFACTOR".into(),
            Self::EnergyLow => "ENERGY_LOW".into(),
            Self::QdcLen(i) => format!("QDC_LEN{}", i),
        }
    }

    pub fn variable(&self) -> ChannelVarTag {
        match self {
            Self::TriggerThreshold => ChannelVarTag::FastThresh,
            Self::EnergyRisetime => ChannelVarTag::SlowLength,
            Self::EnergyFlattop => ChannelVarTag::SlowGap,
            Self::TriggerRisetime => ChannelVarTag::FastLength,
            Self::TriggerFlattop => ChannelVarTag::FastGap,
            Self::Tau => ChannelVarTag::PreampTau,
            Self::TraceDelay => ChannelVarTag::TraceDelay,
            Self::Voffset => ChannelVarTag::VOffset,
            Self::BlCut => ChannelVarTag::BlCut,
            Self::BaselinePercent => ChannelVarTag::BaselinePercent,
            Self::ChannelCsrA => ChannelVarTag::ChanCsrA,
            Self::ChannelCsrB => ChannelVarTag::ChanCsrB,
            Self::CfdThreshold => ChannelVarTag::CfdThresh,
            Self::CfdDelay => ChannelVarTag::CfdDelay,
            Self::FifoDelay => ChannelVarTag::FifoDelay,
            Self::MultiplicityMaskL => ChannelVarTag::MultiplicityMaskL,
            Self::MultiplicityMaskH => ChannelVarTag::MultiplicityMaskH,
            Self::BinFactor => ChannelVarTag::Binn,
            Self::EnergyLow => ChannelVarTag::EnergyLow,
            Self::QdcLen(0) => ChannelVarTag::QdcLen0,
            Self::QdcLen(1) => ChannelVarTag::QdcLen1,
            Self::QdcLen(2) => ChannelVarTag::QdcLen2,
            Self::QdcLen(3) => ChannelVarTag::QdcLen3,
            Self::QdcLen(4) => ChannelVarTag::QdcLen4,
            Self::QdcLen(5) => ChannelVarTag::QdcLen5,
            Self::QdcLen(6) => ChannelVarTag::QdcLen6,
            Self::QdcLen(_) => ChannelVarTag::QdcLen7,
        }
    }

    /// `true` for parameters that are physically floats on the DSP: they
    /// round-trip through the 32-bit IEEE-float-equivalent word the DSP
    /// expects (spec.md §4.5).
    pub fn is_float(&self) -> bool {
        !matches!(
            self,
            Self::ChannelCsrA
                | Self::ChannelCsrB
                | Self::FifoDelay
                | Self::MultiplicityMaskL
                | Self::MultiplicityMaskH
                | Self::BinFactor
                | Self::QdcLen(_)
        )
    }

    /// Clock factor (ticks per microsecond) used by the filter-range timed
    /// parameters; driven by the module's ADC sample rate (spec.md §3/§4.3).
    fn clock_factor(&self, props: &ModuleProps) -> Option<f64> {
        match self {
            Self::EnergyRisetime | Self::EnergyFlattop | Self::TriggerRisetime | Self::TriggerFlattop => {
                Some(props.adc_msps as f64)
            }
            _ => None,
        }
    }

    pub fn to_words(&self, value: f64, props: &ModuleProps) -> Result<Vec<u32>, ApiError> {
        if self.is_float() {
            let scaled = match self.clock_factor(props) {
                Some(factor) => value * factor,
                None => value,
            };
            let bits = (scaled as f32).to_bits();
            Ok(vec![bits])
        } else {
            let v = value as i64;
            if v < 0 || v > u32::MAX as i64 {
                return Err(ApiError::new(ErrorCode::InvalidValue, format!("{} out of range", self.name())));
            }
            Ok(vec![v as u32])
        }
    }

    pub fn from_words(&self, words: &[u32], props: &ModuleProps) -> f64 {
        let word = *words.first().unwrap_or(&0);
        if self.is_float() {
            let raw = f32::from_bits(word) as f64;
            match self.clock_factor(props) {
                Some(factor) if factor != 0.0 => raw / factor,
                _ => raw,
            }
        } else {
            word as f64
        }
    }
}

pub fn lookup_channel_param(label: &str) -> Result<ChannelParam, ApiError> {
    if let Some(rest) = label.strip_prefix("QDC_LEN") {
        if let Ok(i) = rest.parse::<u8>() {
            if i < 8 {
                return Ok(ChannelParam::QdcLen(i));
            }
        }
        return Err(ApiError::new(ErrorCode::ChannelInvalidParam, format!("unknown channel parameter {:?}", label)));
    }
    match label {
        "TRIGGER_THRESHOLD" => Ok(ChannelParam::TriggerThreshold),
        "ENERGY_RISETIME" => Ok(ChannelParam::EnergyRisetime),
        "ENERGY_FLATTOP" => Ok(ChannelParam::EnergyFlattop),
        "TRIGGER_RISETIME" => Ok(ChannelParam::TriggerRisetime),
        "TRIGGER_FLATTOP" => Ok(ChannelParam::TriggerFlattop),
        "TAU" => Ok(ChannelParam::Tau),
        "TRACE_DELAY" => Ok(ChannelParam::TraceDelay),
        "VOFFSET" => Ok(ChannelParam::Voffset),
        "BLCUT" => Ok(ChannelParam::BlCut),
        "BASELINE_PERCENT" => Ok(ChannelParam::BaselinePercent),
        "CHANNEL_CSRA" => Ok(ChannelParam::ChannelCsrA),
        "CHANNEL_CSRB" => Ok(ChannelParam::ChannelCsrB),
        "CFD_THRESHOLD" => Ok(ChannelParam::CfdThreshold),
        "CFD_DELAY" => Ok(ChannelParam::CfdDelay),
        "FIFO_DELAY" => Ok(ChannelParam::FifoDelay),
        "MULTIPLICITY_MASKL" => Ok(ChannelParam::MultiplicityMaskL),
        "MULTIPLICITY_MASKH" => Ok(ChannelParam::MultiplicityMaskH),
        "BINFACTOR" => Ok(ChannelParam::BinFactor),
        "ENERGY_LOW" => Ok(ChannelParam::EnergyLow),
        other => Err(ApiError::new(ErrorCode::ChannelInvalidParam, format!("unknown channel parameter {:?}", other))),
    }
}

/// Policy check shared by every parameter/variable read or write path
/// (spec.md §4.3's disabled/readonly/writeonly failure modes).
pub fn check_access(enabled: bool, mode: RwMode, want_write: bool, disabled_code: ErrorCode, readonly_code: ErrorCode, writeonly_code: ErrorCode, label: &str) -> Result<(), ApiError> {
    if !enabled {
        return Err(ApiError::new(disabled_code, format!("{} is disabled (not present in loaded VAR file)", label)));
    }
    match (mode, want_write) {
        (RwMode::ReadOnly, true) => Err(ApiError::new(readonly_code, format!("{} is read-only", label))),
        (RwMode::WriteOnly, false) => Err(ApiError::new(writeonly_code, format!("{} is write-only", label))),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_var_file() -> &'static str {
        "ModCSRA 0x4000\nModCSRB 0x4001\nMaxEvents 0x4002\nSynchWait 0x4003\nInSynch 0x4004\n\
         SlowFilterRange 0x4005\nFastFilterRange 0x4006\nHostRunTimePresetLo 0x4007\nHostRunTimePresetHi 0x4008\n\
         RunTask 0x4009\nControlTask 0x400A\n\
         FastThresh 0x5000\nSlowLength 0x5001\nSlowGap 0x5002\nFastLength 0x5003\nFastGap 0x5004\n\
         VOffset 0x5005\nTraceDelay 0x5006\nBinn 0x5007\nEnergyLow 0x5008\nPreampTau 0x5009\nPSM 0x500A\n\
         BLCut 0x500B\nBaselinePercent 0x500C\nChanCSRa 0x500D\nChanCSRb 0x500E\nCFDThresh 0x500F\n\
         CFDDelay 0x5010\nExternDelayLen 0x5011\nFIFODelay 0x5012\nMultiplicityMaskL 0x5013\n\
         MultiplicityMaskH 0x5014\nQDCLen0 0x5015\nQDCLen1 0x5016\nQDCLen2 0x5017\nQDCLen3 0x5018\n\
         QDCLen4 0x5019\nQDCLen5 0x501A\nQDCLen6 0x501B\nQDCLen7 0x501C\n"
    }

    #[test]
    fn load_var_file_builds_address_map() {
        let (_m, _c, map) = load_var_file(sample_var_file().as_bytes(), 4).unwrap();
        assert_eq!(map.vars_per_channel, 0x501C - 0x5000 + 1);
        for i in 0..3 {
            assert_eq!(map.channel_base(i + 1) - map.channel_base(i), map.vars_per_channel);
        }
        map.validate().unwrap();
    }

    #[test]
    fn missing_name_disables_descriptor() {
        let (module_descs, _c, _map) = load_var_file("ModCSRA 0x10\n".as_bytes(), 1).unwrap();
        assert!(module_descs[&ModuleVarTag::ModCsrA].enabled);
        assert!(!module_descs[&ModuleVarTag::MaxEvents].enabled);
    }

    #[test]
    fn trigger_threshold_round_trips_at_f32_precision() {
        let props = ModuleProps { adc_bits: 14, adc_msps: 100, num_channels: 1 };
        let words = ChannelParam::TriggerThreshold.to_words(1234.5, &props).unwrap();
        let back = ChannelParam::TriggerThreshold.from_words(&words, &props);
        assert_eq!(back, 1234.5f32 as f64);
    }

    #[test]
    fn energy_risetime_uses_clock_factor() {
        let props = ModuleProps { adc_bits: 14, adc_msps: 100, num_channels: 1 };
        let words = ChannelParam::EnergyRisetime.to_words(2.0, &props).unwrap();
        let back = ChannelParam::EnergyRisetime.from_words(&words, &props);
        assert!((back - 2.0).abs() < 1e-3);
    }

    #[test]
    fn copy_parameters_respects_mask_and_group() {
        let mut src = HashMap::new();
        src.insert(ChannelVarTag::FastThresh, vec![Cell { value: 42, dirty: false }]);
        src.insert(ChannelVarTag::SlowLength, vec![Cell { value: 99, dirty: false }]);
        let mut dst = HashMap::new();
        dst.insert(ChannelVarTag::FastThresh, vec![Cell { value: 0, dirty: false }]);
        dst.insert(ChannelVarTag::SlowLength, vec![Cell { value: 0, dirty: false }]);

        copy_parameters(CopyFilter::TRIGGER, &src, &mut dst);
        assert_eq!(dst[&ChannelVarTag::FastThresh][0].value, 42);
        assert!(dst[&ChannelVarTag::FastThresh][0].dirty);
        assert_eq!(dst[&ChannelVarTag::SlowLength][0].value, 0);
        assert!(!dst[&ChannelVarTag::SlowLength][0].dirty);
    }

    #[test]
    fn lookup_invalid_param_fails() {
        assert!(lookup_channel_param("NOT_A_PARAM").is_err());
        assert!(lookup_module_param("NOT_A_PARAM").is_err());
    }

    #[test]
    fn write_sets_dirty_even_for_same_value() {
        let mut store = ValueStore::new(1);
        store.write_channel(0, ChannelVarTag::FastThresh, &[7]);
        store.clear_all_dirty();
        store.write_channel(0, ChannelVarTag::FastThresh, &[7]);
        assert!(store.channels[0][&ChannelVarTag::FastThresh][0].dirty);
    }
}
