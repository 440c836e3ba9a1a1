//! Module runtime: per-module parameter access, trace/baseline/histogram
//! reads, and run control (spec.md §4.5).
//!
//! The host-side cache + dirty flag + explicit `sync_vars`/`sync_hw` flush
//! pattern mirrors `drive/status.rs`'s status-cache idiom; DMA block
//! transfers for traces/histograms use [`crate::bus::Bus::block_dma_read`]
//! the same way `drive/dma.rs` streams NPU inference buffers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};

use crate::bus::{Bus, BusDriver};
use crate::error::{ApiError, ErrorCode};
use crate::firmware::Firmware;
use crate::params::{
    check_access, lookup_channel_param, lookup_channel_var, lookup_module_param, lookup_module_var, AddressMap,
    ChannelVarTag, ModuleProps, ModuleVarTag, ValueStore, VarDescriptor,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunTask {
    None,
    Histogram,
    ListMode,
}

/// `start_histograms`/`start_listmode` mode (spec.md §4.5): a new run
/// re-zeroes accumulators; a resumed run continues an interrupted one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    NewRun,
    Resume,
}

/// Per module, per channel: real-time/live-time/count-rate/overflow/FIFO
/// totals (spec.md §3 "Run statistics").
#[derive(Debug, Clone, Default)]
pub struct RunStatistics {
    pub real_time: f64,
    pub live_time: Vec<f64>,
    pub input_count_rate: Vec<f64>,
    pub output_count_rate: Vec<f64>,
    pub hw_overflows: u64,
    pub host_overflows: u64,
    pub fifo_in: u64,
    pub fifo_out: u64,
}

/// Baseline samples for a set of channels with per-sample timestamps;
/// channel 0's timestamps are canonical for the whole module (spec.md §4.5).
#[derive(Debug, Clone, Default)]
pub struct BaselineReading {
    pub timestamps: Vec<f64>,
    pub values: Vec<Vec<f64>>,
}

/// DMA-addressable register offsets for one module's runtime data regions.
/// Real offsets are hardware-revision-specific; see [`crate::boot::BootRegs`]
/// for the analogous boot-controller placeholder.
#[derive(Debug, Clone, Copy)]
pub struct ModuleRegs {
    pub trace_base: usize,
    pub baseline_base: usize,
    pub histogram_base: usize,
    pub listmode_fifo_in: usize,
    pub listmode_fifo_out: usize,
    pub listmode_data: usize,
    pub run_control: usize,
    pub run_status: usize,
    pub stats_base: usize,
}

const RUN_CTRL_START: u32 = 0x1;
const RUN_CTRL_STOP: u32 = 0x2;
const RUN_CTRL_RESUME: u32 = 0x4;
const RUN_STATUS_ACTIVE: u32 = 0x1;

/// Offset-DAC binary search target and bound (spec.md §4.5 `adjust_offsets`).
const OFFSET_CONVERGENCE_TOLERANCE: f64 = 1.0;
const OFFSET_MAX_ITERATIONS: u32 = 16;

const STATS_HEADER_WORDS: usize = 5;
const STATS_PER_CHANNEL_WORDS: usize = 3;

pub struct Module<D: BusDriver> {
    pub number: usize,
    pub props: ModuleProps,
    pub firmwares: Vec<Firmware>,
    pub address_map: AddressMap,
    pub regs: ModuleRegs,
    module_descs: HashMap<ModuleVarTag, VarDescriptor>,
    channel_descs: HashMap<ChannelVarTag, VarDescriptor>,
    store: ValueStore,
    run_task: RunTask,
    bus: Arc<Bus<D>>,
}

impl<D: BusDriver> Module<D> {
    /// `module_descs`/`channel_descs` come from [`crate::params::load_var_file`]
    /// run against this module's bound DSP VAR firmware.
    pub fn new(
        bus: Arc<Bus<D>>,
        number: usize,
        props: ModuleProps,
        address_map: AddressMap,
        regs: ModuleRegs,
        module_descs: HashMap<ModuleVarTag, VarDescriptor>,
        channel_descs: HashMap<ChannelVarTag, VarDescriptor>,
    ) -> Self {
        let num_channels = props.num_channels;
        Self {
            number,
            props,
            firmwares: Vec::new(),
            address_map,
            regs,
            module_descs,
            channel_descs,
            store: ValueStore::new(num_channels),
            run_task: RunTask::None,
            bus,
        }
    }

    fn channel_in_range(&self, channel: usize) -> Result<(), ApiError> {
        if channel >= self.props.num_channels {
            return Err(ApiError::new(ErrorCode::ChannelNotFound, format!("module {} has no channel {}", self.number, channel)));
        }
        Ok(())
    }

    // ---- parameter / variable access ---------------------------------

    pub fn read_module_param(&self, label: &str) -> Result<f64, ApiError> {
        let param = lookup_module_param(label)?;
        let var = param.variable();
        self.read_module_var_checked(var, false)?;
        let words = if param.is_multiword_time() {
            vec![self.store.read_module(ModuleVarTag::HostRunTimePresetLo)[0], self.store.read_module(ModuleVarTag::HostRunTimePresetHi)[0]]
        } else {
            self.store.read_module(var)
        };
        Ok(param.from_words(&words))
    }

    pub fn write_module_param(&mut self, label: &str, value: f64) -> Result<(), ApiError> {
        let param = lookup_module_param(label)?;
        let var = param.variable();
        self.read_module_var_checked(var, true)?;
        let words = param.to_words(value)?;
        if param.is_multiword_time() {
            self.store.write_module(ModuleVarTag::HostRunTimePresetLo, &words[..1]);
            self.store.write_module(ModuleVarTag::HostRunTimePresetHi, &words[1..]);
        } else {
            self.store.write_module(var, &words);
        }
        Ok(())
    }

    pub fn read_module_var(&self, label: &str) -> Result<Vec<u32>, ApiError> {
        let tag = lookup_module_var(label)?;
        self.read_module_var_checked(tag, false)?;
        Ok(self.store.read_module(tag))
    }

    pub fn write_module_var(&mut self, label: &str, words: &[u32]) -> Result<(), ApiError> {
        let tag = lookup_module_var(label)?;
        self.read_module_var_checked(tag, true)?;
        self.store.write_module(tag, words);
        Ok(())
    }

    fn read_module_var_checked(&self, tag: ModuleVarTag, want_write: bool) -> Result<(), ApiError> {
        // A module with no VAR descriptors loaded (e.g. purely simulated)
        // treats every variable as enabled, since there is nothing to
        // disable it against.
        let enabled = self.module_descs.get(&tag).map(|d| d.enabled).unwrap_or(true);
        check_access(
            enabled,
            tag.rw_mode(),
            want_write,
            ErrorCode::ModuleParamDisabled,
            ErrorCode::ModuleParamReadonly,
            ErrorCode::ModuleParamWriteonly,
            tag.name(),
        )
    }

    fn read_channel_var_checked(&self, tag: ChannelVarTag, want_write: bool) -> Result<(), ApiError> {
        let enabled = self.channel_descs.get(&tag).map(|d| d.enabled).unwrap_or(true);
        check_access(
            enabled,
            tag.rw_mode(),
            want_write,
            ErrorCode::ChannelParamDisabled,
            ErrorCode::ChannelParamReadonly,
            ErrorCode::ChannelParamWriteonly,
            tag.name(),
        )
    }

    pub fn read_channel_param(&self, channel: usize, label: &str) -> Result<f64, ApiError> {
        self.channel_in_range(channel)?;
        let param = lookup_channel_param(label)?;
        self.read_channel_var_checked(param.variable(), false)?;
        let words = self.store.read_channel(channel, param.variable());
        Ok(param.from_words(&words, &self.props))
    }

    pub fn write_channel_param(&mut self, channel: usize, label: &str, value: f64) -> Result<(), ApiError> {
        self.channel_in_range(channel)?;
        let param = lookup_channel_param(label)?;
        self.read_channel_var_checked(param.variable(), true)?;
        let words = param.to_words(value, &self.props)?;
        self.store.write_channel(channel, param.variable(), &words);
        Ok(())
    }

    pub fn read_channel_var(&self, channel: usize, label: &str) -> Result<Vec<u32>, ApiError> {
        self.channel_in_range(channel)?;
        let tag = lookup_channel_var(label)?;
        self.read_channel_var_checked(tag, false)?;
        Ok(self.store.read_channel(channel, tag))
    }

    pub fn write_channel_var(&mut self, channel: usize, label: &str, words: &[u32]) -> Result<(), ApiError> {
        self.channel_in_range(channel)?;
        let tag = lookup_channel_var(label)?;
        self.read_channel_var_checked(tag, true)?;
        self.store.write_channel(channel, tag, words);
        Ok(())
    }

    pub fn copy_channel_parameters(&mut self, src_channel: usize, dst_channel: usize, filter: crate::params::CopyFilter) -> Result<(), ApiError> {
        self.channel_in_range(src_channel)?;
        self.channel_in_range(dst_channel)?;
        if src_channel == dst_channel {
            return Ok(());
        }
        let src = self.store.channels[src_channel].clone();
        crate::params::copy_parameters(filter, &src, &mut self.store.channels[dst_channel]);
        Ok(())
    }

    /// Flush every dirty host-side cell to the DSP over DMA, then clear
    /// dirty flags (spec.md §4.5's `sync_vars`). Variables with no address
    /// (no VAR descriptor loaded for them) are skipped rather than failing
    /// the whole flush.
    pub fn sync_vars(&mut self) -> Result<(), ApiError> {
        let g = self.bus.guard(self.number);
        for (tag, cells) in self.store.module.iter() {
            let addr = match self.module_descs.get(tag).and_then(|d| d.address) {
                Some(a) => a,
                None => continue,
            };
            let words: Vec<u32> = cells.iter().map(|c| c.value).collect();
            self.bus.block_dma_write(&g, addr, &words).map_err(ApiError::from)?;
        }
        for (ch, vars) in self.store.channels.iter().enumerate() {
            for (tag, cells) in vars.iter() {
                let addr = match self.channel_descs.get(tag).and_then(|d| d.address) {
                    Some(a) => self.address_map.channel_base(ch) + (a - self.address_map.channels_in.0),
                    None => continue,
                };
                let words: Vec<u32> = cells.iter().map(|c| c.value).collect();
                self.bus.block_dma_write(&g, addr, &words).map_err(ApiError::from)?;
            }
        }
        debug!("module {}: flushed {} dirty cells to hardware", self.number, self.store.dirty_count());
        self.store.clear_all_dirty();
        Ok(())
    }

    /// Pull variables back from the DSP into the host cache (spec.md
    /// §4.5's `sync_hw`, the read-direction counterpart to `sync_vars`).
    pub fn sync_hw(&mut self) -> Result<(), ApiError> {
        let g = self.bus.guard(self.number);
        let module_tags: Vec<ModuleVarTag> = self.store.module.keys().copied().collect();
        for tag in module_tags {
            let addr = match self.module_descs.get(&tag).and_then(|d| d.address) {
                Some(a) => a,
                None => continue,
            };
            let mut buf = vec![0u32; tag.size()];
            self.bus.block_dma_read(&g, addr, &mut buf).map_err(ApiError::from)?;
            self.store.write_module(tag, &buf);
        }
        for ch in 0..self.props.num_channels {
            let var_tags: Vec<ChannelVarTag> = self.store.channels[ch].keys().copied().collect();
            for tag in var_tags {
                let addr = match self.channel_descs.get(&tag).and_then(|d| d.address) {
                    Some(a) => self.address_map.channel_base(ch) + (a - self.address_map.channels_in.0),
                    None => continue,
                };
                let mut buf = vec![0u32; tag.size()];
                self.bus.block_dma_read(&g, addr, &mut buf).map_err(ApiError::from)?;
                self.store.write_channel(ch, tag, &buf);
            }
        }
        self.store.clear_all_dirty();
        Ok(())
    }

    // ---- data acquisition ----------------------------------------------

    /// Read an ADC trace for `channel` (spec.md §4.5 `get_traces`/`read_adc`).
    pub fn read_adc_trace(&self, channel: usize, length: usize) -> Result<Vec<u16>, ApiError> {
        self.channel_in_range(channel)?;
        let g = self.bus.guard(self.number);
        let mut words = vec![0u32; length.div_ceil(2)];
        let addr = self.regs.trace_base + channel * length;
        self.bus.block_dma_read(&g, addr, &mut words).map_err(ApiError::from)?;
        let mut trace = Vec::with_capacity(length);
        for w in words {
            trace.push((w & 0xFFFF) as u16);
            trace.push((w >> 16) as u16);
        }
        trace.truncate(length);
        Ok(trace)
    }

    /// Acquire and read back baseline samples with per-sample timestamps
    /// (spec.md §4.5 `acquire_baselines`/`bl_get`); channel 0's timestamps
    /// are canonical for the whole reading.
    pub fn acquire_baselines(&self, channels: &[usize], count: usize) -> Result<BaselineReading, ApiError> {
        for &ch in channels {
            self.channel_in_range(ch)?;
        }
        let g = self.bus.guard(self.number);
        let mut timestamps = Vec::with_capacity(count);
        let mut values = Vec::with_capacity(channels.len());
        for (i, &ch) in channels.iter().enumerate() {
            // Layout: one extra leading word per channel sample holding a
            // timestamp, followed by the f32-bit sample itself.
            let mut words = vec![0u32; count * 2];
            let addr = self.regs.baseline_base + ch * count * 2;
            self.bus.block_dma_read(&g, addr, &mut words).map_err(ApiError::from)?;
            let mut chan_values = Vec::with_capacity(count);
            let mut chan_timestamps = Vec::with_capacity(count);
            for pair in words.chunks_exact(2) {
                chan_timestamps.push(f32::from_bits(pair[0]) as f64);
                chan_values.push(f32::from_bits(pair[1]) as f64);
            }
            if i == 0 {
                timestamps = chan_timestamps;
            }
            values.push(chan_values);
        }
        Ok(BaselineReading { timestamps, values })
    }

    /// Read the accumulated MCA histogram for `channel` (spec.md §4.5 `read_histogram`).
    pub fn read_histogram(&self, channel: usize, length: usize) -> Result<Vec<u32>, ApiError> {
        self.channel_in_range(channel)?;
        let g = self.bus.guard(self.number);
        let mut words = vec![0u32; length];
        let addr = self.regs.histogram_base + channel * length;
        self.bus.block_dma_read(&g, addr, &mut words).map_err(ApiError::from)?;
        Ok(words)
    }

    /// Drain whatever list-mode words are currently queued in the module's
    /// FIFO, up to `max_words` (spec.md §4.5 `read_list_mode`). Returns
    /// fewer words than requested when the FIFO has less ready.
    pub fn read_list_mode(&self, max_words: usize) -> Result<Vec<u32>, ApiError> {
        let g = self.bus.guard(self.number);
        let available = self.bus.read_word(&g, self.regs.listmode_fifo_out).map_err(ApiError::from)? as usize;
        let n = available.min(max_words);
        if n == 0 {
            return Ok(Vec::new());
        }
        let mut words = vec![0u32; n];
        self.bus.block_dma_read(&g, self.regs.listmode_data, &mut words).map_err(ApiError::from)?;
        self.bus.write_word(&g, self.regs.listmode_fifo_out, (available - n) as u32).map_err(ApiError::from)?;
        Ok(words)
    }

    /// The FIFO's current fill level in words (spec.md §4.5 `read_list_mode_level`).
    pub fn read_list_mode_level(&self) -> Result<usize, ApiError> {
        let g = self.bus.guard(self.number);
        Ok(self.bus.read_word(&g, self.regs.listmode_fifo_out).map_err(ApiError::from)? as usize)
    }

    /// Per module, per channel counters (spec.md §3 "Run statistics",
    /// §4.5 `read_statistics`).
    pub fn read_statistics(&self) -> Result<RunStatistics, ApiError> {
        let g = self.bus.guard(self.number);
        let n = self.props.num_channels;
        let mut words = vec![0u32; STATS_HEADER_WORDS + n * STATS_PER_CHANNEL_WORDS];
        self.bus.block_dma_read(&g, self.regs.stats_base, &mut words).map_err(ApiError::from)?;
        let real_time = f32::from_bits(words[0]) as f64;
        let hw_overflows = words[1] as u64;
        let host_overflows = words[2] as u64;
        let fifo_in = words[3] as u64;
        let fifo_out = words[4] as u64;
        let mut live_time = Vec::with_capacity(n);
        let mut input_count_rate = Vec::with_capacity(n);
        let mut output_count_rate = Vec::with_capacity(n);
        for ch in 0..n {
            let base = STATS_HEADER_WORDS + ch * STATS_PER_CHANNEL_WORDS;
            live_time.push(f32::from_bits(words[base]) as f64);
            input_count_rate.push(f32::from_bits(words[base + 1]) as f64);
            output_count_rate.push(f32::from_bits(words[base + 2]) as f64);
        }
        Ok(RunStatistics { real_time, live_time, input_count_rate, output_count_rate, hw_overflows, host_overflows, fifo_in, fifo_out })
    }

    /// Binary-search the channel offset DACs toward a target baseline level,
    /// writing `VOffset` each iteration and re-measuring (spec.md §4.5
    /// `adjust_offsets`). Gives up with `module_task_timeout` past
    /// [`OFFSET_MAX_ITERATIONS`] without converging.
    pub fn adjust_offsets(&mut self) -> Result<(), ApiError> {
        const DAC_MIN: f64 = 0.0;
        const DAC_MAX: f64 = 65535.0;
        const TARGET: f64 = DAC_MAX / 2.0;

        for ch in 0..self.props.num_channels {
            let mut lo = DAC_MIN;
            let mut hi = DAC_MAX;
            let mut converged = false;
            for _ in 0..OFFSET_MAX_ITERATIONS {
                let mid = (lo + hi) / 2.0;
                self.write_channel_var(ch, "VOffset", &[(mid as f32).to_bits()])?;
                self.sync_vars()?;
                let reading = self.acquire_baselines(&[ch], 1)?;
                let measured = reading.values[0][0];
                if (measured - TARGET).abs() <= OFFSET_CONVERGENCE_TOLERANCE {
                    converged = true;
                    break;
                }
                if measured < TARGET {
                    lo = mid;
                } else {
                    hi = mid;
                }
            }
            if !converged {
                return Err(ApiError::new(ErrorCode::ModuleTaskTimeout, format!("module {} channel {} offset DAC did not converge", self.number, ch)));
            }
        }
        Ok(())
    }

    // ---- run control -----------------------------------------------------

    pub fn run_active(&self) -> Result<bool, ApiError> {
        let g = self.bus.guard(self.number);
        let status = self.bus.read_word(&g, self.regs.run_status).map_err(ApiError::from)?;
        Ok(status & RUN_STATUS_ACTIVE != 0)
    }

    pub fn start_histograms(&mut self, mode: RunMode) -> Result<(), ApiError> {
        self.start_run(RunTask::Histogram, mode)
    }

    pub fn start_listmode(&mut self, mode: RunMode) -> Result<(), ApiError> {
        self.start_run(RunTask::ListMode, mode)
    }

    fn start_run(&mut self, task: RunTask, mode: RunMode) -> Result<(), ApiError> {
        if self.run_task != RunTask::None {
            return Err(ApiError::new(ErrorCode::ModuleInvalidOperation, "a run is already active on this module"));
        }
        let g = self.bus.guard(self.number);
        let ctrl = match mode {
            RunMode::NewRun => RUN_CTRL_START,
            RunMode::Resume => RUN_CTRL_START | RUN_CTRL_RESUME,
        };
        self.bus.write_word(&g, self.regs.run_control, ctrl).map_err(ApiError::from)?;
        self.run_task = task;
        info!("module {}: started {:?} run ({:?})", self.number, task, mode);
        Ok(())
    }

    pub fn run_end(&mut self) -> Result<(), ApiError> {
        if self.run_task == RunTask::None {
            return Err(ApiError::new(ErrorCode::ModuleInvalidOperation, "no run active on this module"));
        }
        let g = self.bus.guard(self.number);
        self.bus.write_word(&g, self.regs.run_control, RUN_CTRL_STOP).map_err(ApiError::from)?;
        if let Err(last) = self.bus.poll_until(&g, self.regs.run_status, |v| v & RUN_STATUS_ACTIVE == 0, Duration::from_millis(1), Duration::from_secs(5)) {
            warn!("module {}: run did not stop within timeout, last status {:#x}", self.number, last);
            return Err(ApiError::new(ErrorCode::ModuleTaskTimeout, "module did not stop within timeout"));
        }
        debug!("module {}: {:?} run stopped", self.number, self.run_task);
        self.run_task = RunTask::None;
        Ok(())
    }

    // ---- diagnostics ----------------------------------------------------

    /// Runs an offline self-test task (spec.md §4.5 `start_test`/`end_test`).
    pub fn start_test(&self, test_id: u32) -> Result<(), ApiError> {
        let g = self.bus.guard(self.number);
        self.bus.write_word(&g, self.regs.run_control, 0x8000_0000 | test_id).map_err(ApiError::from)
    }

    pub fn end_test(&self) -> Result<u32, ApiError> {
        let g = self.bus.guard(self.number);
        self.bus.read_word(&g, self.regs.run_status).map_err(ApiError::from)
    }
}
