//! Hardware Bus I/O — word and block register access over PCI/PXI.
//!
//! The real bus (a vendor PCI/PXI driver) is an external collaborator, same
//! boundary as `pcid_interface` was to the teacher's NPU driver: this crate
//! defines the trait a caller wires to real hardware, plus one concrete,
//! in-memory implementation (`SimBus`) standing in for it in tests and
//! dry-run mode. Register access style (volatile-flavored bounds checks,
//! `poll_until`) is ported from `drive/mmio.rs`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::{ApiError, ErrorCode};

/// Errors surfaced by the bus layer (spec.md §4.1, §7 device_* group).
#[derive(Debug)]
pub enum DeviceError {
    HwFailure { module: usize, offset: usize },
    DmaFailure { module: usize, addr: usize },
    DmaBusy { module: usize },
}

impl std::fmt::Display for DeviceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HwFailure { module, offset } => {
                write!(f, "module {}: hardware register access failed at offset {:#x}", module, offset)
            }
            Self::DmaFailure { module, addr } => {
                write!(f, "module {}: DMA transfer failed at DSP addr {:#x}", module, addr)
            }
            Self::DmaBusy { module } => write!(f, "module {}: DMA engine busy", module),
        }
    }
}

impl std::error::Error for DeviceError {}

impl From<DeviceError> for ApiError {
    fn from(e: DeviceError) -> Self {
        let code = match &e {
            DeviceError::HwFailure { .. } => ErrorCode::DeviceHwFailure,
            DeviceError::DmaFailure { .. } => ErrorCode::DeviceDmaFailure,
            DeviceError::DmaBusy { .. } => ErrorCode::DeviceDmaBusy,
        };
        ApiError::new(code, e.to_string())
    }
}

/// External collaborator interface: a PCI/PXI register-I/O backend.
///
/// Implementations must be internally synchronized per module — callers
/// serialize access via [`BusGuard`], but the trait itself makes no
/// assumption about how a real driver multiplexes the bus.
pub trait BusDriver: Send + Sync {
    fn read_word(&self, module: usize, offset: usize) -> Result<u32, DeviceError>;
    fn write_word(&self, module: usize, offset: usize, value: u32) -> Result<(), DeviceError>;
    fn block_dma_read(&self, module: usize, dsp_addr: usize, dst: &mut [u32]) -> Result<(), DeviceError>;
    fn block_dma_write(&self, module: usize, dsp_addr: usize, src: &[u32]) -> Result<(), DeviceError>;

    /// Number of modules the driver believes are present (PCI discovery).
    fn discover(&self) -> Vec<usize>;
}

/// Scoped acquisition of a module's bus lock. Released on all exit paths
/// (including unwinding) via `Drop`, matching `drive/mmio.rs`'s RAII style.
pub struct BusGuard<'a> {
    _guard: MutexGuard<'a, ()>,
    pub module: usize,
}

/// Per-module lock table plus a dry-run switch, wrapping a [`BusDriver`].
///
/// Dry-run mode short-circuits every access with a success return and no
/// side effect (spec.md §4.1), used when probing configuration without
/// touching real hardware.
pub struct Bus<D: BusDriver> {
    driver: D,
    locks: Vec<Mutex<()>>,
    dry_run: AtomicBool,
}

impl<D: BusDriver> Bus<D> {
    pub fn new(driver: D, num_modules: usize) -> Self {
        Self {
            driver,
            locks: (0..num_modules).map(|_| Mutex::new(())).collect(),
            dry_run: AtomicBool::new(false),
        }
    }

    pub fn set_dry_run(&self, on: bool) {
        self.dry_run.store(on, Ordering::SeqCst);
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run.load(Ordering::SeqCst)
    }

    /// Acquire the per-module guard. Never acquire more than one at a time
    /// (spec.md §5 deadlock-avoidance rule).
    pub fn guard(&self, module: usize) -> BusGuard<'_> {
        let guard = self.locks[module].lock().unwrap_or_else(|p| p.into_inner());
        BusGuard { _guard: guard, module }
    }

    pub fn read_word(&self, g: &BusGuard<'_>, offset: usize) -> Result<u32, DeviceError> {
        if self.dry_run.load(Ordering::SeqCst) {
            return Ok(0);
        }
        self.driver.read_word(g.module, offset)
    }

    pub fn write_word(&self, g: &BusGuard<'_>, offset: usize, value: u32) -> Result<(), DeviceError> {
        if self.dry_run.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.driver.write_word(g.module, offset, value)
    }

    pub fn block_dma_read(&self, g: &BusGuard<'_>, dsp_addr: usize, dst: &mut [u32]) -> Result<(), DeviceError> {
        if self.dry_run.load(Ordering::SeqCst) {
            dst.iter_mut().for_each(|w| *w = 0);
            return Ok(());
        }
        self.driver.block_dma_read(g.module, dsp_addr, dst)
    }

    pub fn block_dma_write(&self, g: &BusGuard<'_>, dsp_addr: usize, src: &[u32]) -> Result<(), DeviceError> {
        if self.dry_run.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.driver.block_dma_write(g.module, dsp_addr, src)
    }

    /// Poll a register until `condition` holds or the timeout expires.
    /// Ported from `drive/mmio.rs::poll_until`.
    pub fn poll_until<F>(
        &self,
        g: &BusGuard<'_>,
        offset: usize,
        condition: F,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Result<u32, u32>
    where
        F: Fn(u32) -> bool,
    {
        let start = Instant::now();
        loop {
            let value = self.read_word(g, offset).unwrap_or(0xFFFF_FFFF);
            if condition(value) {
                return Ok(value);
            }
            if start.elapsed() >= timeout {
                return Err(value);
            }
            std::thread::sleep(poll_interval);
        }
    }

    pub fn discover(&self) -> Vec<usize> {
        self.driver.discover()
    }
}

/// In-memory [`BusDriver`] standing in for real PCI/PXI hardware. Each
/// module is a flat `u32` register file; DMA reads/writes address the same
/// space (an offline SDK cannot distinguish "register space" from "DSP
/// memory space" without a real bus, so this keeps them unified for
/// simulation purposes).
pub struct SimBus {
    modules: Mutex<HashMap<usize, Vec<u32>>>,
}

impl SimBus {
    pub fn new(num_modules: usize, reg_space_words: usize) -> Self {
        let mut modules = HashMap::new();
        for m in 0..num_modules {
            modules.insert(m, vec![0u32; reg_space_words]);
        }
        Self { modules: Mutex::new(modules) }
    }

    /// Test/diagnostic hook: seed a register directly, bypassing dry-run.
    pub fn poke(&self, module: usize, offset: usize, value: u32) {
        let mut m = self.modules.lock().unwrap();
        if let Some(regs) = m.get_mut(&module) {
            if offset < regs.len() {
                regs[offset] = value;
            }
        }
    }

    pub fn peek(&self, module: usize, offset: usize) -> u32 {
        let m = self.modules.lock().unwrap();
        m.get(&module).and_then(|r| r.get(offset)).copied().unwrap_or(0xFFFF_FFFF)
    }
}

impl BusDriver for SimBus {
    fn read_word(&self, module: usize, offset: usize) -> Result<u32, DeviceError> {
        let m = self.modules.lock().unwrap();
        let regs = m.get(&module).ok_or(DeviceError::HwFailure { module, offset })?;
        regs.get(offset).copied().ok_or(DeviceError::HwFailure { module, offset })
    }

    fn write_word(&self, module: usize, offset: usize, value: u32) -> Result<(), DeviceError> {
        let mut m = self.modules.lock().unwrap();
        let regs = m.get_mut(&module).ok_or(DeviceError::HwFailure { module, offset })?;
        let slot = regs.get_mut(offset).ok_or(DeviceError::HwFailure { module, offset })?;
        *slot = value;
        Ok(())
    }

    fn block_dma_read(&self, module: usize, dsp_addr: usize, dst: &mut [u32]) -> Result<(), DeviceError> {
        let m = self.modules.lock().unwrap();
        let regs = m.get(&module).ok_or(DeviceError::DmaFailure { module, addr: dsp_addr })?;
        let end = dsp_addr.checked_add(dst.len()).ok_or(DeviceError::DmaFailure { module, addr: dsp_addr })?;
        if end > regs.len() {
            return Err(DeviceError::DmaFailure { module, addr: dsp_addr });
        }
        dst.copy_from_slice(&regs[dsp_addr..end]);
        Ok(())
    }

    fn block_dma_write(&self, module: usize, dsp_addr: usize, src: &[u32]) -> Result<(), DeviceError> {
        let mut m = self.modules.lock().unwrap();
        let regs = m.get_mut(&module).ok_or(DeviceError::DmaFailure { module, addr: dsp_addr })?;
        let end = dsp_addr.checked_add(src.len()).ok_or(DeviceError::DmaFailure { module, addr: dsp_addr })?;
        if end > regs.len() {
            return Err(DeviceError::DmaFailure { module, addr: dsp_addr });
        }
        regs[dsp_addr..end].copy_from_slice(src);
        Ok(())
    }

    fn discover(&self) -> Vec<usize> {
        let m = self.modules.lock().unwrap();
        let mut nums: Vec<usize> = m.keys().copied().collect();
        nums.sort_unstable();
        nums
    }
}

impl Default for SimBus {
    fn default() -> Self {
        Self::new(0, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_write_round_trip() {
        let bus = Bus::new(SimBus::new(2, 1024), 2);
        let g = bus.guard(0);
        bus.write_word(&g, 10, 0xDEAD_BEEF).unwrap();
        assert_eq!(bus.read_word(&g, 10).unwrap(), 0xDEAD_BEEF);
    }

    #[test]
    fn dry_run_short_circuits() {
        let bus = Bus::new(SimBus::new(1, 16), 1);
        bus.set_dry_run(true);
        let g = bus.guard(0);
        bus.write_word(&g, 0, 0x1234).unwrap();
        assert_eq!(bus.read_word(&g, 0).unwrap(), 0);
    }

    #[test]
    fn out_of_bounds_is_hw_failure() {
        let bus = Bus::new(SimBus::new(1, 4), 1);
        let g = bus.guard(0);
        assert!(matches!(bus.read_word(&g, 100), Err(DeviceError::HwFailure { .. })));
    }

    #[test]
    fn poll_until_times_out() {
        let bus = Bus::new(SimBus::new(1, 16), 1);
        let g = bus.guard(0);
        let res = bus.poll_until(&g, 0, |v| v == 1, Duration::from_millis(1), Duration::from_millis(5));
        assert!(res.is_err());
    }
}
