//! Boot controller: drives system FPGA, FiPPI FPGAs, and DSP firmware onto
//! a module through one shared state machine (spec.md §4.4).
//!
//! State-machine shape (`idle -> prepare -> streaming -> verify -> done`,
//! driven by repeated `poll_until` on a status register) is ported from
//! `drive/boot.rs`'s `BootSequence`, generalized from one fixed image to
//! three controllers sharing the same pattern.

use std::time::Duration;

use log::{debug, error, info, warn};

use crate::bus::{Bus, BusDriver};
use crate::error::{ApiError, ErrorCode};
use crate::firmware::{Device, Firmware};

bitflags::bitflags! {
    /// Boot pattern bitmask (spec.md §4.4): which stages to run. `SYS` and
    /// `FIPPI` live in the low nibble so `FAST` (0x70) clears both while
    /// still carrying `DSP`, which must run even on a fast/partial boot.
    pub struct BootPattern: u8 {
        const SYS    = 0b0000_0001;
        const FIPPI  = 0b0000_0010;
        const PROGRAM_FIPPI = 0b0000_0100;
        const DSP    = 0b0001_0000;
        /// Full boot: all stages.
        const FULL = 0x7F;
        /// Fast/partial boot: skip ComFPGA and SPFPGA, assuming they're
        /// already configured; DSP still loads.
        const FAST = 0x70;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootState {
    Idle,
    Prepare,
    Streaming,
    Verify,
    Done,
}

/// Register offsets for one boot controller instance. Real offsets come
/// from the module's hardware revision map; these are placeholders a real
/// `BusDriver` wiring assigns concretely (spec.md §4.4 leaves exact offsets
/// implementation-defined).
#[derive(Debug, Clone, Copy)]
pub struct BootRegs {
    pub control: usize,
    pub status: usize,
    pub data: usize,
}

const CTRL_START: u32 = 0x1;
const STATUS_DONE: u32 = 0x1;
const STATUS_ERROR: u32 = 0x2;

/// One boot controller: streams an image through `regs.data`, polling
/// `regs.status` for completion (spec.md §4.4's shared state machine).
pub struct BootController {
    regs: BootRegs,
    state: BootState,
}

impl BootController {
    pub fn new(regs: BootRegs) -> Self {
        Self { regs, state: BootState::Idle }
    }

    pub fn state(&self) -> BootState {
        self.state
    }

    /// Drive one device's firmware image onto `module` end to end.
    pub fn run<D: BusDriver>(&mut self, bus: &Bus<D>, module: usize, fw: &Firmware) -> Result<(), ApiError> {
        let image = fw.image().ok_or_else(|| {
            ApiError::new(ErrorCode::DeviceBootFailure, format!("firmware for {} not loaded before boot", fw.device))
        })?;

        info!("module {}: booting {} from {}", module, fw.device, fw.filename);
        self.state = BootState::Prepare;
        let g = bus.guard(module);
        bus.write_word(&g, self.regs.control, CTRL_START)
            .map_err(|e| self.fail(fw.device, e.into()))?;

        self.state = BootState::Streaming;
        debug!("module {}: streaming {} bytes to {}", module, image.len(), fw.device);
        let words = image.chunks(4).map(|c| {
            let mut buf = [0u8; 4];
            buf[..c.len()].copy_from_slice(c);
            u32::from_le_bytes(buf)
        });
        for (i, w) in words.enumerate() {
            bus.write_word(&g, self.regs.data + i, w).map_err(|e| self.fail(fw.device, e.into()))?;
        }

        self.state = BootState::Verify;
        let result = bus.poll_until(
            &g,
            self.regs.status,
            |v| v & STATUS_DONE != 0 || v & STATUS_ERROR != 0,
            Duration::from_millis(1),
            Duration::from_secs(5),
        );
        match result {
            Ok(v) if v & STATUS_ERROR == 0 => {
                self.state = BootState::Done;
                info!("module {}: {} boot done", module, fw.device);
                Ok(())
            }
            Ok(_) => {
                warn!("module {}: {} status register reported a boot error", module, fw.device);
                Err(self.fail_msg(fw.device, "status register reported a boot error"))
            }
            Err(_) => {
                error!("module {}: {} boot timed out", module, fw.device);
                Err(self.fail_msg(fw.device, "timed out waiting for boot completion"))
            }
        }
    }

    fn fail(&mut self, device: Device, e: ApiError) -> ApiError {
        self.state = BootState::Idle;
        error!("{} boot failed: {}", device, e);
        ApiError::new(ErrorCode::DeviceBootFailure, format!("{} boot failed: {}", device, e))
    }

    fn fail_msg(&mut self, device: Device, msg: &str) -> ApiError {
        self.state = BootState::Idle;
        ApiError::new(ErrorCode::DeviceBootFailure, format!("{} boot failed: {}", device, msg))
    }
}

/// Runs the sequence named by `pattern` against the module's bound
/// firmware set, in the fixed order sys, fippi, dsp (spec.md §4.4).
pub fn boot_module<D: BusDriver>(
    bus: &Bus<D>,
    module: usize,
    pattern: BootPattern,
    regs: [BootRegs; 3],
    firmwares: &[Firmware],
) -> Result<(), ApiError> {
    let stages: &[(Device, BootPattern, usize)] =
        &[(Device::Sys, BootPattern::SYS, 0), (Device::Fippi, BootPattern::FIPPI, 1), (Device::Dsp, BootPattern::DSP, 2)];

    for (device, bit, reg_idx) in stages {
        if !pattern.contains(*bit) {
            continue;
        }
        let fw = firmwares
            .iter()
            .find(|f| f.device == *device)
            .ok_or_else(|| ApiError::new(ErrorCode::ModuleInvalidFirmware, format!("no {} firmware bound to module {}", device, module)))?;
        let mut controller = BootController::new(regs[*reg_idx]);
        controller.run(bus, module, fw)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::SimBus;

    fn regs(base: usize) -> BootRegs {
        BootRegs { control: base, status: base + 1, data: base + 2 }
    }

    #[test]
    fn full_boot_drives_all_three_stages() {
        let bus = Bus::new(SimBus::new(1, 4096), 1);
        let sim = bus.discover();
        assert_eq!(sim, vec![0]);

        // Pre-arm each status register as "done" so the poll resolves
        // immediately (SimBus has no real FPGA behind it).
        // Reaching into the driver directly is test-only; the boot
        // controller itself only ever goes through `Bus`.
        let r = [regs(0), regs(16), regs(32)];
        for reg in &r {
            // stash via a guard+write so it goes through the same path the
            // controller polls with, after the controller's DATA write
            // wouldn't otherwise flip status on the sim driver.
            let g = bus.guard(0);
            bus.write_word(&g, reg.status, STATUS_DONE).unwrap();
        }

        let fws = vec![
            Firmware::new("1.0", 1000, Device::Sys, "sys.bin"),
            Firmware::new("1.0", 1000, Device::Fippi, "fippi.bin"),
            Firmware::new("1.0", 1000, Device::Dsp, "dsp.bin"),
        ];
        // Firmware images load lazily from disk; stage real files on disk
        // for each so `load()` succeeds without a real programmer present.
        let dir = std::env::temp_dir().join(format!("pixie16-boot-test-{:?}", std::thread::current().id()));
        std::fs::create_dir_all(&dir).unwrap();
        let mut loaded = Vec::new();
        for fw in fws {
            let path = dir.join(format!("{}.bin", fw.device));
            std::fs::write(&path, vec![0xAAu8; 16]).unwrap();
            let mut fw = Firmware::new(fw.version, fw.revision, fw.device, path.to_string_lossy().to_string());
            fw.load().unwrap();
            loaded.push(fw);
        }

        let result = boot_module(&bus, 0, BootPattern::FULL, r, &loaded);
        assert!(result.is_ok());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn boot_fails_when_firmware_not_loaded() {
        let bus = Bus::new(SimBus::new(1, 4096), 1);
        let r = [regs(0), regs(16), regs(32)];
        let fws = vec![Firmware::new("1.0", 1000, Device::Sys, "sys.bin")];
        let result = boot_module(&bus, 0, BootPattern::SYS, r, &fws);
        assert!(result.is_err());
    }

    #[test]
    fn boot_fails_without_matching_firmware() {
        let bus = Bus::new(SimBus::new(1, 4096), 1);
        let r = [regs(0), regs(16), regs(32)];
        let result = boot_module(&bus, 0, BootPattern::SYS, r, &[]);
        assert!(matches!(result, Err(e) if e.code == ErrorCode::ModuleInvalidFirmware));
    }

    #[test]
    fn fast_pattern_skips_sys_and_fippi_but_boots_dsp() {
        let bus = Bus::new(SimBus::new(1, 4096), 1);
        let r = [regs(0), regs(16), regs(32)];
        {
            let g = bus.guard(0);
            bus.write_word(&g, r[2].status, STATUS_DONE).unwrap();
        }
        let dir = std::env::temp_dir().join(format!("pixie16-boot-fast-test-{:?}", std::thread::current().id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("dsp.bin");
        std::fs::write(&path, vec![0xAAu8; 16]).unwrap();
        let mut dsp_fw = Firmware::new("1.0", 1000, Device::Dsp, path.to_string_lossy().to_string());
        dsp_fw.load().unwrap();

        // No sys/fippi firmware bound at all: FAST must not even look for them.
        let result = boot_module(&bus, 0, BootPattern::FAST, r, &[dsp_fw]);
        assert!(result.is_ok());
        std::fs::remove_dir_all(&dir).ok();
    }
}
