//! Host-side SDK for driving a crate of Pixie-16 PXI digital pulse-processor
//! modules: bus I/O, firmware loading, boot sequencing, parameter/variable
//! access, backplane coordination, and list-mode data acquisition.
//!
//! Structured logging follows the teacher's [`log`] + [`env_logger`] stack;
//! call [`init_logging`] once at process startup (a caller embedding this
//! SDK in its own daemon may instead configure `env_logger` itself, since
//! a library should not fight a host process for the global logger).

pub mod backplane;
pub mod boot;
pub mod buffer;
pub mod bus;
pub mod config;
pub mod error;
pub mod facade;
pub mod fifo;
pub mod files;
pub mod firmware;
pub mod module;
pub mod params;

pub use backplane::{Backplane, Role};
pub use boot::{boot_module, BootController, BootPattern, BootRegs, BootState};
pub use buffer::{BufferHandle, BufferPool, CopyDestination, Queue};
pub use bus::{Bus, BusDriver, BusGuard, DeviceError, SimBus};
pub use config::{CrateConfig, DspPaths, FirmwareInfo, FpgaPaths, LegacyCrateConfig, ModuleConfig, ParameterState, SYS_MAX_NUM_MODULES};
pub use error::{ApiError, ApiResult, ErrorCode};
pub use facade::CrateHandle;
pub use fifo::{FifoRegs, FifoSink, FifoWorker, Supervisor};
pub use files::{FileSink, OutputSink};
pub use firmware::{Device, Firmware, FirmwareError, FirmwareRegistry};
pub use module::{BaselineReading, Module, ModuleRegs, RunMode, RunStatistics, RunTask};
pub use params::{
    CopyFilter, ChannelParam, ChannelVarTag, ModuleParam, ModuleProps, ModuleVarTag, RwMode,
};

/// Initialize `env_logger` from `RUST_LOG` (or a sensible `info` default).
/// Safe to call more than once; later calls are no-ops.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).try_init();
}
