//! List-mode FIFO worker threads and their supervisor (spec.md §4.8).
//!
//! N+1 thread model: one worker per module draining its list-mode FIFO
//! through [`crate::module::Module::read_list_mode`] into the shared
//! [`crate::buffer::Queue`], one supervisor polling throughput and
//! reporting roughly every five seconds. Cooperative cancellation via a
//! shared stop flag mirrors `drive/main.rs`'s scheme-loop shutdown path.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{info, warn};

use crate::bus::BusDriver;
use crate::buffer::{BufferPool, Queue};
use crate::error::{ApiError, ErrorCode};
use crate::module::{Module, RunMode};

/// Legacy per-module FIFO status register layout, kept for direct bus
/// access outside of [`Module`] (diagnostics, `drive`-style raw polling).
#[derive(Debug, Clone, Copy)]
pub struct FifoRegs {
    pub fifo_in: usize,
    pub fifo_out: usize,
    pub data: usize,
}

struct WorkerShared {
    stop: AtomicBool,
    words_drained: AtomicU64,
    error: Mutex<Option<ApiError>>,
}

/// Output sink for drained words; see [`crate::files::OutputSink`] for the
/// default file-backed implementation (spec.md §6).
pub trait FifoSink: Send + Sync {
    fn write(&self, module: usize, words: &[u32]) -> Result<(), ApiError>;
}

pub struct FifoWorker {
    handle: Option<JoinHandle<()>>,
    shared: Arc<WorkerShared>,
}

impl FifoWorker {
    /// Spawn the worker thread for `module`. If `run_task_capable`, it
    /// first calls `start_listmode(new-run)`; either way it polls
    /// `read_list_mode` at `poll_interval`, pushing drained words into
    /// `queue` (via a pool buffer) and, when given, `sink`, until `stop()`
    /// is called or `deadline` elapses. On exit it performs a final drain
    /// and checks the run statistics, recording a fatal error on mismatch
    /// (spec.md §4.8).
    pub fn spawn<D: BusDriver + 'static>(
        module: Arc<Mutex<Module<D>>>,
        pool: Arc<BufferPool>,
        queue: Arc<Queue>,
        sink: Option<Arc<dyn FifoSink>>,
        poll_interval: Duration,
        deadline: Duration,
        run_task_capable: bool,
    ) -> Self {
        let shared = Arc::new(WorkerShared { stop: AtomicBool::new(false), words_drained: AtomicU64::new(0), error: Mutex::new(None) });
        let worker_shared = shared.clone();
        let module_number = module.lock().unwrap().number;
        info!("module {}: FIFO worker started", module_number);

        let handle = thread::spawn(move || {
            if run_task_capable {
                if let Err(e) = module.lock().unwrap().start_listmode(RunMode::NewRun) {
                    warn!("module {}: failed to start list-mode run: {}", module_number, e);
                    *worker_shared.error.lock().unwrap() = Some(e);
                    return;
                }
            }

            let deadline_at = Instant::now() + deadline;
            while !worker_shared.stop.load(Ordering::SeqCst) && Instant::now() < deadline_at {
                match drain_into(&module, &pool, &queue, &sink, module_number) {
                    Ok(0) => thread::sleep(poll_interval),
                    Ok(n) => {
                        worker_shared.words_drained.fetch_add(n as u64, Ordering::SeqCst);
                    }
                    Err(e) => {
                        warn!("module {}: FIFO drain failed, stopping worker: {}", module_number, e);
                        *worker_shared.error.lock().unwrap() = Some(e);
                        break;
                    }
                }
            }

            // Final drain so nothing buffered at shutdown is lost.
            loop {
                match drain_into(&module, &pool, &queue, &sink, module_number) {
                    Ok(0) => break,
                    Ok(n) => {
                        worker_shared.words_drained.fetch_add(n as u64, Ordering::SeqCst);
                    }
                    Err(e) => {
                        *worker_shared.error.lock().unwrap() = Some(e);
                        break;
                    }
                }
            }

            if run_task_capable {
                let mut m = module.lock().unwrap();
                if let Err(e) = m.run_end() {
                    warn!("module {}: run_end failed: {}", module_number, e);
                    *worker_shared.error.lock().unwrap() = Some(e);
                } else {
                    match m.read_statistics() {
                        Ok(stats) if stats.hw_overflows == 0 && stats.host_overflows == 0 && stats.fifo_in == stats.fifo_out => {}
                        Ok(stats) => {
                            let msg = format!(
                                "module {}: run statistics mismatch at exit (hw_overflows={}, host_overflows={}, fifo_in={}, fifo_out={})",
                                module_number, stats.hw_overflows, stats.host_overflows, stats.fifo_in, stats.fifo_out
                            );
                            warn!("{}", msg);
                            *worker_shared.error.lock().unwrap() = Some(ApiError::new(ErrorCode::ModuleInvalidOperation, msg));
                        }
                        Err(e) => *worker_shared.error.lock().unwrap() = Some(e),
                    }
                }
            }

            info!("module {}: FIFO worker stopped, {} words drained", module_number, worker_shared.words_drained.load(Ordering::SeqCst));
        });
        Self { handle: Some(handle), shared }
    }

    pub fn stop(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }

    pub fn words_drained(&self) -> u64 {
        self.shared.words_drained.load(Ordering::SeqCst)
    }

    /// The worker's terminal error, if it hit one (spec.md §4.8: "one
    /// `future` per worker holding the worker's terminal error code").
    pub fn result(&self) -> Option<ApiError> {
        self.shared.error.lock().unwrap().clone()
    }
}

impl Drop for FifoWorker {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

/// Drain whatever is currently in `module`'s FIFO (bounded by one pool
/// buffer's capacity) into `queue`, and `sink` if given. Returns the word
/// count drained.
fn drain_into<D: BusDriver>(
    module: &Mutex<Module<D>>,
    pool: &BufferPool,
    queue: &Queue,
    sink: &Option<Arc<dyn FifoSink>>,
    module_number: usize,
) -> Result<usize, ApiError> {
    let words = module.lock().unwrap().read_list_mode(pool.buffer_words())?;
    if words.is_empty() {
        return Ok(0);
    }
    if let Some(sink) = sink {
        sink.write(module_number, &words)?;
    }
    let handle = pool.request()?;
    handle.with_mut(|buf| buf[..words.len()].copy_from_slice(&words));
    queue.push(handle, words.len());
    Ok(words.len())
}

/// Polls every worker roughly every five seconds and reports aggregate
/// throughput; runs on its own thread, stopped the same cooperative way
/// as the workers it supervises (spec.md §4.8).
pub struct Supervisor {
    handle: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
}

impl Supervisor {
    pub fn spawn(report: impl Fn(u64, Duration) + Send + 'static, words_drained: impl Fn() -> u64 + Send + 'static) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let worker_stop = stop.clone();
        let handle = thread::spawn(move || {
            let mut last = Instant::now();
            let mut last_count = words_drained();
            while !worker_stop.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(200));
                if last.elapsed() >= Duration::from_secs(5) {
                    let now_count = words_drained();
                    report(now_count.saturating_sub(last_count), last.elapsed());
                    last_count = now_count;
                    last = Instant::now();
                }
            }
        });
        Self { handle: Some(handle), stop }
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Bus, SimBus};
    use crate::buffer::CopyDestination;
    use crate::params::{AddressMap, ModuleProps};
    use std::collections::HashMap;

    fn test_module(bus: Arc<Bus<SimBus>>) -> Module<SimBus> {
        let props = ModuleProps { adc_bits: 14, adc_msps: 100, num_channels: 4 };
        let map = AddressMap { module_in: (0, 16), module_out: (16, 16), channels_in: (16, 16 + 4 * 32), channels_out: (16 + 4 * 32, 16 + 4 * 32), vars_per_channel: 32, num_channels: 4 };
        let regs = crate::module::ModuleRegs {
            trace_base: 1000,
            baseline_base: 2000,
            histogram_base: 3000,
            listmode_fifo_in: 4000,
            listmode_fifo_out: 4001,
            listmode_data: 4002,
            run_control: 5000,
            run_status: 5001,
            stats_base: 6000,
        };
        Module::new(bus, 0, props, map, regs, HashMap::new(), HashMap::new())
    }

    #[test]
    fn worker_with_nothing_queued_exits_cleanly_without_run_task() {
        let bus = Arc::new(Bus::new(SimBus::new(1, 16384), 1));
        let module = Arc::new(Mutex::new(test_module(bus)));
        let pool = Arc::new(BufferPool::create(4, 256));
        let queue = Arc::new(Queue::new());
        let mut worker = FifoWorker::spawn(module, pool, queue.clone(), None, Duration::from_millis(1), Duration::from_millis(20), false);
        worker.stop();
        assert_eq!(worker.words_drained(), 0);
        assert!(worker.result().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn worker_drains_preloaded_fifo_words_into_queue() {
        let bus = Arc::new(Bus::new(SimBus::new(1, 16384), 1));
        {
            let g = bus.guard(0);
            bus.write_word(&g, 4001, 3).unwrap();
            bus.write_word(&g, 4002, 0xAA).unwrap();
            bus.write_word(&g, 4003, 0xBB).unwrap();
            bus.write_word(&g, 4004, 0xCC).unwrap();
        }
        let module = Arc::new(Mutex::new(test_module(bus)));
        let pool = Arc::new(BufferPool::create(4, 256));
        let queue = Arc::new(Queue::new());
        let mut worker = FifoWorker::spawn(module, pool, queue.clone(), None, Duration::from_millis(1), Duration::from_millis(50), false);
        thread::sleep(Duration::from_millis(30));
        worker.stop();
        assert_eq!(worker.words_drained(), 3);
        let mut out = Vec::new();
        queue.copy(CopyDestination::ToBuffer(&mut out), 3).unwrap();
        assert_eq!(out, vec![0xAA, 0xBB, 0xCC]);
    }
}
