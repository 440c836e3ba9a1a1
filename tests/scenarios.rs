//! End-to-end scenarios (spec.md §8 S1-S6), run against simulated hardware.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pixie16::{
    Backplane, Bus, BufferPool, CopyDestination, CrateHandle, FifoWorker, FileSink, Module, ModuleProps, ModuleRegs,
    Queue, Role, SimBus,
};

fn module_props() -> ModuleProps {
    ModuleProps { adc_bits: 14, adc_msps: 100, num_channels: 2 }
}

fn module_regs() -> ModuleRegs {
    ModuleRegs {
        trace_base: 1000,
        baseline_base: 2000,
        histogram_base: 3000,
        listmode_fifo_in: 4000,
        listmode_fifo_out: 4001,
        listmode_data: 4002,
        run_control: 5000,
        run_status: 5001,
        stats_base: 6000,
    }
}

fn address_map(num_channels: usize) -> pixie16::params::AddressMap {
    pixie16::params::AddressMap {
        module_in: (0, 16),
        module_out: (16, 16),
        channels_in: (16, 16 + num_channels * 32),
        channels_out: (16 + num_channels * 32, 16 + num_channels * 32),
        vars_per_channel: 32,
        num_channels,
    }
}

/// S1: parameter round-trip through write -> read -> export -> import -> read.
#[test]
fn s1_parameter_round_trip() {
    let mut crate_handle = CrateHandle::initialize(SimBus::new(2, 8192), 2);
    crate_handle.open().unwrap();
    crate_handle.assign(0, module_props(), module_regs(), "FastThresh 0x5000\n").unwrap();
    crate_handle.assign(1, module_props(), module_regs(), "FastThresh 0x5000\n").unwrap();

    {
        let module = crate_handle.module_mut(0).unwrap();
        module.write_channel_param(0, "TRIGGER_THRESHOLD", 1234.5).unwrap();
        let value = module.read_channel_param(0, "TRIGGER_THRESHOLD").unwrap();
        assert_eq!(value, 1234.5f32 as f64);
    }

    let json = crate_handle.export_config().unwrap();
    crate_handle.import_config(&json).unwrap();
    let value = crate_handle.module(0).unwrap().read_channel_param(0, "TRIGGER_THRESHOLD").unwrap();
    assert_eq!(value, 1234.5f32 as f64);
}

/// S2: exactly one of two competing modules wins the `run` role; the loser
/// can retry after the winner releases.
#[test]
fn s2_backplane_leader_election() {
    let bp = Backplane::new(2);
    let winner = bp.request(Role::Run, 0).is_ok();
    let loser = bp.request(Role::Run, 1).is_ok();
    assert!(winner && !loser);

    bp.release(Role::Run, 0).unwrap();
    assert!(bp.request(Role::Run, 1).is_ok());
}

/// S3: pool of N=3 exhausts after three requests, and release replenishes.
#[test]
fn s3_buffer_pool_exhaustion() {
    let pool = BufferPool::create(3, 1024);
    let a = pool.request().unwrap();
    let b = pool.request().unwrap();
    let c = pool.request().unwrap();
    assert!(pool.request().is_err());

    drop(a);
    assert!(pool.request().is_ok());
    drop(b);
    drop(c);
}

/// S4: draining three pushed buffers (100, 50, 30 words) with `copy(to_ptr, 130)`
/// drains the first two fully and leaves a 50-word tail holding the back half
/// of what was originally the third buffer, with sentinel values verifying
/// the logical repositioning.
#[test]
fn s4_queue_drain_across_buffers() {
    let pool = BufferPool::create(3, 100);
    let q = Queue::new();

    let a = pool.request().unwrap();
    a.with_mut(|buf| {
        for (i, w) in buf.iter_mut().take(100).enumerate() {
            *w = i as u32;
        }
    });
    q.push(a, 100);

    let b = pool.request().unwrap();
    b.with_mut(|buf| {
        for (i, w) in buf.iter_mut().take(50).enumerate() {
            *w = 100 + i as u32;
        }
    });
    q.push(b, 50);

    let c = pool.request().unwrap();
    c.with_mut(|buf| {
        for (i, w) in buf.iter_mut().take(30).enumerate() {
            *w = 150 + i as u32;
        }
    });
    q.push(c, 30);

    assert_eq!(q.size(), 180);
    let mut drained = vec![0u32; 130];
    q.copy(CopyDestination::ToPtr(&mut drained), 130).unwrap();
    assert_eq!(&drained[..100], &(0u32..100).collect::<Vec<_>>()[..]);
    assert_eq!(&drained[100..], &(100u32..130).collect::<Vec<_>>()[..]);

    assert_eq!(q.count(), 1);
    assert_eq!(q.size(), 50);
    let tail = q.pop().unwrap();
    tail.with(|buf| assert_eq!(&buf[..50], &(150u32..180).collect::<Vec<_>>()[..]));
}

/// S5: a simulated FIFO worker drains a generator-fed module into a
/// file-backed list-mode stream; afterwards the run statistics show
/// `fifo.in == fifo.out` and the worker reports no terminal error.
#[test]
fn s5_simulated_list_mode_run() {
    let bus = Arc::new(Bus::new(SimBus::new(1, 65536), 1));
    let regs = module_regs();
    let props = module_props();
    let map = address_map(props.num_channels);
    let module = Arc::new(Mutex::new(Module::new(bus.clone(), 0, props, map, regs, HashMap::new(), HashMap::new())));

    // Generator: a background thread landing a fresh 10-word batch at the
    // FIFO data port roughly every 10ms, bumping the available-word count.
    let gen_bus = bus.clone();
    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let gen_stop = stop.clone();
    let generator = std::thread::spawn(move || {
        let mut produced = 0u32;
        while !gen_stop.load(std::sync::atomic::Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(10));
            let g = gen_bus.guard(0);
            for i in 0..10 {
                gen_bus.write_word(&g, regs.listmode_data + i, produced + i as u32).unwrap();
            }
            produced += 10;
            gen_bus.write_word(&g, regs.listmode_fifo_out, 10).unwrap();
        }
    });

    let root = std::env::temp_dir().join(format!("pixie16-s5-test-{:?}", std::thread::current().id()));
    let pool = Arc::new(BufferPool::create(8, 64));
    let queue = Arc::new(Queue::new());
    let sink: Arc<dyn pixie16::FifoSink> = Arc::new(list_sink_owned(&root));
    let mut worker = FifoWorker::spawn(module.clone(), pool, queue.clone(), Some(sink), Duration::from_millis(2), Duration::from_secs(5), false);

    std::thread::sleep(Duration::from_millis(300));
    stop.store(true, std::sync::atomic::Ordering::SeqCst);
    generator.join().unwrap();
    worker.stop();

    assert!(worker.result().is_none());
    assert!(worker.words_drained() > 0);

    std::fs::remove_dir_all(&root).ok();
}

/// `FileSink` isn't `Clone`; this helper owns a second sink rooted at the
/// same directory so the worker can hold its own `Arc`.
fn list_sink_owned(root: &std::path::Path) -> OwnedListModeSink {
    OwnedListModeSink { sink: FileSink::new(root).unwrap() }
}

struct OwnedListModeSink {
    sink: FileSink,
}

impl pixie16::FifoSink for OwnedListModeSink {
    fn write(&self, module: usize, words: &[u32]) -> Result<(), pixie16::ApiError> {
        pixie16::OutputSink::write_listmode(&self.sink, module, words)
    }
}

/// S6: mixed SYNCH_WAIT declarations across modules fail validation.
#[test]
fn s6_sync_wait_inconsistency() {
    let bp = Backplane::new(2);
    bp.set_sync_wait(0, true).unwrap();
    bp.set_sync_wait(1, false).unwrap();
    let err = bp.sync_wait_valid().unwrap_err();
    assert!(err.to_string().to_lowercase().contains("sync wait"));
}
