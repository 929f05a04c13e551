//! Stress test - many submitters on both rings
//!
//! Submitter threads hammer both rings from their own contexts while a
//! service thread plays the interrupt handler: it runs the simulated CP,
//! delivers interrupts, checks the preemption deadline and recovers the
//! device if it was lost. Every fence must retire.
//!
//! Usage: stress [submitters] [submits_per_thread]

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use gpuring::prelude::*;
use gpuring::sim::{SimGpu, StaticPageTables};
use gpuring::{DeviceMemory, A740};

const CMD_IOVA: u64 = 0x40_0000;
const CMD_SPAN: u64 = 0x10_0000;

fn context(n: usize) -> ContextId {
    ContextId::new(n as u32 + 1)
}

fn main() -> GpuResult<()> {
    println!("=== gpuring Stress Test ===\n");

    let mut args = std::env::args().skip(1);
    let submitters: usize = args.next().and_then(|s| s.parse().ok()).unwrap_or(8);
    let per_thread: usize = args.next().and_then(|s| s.parse().ok()).unwrap_or(10_000);

    let cfg = DeviceConfig::from_env().name("stress");
    let mem = Arc::new(DeviceMemory::new("stress", cfg.iova_base));
    let sim = Arc::new(SimGpu::new(mem.clone()));

    let mut pagetables = StaticPageTables::new();
    for n in 0..submitters {
        let binding = PageTableBinding { ttbr0: 0x1_0000_0000 * (n as u64 + 1), asid: n as u32 + 1 };
        pagetables = pagetables
            .with_context(context(n), binding)
            .with_mapping(context(n), CMD_IOVA, CMD_SPAN);
    }

    let dev = Arc::new(GpuDevice::new(
        Collaborators {
            bus: sim.clone(),
            alloc: mem,
            pagetables: Arc::new(pagetables),
            variant: Arc::new(A740),
            firmware: Firmware::from_words(vec![0x7000_0000; 64])?,
        },
        cfg,
    )?);
    dev.init()?;

    println!("Submitters: {} ({} per thread, odd threads on ring 1)", submitters, per_thread);

    let stop = Arc::new(AtomicBool::new(false));
    let ring_full = Arc::new(AtomicU64::new(0));
    let interrupts = Arc::new(AtomicU64::new(0));

    let service = {
        let dev = dev.clone();
        let sim = sim.clone();
        let stop = stop.clone();
        let interrupts = interrupts.clone();
        thread::spawn(move || {
            while !stop.load(Ordering::Acquire) {
                sim.run();
                let irq = sim.take_irq();
                if !irq.is_empty() {
                    dev.on_interrupt(irq);
                    interrupts.fetch_add(1, Ordering::Relaxed);
                } else {
                    thread::yield_now();
                }
                dev.check_timeouts();
                if dev.needs_recovery() {
                    if let Err(e) = dev.recover() {
                        eprintln!("recovery failed: {}", e);
                        return;
                    }
                }
            }
        })
    };

    let start = Instant::now();
    let workers: Vec<_> = (0..submitters)
        .map(|n| {
            let dev = dev.clone();
            let ring_full = ring_full.clone();
            thread::spawn(move || -> GpuResult<Option<Fence>> {
                let ring = (n % 2) as u32;
                let cmd = CmdBuffer::new(CMD_IOVA + (n as u64) * 0x100, 16);
                let mut last = None;
                for _ in 0..per_thread {
                    loop {
                        match dev.submit(context(n), ring, &[cmd]) {
                            Ok(f) => {
                                last = Some(f);
                                break;
                            }
                            Err(GpuError::RingFull { .. }) => {
                                ring_full.fetch_add(1, Ordering::Relaxed);
                                thread::yield_now();
                            }
                            Err(e) => return Err(e),
                        }
                    }
                }
                Ok(last)
            })
        })
        .collect();

    let mut last_fences = Vec::new();
    for w in workers {
        match w.join() {
            Ok(Ok(Some(f))) => last_fences.push(f),
            Ok(Ok(None)) => {}
            Ok(Err(e)) => eprintln!("submitter failed: {}", e),
            Err(_) => eprintln!("submitter panicked"),
        }
    }
    let submit_time = start.elapsed();

    let mut timed_out = 0;
    for f in &last_fences {
        if dev.wait(*f, Some(Duration::from_secs(10))) != WaitStatus::Signaled {
            timed_out += 1;
        }
    }
    let total_time = start.elapsed();

    stop.store(true, Ordering::Release);
    let _ = service.join();

    let total = (submitters * per_thread) as f64;
    let counters = dev.preempt_counters();
    println!("\n=== Results ===");
    println!("Submissions:     {}", submitters * per_thread);
    println!("Issued (0/1):    {} / {}", dev.issued(RingId::LOW), dev.issued(RingId::HIGH));
    println!("Retired (0/1):   {} / {}", dev.retired(RingId::LOW), dev.retired(RingId::HIGH));
    println!("Unretired:       {}", timed_out);
    println!("RingFull retries:{}", ring_full.load(Ordering::Relaxed));
    println!("Interrupts:      {}", interrupts.load(Ordering::Relaxed));
    println!("Switches:        {} requested, {} completed", counters.requested, counters.completed);
    println!("Desyncs:         {}", counters.desyncs);
    println!("Recoveries:      {}", dev.recoveries());
    println!("Submit time:     {:?}", submit_time);
    println!("Total time:      {:?}", total_time);
    println!("Throughput:      {:.0} fences/sec", total / total_time.as_secs_f64());

    println!("\n=== Stress Test Complete ===");
    Ok(())
}
