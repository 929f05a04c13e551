//! Preemption walkthrough
//!
//! Fills the low-priority ring from one context, then submits a single
//! high-priority buffer from another and follows the controller through
//! the switch to ring 1 and back, all against the simulated CP.
//!
//! Usage: preemption [low_submits]

use std::sync::Arc;
use std::time::{Duration, Instant};

use gpuring::prelude::*;
use gpuring::sim::{SimGpu, StaticPageTables};
use gpuring::{DeviceMemory, A740};

const LOW_CTX: ContextId = ContextId::new(1);
const HIGH_CTX: ContextId = ContextId::new(2);
const LOW_PT: PageTableBinding = PageTableBinding { ttbr0: 0xa000_0000, asid: 1 };
const HIGH_PT: PageTableBinding = PageTableBinding { ttbr0: 0xb000_0000, asid: 2 };
const CMD: CmdBuffer = CmdBuffer::new(0x40_0000, 16);

/// Run the CP and deliver one interrupt; returns what the device serviced
fn pump(dev: &GpuDevice, sim: &SimGpu) -> IrqStatus {
    sim.run();
    let irq = sim.take_irq();
    if irq.is_empty() {
        irq
    } else {
        dev.on_interrupt(irq)
    }
}

fn main() -> GpuResult<()> {
    println!("=== gpuring preemption demo ===\n");

    let low_submits: u32 = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(5);

    let cfg = DeviceConfig::from_env().name("demo");
    cfg.print();
    println!();

    let mem = Arc::new(DeviceMemory::new("demo", cfg.iova_base));
    let sim = Arc::new(SimGpu::new(mem.clone()));
    let pagetables = StaticPageTables::new()
        .with_context(LOW_CTX, LOW_PT)
        .with_context(HIGH_CTX, HIGH_PT)
        .with_mapping(LOW_CTX, CMD.iova, 0x10_0000)
        .with_mapping(HIGH_CTX, CMD.iova, 0x10_0000);

    let dev = GpuDevice::new(
        Collaborators {
            bus: sim.clone(),
            alloc: mem,
            pagetables: Arc::new(pagetables),
            variant: Arc::new(A740),
            firmware: Firmware::from_words(vec![0x7000_0000; 64])?,
        },
        cfg,
    )?;

    let start = Instant::now();
    dev.init()?;
    println!("init:        {:?} in {:?}", dev.preempt_state(), start.elapsed());

    let mut low = Vec::with_capacity(low_submits as usize);
    for _ in 0..low_submits {
        low.push(dev.submit(LOW_CTX, 0, &[CMD])?);
    }
    println!("low fences:  {}", fmt_fences(&low));

    let high = dev.submit(HIGH_CTX, 1, &[CMD])?;
    println!("high fence:  {}", high);
    println!("requested:   {:?}", dev.preempt_state());

    let mut rounds = 0;
    while rounds < 32 {
        let irq = pump(&dev, &sim);
        rounds += 1;
        if !irq.is_empty() {
            println!(
                "round {:2}:    irq {:?} -> {:?} (ttbr0 {:#x})",
                rounds,
                irq,
                dev.preempt_state(),
                sim.ttbr0()
            );
        }
        if irq.is_empty() && !dev.preempt_state().is_switching() {
            break;
        }
    }

    let status = dev.wait(high, Some(Duration::from_millis(100)));
    println!("\nhigh wait:   {:?}", status);
    for f in &low {
        println!("  {} -> {:?}", f, dev.wait(*f, Some(Duration::from_millis(100))));
    }

    let counters = dev.preempt_counters();
    let stats = sim.stats();
    println!("\n=== Results ===");
    println!("Final state:     {:?}", dev.preempt_state());
    println!("Switches:        {} requested, {} completed", counters.requested, counters.completed);
    println!("Desyncs:         {}", counters.desyncs);
    println!("Timeouts:        {}", counters.timeouts);
    println!("IBs executed:    {}", stats.ibs_executed);
    println!("Retired (0/1):   {} / {}", dev.retired(RingId::LOW), dev.retired(RingId::HIGH));
    for report in dev.take_diagnostics() {
        println!("Diagnostic:      {:?} {}", report.kind, report.detail);
    }

    println!("\n=== Preemption demo complete ===");
    Ok(())
}

fn fmt_fences(fences: &[Fence]) -> String {
    fences
        .iter()
        .map(|f| f.seqno.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}
