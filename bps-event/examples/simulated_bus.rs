//! Walk an event through its full lifecycle on the simulated bus
//!
//! Creates a few events with payloads and completion callbacks, lets the bus
//! complete some of them, disposes the rest, and prints the allocation
//! counters at the end. Every counter under "live" should be zero.
//!
//! Usage:
//!   cargo run --example simulated_bus

use bps_event::{
    EventBridge, NativeBus, Payload, PayloadValue, SimulatedBus, TrackingAllocator,
};
use std::sync::Arc;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();

    let bus = Arc::new(SimulatedBus::new());
    let alloc = Arc::new(TrackingAllocator::new());
    let bridge = EventBridge::builder(bus.clone())
        .with_allocator(alloc.clone())
        .build();

    let mut events = Vec::new();
    for i in 0..4u32 {
        let payload = Payload::new()
            .with_data1(i)
            .with_data2(format!("message #{}", i))
            .with_data3(PayloadValue::opaque(vec![i; 4]));

        let event = bridge
            .create_event_with_completion(0x42, 0x100 + i, payload, move |event| {
                println!(
                    "  completion: domain=0x{:X} code=0x{:X}",
                    event.domain()?,
                    event.code()?
                );
                Ok(())
            })
            .expect("create event");

        let data = event.payload().expect("read payload");
        println!("Created event {:?}", event.handle().expect("handle"));
        for (slot, value) in data.values().iter().enumerate() {
            if let Some(value) = value {
                println!("  data{} = {}", slot + 1, value);
            }
        }
        events.push(event);
    }

    // The bus finishes with the even-numbered events on its own
    for event in events.iter().step_by(2) {
        let handle = event.handle().expect("handle");
        println!("Bus completes {}", handle);
        bus.deliver_completion(handle);
    }

    for mut event in events {
        let handle = event.handle().expect("handle");
        println!("Disposing {} (domain still readable: {})", handle, bus.domain(handle));
        event.dispose().expect("dispose");
    }

    let stats = alloc.stats();
    println!("\n=== Allocation Summary ===");
    println!("Allocations:   {}", stats.allocations);
    println!("Deallocations: {}", stats.deallocations);
    println!("Live blocks:   {}", stats.live_blocks);
    println!("Live bytes:    {}", stats.live_bytes);
    println!("Bus: {:?}", bus.stats());
}
