//! Coordinator throughput benchmark.
//!
//! Usage:
//!     cargo run --release --bin batch_bench
//!
//! Environment variables:
//!     PRODUCERS=4           Producer threads (default: 4)
//!     ITEMS=1000000         Items per producer (default: 1000000)
//!     HANDLER_DELAY_US=50   Simulated handler latency per batch (default: 50)

use std::env;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use doublebuf::{BatchCoordinator, BoxError, CoordinatorConfig, handler_fn};

type Payload = u64;

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn main() {
    doublebuf::init_tracing();

    let producers: u64 = env_or("PRODUCERS", 4);
    let items: u64 = env_or("ITEMS", 1_000_000);
    let delay = Duration::from_micros(env_or("HANDLER_DELAY_US", 50));
    let total = producers * items;

    println!("Coordinator benchmark");
    println!("  Producers:     {producers}");
    println!("  Items each:    {items}");
    println!("  Handler delay: {delay:?}");
    println!();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_time()
        .thread_name("bench-drain")
        .build()
        .expect("failed to build runtime");

    let checksum = Arc::new(AtomicU64::new(0));
    let sink = Arc::clone(&checksum);
    let handler = handler_fn(move |batch: Vec<Payload>| {
        let sum: u64 = batch.iter().copied().fold(0, u64::wrapping_add);
        sink.fetch_add(sum, Ordering::Relaxed);
        async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            Ok::<(), BoxError>(())
        }
    });

    let config = CoordinatorConfig {
        name: "bench".to_string(),
        initial_capacity: 4096,
        ..CoordinatorConfig::default()
    };
    let coordinator = BatchCoordinator::with_runtime(handler, config, runtime.handle().clone());

    let start = Instant::now();
    let handles: Vec<_> = (0..producers)
        .map(|p| {
            let coordinator = coordinator.clone();
            thread::Builder::new()
                .name(format!("bench-producer-{p}"))
                .spawn(move || {
                    for i in 0..items {
                        coordinator.add_task(p * items + i);
                    }
                })
                .expect("failed to spawn producer")
        })
        .collect();
    for handle in handles {
        handle.join().expect("producer panicked");
    }
    let produced = start.elapsed();

    coordinator.finish();
    runtime.block_on(coordinator.wait_all_finished());
    let drained = start.elapsed();

    let expected = (0..total).fold(0u64, u64::wrapping_add);
    assert_eq!(checksum.load(Ordering::Relaxed), expected, "checksum mismatch");

    let stats = coordinator.stats();
    println!("Results:");
    println!(
        "  Produce:   {:.2} M items/sec ({produced:?})",
        total as f64 / produced.as_secs_f64() / 1e6
    );
    println!(
        "  End to end: {:.2} M items/sec ({drained:?})",
        total as f64 / drained.as_secs_f64() / 1e6
    );
    println!("  Batches:    {}", stats.batches_handled);
    println!("  Mean batch: {:.1} items", stats.mean_batch_len());
    println!("  Max batch:  {} items", stats.max_batch_len);
    println!("  Drain loops started: {}", stats.drain_loops);
    println!(
        "  Handler time: {} us total, {} us max",
        stats.handler_micros, stats.max_handler_micros
    );
}
