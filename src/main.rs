//! Stress driver for concurrent `BwTree` writes.
//!
//! Runs disjoint-range and high-contention insert/erase workloads under a
//! watchdog that reports any thread making no progress, then validates the
//! index structure.
//!
//! Run with:
//! ```bash
//! RUST_LOG=bwtree=debug cargo run --release --features tracing,mimalloc
//! ```

#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::too_many_lines
)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use bwtree::{BwTree, IndexConfig};

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

type Index = BwTree<u64, u64>;

// =============================================================================
// Hang detection
// =============================================================================

/// Last reported position of one worker thread.
#[derive(Default)]
struct Heartbeat {
    op: AtomicUsize,
    key: AtomicU64,
    /// Milliseconds since the workload started.
    at_ms: AtomicU64,
    done: AtomicBool,
}

struct Heartbeats {
    threads: Vec<Heartbeat>,
    start: Instant,
}

impl Heartbeats {
    fn new(threads: usize) -> Self {
        Self {
            threads: (0..threads).map(|_| Heartbeat::default()).collect(),
            start: Instant::now(),
        }
    }

    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    fn beat(&self, thread: usize, op: usize, key: u64) {
        let beat = &self.threads[thread];
        beat.op.store(op, Ordering::Relaxed);
        beat.key.store(key, Ordering::Relaxed);
        beat.at_ms.store(self.now_ms(), Ordering::Relaxed);
    }

    fn finish(&self, thread: usize) {
        self.threads[thread].done.store(true, Ordering::Relaxed);
    }

    fn finished(&self) -> bool {
        self.threads.iter().all(|beat| beat.done.load(Ordering::Relaxed))
    }

    /// Threads silent for longer than `timeout_ms`: `(thread, op, key, silent_ms)`.
    fn silent(&self, timeout_ms: u64) -> Vec<(usize, usize, u64, u64)> {
        let now = self.now_ms();
        self.threads
            .iter()
            .enumerate()
            .filter(|(_, beat)| !beat.done.load(Ordering::Relaxed))
            .filter_map(|(thread, beat)| {
                let silent = now.saturating_sub(beat.at_ms.load(Ordering::Relaxed));
                (silent > timeout_ms).then(|| {
                    (
                        thread,
                        beat.op.load(Ordering::Relaxed),
                        beat.key.load(Ordering::Relaxed),
                        silent,
                    )
                })
            })
            .collect()
    }
}

/// Report stalled threads every half second until `stop` is set.
fn spawn_watchdog(heartbeats: Arc<Heartbeats>, stop: Arc<AtomicBool>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        while !stop.load(Ordering::Relaxed) && !heartbeats.finished() {
            thread::sleep(Duration::from_millis(500));
            for (thread, op, key, silent_ms) in heartbeats.silent(2_000) {
                eprintln!("!!! STUCK: thread {thread} at op {op} key=0x{key:016x}, silent for {silent_ms}ms");
            }
        }
    })
}

/// Run `body(thread, op)` for every op of every thread under the watchdog.
fn run_workload<F>(tree: &Arc<Index>, threads: usize, ops_per_thread: usize, body: F) -> Duration
where
    F: Fn(&Index, &bwtree::Participant<'_>, usize, usize) -> u64 + Send + Sync + 'static,
{
    let heartbeats = Arc::new(Heartbeats::new(threads));
    let stop_watchdog = Arc::new(AtomicBool::new(false));
    let watchdog = spawn_watchdog(Arc::clone(&heartbeats), Arc::clone(&stop_watchdog));
    let body = Arc::new(body);

    let start = Instant::now();
    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let tree = Arc::clone(tree);
            let heartbeats = Arc::clone(&heartbeats);
            let body = Arc::clone(&body);
            thread::spawn(move || {
                let worker = tree.participant();
                for op in 0..ops_per_thread {
                    let op_start = Instant::now();
                    let key = body(&tree, &worker, t, op);
                    heartbeats.beat(t, op, key);

                    let op_elapsed = op_start.elapsed();
                    if op_elapsed > Duration::from_millis(100) {
                        eprintln!("[T{t:02}] SLOW op {op} key=0x{key:016x} took {op_elapsed:?}");
                    }
                }
                heartbeats.finish(t);
            })
        })
        .collect();

    for h in handles {
        let _ = h.join();
    }
    let elapsed = start.elapsed();

    stop_watchdog.store(true, Ordering::Relaxed);
    let _ = watchdog.join();
    elapsed
}

fn report(label: &str, ops: usize, elapsed: Duration, tree: &Index) {
    println!(
        "{label} DONE: {ops} ops in {elapsed:?} ({:.0} ops/sec), tree.len()={}",
        ops as f64 / elapsed.as_secs_f64(),
        tree.len()
    );

    match tree.validate() {
        Ok(stats) => println!("{label} stats: {stats:?}"),
        Err(violation) => {
            eprintln!("!!! {label}: {violation}");
            std::process::exit(1);
        }
    }
}

// =============================================================================
// Workload 1: Concurrent Writes - Disjoint Ranges
// =============================================================================

fn run_disjoint_writes(threads: usize, ops_per_thread: usize) {
    println!("\n{}", "=".repeat(80));
    println!("DISJOINT WRITES ({threads} threads, {ops_per_thread} ops/thread)");
    println!("{}", "=".repeat(80));

    let tree: Arc<Index> = Arc::new(BwTree::new());
    let elapsed = run_workload(&tree, threads, ops_per_thread, move |tree, worker, t, op| {
        let key = (t * ops_per_thread + op) as u64;
        if let Err(e) = tree.insert_with(key, key, worker) {
            eprintln!("[T{t:02}] ERROR op {op} key=0x{key:016x}: {e}");
        }
        key
    });

    report("disjoint", threads * ops_per_thread, elapsed, &tree);
    assert_eq!(tree.len(), threads * ops_per_thread);
}

// =============================================================================
// Workload 2: Insert/Erase Churn - High Contention
// =============================================================================

fn run_contention_churn(threads: usize, ops_per_thread: usize, key_space: u64) {
    println!("\n{}", "=".repeat(80));
    println!("CONTENTION CHURN ({threads} threads, {ops_per_thread} ops/thread, {key_space} keys)");
    println!("{}", "=".repeat(80));

    let config = IndexConfig::default().with_duplicates(true).with_page_bytes(128);
    let tree: Arc<Index> = Arc::new(BwTree::with_config(config));
    let elapsed = run_workload(&tree, threads, ops_per_thread, move |tree, worker, t, op| {
        let state = ((t * ops_per_thread + op) as u64)
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1);
        let key = state % key_space;

        let result = if state & (1 << 40) == 0 {
            tree.insert_with(key, t as u64, worker).map(|()| 1)
        } else {
            tree.erase_pair_with(&key, &(t as u64), worker)
        };
        if let Err(e) = result {
            eprintln!("[T{t:02}] ERROR op {op} key=0x{key:016x}: {e}");
        }
        key
    });

    report("churn", threads * ops_per_thread, elapsed, &tree);
}

// =============================================================================
// Main
// =============================================================================

#[cfg(feature = "tracing")]
fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_thread_ids(true)
        .init();
}

#[cfg(not(feature = "tracing"))]
const fn init_tracing() {}

fn main() {
    init_tracing();

    eprintln!("BwTree Concurrent Write Hang Detector");
    eprintln!("=====================================");
    eprintln!("Watchdog will report any thread stuck for >2 seconds.");

    for run in 1..=5 {
        eprintln!("\n--- Run {run}/5 ---");
        run_disjoint_writes(8, 50_000);
        run_contention_churn(8, 50_000, 1_024);
    }

    eprintln!("\nAll runs completed!");
}
