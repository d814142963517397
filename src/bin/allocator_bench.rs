//! Pool allocator microbenchmark
//!
//! Fills a ~32 MiB pool with random-sized allocations, then frees them all
//! in arbitrary order, asserting the allocator's bookkeeping after every
//! operation. Latency and efficiency figures go to stderr. Runs both
//! allocator variants; takes no flags.

use rand::prelude::*;
use shmstructs::{Allocator, LogarithmicAllocator, Pool, SimpleAllocator};
use std::rc::Rc;
use std::time::Instant;

const POOL_NAME: &str = "shmstructs-benchmark";
const POOL_TARGET: u64 = 32 * 1024 * 1024 - 16;
const MIN_ALLOC_SIZE: u64 = 0;
const MAX_ALLOC_SIZE: u64 = 1024;
const REPORT_INTERVAL: usize = 100;

fn create_allocator(pool: Rc<Pool>, kind: &str) -> Rc<dyn Allocator> {
    match kind {
        "simple" => Rc::new(SimpleAllocator::attach(pool).expect("attach simple allocator")),
        "logarithmic" => {
            Rc::new(LogarithmicAllocator::attach(pool).expect("attach logarithmic allocator"))
        }
        other => panic!("unknown allocator type: {other}"),
    }
}

fn efficiency(allocator: &dyn Allocator) -> f64 {
    let pool = allocator.pool();
    allocator.bytes_allocated() as f64 / (pool.size() - allocator.bytes_free()) as f64
}

fn run_benchmark(kind: &str) {
    Pool::delete(POOL_NAME, false).expect("delete benchmark pool");
    let pool = Rc::new(Pool::open(POOL_NAME, 0, false).expect("open benchmark pool"));
    let allocator = create_allocator(Rc::clone(&pool), kind);

    // Pre-size the arena through the allocator so the whole target region
    // is threaded on its free structures.
    let warm = allocator.allocate(POOL_TARGET).expect("pre-size pool");
    allocator.free(warm);
    let target_size = pool.size();
    eprintln!("[{kind}] pool pre-sized to {target_size} bytes");

    let mut rng = rand::thread_rng();
    let mut live: Vec<(u64, u64)> = Vec::new();
    let mut allocated_size = 0u64;
    let mut op_time = 0u128;

    while pool.size() <= target_size {
        let size = rng.gen_range(MIN_ALLOC_SIZE..MAX_ALLOC_SIZE);

        let start = Instant::now();
        let offset = allocator.allocate(size).expect("allocate");
        op_time += start.elapsed().as_nanos();
        live.push((offset, size));
        allocated_size += size;

        assert_eq!(allocated_size, allocator.bytes_allocated());

        if live.len() % REPORT_INTERVAL == 0 {
            eprintln!(
                "allocation #{} ({} nsec/alloc): {} allocated, {} free, {} total, {:.6} efficiency",
                live.len(),
                op_time / REPORT_INTERVAL as u128,
                allocated_size,
                allocator.bytes_free(),
                pool.size(),
                efficiency(allocator.as_ref()),
            );
            op_time = 0;
        }
    }

    live.shuffle(&mut rng);
    op_time = 0;
    while let Some((offset, size)) = live.pop() {
        let start = Instant::now();
        allocator.free(offset);
        op_time += start.elapsed().as_nanos();
        allocated_size -= size;

        assert_eq!(allocated_size, allocator.bytes_allocated());

        if live.len() % REPORT_INTERVAL == 0 {
            eprintln!(
                "free #{} ({} nsec/free): {} allocated, {} free, {} total, {:.6} efficiency",
                live.len(),
                op_time / REPORT_INTERVAL as u128,
                allocated_size,
                allocator.bytes_free(),
                pool.size(),
                efficiency(allocator.as_ref()),
            );
            op_time = 0;
        }
    }

    assert_eq!(allocator.bytes_allocated(), 0);
    eprintln!("[{kind}] done: no leaks");

    drop(allocator);
    drop(pool);
    Pool::delete(POOL_NAME, false).expect("delete benchmark pool");
}

fn main() {
    env_logger::init();
    for kind in ["simple", "logarithmic"] {
        run_benchmark(kind);
    }
}
