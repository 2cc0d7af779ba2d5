//! Randomized balanced-tree workload over the collector.
//!
//! Each worker owns a treap of collected nodes and hammers it with a
//! deterministic insert/erase/lookup sequence, exercising allocation,
//! tracing and reclamation while the collector runs in the background.

use std::{thread, time::Instant};

use clap::Parser;
use log::info;

use pauseless::{Collectable, Root, Tracked, UnsafeRef};

struct Node {
    value: i64,
    priority: u64,
    left: Tracked<Node>,
    right: Tracked<Node>,
}

impl Collectable for Node {
    fn visit_edges(&self, visitor: &mut dyn FnMut(*mut u8)) {
        self.left.visit(visitor);
        self.right.visit(visitor);
    }
}

struct Treap {
    root: Root<Node>,
    rng: u64,
}

impl Treap {
    fn new(seed: u64) -> Self {
        Self {
            root: Root::null(),
            rng: seed | 1,
        }
    }

    fn next_priority(&mut self) -> u64 {
        // xorshift64
        let mut x = self.rng;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.rng = x;
        x
    }

    pub fn insert(&mut self, value: i64) {
        let (lower, equal, greater) = self.split_three(value);
        let equal = if equal.is_null() {
            Root::new(Node {
                value,
                priority: self.next_priority(),
                left: Tracked::null(),
                right: Tracked::null(),
            })
        } else {
            equal
        };
        let merged = merge3(lower.get(), equal.get(), greater.get());
        self.root.set(merged);
    }

    pub fn erase(&mut self, value: i64) {
        let (lower, _equal, greater) = self.split_three(value);
        let merged = merge(lower.get(), greater.get());
        self.root.set(merged);
    }

    pub fn contains(&mut self, value: i64) -> bool {
        let (lower, equal, greater) = self.split_three(value);
        let found = !equal.is_null();
        let merged = merge3(lower.get(), equal.get(), greater.get());
        self.root.set(merged);
        found
    }

    /// Splits into (< value, == value, > value), every part anchored.
    fn split_three(&self, value: i64) -> (Root<Node>, Root<Node>, Root<Node>) {
        let lower: Root<Node> = Root::null();
        let equal: Root<Node> = Root::null();
        let equal_or_greater: Root<Node> = Root::null();
        let greater: Root<Node> = Root::null();
        split(self.root.get(), lower.edge(), equal_or_greater.edge(), value);
        split(
            equal_or_greater.get(),
            equal.edge(),
            greater.edge(),
            value + 1,
        );
        (lower, equal, greater)
    }
}

/// Partitions `orig` around `value`, writing the halves through anchored
/// edges so every node stays reachable mid-rotation.
fn split(orig: UnsafeRef<Node>, lower: &Tracked<Node>, greater: &Tracked<Node>, value: i64) {
    if orig.is_null() {
        lower.store(UnsafeRef::null());
        greater.store(UnsafeRef::null());
    } else if orig.value < value {
        lower.store(orig);
        split(orig.right.load(), &orig.right, greater, value);
    } else {
        greater.store(orig);
        split(orig.left.load(), lower, &orig.left, value);
    }
}

fn merge(lower: UnsafeRef<Node>, greater: UnsafeRef<Node>) -> UnsafeRef<Node> {
    if lower.is_null() {
        return greater;
    }
    if greater.is_null() {
        return lower;
    }
    if lower.priority < greater.priority {
        lower.right.store(merge(lower.right.load(), greater));
        lower
    } else {
        greater.left.store(merge(lower, greater.left.load()));
        greater
    }
}

fn merge3(lower: UnsafeRef<Node>, equal: UnsafeRef<Node>, greater: UnsafeRef<Node>) -> UnsafeRef<Node> {
    merge(merge(lower, equal), greater)
}

fn run_worker(ops: usize, seed: u64) -> usize {
    let mut treap = Treap::new(seed);
    let mut value = 5i64;
    let mut hits = 0usize;
    for i in 1..ops {
        value = (value * 57 + 43) % 10007;
        match i % 3 {
            0 => treap.insert(value),
            1 => treap.erase(value),
            _ => hits += usize::from(treap.contains(value)),
        }
    }
    hits
}

#[derive(Parser, Debug)]
#[command(author, version, about = "treap workload over the pauseless collector", long_about = None)]
struct Cli {
    /// Operations per worker
    #[arg(long, default_value_t = 1_000_000)]
    ops: usize,

    /// Worker thread count
    #[arg(long, default_value_t = 1)]
    threads: usize,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let started = Instant::now();
    let workers: Vec<_> = (0..cli.threads)
        .map(|t| {
            let ops = cli.ops;
            thread::spawn(move || run_worker(ops, 0x9E37_79B9 + t as u64))
        })
        .collect();

    let mut hits = 0usize;
    for worker in workers {
        hits += worker.join().expect("worker panicked");
    }

    println!("{hits}");
    println!("{:.3}ms", started.elapsed().as_secs_f64() * 1000.0);

    pauseless::collect();
    info!(
        "drained: {} live objects, {} cycles",
        pauseless::live_objects(),
        pauseless::cycle_count()
    );
    pauseless::shutdown();
}
