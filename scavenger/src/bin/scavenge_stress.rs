use clap::{Parser, ValueEnum};
use std::{
    collections::HashSet,
    process,
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::Instant,
};

use object::{Address, Header, ObjectShape, Slot, Value, identity_hash};
use scavenger::{
    CollectOutcome, ConcurrentSettings, ConcurrentStart, LogListener, PercolateReason,
    ScanOrdering, ScanProgress, Scavenger, ScavengerSettings, ScavengerStats, TenureSettings,
};

#[path = "../rng.rs"]
mod rng;

use rng::Rng;

const NODE_SLOTS: u32 = 4;
const ARRAY_EVERY: usize = 64;
const ARRAY_LEN: u32 = 256;
const LEAF_EVERY: usize = 29;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ScanOrder {
    Hierarchical,
    BreadthFirst,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Run the scavenger over a random object graph", long_about = None)]
struct Cli {
    /// Collection cycles to run
    #[arg(long, default_value_t = 10)]
    cycles: usize,

    /// Objects in the initial graph
    #[arg(long, default_value_t = 20_000)]
    objects: usize,

    /// Root slots
    #[arg(long, default_value_t = 64)]
    roots: usize,

    /// GC worker threads (defaults to the CPU count, at most 8)
    #[arg(short, long)]
    threads: Option<usize>,

    #[arg(long, value_enum, default_value_t = ScanOrder::Hierarchical)]
    ordering: ScanOrder,

    /// Run concurrent cycles with a reading mutator thread
    #[arg(long)]
    concurrent: bool,

    #[arg(long, default_value_t = 8, help = "Nursery size in MB")]
    nursery_mb: usize,

    #[arg(long, default_value_t = 64, help = "Tenure space size in MB")]
    tenure_mb: usize,

    /// Fixed tenure age instead of the adaptive policy
    #[arg(long)]
    tenure_age: Option<u8>,

    /// Share of the initial graph size allocated again before each cycle
    #[arg(long, default_value_t = 0.25)]
    churn: f64,

    #[arg(long, default_value_t = 0x5eed)]
    seed: u64,
}

fn slot_of(object: Address, index: usize) -> Slot {
    // SAFETY: only indexes slots of objects allocated with a known shape
    unsafe { object::slot(object, index) }
}

struct Graph {
    rng: Rng,
    next_id: i64,
    /// Reachable objects as of the last verification.
    live: Vec<Address>,
}

impl Graph {
    /// Allocate one object and point its reference slots at random live
    /// objects. `None` once the nursery is full.
    fn grow(&mut self, scavenger: &Scavenger) -> Option<Address> {
        let id = self.next_id;
        let shape = if id as usize % ARRAY_EVERY == ARRAY_EVERY - 1 {
            ObjectShape::array(ARRAY_LEN)
        } else if id as usize % LEAF_EVERY == LEAF_EVERY - 1 {
            ObjectShape::slots(1, 200)
        } else {
            ObjectShape::slots(NODE_SLOTS, 0)
        };
        let object = scavenger.allocate(shape)?;
        self.next_id += 1;
        slot_of(object, 0).store(Value::from_i64(id));
        if id % 7 == 0 {
            // SAFETY: freshly allocated
            unsafe { identity_hash(object) };
        }
        for index in 1..shape.slot_count as usize {
            if !self.live.is_empty() && self.rng.below(3) != 0 {
                let target = self.live[self.rng.below(self.live.len())];
                slot_of(object, index).store(Value::reference(target));
            }
        }
        self.live.push(object);
        Some(object)
    }

    /// Hang `count` fresh objects off random live ones and replace a few
    /// roots.
    fn churn(&mut self, scavenger: &Scavenger, roots: &mut [Value], count: usize) {
        for _ in 0..count {
            let Some(child) = self.grow(scavenger) else {
                log::debug!("nursery full after {} new objects", self.live.len());
                return;
            };
            let parent = self.live[self.rng.below(self.live.len())];
            // SAFETY: live objects have valid headers
            let slots = unsafe { Header::at(parent) }
                .class_word()
                .map_or(0, |class| class.slot_count());
            if slots > 1 {
                let value = Value::reference(child);
                slot_of(parent, 1 + self.rng.below(slots - 1)).store(value);
                scavenger.write_barrier(parent, value);
            }
            if self.rng.below(50) == 0 {
                roots[self.rng.below(roots.len())] = Value::reference(child);
            }
        }
    }
}

/// Depth-first walk: ids and child ids in visit order, plus every
/// reachable object.
fn fingerprint(roots: &[Value], load: &dyn Fn(Slot) -> Value) -> (Vec<i64>, Vec<Address>) {
    let mut seen = HashSet::new();
    let mut order = Vec::new();
    let mut ids = Vec::new();
    let mut stack: Vec<Address> = roots.iter().rev().filter_map(|root| root.address()).collect();
    while let Some(object) = stack.pop() {
        if !seen.insert(object) {
            continue;
        }
        order.push(object);
        // SAFETY: reachable objects are live
        let Some(class) = unsafe { Header::at(object) }.class_word() else {
            ids.push(-3);
            continue;
        };
        ids.push(load(slot_of(object, 0)).as_i64().unwrap_or(-2));
        let mut children = Vec::new();
        for index in 1..class.slot_count() {
            match load(slot_of(object, index)).address() {
                Some(child) => {
                    ids.push(load(slot_of(child, 0)).as_i64().unwrap_or(-2));
                    children.push(child);
                }
                None => ids.push(-1),
            }
        }
        stack.extend(children.into_iter().rev());
    }
    (ids, order)
}

fn plain_load(slot: Slot) -> Value {
    slot.load()
}

fn settings_from(cli: &Cli) -> ScavengerSettings {
    let defaults = ScavengerSettings::default();
    ScavengerSettings {
        nursery_size: cli.nursery_mb * 1024 * 1024,
        tenure_size: cli.tenure_mb * 1024 * 1024,
        worker_threads: cli.threads.unwrap_or(defaults.worker_threads),
        scan_ordering: match cli.ordering {
            ScanOrder::Hierarchical => ScanOrdering::Hierarchical,
            ScanOrder::BreadthFirst => ScanOrdering::BreadthFirst,
        },
        tenure: cli.tenure_age.map_or(defaults.tenure, TenureSettings::fixed),
        concurrent: ConcurrentSettings {
            enabled: cli.concurrent,
            background_threads: cli.threads.unwrap_or(defaults.worker_threads),
            ..ConcurrentSettings::default()
        },
        ..defaults
    }
}

/// One concurrent cycle with a mutator thread re-reading the graph
/// through the read barrier while the background scan runs.
fn concurrent_cycle(
    scavenger: &Scavenger,
    roots: &mut Vec<Value>,
    expected: &[i64],
) -> Result<CollectOutcome, String> {
    let mutator = scavenger.attach_mutator();
    match scavenger
        .concurrent_start(roots)
        .map_err(|err| err.to_string())?
    {
        ConcurrentStart::Started => {}
        ConcurrentStart::Percolated(reason) => return Ok(CollectOutcome::Percolated(reason)),
    }

    let done = AtomicBool::new(false);
    let snapshot = roots.clone();
    let reads = thread::scope(|scope| {
        let reader = scope.spawn(|| {
            let mut passes = 0usize;
            let mut mismatch = false;
            while !done.load(Ordering::Acquire) {
                let (ids, _) = fingerprint(&snapshot, &|slot| mutator.load(slot));
                mismatch |= ids != expected;
                mutator.safepoint();
                passes += 1;
            }
            drop(mutator);
            (passes, mismatch)
        });
        let result = loop {
            match scavenger.main_thread_concurrent_collect() {
                Ok(ScanProgress::Completed) => break Ok(()),
                Ok(ScanProgress::Yielded) => {}
                Err(err) => break Err(err.to_string()),
            }
        };
        done.store(true, Ordering::Release);
        let reads = reader.join().map_err(|_| "mutator thread panicked".to_string());
        result.and(reads)
    })?;
    if reads.1 {
        return Err("mutator saw a different graph during the background scan".into());
    }
    log::debug!("mutator walked the graph {} times during the scan", reads.0);
    scavenger
        .concurrent_complete(roots)
        .map_err(|err| err.to_string())
}

fn print_cycle(cycle: usize, outcome: CollectOutcome, stats: &ScavengerStats, millis: f64) {
    println!(
        "cycle {cycle:>3} {:<28} {millis:>8.2} ms  flip {:>7} obj {:>8} KB  tenure {:>7} obj {:>8} KB  splits {:>4}  aliases {:>6}",
        format!("{outcome:?}"),
        stats.flip_count,
        stats.flip_bytes / 1024,
        stats.tenure_count,
        stats.tenure_bytes / 1024,
        stats.array_split_count,
        stats.alias_to_copy_cache_count,
    );
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let scavenger = match Scavenger::with_settings(settings_from(&cli)) {
        Ok(scavenger) => scavenger,
        Err(err) => {
            eprintln!("Error: {err}");
            process::exit(2);
        }
    };
    scavenger.add_listener(Box::new(LogListener));

    let mut graph = Graph {
        rng: Rng::new(cli.seed),
        next_id: 0,
        live: Vec::new(),
    };
    let mut roots = Vec::with_capacity(cli.roots);
    for _ in 0..cli.objects {
        if graph.grow(&scavenger).is_none() {
            eprintln!("Error: the nursery cannot hold {} objects", cli.objects);
            process::exit(2);
        }
    }
    for _ in 0..cli.roots.max(1) {
        let target = graph.live[graph.rng.below(graph.live.len())];
        roots.push(Value::reference(target));
    }
    graph.live = fingerprint(&roots, &plain_load).1;
    let churn = (cli.objects as f64 * cli.churn) as usize;

    let mut backouts_in_a_row = 0;
    for cycle in 0..cli.cycles {
        if cycle > 0 {
            graph.churn(&scavenger, &mut roots, churn);
        }
        let (expected, _) = fingerprint(&roots, &plain_load);

        let start = Instant::now();
        let outcome = if cli.concurrent {
            concurrent_cycle(&scavenger, &mut roots, &expected)
        } else {
            scavenger.scavenge(&mut roots).map_err(|err| err.to_string())
        };
        let millis = start.elapsed().as_secs_f64() * 1000.0;
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(err) => {
                eprintln!("Error in cycle {cycle}: {err}");
                process::exit(1);
            }
        };
        print_cycle(cycle, outcome, &scavenger.last_cycle_stats(), millis);

        let (actual, reachable) = fingerprint(&roots, &plain_load);
        if actual != expected {
            eprintln!("Error: object graph changed by cycle {cycle}");
            process::exit(1);
        }
        if matches!(outcome, CollectOutcome::Scavenged) {
            let heap = scavenger.heap();
            if let Some(stale) = reachable
                .iter()
                .find(|&&address| !heap.allocate_space().contains(address) && !heap.is_in_tenure(address))
            {
                eprintln!("Error: {stale} is reachable but outside the live spaces after cycle {cycle}");
                process::exit(1);
            }
        }
        graph.live = reachable;

        match outcome {
            CollectOutcome::Scavenged => backouts_in_a_row = 0,
            CollectOutcome::BackedOut => {
                backouts_in_a_row += 1;
                if backouts_in_a_row > 1 {
                    println!("backed out twice in a row; the heap is too small for this graph");
                    break;
                }
            }
            CollectOutcome::Aborted => {
                println!("concurrent cycle aborted; a global collection would be needed next");
                break;
            }
            CollectOutcome::Percolated(PercolateReason::AbortedScavenge) => break,
            CollectOutcome::Percolated(reason) => {
                // nothing moves without a global collector; just reset the policy
                log::info!("percolation ({reason:?}) acknowledged without a global collection");
                scavenger.global_collection_complete();
            }
        }
    }

    let history = scavenger.history();
    println!(
        "{} cycles, {} backed out, {} percolated; tenure age {}, avg tenured {} KB, tilt {}%",
        history.gc_count,
        history.backout_count,
        history.percolate_count,
        history.tenure_age,
        history.avg_tenure_bytes / 1024,
        history.tilt_ratio
    );
}
