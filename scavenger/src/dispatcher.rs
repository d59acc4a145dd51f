use std::thread;

/// Runs one task on several GC threads.
pub trait Dispatcher: Send + Sync {
    /// Call `task(id)` for every `id` in `0..threads`, concurrently, and
    /// return once all calls have returned.
    fn run(&self, threads: usize, task: &(dyn Fn(usize) + Sync));

    /// Threads this dispatcher suggests for a collection that may use up
    /// to `limit`.
    fn recommended_threads(&self, limit: usize) -> usize {
        limit
    }
}

/// Spawns named scoped threads per dispatch; worker 0 runs on the caller.
#[derive(Debug, Clone)]
pub struct ThreadPoolDispatcher {
    max_threads: usize,
}

impl ThreadPoolDispatcher {
    pub fn new(max_threads: usize) -> Self {
        Self {
            max_threads: max_threads.max(1),
        }
    }
}

impl Dispatcher for ThreadPoolDispatcher {
    fn run(&self, threads: usize, task: &(dyn Fn(usize) + Sync)) {
        if threads <= 1 {
            task(0);
            return;
        }
        thread::scope(|scope| {
            for id in 1..threads {
                thread::Builder::new()
                    .name(format!("scavenger-worker-{id}"))
                    .spawn_scoped(scope, move || task(id))
                    .expect("spawn scavenger worker");
            }
            task(0);
        });
    }

    fn recommended_threads(&self, limit: usize) -> usize {
        limit.min(self.max_threads).min(num_cpus::get()).max(1)
    }
}
