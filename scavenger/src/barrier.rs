use parking_lot::{Condvar, Mutex};

/// A reusable synchronization barrier that puts threads to sleep.
///
/// Unlike `std::sync::Barrier` the participant count is supplied per call,
/// so the same barrier serves increments with different thread counts.
#[derive(Debug, Default)]
pub struct SenseBarrier {
    /// Protected state: (current_count, current_sense)
    state: Mutex<(usize, bool)>,
    cvar: Condvar,
}

impl SenseBarrier {
    pub fn new() -> Self {
        Self {
            state: Mutex::new((0, false)),
            cvar: Condvar::new(),
        }
    }

    /// Blocks the current thread until `until` threads have called this
    /// function. Returns `true` on exactly one thread, the last to arrive.
    pub fn wait(&self, until: usize) -> bool {
        if until <= 1 {
            return true;
        }
        let mut state = self.state.lock();

        let my_sense = state.1;

        state.0 += 1;

        if state.0 == until {
            // LAST
            state.0 = 0;
            state.1 = !my_sense;

            self.cvar.notify_all();
            true
        } else {
            // FOLLOWER
            while state.1 == my_sense {
                self.cvar.wait(&mut state);
            }
            false
        }
    }
}
