//! Back-out: undo a stop-the-world scavenge that ran out of room.
//!
//! Originals in evacuate space are untouched by copying apart from their
//! forwarding word, so the heap is restored by reinstating each original's
//! class word, pointing every updated slot back at the original and
//! dropping the copies.

use std::sync::atomic::Ordering;

use object::{Address, ForwardState, Header, Slot, Value, WalkKind};

use crate::{
    engine::{BackOutState, Scavenger},
    object_model::{ObjectModel, ScanReason},
    roots::RootBuffer,
    worker::WorkerContext,
};

impl<M: ObjectModel> Scavenger<M> {
    /// Run by one thread after every worker stopped.
    pub(crate) fn back_out(&self, ctx: &mut WorkerContext, roots: &RootBuffer) {
        self.cycle
            .backout
            .store(BackOutState::Started as u8, Ordering::Release);
        let mark = self.tenure_mark();
        log::warn!(
            "backing out scavenge #{}: survivor and tenure space exhausted",
            self.cycle.gc_count.load(Ordering::Relaxed)
        );

        for cache in self.scan_queue.drain() {
            self.cache_pool.push(cache);
        }
        self.reverse_forwarded_objects();

        let restore = |slot: Slot| self.restore_original(slot, mark);
        for slot in roots.slots() {
            restore(slot);
        }
        let overflowed = self.remembered_set.is_overflowed();
        if overflowed {
            // SAFETY: tenure below the mark predates the cycle and is parsable
            let walker = unsafe { object::ObjectWalker::new(self.heap.tenure().base(), mark) };
            for entry in walker {
                if matches!(entry.kind, WalkKind::Object(ForwardState::NotForwarded(_)))
                    && self.model.is_remembered(entry.address)
                {
                    self.restore_object_slots(entry.address, &restore);
                }
            }
        } else {
            for object in self.remembered_set.objects() {
                if object < mark {
                    self.restore_object_slots(object, &restore);
                }
            }
            self.remembered_set.remove_where(|object| object >= mark);
        }

        self.model.back_out();
        self.survivor_space().reset();
        self.heap.tenure().rewind(mark);
        if overflowed {
            self.rebuild_remembered_set();
        }
        ctx.stats.backout = true;
    }

    /// Give originals their class word back; turn copies into pointers to
    /// their original.
    fn reverse_forwarded_objects(&self) {
        // SAFETY: all workers are parked; evacuate space only holds
        // originals and holes
        for entry in unsafe { self.evacuate_space().walk() } {
            let class = match entry.kind {
                WalkKind::Object(ForwardState::Forwarded(dest)) => {
                    // SAFETY: the copy was finished before its address was published
                    let copy = unsafe { Header::at(dest) };
                    let Some(class) = copy.class_word() else {
                        debug_assert!(false, "copy {dest} of {} has no class", entry.address);
                        continue;
                    };
                    copy.forwarding().set_reverse_forwarded(entry.address);
                    class
                }
                WalkKind::Object(ForwardState::SelfForwarded(class)) => class,
                _ => continue,
            };
            // SAFETY: the walker yields object starts with full headers
            unsafe { Header::at(entry.address) }.forwarding().restore(class);
        }
    }

    /// Point `slot` back at the original if it holds a discarded copy.
    fn restore_original(&self, slot: Slot, mark: Address) {
        let Some(target) = slot.load().address() else {
            return;
        };
        let is_copy = self.survivor_space().contains(target)
            || (self.heap.is_in_tenure(target) && target >= mark);
        if !is_copy {
            return;
        }
        // SAFETY: copies stay mapped until the spaces are reset
        if let ForwardState::ReverseForwarded(original) = unsafe { Header::at(target) }.forward_state()
        {
            slot.store(Value::reference(original));
        }
    }

    fn restore_object_slots(&self, object: Address, restore: &dyn Fn(Slot)) {
        // SAFETY: remembered objects below the mark are live and tenured
        let Some(class) = unsafe { Header::at(object) }.class_word() else {
            return;
        };
        for slot in self.model.scanner(object, class, ScanReason::Backout) {
            restore(slot);
        }
        if self.model.has_indirect_object_referents(object) {
            self.model
                .visit_indirect_referents(object, &mut |slot| restore(slot));
        }
    }
}
