use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use object::{Slot, Value};

/// Source of root references.
///
/// Visited once when a stop-the-world increment starts and once when it
/// ends; both visits must present the same slots in the same order.
pub trait RootProvider {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value));
}

impl RootProvider for Vec<Value> {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        for value in self.iter_mut() {
            visitor(value);
        }
    }
}

const ROOT_CHUNK: usize = 64;

/// Roots copied into shared slots so workers can claim them in chunks.
#[derive(Debug, Default)]
pub struct RootBuffer {
    slots: Vec<AtomicU64>,
    cursor: AtomicUsize,
}

impl RootBuffer {
    pub fn collect(provider: &mut dyn RootProvider) -> Self {
        let mut slots = Vec::new();
        provider.visit_roots(&mut |value| slots.push(AtomicU64::new(value.raw())));
        Self {
            slots,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Next unclaimed chunk of root slots.
    pub fn claim(&self) -> Option<impl Iterator<Item = Slot> + '_> {
        let start = self.cursor.fetch_add(ROOT_CHUNK, Ordering::Relaxed);
        if start >= self.slots.len() {
            return None;
        }
        let end = (start + ROOT_CHUNK).min(self.slots.len());
        Some(self.slots[start..end].iter().map(Slot::from_atomic))
    }

    pub fn slots(&self) -> impl Iterator<Item = Slot> + '_ {
        self.slots.iter().map(Slot::from_atomic)
    }

    /// Store the (possibly moved) roots back into the provider.
    pub fn write_back(&self, provider: &mut dyn RootProvider) {
        let mut values = self.slots.iter();
        provider.visit_roots(&mut |value| {
            if let Some(slot) = values.next() {
                *value = Value::from_raw(slot.load(Ordering::Relaxed));
            }
        });
        debug_assert!(values.next().is_none(), "root provider shrank during the cycle");
    }
}
