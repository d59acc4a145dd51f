use std::sync::atomic::{AtomicU64, Ordering};

use crate::{Address, Value};

/// Location of one reference-holding word, inside a heap object or a
/// root buffer.
///
/// All accesses are atomic so collector threads and mutators can race on
/// the same slot during a concurrent scan.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Slot(Address);

impl Slot {
    /// # Safety
    ///
    /// `address` must be a word-aligned location that stays valid (and is
    /// only accessed atomically) for as long as the slot is used.
    #[inline(always)]
    pub const unsafe fn new(address: Address) -> Self {
        Self(address)
    }

    #[inline(always)]
    pub fn from_atomic(cell: &AtomicU64) -> Self {
        Self(Address::from_ptr(cell as *const AtomicU64))
    }

    #[inline(always)]
    pub const fn address(self) -> Address {
        self.0
    }

    #[inline(always)]
    fn cell(&self) -> &AtomicU64 {
        // SAFETY: upheld by the constructor contract
        unsafe { &*self.0.as_ptr::<AtomicU64>() }
    }

    #[inline(always)]
    pub fn load(self) -> Value {
        Value::from_raw(self.cell().load(Ordering::Acquire))
    }

    #[inline(always)]
    pub fn store(self, value: Value) {
        self.cell().store(value.raw(), Ordering::Release);
    }

    /// Replace `current` with `new` unless someone else changed the slot
    /// first. Returns the value that was found.
    #[inline(always)]
    pub fn compare_exchange(self, current: Value, new: Value) -> Result<Value, Value> {
        self.cell()
            .compare_exchange(current.raw(), new.raw(), Ordering::AcqRel, Ordering::Acquire)
            .map(Value::from_raw)
            .map_err(Value::from_raw)
    }
}

impl core::fmt::Debug for Slot {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Slot({} = {:?})", self.0, self.load())
    }
}
