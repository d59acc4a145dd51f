//! Engine side of the forwarding protocol.
//!
//! The `object` crate owns the bit layout and the CAS transitions; this
//! module adds the cooperative copy of large objects in concurrent mode.
//! While such a copy is in flight the destination's first word is a
//! section counter instead of a class word:
//!
//! ```text
//! bits 0..2    zero (never the class tag 0b11)
//! bits 2..32   sections claimed
//! bits 32..64  sections done
//! ```
//!
//! The destination's size field holds the winner's copy size, which can
//! differ from the original's size under a custom object model.
//!
//! Any thread that meets `BeingCopied(dest)` claims sections until none are
//! left, then waits for the winner to publish `Forwarded(dest)`.

use std::{
    hint, ptr,
    sync::atomic::{AtomicU64, Ordering},
    thread,
};

use object::{Address, ClassWord, ForwardState, HEADER_SIZE, Header};

const CLAIM_UNIT: u64 = 1 << 2;
const CLAIM_MASK: u64 = 0xFFFF_FFFC;
const DONE_UNIT: u64 = 1 << 32;
const CLASS_TAG_MASK: u64 = 0b11;

const SPINS_BEFORE_YIELD: u32 = 64;

/// Snapshot of an evacuate-space object's forwarding state plus the
/// transitions that race on it.
#[derive(Debug)]
pub struct ForwardedHeader<'a> {
    object: Address,
    header: &'a Header,
    state: ForwardState,
}

impl<'a> ForwardedHeader<'a> {
    /// # Safety
    ///
    /// `object` must be the start of an object that stays mapped for `'a`.
    #[inline(always)]
    pub unsafe fn new(object: Address) -> Self {
        // SAFETY: per caller
        let header = unsafe { Header::at(object) };
        Self {
            object,
            header,
            state: header.forward_state(),
        }
    }

    #[inline(always)]
    pub fn object(&self) -> Address {
        self.object
    }

    #[inline(always)]
    pub fn header(&self) -> &'a Header {
        self.header
    }

    #[inline(always)]
    pub fn state(&self) -> ForwardState {
        self.state
    }

    #[inline(always)]
    pub fn is_forwarded_pointer(&self) -> bool {
        self.state.is_forwarded_pointer()
    }

    #[inline(always)]
    pub fn is_self_forwarded(&self) -> bool {
        matches!(self.state, ForwardState::SelfForwarded(_))
    }

    /// Class word while nobody has claimed the object yet.
    #[inline(always)]
    pub fn class_word(&self) -> Option<ClassWord> {
        match self.state {
            ForwardState::NotForwarded(class) => Some(class),
            _ => None,
        }
    }

    /// Where the object lives now, if anyone claimed it.
    #[inline(always)]
    pub fn forwarded_object(&self) -> Option<Address> {
        match self.state {
            ForwardState::Forwarded(dest) | ForwardState::BeingCopied(dest) => Some(dest),
            ForwardState::SelfForwarded(_) => Some(self.object),
            ForwardState::NotForwarded(_) | ForwardState::ReverseForwarded(_) => None,
        }
    }

    /// Race to forward to `dest`. `true` if this thread won.
    #[inline]
    pub fn set_forwarded_object(&mut self, class: ClassWord, dest: Address) -> bool {
        self.state = self.header.forwarding().set_forwarded_object(class, dest);
        self.state == ForwardState::Forwarded(dest)
    }

    /// Race to claim the object for a sectioned copy into `dest`. The
    /// section counter in `dest` must already be initialised.
    #[inline]
    pub fn set_forwarded_object_with_being_copied_hint(
        &mut self,
        class: ClassWord,
        dest: Address,
    ) -> bool {
        self.state = self
            .header
            .forwarding()
            .set_forwarded_object_with_being_copied_hint(class, dest);
        self.state == ForwardState::BeingCopied(dest)
    }

    /// Race to pin the object in place. `true` if this thread won.
    #[inline]
    pub fn set_self_forwarded_object(&mut self, class: ClassWord) -> bool {
        self.state = self.header.forwarding().set_self_forwarded_object(class);
        self.state == ForwardState::SelfForwarded(class)
    }

    /// Re-read the forwarding word.
    #[inline]
    pub fn refresh(&mut self) -> ForwardState {
        self.state = self.header.forward_state();
        self.state
    }

    /// Help an in-flight sectioned copy and wait until it is published.
    /// Returns the final destination.
    pub fn copy_or_wait(&mut self, dest: Address, section_size: usize) -> Address {
        // SAFETY: dest is the winner's reservation, at least a header long
        let copy_size = unsafe { Header::at(dest) }.size();
        copy_sections(self.object, dest, copy_size, section_size);
        let mut spins = 0;
        while let ForwardState::BeingCopied(_) = self.refresh() {
            backoff(&mut spins);
        }
        self.forwarded_object().unwrap_or(dest)
    }

    /// Copy sections as the claiming thread and wait for helpers to finish.
    /// The caller fixes up the header and publishes with
    /// [`complete_copy`](Self::complete_copy).
    pub fn copy_or_wait_winner(&self, dest: Address, copy_size: usize, section_size: usize) {
        copy_sections(self.object, dest, copy_size, section_size);
        let total = section_count(copy_size, section_size);
        let counter = counter_word(dest);
        let mut spins = 0;
        while counter.load(Ordering::Acquire) / DONE_UNIT < total {
            backoff(&mut spins);
        }
    }

    #[inline]
    pub fn complete_copy(&mut self, dest: Address) {
        self.header.forwarding().complete_copy(dest);
        self.state = ForwardState::Forwarded(dest);
    }
}

/// Prepare `dest` to receive a sectioned copy of `copy_size` bytes.
#[inline]
pub fn init_section_counter(dest: Address, copy_size: usize) {
    counter_word(dest).store(0, Ordering::Relaxed);
    // SAFETY: the destination reservation is at least a header long
    unsafe { Header::at(dest) }.set_size(copy_size);
}

#[inline(always)]
fn counter_word<'a>(dest: Address) -> &'a AtomicU64 {
    // SAFETY: the destination reservation is at least a header long
    unsafe { &*dest.as_ptr::<AtomicU64>() }
}

#[inline(always)]
fn section_count(copy_size: usize, section_size: usize) -> u64 {
    (copy_size.saturating_sub(HEADER_SIZE)).div_ceil(section_size) as u64
}

fn copy_sections(original: Address, dest: Address, copy_size: usize, section_size: usize) {
    let total = section_count(copy_size, section_size);
    let counter = counter_word(dest);
    let mut current = counter.load(Ordering::Acquire);
    loop {
        if current & CLASS_TAG_MASK != 0 {
            // already published
            return;
        }
        let claimed = (current & CLAIM_MASK) / CLAIM_UNIT;
        if claimed >= total {
            return;
        }
        match counter.compare_exchange_weak(
            current,
            current + CLAIM_UNIT,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                let start = HEADER_SIZE + claimed as usize * section_size;
                let end = (start + section_size).min(copy_size);
                // SAFETY: the claim gives this thread exclusive ownership of
                // [start, end) in the destination; the source is immutable
                unsafe {
                    ptr::copy_nonoverlapping(
                        original.offset(start).as_ptr::<u8>(),
                        dest.offset(start).as_mut_ptr::<u8>(),
                        end - start,
                    );
                }
                current = counter.fetch_add(DONE_UNIT, Ordering::AcqRel) + DONE_UNIT;
            }
            Err(updated) => current = updated,
        }
    }
}

#[inline]
fn backoff(spins: &mut u32) {
    if *spins < SPINS_BEFORE_YIELD {
        *spins += 1;
        hint::spin_loop();
    } else {
        thread::yield_now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object::{ObjectShape, init_object, slot};
    use std::sync::{Arc, Barrier};

    fn create_test_object(memory: &mut [u64], shape: ObjectShape) -> Address {
        let object = Address::from_ptr(memory.as_mut_ptr());
        // SAFETY: the scratch slice is big enough for the shape
        unsafe { init_object(object, shape) };
        object
    }

    #[test]
    fn test_single_winner_for_forwarding() {
        let mut memory = vec![0u64; 64];
        let shape = ObjectShape::slots(1, 0);
        let object = create_test_object(&mut memory, shape);
        let first = object.offset(128);
        let second = object.offset(256);

        // SAFETY: object is live
        let mut a = unsafe { ForwardedHeader::new(object) };
        // SAFETY: as above
        let mut b = unsafe { ForwardedHeader::new(object) };
        assert!(a.set_forwarded_object(shape.class_word(), first));
        assert!(!b.set_forwarded_object(shape.class_word(), second));
        assert_eq!(b.forwarded_object(), Some(first), "loser sees the winner");
        assert!(b.is_forwarded_pointer());
    }

    #[test]
    fn test_self_forwarding_reports_original() {
        let mut memory = vec![0u64; 8];
        let shape = ObjectShape::bytes(8);
        let object = create_test_object(&mut memory, shape);
        // SAFETY: object is live
        let mut header = unsafe { ForwardedHeader::new(object) };
        assert!(header.set_self_forwarded_object(shape.class_word()));
        assert!(header.is_self_forwarded());
        assert_eq!(header.forwarded_object(), Some(object));
    }

    #[test]
    fn test_sectioned_copy_with_helpers() {
        let len = 200u32;
        let shape = ObjectShape::array(len);
        let words = shape.size() / 8;
        let mut source = vec![0u64; words];
        let mut target = vec![0u64; words];
        let object = create_test_object(&mut source, shape);
        for i in 0..len as usize {
            // SAFETY: i < len
            unsafe { slot(object, i) }.store(object::Value::from_i64(i as i64));
        }
        let dest = Address::from_ptr(target.as_mut_ptr());
        init_section_counter(dest, shape.size());

        // SAFETY: object is live
        let mut winner = unsafe { ForwardedHeader::new(object) };
        assert!(winner.set_forwarded_object_with_being_copied_hint(shape.class_word(), dest));

        let object_raw = object.as_usize();
        let dest_raw = dest.as_usize();
        let barrier = Arc::new(Barrier::new(4));
        let helpers: Vec<_> = (0..3)
            .map(|_| {
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    // SAFETY: both buffers outlive the helpers (joined below)
                    let mut helper =
                        unsafe { ForwardedHeader::new(Address::from_usize(object_raw)) };
                    helper.copy_or_wait(Address::from_usize(dest_raw), 64)
                })
            })
            .collect();

        barrier.wait();
        winner.copy_or_wait_winner(dest, shape.size(), 64);
        // SAFETY: all sections are done, dest is ours again
        unsafe { Header::at(dest) }.forwarding().restore(shape.class_word());
        winner.complete_copy(dest);

        for helper in helpers {
            assert_eq!(helper.join().expect("Thread panicked"), dest);
        }
        for i in 0..len as usize {
            // SAFETY: i < len
            let value = unsafe { slot(dest, i) }.load();
            assert_eq!(value.as_i64(), Some(i as i64), "slot {i} not copied");
        }
    }

    #[test]
    fn test_helpers_copy_the_winners_size() {
        let shape = ObjectShape::array(40);
        let words = shape.size() / 8;
        let mut source = vec![0xCDu64; words + 16];
        let mut target = vec![0xABu64; words + 16];
        let object = create_test_object(&mut source, shape);
        let dest = Address::from_ptr(target.as_mut_ptr());
        init_section_counter(dest, shape.size());

        // SAFETY: object is live
        let mut winner = unsafe { ForwardedHeader::new(object) };
        assert!(winner.set_forwarded_object_with_being_copied_hint(shape.class_word(), dest));
        // the original claims more bytes than the winner copies
        // SAFETY: as above
        unsafe { Header::at(object) }.set_size(shape.size() + 64);

        let object_raw = object.as_usize();
        let dest_raw = dest.as_usize();
        let helper = thread::spawn(move || {
            // SAFETY: both buffers outlive the helper (joined below)
            let mut helper = unsafe { ForwardedHeader::new(Address::from_usize(object_raw)) };
            helper.copy_or_wait(Address::from_usize(dest_raw), 32)
        });
        winner.copy_or_wait_winner(dest, shape.size(), 32);
        // SAFETY: all sections are done, dest is ours again
        unsafe { Header::at(dest) }.forwarding().restore(shape.class_word());
        winner.complete_copy(dest);

        assert_eq!(helper.join().expect("Thread panicked"), dest);
        assert!(target[words..].iter().all(|&word| word == 0xAB), "copied past the copy size");
    }
}
