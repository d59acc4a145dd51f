//! In-heap object layout.
//!
//! ```text
//! [Header 16B] [slot_0 8B] ... [slot_{n-1} 8B] [payload, word padded] [hash 8B]?
//! ```
//!
//! Reference slots always sit directly after the header, so any object can
//! be scanned from its class word alone. The trailing hash word only exists
//! on copies of objects whose identity hash was taken before they moved.

use core::ptr;

use crate::{
    Address, ClassWord, ForwardState, Header, HeaderFlags, ObjectType, Slot,
    address::{WORD_SIZE, align_up},
    header::HEADER_SIZE,
};

/// Smallest allocation; every real object carries the full header.
pub const MIN_OBJECT_SIZE: usize = HEADER_SIZE;

/// Static description of an object to allocate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectShape {
    pub object_type: ObjectType,
    pub slot_count: u32,
    pub payload_bytes: usize,
}

impl ObjectShape {
    pub const fn slots(slot_count: u32, payload_bytes: usize) -> Self {
        Self {
            object_type: ObjectType::Slots,
            slot_count,
            payload_bytes,
        }
    }

    pub const fn array(len: u32) -> Self {
        Self {
            object_type: ObjectType::Array,
            slot_count: len,
            payload_bytes: 0,
        }
    }

    pub const fn bytes(len: usize) -> Self {
        Self {
            object_type: ObjectType::Bytes,
            slot_count: 0,
            payload_bytes: len,
        }
    }

    #[inline(always)]
    pub const fn size(&self) -> usize {
        HEADER_SIZE
            + self.slot_count as usize * WORD_SIZE
            + align_up(self.payload_bytes, WORD_SIZE)
    }

    #[inline(always)]
    pub const fn class_word(&self) -> ClassWord {
        ClassWord::new(self.object_type, self.slot_count)
    }
}

/// Write a fresh header at `address` and zero the body. Every slot starts
/// out as the fixnum `0`.
///
/// # Safety
///
/// `address` must be word aligned and own `shape.size()` writable bytes.
pub unsafe fn init_object(address: Address, shape: ObjectShape) {
    let size = shape.size();
    // SAFETY: caller owns [address, address + size)
    unsafe {
        ptr::write(
            address.as_mut_ptr::<Header>(),
            Header::new(shape.class_word(), size),
        );
        ptr::write_bytes(
            address.offset(HEADER_SIZE).as_mut_ptr::<u8>(),
            0,
            size - HEADER_SIZE,
        );
    }
}

#[inline(always)]
pub const fn slot_offset(index: usize) -> usize {
    HEADER_SIZE + index * WORD_SIZE
}

/// Reference slot `index` of `object`.
///
/// # Safety
///
/// `object` must be a live object with more than `index` slots.
#[inline(always)]
pub unsafe fn slot(object: Address, index: usize) -> Slot {
    // SAFETY: index is within the object's slot range per caller
    unsafe { Slot::new(object.offset(slot_offset(index))) }
}

/// Turn `[base, top)` into walkable dead space.
///
/// # Safety
///
/// The range must be word aligned, unused, and writable.
pub unsafe fn fill_hole(base: Address, top: Address) {
    let size = top - base;
    debug_assert!(size % WORD_SIZE == 0, "hole not word sized: {size}");
    if size == 0 {
        return;
    }
    if size == WORD_SIZE {
        // SAFETY: one writable word
        unsafe {
            ptr::write(
                base.as_mut_ptr::<u64>(),
                ClassWord::new(ObjectType::FillerWord, 0).raw(),
            );
        }
        return;
    }
    // SAFETY: at least a full header fits
    unsafe {
        ptr::write(
            base.as_mut_ptr::<Header>(),
            Header::new(ClassWord::new(ObjectType::Filler, 0), size),
        );
    }
}

/// Bytes occupied by the object or hole at `address`.
///
/// Valid in every forwarding state: the size word of an evacuated object
/// is never overwritten.
///
/// # Safety
///
/// `address` must be the start of an object or hole.
#[inline(always)]
pub unsafe fn extent(address: Address) -> usize {
    // SAFETY: caller guarantees an object or hole starts here
    let raw = unsafe { *address.as_ptr::<u64>() };
    if let Some(class) = ClassWord::from_raw(raw) {
        if class.object_type() == ObjectType::FillerWord {
            return WORD_SIZE;
        }
    }
    // SAFETY: everything but a one-word filler has a full header
    unsafe { Header::at(address) }.size()
}

/// What the walker found at a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkKind {
    /// A real object, possibly forwarded or pinned in place.
    Object(ForwardState),
    /// Filler or a reverse-forwarded dead copy.
    Hole,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalkEntry {
    pub address: Address,
    pub size: usize,
    pub kind: WalkKind,
}

/// Linear walk over a fully parsable range of objects and holes.
#[derive(Debug, Clone)]
pub struct ObjectWalker {
    cursor: Address,
    end: Address,
}

impl ObjectWalker {
    /// # Safety
    ///
    /// `[start, end)` must be a sequence of objects and holes with no gaps.
    pub unsafe fn new(start: Address, end: Address) -> Self {
        Self { cursor: start, end }
    }
}

impl Iterator for ObjectWalker {
    type Item = WalkEntry;

    fn next(&mut self) -> Option<WalkEntry> {
        if self.cursor >= self.end {
            return None;
        }
        let address = self.cursor;
        // SAFETY: constructor guarantees the range is parsable
        let size = unsafe { extent(address) };
        debug_assert!(size >= WORD_SIZE, "zero sized entry at {address}");
        // SAFETY: as above
        let raw = unsafe { *address.as_ptr::<u64>() };
        let state = ForwardState::decode(raw);
        let kind = match state {
            ForwardState::NotForwarded(class) if class.object_type().is_hole() => WalkKind::Hole,
            ForwardState::ReverseForwarded(_) => WalkKind::Hole,
            other => WalkKind::Object(other),
        };
        self.cursor = address.offset(size);
        Some(WalkEntry {
            address,
            size,
            kind,
        })
    }
}

// ── Identity hash ─────────────────────────────────────────────────────

/// Hash derived from an address, used until the object first moves.
#[inline(always)]
pub fn address_hash(address: Address) -> u32 {
    ((address.as_usize() >> 3) as u32).wrapping_mul(0x9E37_79B1)
}

/// Identity hash of `object`, stable across moves.
///
/// # Safety
///
/// `object` must be a live, non-forwarded object.
pub unsafe fn identity_hash(object: Address) -> u32 {
    // SAFETY: live object per caller
    let header = unsafe { Header::at(object) };
    if header.has_flag(HeaderFlags::HASH_MOVED) {
        let hash_word = object.offset(header.size() - WORD_SIZE);
        // SAFETY: moved objects carry the trailing hash word
        return unsafe { *hash_word.as_ptr::<u64>() } as u32;
    }
    header.add_flag(HeaderFlags::HASHED);
    address_hash(object)
}
