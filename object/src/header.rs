use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};

use crate::{Address, ForwardState, ForwardingWord};

/// Oldest age an object can reach in the nursery; ages saturate here.
pub const AGE_MAX: u8 = 14;

/// Object type tag stored in bits 2..7 of the class word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjectType {
    /// Fixed number of reference slots followed by raw payload bytes.
    Slots = 0,
    /// Indexable reference array; large instances are scanned in pieces.
    Array,
    /// Raw bytes only, never contains references.
    Bytes,
    /// Dead hole of `size` bytes.
    Filler,
    /// Dead hole of exactly one word. Has no second header word.
    FillerWord,
}

impl ObjectType {
    pub const COUNT: usize = Self::FillerWord as usize + 1;

    #[inline(always)]
    pub const fn is_hole(self) -> bool {
        matches!(self, Self::Filler | Self::FillerWord)
    }

    #[inline(always)]
    pub const fn is_indexable(self) -> bool {
        matches!(self, Self::Array)
    }
}

/// GC bookkeeping flags stored atomically in the second header word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct HeaderFlags(pub u8);

impl HeaderFlags {
    pub const NONE: Self = Self(0);
    /// Tenured object recorded in the remembered set.
    pub const REMEMBERED: Self = Self(1 << 0);
    /// Identity hash was derived from the current address.
    pub const HASHED: Self = Self(1 << 1);
    /// Identity hash lives in the trailing word appended on a move.
    pub const HASH_MOVED: Self = Self(1 << 2);

    #[inline(always)]
    pub const fn contains(self, flag: Self) -> bool {
        self.0 & flag.0 == flag.0
    }

    #[inline(always)]
    pub const fn with(self, flag: Self) -> Self {
        Self(self.0 | flag.0)
    }

    #[inline(always)]
    pub const fn without(self, flag: Self) -> Self {
        Self(self.0 & !flag.0)
    }
}

const CLASS_TAG: u64 = 0b11;
const TAG_MASK: u64 = 0b11;
const TYPE_SHIFT: u32 = 2;
const TYPE_MASK: u64 = 0b1_1111;
const SELF_FORWARDED_BIT: u64 = 1 << 7;
const SLOT_COUNT_SHIFT: u32 = 8;
const SLOT_COUNT_MASK: u64 = u32::MAX as u64;

/// The immutable first header word of a live object.
///
/// ```text
/// bits 0..2    tag = 0b11
/// bits 2..7    object type
/// bit  7       self-forwarded (object stays in place this cycle)
/// bits 8..40   reference slot count
/// bits 40..64  reserved (zero)
/// ```
///
/// The word is copied verbatim into every copy of the object, which is
/// what lets a failed scavenge restore the original header exactly.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ClassWord(u64);

impl ClassWord {
    #[inline(always)]
    pub const fn new(object_type: ObjectType, slot_count: u32) -> Self {
        Self(
            CLASS_TAG
                | ((object_type as u64) << TYPE_SHIFT)
                | ((slot_count as u64) << SLOT_COUNT_SHIFT),
        )
    }

    #[inline(always)]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Decode a raw word, `None` unless it carries the class tag.
    #[inline(always)]
    pub const fn from_raw(raw: u64) -> Option<Self> {
        if raw & TAG_MASK == CLASS_TAG {
            Some(Self(raw))
        } else {
            None
        }
    }

    #[inline(always)]
    pub fn object_type(self) -> ObjectType {
        let raw = ((self.0 >> TYPE_SHIFT) & TYPE_MASK) as u8;
        debug_assert!((raw as usize) < ObjectType::COUNT);
        // SAFETY: only `ClassWord::new` produces the type bits
        unsafe { core::mem::transmute::<u8, ObjectType>(raw) }
    }

    #[inline(always)]
    pub const fn slot_count(self) -> usize {
        ((self.0 >> SLOT_COUNT_SHIFT) & SLOT_COUNT_MASK) as usize
    }

    #[inline(always)]
    pub const fn is_self_forwarded(self) -> bool {
        self.0 & SELF_FORWARDED_BIT != 0
    }

    #[inline(always)]
    pub const fn self_forwarded(self) -> Self {
        Self(self.0 | SELF_FORWARDED_BIT)
    }

    #[inline(always)]
    pub const fn without_self_forwarded(self) -> Self {
        Self(self.0 & !SELF_FORWARDED_BIT)
    }
}

impl core::fmt::Debug for ClassWord {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ClassWord")
            .field("type", &self.object_type())
            .field("slots", &self.slot_count())
            .field("self_forwarded", &self.is_self_forwarded())
            .finish()
    }
}

/// The 16-byte header at the start of every heap object.
///
/// ```text
/// word 0:      class word or forwarding state (atomic, see ForwardingWord)
/// bytes 8‥12:  size in bytes, header included
/// byte 12:     flags (atomic) — Remembered | Hashed | HashMoved
/// byte 13:     age   (atomic) — scavenges survived in the nursery
/// bytes 14‥16: reserved (zero)
/// ```
///
/// Only word 0 is ever overwritten by the collector on the original
/// object; size, flags and age of an evacuated object stay readable while
/// it is forwarded.
#[repr(C)]
pub struct Header {
    class: ForwardingWord,
    size: AtomicU32,
    flags: AtomicU8,
    age: AtomicU8,
    _reserved: [u8; 2],
}

pub const HEADER_SIZE: usize = size_of::<Header>();

const _: () = assert!(HEADER_SIZE == 16);

impl Header {
    pub fn new(class: ClassWord, size: usize) -> Self {
        debug_assert!(size <= u32::MAX as usize, "object too large: {size}");
        Self {
            class: ForwardingWord::new(class),
            size: AtomicU32::new(size as u32),
            flags: AtomicU8::new(0),
            age: AtomicU8::new(0),
            _reserved: [0; 2],
        }
    }

    /// # Safety
    ///
    /// `address` must point at a live, initialised object header that stays
    /// mapped for `'a`.
    #[inline(always)]
    pub unsafe fn at<'a>(address: Address) -> &'a Header {
        debug_assert!(address.is_aligned(8));
        // SAFETY: guaranteed by caller
        unsafe { &*address.as_ptr::<Header>() }
    }

    #[inline(always)]
    pub fn forwarding(&self) -> &ForwardingWord {
        &self.class
    }

    /// Current forwarding state of word 0.
    #[inline(always)]
    pub fn forward_state(&self) -> ForwardState {
        self.class.load()
    }

    /// Class word of an object that is not forwarded elsewhere.
    #[inline(always)]
    pub fn class_word(&self) -> Option<ClassWord> {
        match self.class.load() {
            ForwardState::NotForwarded(class) | ForwardState::SelfForwarded(class) => Some(class),
            _ => None,
        }
    }

    // ── size ───────────────────────────────────────────────────────

    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed) as usize
    }

    #[inline(always)]
    pub fn set_size(&self, size: usize) {
        debug_assert!(size <= u32::MAX as usize);
        self.size.store(size as u32, Ordering::Relaxed);
    }

    // ── flags ──────────────────────────────────────────────────────

    #[inline(always)]
    pub fn flags(&self) -> HeaderFlags {
        HeaderFlags(self.flags.load(Ordering::Relaxed))
    }

    #[inline(always)]
    pub fn set_flags(&self, flags: HeaderFlags) {
        self.flags.store(flags.0, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn has_flag(&self, flag: HeaderFlags) -> bool {
        self.flags().contains(flag)
    }

    #[inline(always)]
    pub fn add_flag(&self, flag: HeaderFlags) {
        self.flags.fetch_or(flag.0, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn remove_flag(&self, flag: HeaderFlags) {
        self.flags.fetch_and(!flag.0, Ordering::Relaxed);
    }

    /// Atomically OR flags and return the *previous* flags value.
    #[inline(always)]
    pub fn fetch_or_flags(&self, flag: HeaderFlags) -> HeaderFlags {
        HeaderFlags(self.flags.fetch_or(flag.0, Ordering::AcqRel))
    }

    /// Atomically clear flags and return the *previous* flags value.
    #[inline(always)]
    pub fn fetch_and_clear_flags(&self, flag: HeaderFlags) -> HeaderFlags {
        HeaderFlags(self.flags.fetch_and(!flag.0, Ordering::AcqRel))
    }

    // ── age ────────────────────────────────────────────────────────

    #[inline(always)]
    pub fn age(&self) -> u8 {
        self.age.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn set_age(&self, age: u8) {
        debug_assert!(age <= AGE_MAX);
        self.age.store(age, Ordering::Relaxed);
    }
}

impl core::fmt::Debug for Header {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Header")
            .field("state", &self.forward_state())
            .field("size", &self.size())
            .field("flags", &self.flags())
            .field("age", &self.age())
            .finish()
    }
}
