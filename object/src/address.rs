use core::{
    fmt,
    ops::{Add, Sub},
};

pub const WORD_SIZE: usize = size_of::<u64>();

/// A machine address inside (or at the edge of) a heap region.
///
/// Heap objects are always word aligned; addresses handed out by the
/// allocators keep the low three bits clear so the tagging schemes in
/// [`Value`](crate::Value) and [`ForwardingWord`](crate::ForwardingWord)
/// can use them.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct Address(usize);

impl Address {
    pub const NULL: Self = Self(0);

    #[inline(always)]
    pub const fn from_usize(raw: usize) -> Self {
        Self(raw)
    }

    #[inline(always)]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }

    #[inline(always)]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    #[inline(always)]
    pub const fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    #[inline(always)]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    #[inline(always)]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline(always)]
    pub const fn offset(self, bytes: usize) -> Self {
        Self(self.0 + bytes)
    }

    /// Distance in bytes from `base` up to `self`.
    #[inline(always)]
    pub const fn offset_from(self, base: Address) -> usize {
        debug_assert!(self.0 >= base.0);
        self.0 - base.0
    }

    #[inline(always)]
    pub const fn is_aligned(self, align: usize) -> bool {
        self.0 & (align - 1) == 0
    }

    #[inline(always)]
    pub const fn align_up(self, align: usize) -> Self {
        Self(align_up(self.0, align))
    }
}

/// Round `value` up to the next multiple of `align` (a power of two).
#[inline(always)]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

impl Add<usize> for Address {
    type Output = Address;

    #[inline(always)]
    fn add(self, rhs: usize) -> Address {
        self.offset(rhs)
    }
}

impl Sub<Address> for Address {
    type Output = usize;

    #[inline(always)]
    fn sub(self, rhs: Address) -> usize {
        self.offset_from(rhs)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}
