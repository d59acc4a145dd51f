use crate::Address;

const FIXNUM_MASK: u64 = 0b1;
const TAG_MASK: u64 = 0b11;
const REF_TAG: u64 = 0b01;
const HEADER_TAG: u64 = 0b11;

/// A tagged 64-bit slot value.
///
/// Encoding:
/// - **Fixnum**:    `...XXXXX0` — 63-bit signed integer (low bit 0).
///   The all-zero word is the fixnum `0` and doubles as "no reference".
/// - **Reference**: `...XXXX01` — heap address with the tag folded into the
///   low bits (objects are word aligned, so the bits are free).
/// - **Header**:    `...XXXX11` — never valid inside a reference slot.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Value(u64);

impl Value {
    pub const ZERO: Self = Self(0);

    #[inline(always)]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline(always)]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    // ── Fixnum ─────────────────────────────────────────────────────

    #[inline(always)]
    pub const fn is_fixnum(self) -> bool {
        self.0 & FIXNUM_MASK == 0
    }

    #[inline(always)]
    pub fn from_i64(n: i64) -> Self {
        debug_assert!(
            (-(1i64 << 62)..(1i64 << 62)).contains(&n),
            "fixnum overflow: {n}"
        );
        Self((n << 1) as u64)
    }

    /// Returns `None` for anything that is not a fixnum.
    #[inline(always)]
    pub const fn as_i64(self) -> Option<i64> {
        if self.is_fixnum() {
            Some((self.0 as i64) >> 1)
        } else {
            None
        }
    }

    // ── Reference ──────────────────────────────────────────────────

    #[inline(always)]
    pub const fn is_ref(self) -> bool {
        self.0 & TAG_MASK == REF_TAG
    }

    #[inline(always)]
    pub fn reference(address: Address) -> Self {
        debug_assert!(!address.is_null(), "null reference");
        debug_assert!(
            address.as_usize() as u64 & TAG_MASK == 0,
            "reference target not aligned: {address}"
        );
        Self(address.as_usize() as u64 | REF_TAG)
    }

    /// The referenced address, if this value is a reference.
    #[inline(always)]
    pub const fn address(self) -> Option<Address> {
        if self.is_ref() {
            Some(Address::from_usize((self.0 & !TAG_MASK) as usize))
        } else {
            None
        }
    }

    #[inline(always)]
    pub const fn is_header(self) -> bool {
        self.0 & TAG_MASK == HEADER_TAG
    }
}

impl Default for Value {
    fn default() -> Self {
        Self::ZERO
    }
}

impl core::fmt::Debug for Value {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if let Some(n) = self.as_i64() {
            write!(f, "Fixnum({n})")
        } else if let Some(address) = self.address() {
            write!(f, "Ref({address})")
        } else {
            write!(f, "Header(0x{:016x})", self.0)
        }
    }
}
