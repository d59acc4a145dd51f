use std::sync::atomic::{AtomicU64, Ordering};

use crate::{Address, ClassWord};

const TAG_MASK: u64 = 0b11;
const FORWARDED_TAG: u64 = 0b00;
const BEING_COPIED_TAG: u64 = 0b01;
const REVERSE_FORWARDED_TAG: u64 = 0b10;
const CLASS_TAG: u64 = 0b11;

/// Decoded state of an object's first header word.
///
/// ```text
/// tag 0b11  class word               NotForwarded / SelfForwarded (bit 7)
/// tag 0b00  destination address      Forwarded
/// tag 0b01  destination address      BeingCopied (copy still in progress)
/// tag 0b10  original address         ReverseForwarded (dead copy after back-out)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardState {
    NotForwarded(ClassWord),
    Forwarded(Address),
    BeingCopied(Address),
    SelfForwarded(ClassWord),
    ReverseForwarded(Address),
}

impl ForwardState {
    #[inline(always)]
    pub fn decode(raw: u64) -> Self {
        match raw & TAG_MASK {
            CLASS_TAG => match ClassWord::from_raw(raw) {
                Some(class) if class.is_self_forwarded() => {
                    Self::SelfForwarded(class.without_self_forwarded())
                }
                Some(class) => Self::NotForwarded(class),
                None => unreachable!("class tag without class word"),
            },
            FORWARDED_TAG => {
                debug_assert!(raw != 0, "forwarding word never initialised");
                Self::Forwarded(Address::from_usize(raw as usize))
            }
            BEING_COPIED_TAG => {
                Self::BeingCopied(Address::from_usize((raw & !TAG_MASK) as usize))
            }
            _ => Self::ReverseForwarded(Address::from_usize((raw & !TAG_MASK) as usize)),
        }
    }

    #[inline(always)]
    pub fn encode(self) -> u64 {
        match self {
            Self::NotForwarded(class) => class.raw(),
            Self::SelfForwarded(class) => class.self_forwarded().raw(),
            Self::Forwarded(dest) => tagged(dest, FORWARDED_TAG),
            Self::BeingCopied(dest) => tagged(dest, BEING_COPIED_TAG),
            Self::ReverseForwarded(original) => tagged(original, REVERSE_FORWARDED_TAG),
        }
    }

    /// True once a destination other than the object itself is installed.
    #[inline(always)]
    pub fn is_forwarded_pointer(self) -> bool {
        matches!(self, Self::Forwarded(_) | Self::BeingCopied(_))
    }
}

#[inline(always)]
fn tagged(address: Address, tag: u64) -> u64 {
    let raw = address.as_usize() as u64;
    debug_assert!(raw & TAG_MASK == 0, "unaligned forwarding target {address}");
    raw | tag
}

/// Atomic first header word. The transition methods below are the only
/// writers once an object is published.
#[derive(Debug)]
#[repr(transparent)]
pub struct ForwardingWord(AtomicU64);

impl ForwardingWord {
    pub const fn new(class: ClassWord) -> Self {
        Self(AtomicU64::new(class.raw()))
    }

    #[inline(always)]
    pub fn load(&self) -> ForwardState {
        ForwardState::decode(self.0.load(Ordering::Acquire))
    }

    #[inline(always)]
    pub fn raw(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub fn is_forwarded_pointer(&self) -> bool {
        self.load().is_forwarded_pointer()
    }

    /// Race to install `dest`. Returns the state present after the attempt;
    /// the caller won iff it equals `Forwarded(dest)`.
    #[inline(always)]
    pub fn set_forwarded_object(&self, expected: ClassWord, dest: Address) -> ForwardState {
        self.transition(expected, ForwardState::Forwarded(dest))
    }

    /// Race to claim the object for a sectioned copy into `dest`.
    #[inline(always)]
    pub fn set_forwarded_object_with_being_copied_hint(
        &self,
        expected: ClassWord,
        dest: Address,
    ) -> ForwardState {
        self.transition(expected, ForwardState::BeingCopied(dest))
    }

    /// Race to pin the object in place because no destination exists.
    #[inline(always)]
    pub fn set_self_forwarded_object(&self, expected: ClassWord) -> ForwardState {
        self.transition(expected, ForwardState::SelfForwarded(expected))
    }

    /// Publish a finished sectioned copy.
    #[inline(always)]
    pub fn complete_copy(&self, dest: Address) {
        debug_assert_eq!(self.load(), ForwardState::BeingCopied(dest));
        self.0
            .store(ForwardState::Forwarded(dest).encode(), Ordering::Release);
    }

    /// Put the class word back, undoing any forwarding.
    #[inline(always)]
    pub fn restore(&self, class: ClassWord) {
        self.0.store(class.raw(), Ordering::Release);
    }

    #[inline(always)]
    pub fn set_reverse_forwarded(&self, original: Address) {
        self.0.store(
            ForwardState::ReverseForwarded(original).encode(),
            Ordering::Release,
        );
    }

    /// Raw access for protocols that borrow the word of a destination
    /// whose copy is still in flight.
    #[inline(always)]
    pub fn as_atomic(&self) -> &AtomicU64 {
        &self.0
    }

    #[inline(always)]
    fn transition(&self, expected: ClassWord, next: ForwardState) -> ForwardState {
        match self.0.compare_exchange(
            expected.raw(),
            next.encode(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => next,
            Err(actual) => ForwardState::decode(actual),
        }
    }
}
