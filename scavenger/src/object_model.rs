//! The object-model capability the collector is written against.
//!
//! Everything the engine needs to know about object shapes goes through
//! [`ObjectModel`]; the engine itself only touches the forwarding word and
//! reference slots.

use object::{
    AGE_MAX, Address, ClassWord, Header, HeaderFlags, ObjectType, Slot, WORD_SIZE,
    address_hash, extent, slot,
};

/// Why an object is being scanned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanReason {
    /// Copy and forward every nursery referent.
    Scavenge,
    /// Decide whether a tenured object still needs remembering.
    ShouldRemember,
    /// Point slots back at original objects after a failed cycle.
    Backout,
    /// Repair slots of objects left in place by an aborted concurrent cycle.
    Fixup,
}

pub const MAX_HOT_FIELDS: usize = 3;

/// Up to [`MAX_HOT_FIELDS`] slot indices worth copying depth-first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HotFields {
    count: u8,
    slots: [u32; MAX_HOT_FIELDS],
}

impl HotFields {
    pub const NONE: Self = Self {
        count: 0,
        slots: [0; MAX_HOT_FIELDS],
    };

    /// Hot fields from `slots`; extra entries past the limit are ignored.
    pub fn new(slots: &[u32]) -> Self {
        let mut hot = Self::NONE;
        for &index in slots.iter().take(MAX_HOT_FIELDS) {
            hot.slots[hot.count as usize] = index;
            hot.count += 1;
        }
        hot
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.slots[..self.count as usize].iter().map(|&i| i as usize)
    }
}

/// Sizes and hints for copying one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyDetails {
    /// Bytes to duplicate.
    pub copy_size: usize,
    /// Bytes the copy occupies; larger than `copy_size` when the identity
    /// hash has to be appended.
    pub reserve_size: usize,
    pub hot_fields: HotFields,
}

/// Lazy, restartable iteration over an object's reference slots.
///
/// Indices count slots, so a scanner over an array can be split into
/// independent pieces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectScanner {
    object: Address,
    start: usize,
    next: usize,
    end: usize,
    indexable: bool,
}

impl ObjectScanner {
    pub fn new(object: Address, start: usize, end: usize, indexable: bool) -> Self {
        debug_assert!(start <= end);
        Self {
            object,
            start,
            next: start,
            end,
            indexable,
        }
    }

    #[inline(always)]
    pub fn object(&self) -> Address {
        self.object
    }

    /// No reference slots at all.
    #[inline(always)]
    pub fn is_leaf(&self) -> bool {
        self.start == self.end
    }

    #[inline(always)]
    pub fn is_indexable(&self) -> bool {
        self.indexable
    }

    /// Nothing consumed yet.
    #[inline(always)]
    pub fn is_fresh(&self) -> bool {
        self.next == self.start
    }

    #[inline(always)]
    pub fn cursor(&self) -> usize {
        self.next
    }

    #[inline(always)]
    pub fn end(&self) -> usize {
        self.end
    }

    #[inline(always)]
    pub fn remaining(&self) -> usize {
        self.end - self.next
    }

    pub fn restart_at(&mut self, index: usize) {
        debug_assert!(index >= self.start && index <= self.end);
        self.next = index;
    }

    /// Cut the slots from `at` on into a scanner of their own.
    pub fn split_tail(&mut self, at: usize) -> Option<ObjectScanner> {
        if at <= self.next || at >= self.end {
            return None;
        }
        let tail = ObjectScanner::new(self.object, at, self.end, self.indexable);
        self.end = at;
        Some(tail)
    }
}

impl Iterator for ObjectScanner {
    type Item = Slot;

    #[inline]
    fn next(&mut self) -> Option<Slot> {
        if self.next >= self.end {
            return None;
        }
        // SAFETY: the scanner never exceeds the slot count it was built for
        let slot = unsafe { slot(self.object, self.next) };
        self.next += 1;
        Some(slot)
    }
}

/// Callbacks the collector needs from the language runtime.
pub trait ObjectModel: Send + Sync {
    /// Age before this cycle.
    #[inline]
    fn preserved_age(&self, header: &Header) -> u8 {
        header.age()
    }

    fn calculate_object_details_for_copy(&self, object: Address, class: ClassWord) -> CopyDetails;

    /// Finish the header of `copy` after its body was duplicated from
    /// `original`. Must not modify `original`.
    fn fixup_forwarded_object(
        &self,
        original: Address,
        copy: Address,
        class: ClassWord,
        details: &CopyDetails,
        age: u8,
    );

    fn is_remembered(&self, object: Address) -> bool;

    /// Returns `true` iff this call set the bit.
    fn set_remembered(&self, object: Address) -> bool;

    fn clear_remembered(&self, object: Address);

    /// Whether `object` can reach nursery objects other than through its
    /// own slots.
    fn has_indirect_object_referents(&self, _object: Address) -> bool {
        false
    }

    /// Visit the slots behind [`has_indirect_object_referents`](Self::has_indirect_object_referents).
    fn visit_indirect_referents(&self, _object: Address, _visitor: &mut dyn FnMut(Slot)) {}

    fn scanner(&self, object: Address, class: ClassWord, reason: ScanReason) -> ObjectScanner;

    /// Bytes occupied by `object` in any forwarding state.
    #[inline]
    fn object_size(&self, object: Address) -> usize {
        // SAFETY: callers only pass object starts
        unsafe { extent(object) }
    }

    /// Runtime bookkeeping after a cycle was backed out.
    fn back_out(&self) {}

    /// Clearable (weak) reference processing at the end of a concurrent cycle.
    /// `forwarded` maps a nursery referent to its surviving location, or
    /// `None` when it did not survive.
    fn process_clearable_references(&self, _forwarded: &dyn Fn(Address) -> Option<Address>) {}
}

/// Object model for the layouts in the `object` crate.
#[derive(Debug, Clone)]
pub struct StandardObjectModel {
    hot_slots: HotFields,
}

impl Default for StandardObjectModel {
    fn default() -> Self {
        Self {
            hot_slots: HotFields::new(&[0]),
        }
    }
}

impl StandardObjectModel {
    /// Treat `slots` of every slot object as hot.
    pub fn with_hot_slots(slots: &[u32]) -> Self {
        Self {
            hot_slots: HotFields::new(slots),
        }
    }

    #[inline(always)]
    fn header(object: Address) -> &'static Header {
        // SAFETY: the engine only hands live object starts to the model;
        // the heap outlives every cycle
        unsafe { Header::at(object) }
    }
}

impl ObjectModel for StandardObjectModel {
    fn calculate_object_details_for_copy(&self, object: Address, class: ClassWord) -> CopyDetails {
        let header = Self::header(object);
        let copy_size = header.size();
        let flags = header.flags();
        let reserve_size = if flags.contains(HeaderFlags::HASHED)
            && !flags.contains(HeaderFlags::HASH_MOVED)
        {
            copy_size + WORD_SIZE
        } else {
            copy_size
        };
        let hot_fields = if class.object_type() == ObjectType::Slots {
            let slots = class.slot_count();
            let mut picked = [0u32; MAX_HOT_FIELDS];
            let mut count = 0;
            for index in self.hot_slots.iter().filter(|&i| i < slots) {
                picked[count] = index as u32;
                count += 1;
            }
            HotFields::new(&picked[..count])
        } else {
            HotFields::NONE
        };
        CopyDetails {
            copy_size,
            reserve_size,
            hot_fields,
        }
    }

    fn fixup_forwarded_object(
        &self,
        original: Address,
        copy: Address,
        class: ClassWord,
        details: &CopyDetails,
        age: u8,
    ) {
        let source = Self::header(original);
        let header = Self::header(copy);
        header.forwarding().restore(class);
        header.set_size(details.reserve_size);
        let mut flags = source.flags().without(HeaderFlags::REMEMBERED);
        if details.reserve_size > details.copy_size {
            let hash_word = copy.offset(details.copy_size);
            // SAFETY: the reservation covers the appended word
            unsafe { *hash_word.as_mut_ptr::<u64>() = address_hash(original) as u64 };
            flags = flags.with(HeaderFlags::HASH_MOVED);
        }
        header.set_flags(flags);
        header.set_age(age.min(AGE_MAX));
    }

    #[inline]
    fn is_remembered(&self, object: Address) -> bool {
        Self::header(object).has_flag(HeaderFlags::REMEMBERED)
    }

    #[inline]
    fn set_remembered(&self, object: Address) -> bool {
        !Self::header(object)
            .fetch_or_flags(HeaderFlags::REMEMBERED)
            .contains(HeaderFlags::REMEMBERED)
    }

    #[inline]
    fn clear_remembered(&self, object: Address) {
        Self::header(object).remove_flag(HeaderFlags::REMEMBERED);
    }

    fn scanner(&self, object: Address, class: ClassWord, _reason: ScanReason) -> ObjectScanner {
        match class.object_type() {
            ObjectType::Slots => ObjectScanner::new(object, 0, class.slot_count(), false),
            ObjectType::Array => ObjectScanner::new(object, 0, class.slot_count(), true),
            ObjectType::Bytes | ObjectType::Filler | ObjectType::FillerWord => {
                ObjectScanner::new(object, 0, 0, false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object::{ObjectShape, identity_hash, init_object};

    fn scratch(words: usize) -> Vec<u64> {
        vec![0u64; words]
    }

    #[test]
    fn test_copy_details_grow_for_hashed_objects() {
        let model = StandardObjectModel::default();
        let mut memory = scratch(8);
        let object = Address::from_ptr(memory.as_mut_ptr());
        let shape = ObjectShape::slots(2, 8);
        // SAFETY: scratch memory is large enough
        unsafe { init_object(object, shape) };

        let details = model.calculate_object_details_for_copy(object, shape.class_word());
        assert_eq!(details.copy_size, shape.size());
        assert_eq!(details.reserve_size, shape.size());
        assert_eq!(details.hot_fields.iter().collect::<Vec<_>>(), vec![0]);

        // SAFETY: live object
        unsafe { identity_hash(object) };
        let details = model.calculate_object_details_for_copy(object, shape.class_word());
        assert_eq!(details.reserve_size, shape.size() + WORD_SIZE);
    }

    #[test]
    fn test_fixup_moves_hash_and_sets_age() {
        let model = StandardObjectModel::default();
        let mut memory = scratch(16);
        let original = Address::from_ptr(memory.as_mut_ptr());
        let copy = original.offset(64);
        let shape = ObjectShape::slots(1, 0);
        // SAFETY: both ranges fit the scratch memory
        unsafe {
            init_object(original, shape);
            let expected = identity_hash(original);
            Header::at(original).add_flag(HeaderFlags::REMEMBERED);
            core::ptr::copy_nonoverlapping(
                original.as_ptr::<u8>(),
                copy.as_mut_ptr::<u8>(),
                shape.size(),
            );
            let details = model.calculate_object_details_for_copy(original, shape.class_word());
            model.fixup_forwarded_object(original, copy, shape.class_word(), &details, 3);

            let header = Header::at(copy);
            assert_eq!(header.class_word(), Some(shape.class_word()));
            assert_eq!(header.age(), 3);
            assert_eq!(header.size(), shape.size() + WORD_SIZE);
            assert!(!header.has_flag(HeaderFlags::REMEMBERED));
            assert_eq!(identity_hash(copy), expected, "hash must survive the move");
            assert!(Header::at(original).has_flag(HeaderFlags::REMEMBERED));
        }
    }

    #[test]
    fn test_scanner_split_and_restart() {
        let mut memory = scratch(16);
        let object = Address::from_ptr(memory.as_mut_ptr());
        // SAFETY: 16 + 10 * 8 bytes fit
        unsafe { init_object(object, ObjectShape::array(10)) };
        let model = StandardObjectModel::default();
        let mut scanner =
            model.scanner(object, ObjectShape::array(10).class_word(), ScanReason::Scavenge);
        assert!(scanner.is_indexable());
        assert!(!scanner.is_leaf());

        let tail = scanner.split_tail(4).expect("split");
        assert_eq!(scanner.remaining(), 4);
        assert_eq!(tail.remaining(), 6);
        assert_eq!(scanner.by_ref().count(), 4);
        assert_eq!(tail.cursor(), 4);

        scanner.restart_at(2);
        assert_eq!(scanner.count(), 2);
    }

    #[test]
    fn test_remembered_bit_is_set_once() {
        let model = StandardObjectModel::default();
        let mut memory = scratch(4);
        let object = Address::from_ptr(memory.as_mut_ptr());
        // SAFETY: header fits
        unsafe { init_object(object, ObjectShape::slots(0, 0)) };
        assert!(model.set_remembered(object));
        assert!(!model.set_remembered(object));
        assert!(model.is_remembered(object));
        model.clear_remembered(object);
        assert!(!model.is_remembered(object));
    }
}
