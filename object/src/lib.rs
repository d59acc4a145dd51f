mod address;
mod value;
mod header;
mod forwarding;
mod slot;
mod layout;

pub use address::{Address, WORD_SIZE, align_up};
pub use value::Value;
pub use header::{AGE_MAX, ClassWord, HEADER_SIZE, Header, HeaderFlags, ObjectType};
pub use forwarding::{ForwardState, ForwardingWord};
pub use slot::Slot;
pub use layout::{
    MIN_OBJECT_SIZE, ObjectShape, ObjectWalker, WalkEntry, WalkKind,
    address_hash, extent, fill_hole, identity_hash, init_object, slot,
    slot_offset,
};

#[cfg(test)]
mod tests {
    use super::*;

    /// Word-aligned scratch memory standing in for a heap region.
    fn scratch(words: usize) -> Vec<u64> {
        vec![0u64; words]
    }

    fn base_of(memory: &mut [u64]) -> Address {
        Address::from_ptr(memory.as_mut_ptr())
    }

    // ── Value tagging ──────────────────────────────────────────────

    #[test]
    fn fixnum_round_trip() {
        for &n in &[0i64, 1, -1, 42, -42, i64::MAX >> 2, i64::MIN >> 2] {
            let v = Value::from_i64(n);
            assert!(v.is_fixnum());
            assert!(!v.is_ref());
            assert_eq!(v.as_i64(), Some(n));
            assert_eq!(v.address(), None);
        }
    }

    #[test]
    fn reference_tagging() {
        let mut memory = scratch(2);
        let address = base_of(&mut memory);
        let v = Value::reference(address);
        assert!(v.is_ref());
        assert!(!v.is_fixnum());
        assert!(!v.is_header());
        assert_eq!(v.address(), Some(address));
    }

    #[test]
    fn zero_value_is_not_a_reference() {
        assert_eq!(Value::ZERO.address(), None);
        assert_eq!(Value::default(), Value::from_i64(0));
    }

    // ── Class word / forwarding codec ──────────────────────────────

    #[test]
    fn class_word_fields() {
        for ty in [
            ObjectType::Slots,
            ObjectType::Array,
            ObjectType::Bytes,
            ObjectType::Filler,
            ObjectType::FillerWord,
        ] {
            let class = ClassWord::new(ty, 77);
            assert_eq!(class.object_type(), ty);
            assert_eq!(class.slot_count(), 77);
            assert!(!class.is_self_forwarded());
            assert!(Value::from_raw(class.raw()).is_header());
        }
    }

    #[test]
    fn forward_state_codec() {
        let class = ClassWord::new(ObjectType::Slots, 3);
        let dest = Address::from_usize(0x1000);
        for state in [
            ForwardState::NotForwarded(class),
            ForwardState::Forwarded(dest),
            ForwardState::BeingCopied(dest),
            ForwardState::SelfForwarded(class),
            ForwardState::ReverseForwarded(dest),
        ] {
            assert_eq!(ForwardState::decode(state.encode()), state);
        }
        assert!(ForwardState::Forwarded(dest).is_forwarded_pointer());
        assert!(ForwardState::BeingCopied(dest).is_forwarded_pointer());
        assert!(!ForwardState::SelfForwarded(class).is_forwarded_pointer());
    }

    #[test]
    fn only_one_forwarding_install_wins() {
        let class = ClassWord::new(ObjectType::Array, 1);
        let word = ForwardingWord::new(class);
        let first = Address::from_usize(0x2000);
        let second = Address::from_usize(0x3000);

        assert_eq!(
            word.set_forwarded_object(class, first),
            ForwardState::Forwarded(first)
        );
        assert_eq!(
            word.set_forwarded_object(class, second),
            ForwardState::Forwarded(first),
            "loser must observe the winner's destination"
        );
        assert_eq!(
            word.set_self_forwarded_object(class),
            ForwardState::Forwarded(first)
        );
    }

    #[test]
    fn being_copied_then_complete() {
        let class = ClassWord::new(ObjectType::Bytes, 0);
        let word = ForwardingWord::new(class);
        let dest = Address::from_usize(0x4000);

        let state = word.set_forwarded_object_with_being_copied_hint(class, dest);
        assert_eq!(state, ForwardState::BeingCopied(dest));
        assert!(word.is_forwarded_pointer());
        word.complete_copy(dest);
        assert_eq!(word.load(), ForwardState::Forwarded(dest));
    }

    #[test]
    fn self_forward_and_restore() {
        let class = ClassWord::new(ObjectType::Slots, 2);
        let word = ForwardingWord::new(class);
        assert_eq!(
            word.set_self_forwarded_object(class),
            ForwardState::SelfForwarded(class)
        );
        assert!(!word.is_forwarded_pointer());
        word.restore(class);
        assert_eq!(word.load(), ForwardState::NotForwarded(class));
    }

    // ── Header ─────────────────────────────────────────────────────

    #[test]
    fn header_flags_and_age() {
        let h = Header::new(ClassWord::new(ObjectType::Slots, 0), 16);
        assert!(!h.has_flag(HeaderFlags::REMEMBERED));

        let prev = h.fetch_or_flags(HeaderFlags::REMEMBERED);
        assert!(!prev.contains(HeaderFlags::REMEMBERED));
        let prev = h.fetch_or_flags(HeaderFlags::REMEMBERED);
        assert!(prev.contains(HeaderFlags::REMEMBERED), "second set sees the bit");

        h.remove_flag(HeaderFlags::REMEMBERED);
        assert_eq!(h.flags(), HeaderFlags::NONE);

        h.set_age(AGE_MAX);
        assert_eq!(h.age(), AGE_MAX);
        assert_eq!(h.size(), 16);
    }

    #[test]
    fn forwarded_object_keeps_size_readable() {
        let mut memory = scratch(8);
        let address = base_of(&mut memory);
        let shape = ObjectShape::slots(2, 10);
        unsafe { init_object(address, shape) };

        let header = unsafe { Header::at(address) };
        let class = header.class_word().unwrap();
        header
            .forwarding()
            .set_forwarded_object(class, Address::from_usize(0x8000));

        assert_eq!(unsafe { extent(address) }, shape.size());
        assert_eq!(header.class_word(), None);
    }

    // ── Layout ─────────────────────────────────────────────────────

    #[test]
    fn shape_sizes_are_word_padded() {
        assert_eq!(ObjectShape::bytes(0).size(), 16);
        assert_eq!(ObjectShape::bytes(1).size(), 24);
        assert_eq!(ObjectShape::array(3).size(), 16 + 24);
        assert_eq!(ObjectShape::slots(1, 9).size(), 16 + 8 + 16);
    }

    #[test]
    fn slots_start_zeroed_and_are_writable() {
        let mut memory = scratch(6);
        let address = base_of(&mut memory);
        unsafe { init_object(address, ObjectShape::array(4)) };

        for i in 0..4 {
            let s = unsafe { slot(address, i) };
            assert_eq!(s.load(), Value::ZERO);
        }
        let s = unsafe { slot(address, 2) };
        s.store(Value::from_i64(9));
        assert_eq!(s.compare_exchange(Value::ZERO, Value::from_i64(1)), Err(Value::from_i64(9)));
        assert_eq!(s.load(), Value::from_i64(9));
    }

    #[test]
    fn walker_sees_objects_and_holes() {
        let mut memory = scratch(16);
        let base = base_of(&mut memory);

        let first = base;
        unsafe { init_object(first, ObjectShape::array(2)) }; // 32 bytes
        let hole = base.offset(32);
        unsafe { fill_hole(hole, hole.offset(8)) };
        let second = base.offset(40);
        unsafe { init_object(second, ObjectShape::bytes(8)) }; // 24 bytes
        let tail = base.offset(64);
        unsafe { fill_hole(tail, base.offset(128)) };

        let entries: Vec<_> = unsafe { ObjectWalker::new(base, base.offset(128)) }.collect();
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[0].address, first);
        assert!(matches!(entries[0].kind, WalkKind::Object(_)));
        assert_eq!(entries[1].kind, WalkKind::Hole);
        assert_eq!(entries[1].size, 8);
        assert_eq!(entries[2].address, second);
        assert_eq!(entries[2].size, 24);
        assert_eq!(entries[3].kind, WalkKind::Hole);
        assert_eq!(entries[3].size, 64);
    }

    #[test]
    fn identity_hash_marks_object() {
        let mut memory = scratch(2);
        let address = base_of(&mut memory);
        unsafe { init_object(address, ObjectShape::bytes(0)) };

        let hash = unsafe { identity_hash(address) };
        assert_eq!(hash, address_hash(address));
        assert!(unsafe { Header::at(address) }.has_flag(HeaderFlags::HASHED));
    }
}
