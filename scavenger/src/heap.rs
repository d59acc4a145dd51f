use std::sync::atomic::{AtomicUsize, Ordering};

use object::{Address, ObjectShape, init_object};

use crate::{
    ScavengeError, ScavengerSettings,
    space::{BumpSpace, Region, SubSpace},
    system::MappedRegion,
};

/// The two-generation heap: a nursery of two semispaces and a tenure space,
/// all carved out of a single mapping.
///
/// ```text
/// [ semispace 0 | semispace 1 | tenure ]
/// ```
///
/// One semispace is the allocate space mutators bump into, the other is the
/// survivor space a scavenge copies into. A successful scavenge swaps them.
#[derive(Debug)]
pub struct Heap {
    semispaces: [BumpSpace; 2],
    allocate_index: AtomicUsize,
    tenure: BumpSpace,
    nursery: Region,
    // keeps the spaces above mapped; dropped last
    _mapping: MappedRegion,
}

impl Heap {
    pub fn new(settings: &ScavengerSettings) -> Result<Self, ScavengeError> {
        settings.validate()?;
        let semispace = settings.semispace_size();
        let total = settings.nursery_size + settings.tenure_size;
        let mapping = MappedRegion::map(total).ok_or(ScavengeError::MapFailed(total))?;
        let base = mapping.base();
        // SAFETY: the three ranges are disjoint and live as long as `mapping`
        let (semispaces, tenure) = unsafe {
            (
                [
                    BumpSpace::new(base, semispace),
                    BumpSpace::new(base.offset(semispace), semispace),
                ],
                BumpSpace::new(base.offset(settings.nursery_size), settings.tenure_size),
            )
        };
        log::debug!(
            "heap mapped at {base}: nursery {} KB, tenure {} KB",
            settings.nursery_size / 1024,
            settings.tenure_size / 1024
        );
        Ok(Self {
            semispaces,
            allocate_index: AtomicUsize::new(0),
            tenure,
            nursery: Region::new(base, base.offset(settings.nursery_size)),
            _mapping: mapping,
        })
    }

    /// Allocate and initialise an object in the allocate semispace.
    pub fn allocate(&self, shape: ObjectShape) -> Option<Address> {
        let address = self.allocate_space().collector_allocate(shape.size())?;
        // SAFETY: freshly reserved, exclusively ours
        unsafe { init_object(address, shape) };
        Some(address)
    }

    /// Allocate and initialise an object directly in tenure space.
    pub fn allocate_tenured(&self, shape: ObjectShape) -> Option<Address> {
        let address = self.tenure.collector_allocate(shape.size())?;
        // SAFETY: freshly reserved, exclusively ours
        unsafe { init_object(address, shape) };
        Some(address)
    }

    #[inline(always)]
    pub fn allocate_index(&self) -> usize {
        self.allocate_index.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub fn semispace(&self, index: usize) -> &BumpSpace {
        &self.semispaces[index]
    }

    #[inline(always)]
    pub fn allocate_space(&self) -> &BumpSpace {
        self.semispace(self.allocate_index())
    }

    /// The semispace mutators do not currently allocate into.
    #[inline(always)]
    pub fn other_space(&self) -> &BumpSpace {
        self.semispace(1 - self.allocate_index())
    }

    /// Swap allocate and survivor roles.
    pub fn flip_allocate(&self) {
        self.allocate_index.fetch_xor(1, Ordering::AcqRel);
    }

    #[inline(always)]
    pub fn tenure(&self) -> &BumpSpace {
        &self.tenure
    }

    #[inline(always)]
    pub fn nursery(&self) -> Region {
        self.nursery
    }

    #[inline(always)]
    pub fn is_in_nursery(&self, address: Address) -> bool {
        self.nursery.contains(address)
    }

    #[inline(always)]
    pub fn is_in_tenure(&self, address: Address) -> bool {
        self.tenure.contains(address)
    }

    #[inline]
    pub fn nursery_free_bytes(&self) -> usize {
        self.allocate_space().free_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object::Header;

    fn create_test_settings() -> ScavengerSettings {
        ScavengerSettings {
            nursery_size: 64 * 1024,
            tenure_size: 64 * 1024,
            worker_threads: 1,
            ..ScavengerSettings::default()
        }
    }

    #[test]
    fn test_allocation_lands_in_the_right_space() {
        let heap = Heap::new(&create_test_settings()).expect("heap");
        let young = heap.allocate(ObjectShape::slots(2, 0)).expect("alloc");
        let old = heap.allocate_tenured(ObjectShape::bytes(24)).expect("alloc");
        assert!(heap.is_in_nursery(young));
        assert!(heap.allocate_space().contains(young));
        assert!(heap.is_in_tenure(old));
        assert!(!heap.is_in_nursery(old));
        // SAFETY: just allocated
        assert_eq!(unsafe { Header::at(old) }.size(), 16 + 24);
    }

    #[test]
    fn test_flip_swaps_semispaces() {
        let heap = Heap::new(&create_test_settings()).expect("heap");
        let before = heap.allocate_space().base();
        heap.flip_allocate();
        assert_eq!(heap.other_space().base(), before);
        assert_ne!(heap.allocate_space().base(), before);
        heap.flip_allocate();
        assert_eq!(heap.allocate_space().base(), before);
    }

    #[test]
    fn test_invalid_settings_are_refused() {
        let settings = ScavengerSettings {
            nursery_size: 1000,
            ..create_test_settings()
        };
        assert!(matches!(Heap::new(&settings), Err(ScavengeError::Settings(_))));
    }
}
