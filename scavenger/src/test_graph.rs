//! Random object graphs for collector tests.

use std::collections::HashSet;

use object::{Address, ObjectShape, Slot, Value};

use crate::Heap;
pub(crate) use crate::rng::Rng;

pub(crate) fn slot_of(object: Address, index: usize) -> Slot {
    // SAFETY: tests only index slots of objects they allocated
    unsafe { object::slot(object, index) }
}

pub(crate) fn set_ref(object: Address, index: usize, target: Address) {
    slot_of(object, index).store(Value::reference(target));
}

pub(crate) fn ref_at(object: Address, index: usize) -> Option<Address> {
    slot_of(object, index).load().address()
}

/// Slot objects with three slots, plus an array every `array_every`
/// objects. Slot 0 holds the object id; the other slots point at random
/// earlier objects. The first root is always the last array built, so
/// array scanning never depends on the seed.
pub(crate) fn build_graph(
    heap: &Heap,
    rng: &mut Rng,
    count: usize,
    array_every: usize,
    array_len: u32,
    root_count: usize,
) -> Vec<Value> {
    let mut objects: Vec<Address> = Vec::with_capacity(count);
    let mut last_array = None;
    for id in 0..count {
        let is_array = array_every != 0 && id % array_every == array_every - 1;
        let shape = if is_array {
            ObjectShape::array(array_len)
        } else {
            ObjectShape::slots(3, 0)
        };
        let object = heap.allocate(shape).expect("test nursery too small");
        if is_array {
            last_array = Some(object);
        }
        slot_of(object, 0).store(Value::from_i64(id as i64));
        for index in 1..shape.slot_count as usize {
            if !objects.is_empty() && rng.below(4) != 0 {
                set_ref(object, index, objects[rng.below(objects.len())]);
            }
        }
        objects.push(object);
    }
    let mut roots: Vec<Value> = (0..root_count)
        .map(|_| Value::reference(objects[rng.below(objects.len())]))
        .collect();
    if let (Some(array), Some(first)) = (last_array, roots.first_mut()) {
        *first = Value::reference(array);
    }
    roots
}

/// Depth-first walk from `roots`, reading slots through `load`.
///
/// Returns the id and child ids of every reachable object in visit order,
/// and every reachable address.
pub(crate) fn fingerprint(roots: &[Value], load: &dyn Fn(Slot) -> Value) -> (Vec<i64>, Vec<Address>) {
    let mut seen = HashSet::new();
    let mut ids = Vec::new();
    let mut stack: Vec<Address> = roots.iter().rev().filter_map(|root| root.address()).collect();
    while let Some(object) = stack.pop() {
        if !seen.insert(object) {
            continue;
        }
        // SAFETY: reachable objects are live
        let class = unsafe { object::Header::at(object) }
            .class_word()
            .expect("reachable object is forwarded");
        ids.push(load(slot_of(object, 0)).as_i64().unwrap_or(-2));
        let mut children = Vec::new();
        for index in 1..class.slot_count() {
            match load(slot_of(object, index)).address() {
                Some(child) => {
                    // SAFETY: as above
                    let child_class = unsafe { object::Header::at(child) }.class_word();
                    let id = child_class.map_or(-3, |_| {
                        load(slot_of(child, 0)).as_i64().unwrap_or(-2)
                    });
                    ids.push(id);
                    children.push(child);
                }
                None => ids.push(-1),
            }
        }
        stack.extend(children.into_iter().rev());
    }
    (ids, seen.into_iter().collect())
}

pub(crate) fn plain_load(slot: Slot) -> Value {
    slot.load()
}
