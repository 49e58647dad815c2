use indexmap::IndexMap;

use crate::value::{ScalarValue, Value};

/// Stable slot space shared by set and map storage.  Each logical element
/// has a stable slot index; removed slots move to a quarantine list and
/// are not reused until the next engine tick, so deltas may still
/// reference removed keys safely.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SlotSpace {
    slots: Vec<Option<ScalarValue>>,
    index: IndexMap<ScalarValue, usize>,
    free: Vec<usize>,
    quarantine: Vec<usize>,
}

impl SlotSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live elements.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Number of allocated slots including quarantined and free ones.
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn slot_of(&self, key: &ScalarValue) -> Option<usize> {
        self.index.get(key).copied()
    }

    pub fn contains(&self, key: &ScalarValue) -> bool {
        self.index.contains_key(key)
    }

    /// The key stored at a slot.  Remains readable for quarantined slots
    /// until the tick ends.
    pub fn key_at(&self, slot: usize) -> Option<&ScalarValue> {
        self.slots.get(slot).and_then(|s| s.as_ref())
    }

    /// Returns `(slot, added)`.  Reuses only slots freed before the
    /// current tick.
    pub fn insert(&mut self, key: ScalarValue) -> (usize, bool) {
        if let Some(&slot) = self.index.get(&key) {
            return (slot, false);
        }
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(key.clone());
                slot
            }
            None => {
                self.slots.push(Some(key.clone()));
                self.slots.len() - 1
            }
        };
        self.index.insert(key, slot);
        (slot, true)
    }

    /// Removes a live key, returning its slot.  The slot's key storage is
    /// preserved until [end_tick](Self::end_tick).
    pub fn remove(&mut self, key: &ScalarValue) -> Option<usize> {
        let slot = self.index.shift_remove(key)?;
        self.quarantine.push(slot);
        Some(slot)
    }

    /// Live elements in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &ScalarValue)> {
        self.index.iter().map(|(key, &slot)| (slot, key))
    }

    /// Advance the freelist: quarantined slots become reusable and their
    /// key storage is dropped.
    pub fn end_tick(&mut self) {
        for slot in self.quarantine.drain(..) {
            // re-insertion of the same key this tick claimed a new slot,
            // so the quarantined one always clears
            self.slots[slot] = None;
            self.free.push(slot);
        }
    }
}

/// Set storage: a slot space of scalar elements.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SetValue {
    space: SlotSpace,
}

impl SetValue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.space.len()
    }

    pub fn is_empty(&self) -> bool {
        self.space.is_empty()
    }

    pub fn contains(&self, key: &ScalarValue) -> bool {
        self.space.contains(key)
    }

    pub fn insert(&mut self, key: ScalarValue) -> (usize, bool) {
        self.space.insert(key)
    }

    pub fn remove(&mut self, key: &ScalarValue) -> Option<usize> {
        self.space.remove(key)
    }

    pub fn key_at(&self, slot: usize) -> Option<&ScalarValue> {
        self.space.key_at(slot)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &ScalarValue)> {
        self.space.iter()
    }

    pub(crate) fn end_tick(&mut self) {
        self.space.end_tick();
    }
}

/// Map storage: a slot space of keys plus a parallel value array sharing
/// the slot indices.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MapValue {
    space: SlotSpace,
    values: Vec<Option<Value>>,
}

impl MapValue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.space.len()
    }

    pub fn is_empty(&self) -> bool {
        self.space.is_empty()
    }

    pub fn contains(&self, key: &ScalarValue) -> bool {
        self.space.contains(key)
    }

    pub fn slot_of(&self, key: &ScalarValue) -> Option<usize> {
        self.space.slot_of(key)
    }

    pub fn get(&self, key: &ScalarValue) -> Option<&Value> {
        self.space
            .slot_of(key)
            .and_then(|slot| self.values.get(slot).and_then(|v| v.as_ref()))
    }

    pub fn key_at(&self, slot: usize) -> Option<&ScalarValue> {
        self.space.key_at(slot)
    }

    /// Value stored at a slot.  Remains readable for quarantined slots
    /// until the tick ends.
    pub fn value_at(&self, slot: usize) -> Option<&Value> {
        self.values.get(slot).and_then(|v| v.as_ref())
    }

    /// Returns `(slot, added)`; on an existing key the value is replaced
    /// in place.
    pub fn insert(&mut self, key: ScalarValue, value: Value) -> (usize, bool) {
        let (slot, added) = self.space.insert(key);
        if self.values.len() <= slot {
            self.values.resize_with(slot + 1, || None);
        }
        self.values[slot] = Some(value);
        (slot, added)
    }

    pub fn remove(&mut self, key: &ScalarValue) -> Option<usize> {
        self.space.remove(key)
    }

    /// Live entries in insertion order as `(slot, key, value)`.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &ScalarValue, &Value)> {
        self.space
            .iter()
            .map(|(slot, key)| (slot, key, self.values[slot].as_ref().unwrap()))
    }

    pub(crate) fn end_tick(&mut self) {
        // clear quarantined value storage alongside the key storage
        for slot in 0..self.values.len() {
            if self.space.key_at(slot).is_none() {
                self.values[slot] = None;
            }
        }
        self.space.end_tick();
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    fn key(s: &str) -> ScalarValue {
        ScalarValue::Str(s.to_string())
    }

    #[test]
    fn slots_are_stable() {
        let mut space = SlotSpace::new();
        let (a, added) = space.insert(key("a"));
        assert!(added);
        let (b, _) = space.insert(key("b"));
        assert_ne!(a, b);
        let (a2, added) = space.insert(key("a"));
        assert_eq!(a, a2);
        assert!(!added);
    }

    #[test]
    fn removed_slot_readable_until_tick_ends() {
        let mut space = SlotSpace::new();
        let (slot, _) = space.insert(key("a"));
        assert_eq!(space.remove(&key("a")), Some(slot));
        assert!(!space.contains(&key("a")));
        // the key is still addressable for delta consumers
        assert_eq!(space.key_at(slot), Some(&key("a")));
        space.end_tick();
        assert_eq!(space.key_at(slot), None);
    }

    #[test]
    fn removed_slot_not_reused_within_tick() {
        let mut space = SlotSpace::new();
        let (a, _) = space.insert(key("a"));
        space.remove(&key("a"));
        let (b, _) = space.insert(key("b"));
        assert_ne!(a, b);
        space.end_tick();
        let (c, _) = space.insert(key("c"));
        assert_eq!(c, a);
    }

    #[test]
    fn same_key_reinserted_same_tick_gets_new_slot() {
        let mut space = SlotSpace::new();
        let (a, _) = space.insert(key("a"));
        space.remove(&key("a"));
        let (a2, added) = space.insert(key("a"));
        assert!(added);
        assert_ne!(a, a2);
        space.end_tick();
        assert_eq!(space.slot_of(&key("a")), Some(a2));
        assert_eq!(space.key_at(a), None);
    }

    #[test]
    fn map_values_share_slot_space() {
        let mut map = MapValue::new();
        let (slot, added) = map.insert(key("a"), Value::Scalar(ScalarValue::Int(1)));
        assert!(added);
        let (slot2, added) = map.insert(key("a"), Value::Scalar(ScalarValue::Int(2)));
        assert!(!added);
        assert_eq!(slot, slot2);
        assert_eq!(map.get(&key("a")), Some(&Value::Scalar(ScalarValue::Int(2))));
        map.remove(&key("a"));
        assert_eq!(map.value_at(slot), Some(&Value::Scalar(ScalarValue::Int(2))));
        map.end_tick();
        assert_eq!(map.value_at(slot), None);
    }
}
