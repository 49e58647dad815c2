//! Per-value modification bookkeeping.  The tracker mirrors the value's
//! shape: whole-value time always, plus per-field, per-index or per-slot
//! times and the added/removed-this-tick sets that feed
//! [DeltaView](crate::delta::DeltaView).  Per-tick sets reset through the
//! engine's end-of-tick callback set.

use crate::error::RuntimeError;
use crate::meta::{MetaPayload, TypeMeta};
use crate::time::EngineTime;

/// Per-slot bookkeeping for set/map storage.
#[derive(Debug, Default)]
pub struct SlotTracker {
    times: Vec<EngineTime>,
    added: Vec<usize>,
    removed: Vec<usize>,
    updated: Vec<usize>,
}

impl SlotTracker {
    fn ensure(&mut self, slot: usize) {
        if self.times.len() <= slot {
            self.times.resize(slot + 1, EngineTime::MAX_DT);
        }
    }

    pub fn record_add(&mut self, slot: usize, time: EngineTime) {
        self.ensure(slot);
        self.times[slot] = time;
        self.added.push(slot);
    }

    /// An add followed by a remove of the same slot within one tick
    /// cancels: the delta emits nothing for that key.
    pub fn record_remove(&mut self, slot: usize, time: EngineTime) {
        self.ensure(slot);
        self.times[slot] = time;
        if let Some(pos) = self.added.iter().position(|&s| s == slot) {
            self.added.swap_remove(pos);
            return;
        }
        if let Some(pos) = self.updated.iter().position(|&s| s == slot) {
            self.updated.swap_remove(pos);
        }
        self.removed.push(slot);
    }

    pub fn record_update(&mut self, slot: usize, time: EngineTime) {
        self.ensure(slot);
        self.times[slot] = time;
        if !self.added.contains(&slot) && !self.updated.contains(&slot) {
            self.updated.push(slot);
        }
    }

    pub fn slot_time(&self, slot: usize) -> EngineTime {
        self.times.get(slot).copied().unwrap_or(EngineTime::MAX_DT)
    }

    pub fn added(&self) -> &[usize] {
        &self.added
    }

    pub fn removed(&self) -> &[usize] {
        &self.removed
    }

    pub fn updated(&self) -> &[usize] {
        &self.updated
    }

    fn end_tick(&mut self) {
        self.added.clear();
        self.removed.clear();
        self.updated.clear();
    }
}

/// Window bookkeeping: how many elements were pushed this tick and
/// whether one was evicted.
#[derive(Debug, Default)]
pub struct WindowTracker {
    pub pushed: usize,
    pub evicted: bool,
}

impl WindowTracker {
    fn end_tick(&mut self) {
        self.pushed = 0;
        self.evicted = false;
    }
}

/// Ref bookkeeping: rebind time is tracked separately from the target's
/// modification time.
#[derive(Debug)]
pub struct RefTracker {
    pub rebind_time: EngineTime,
}

impl Default for RefTracker {
    fn default() -> Self {
        Self {
            rebind_time: EngineTime::MAX_DT,
        }
    }
}

#[derive(Debug)]
pub enum TrackerDetail {
    Whole,
    Fields(Vec<ModificationTracker>),
    Elements(Vec<EngineTime>),
    Slots(SlotTracker),
    Window(WindowTracker),
    Ref(RefTracker),
}

#[derive(Debug)]
pub struct ModificationTracker {
    last_modified: EngineTime,
    detail: TrackerDetail,
}

impl ModificationTracker {
    pub fn new(meta: &TypeMeta) -> Self {
        let detail = match meta.payload() {
            MetaPayload::Scalar(_) | MetaPayload::Queue { .. } => TrackerDetail::Whole,
            MetaPayload::Bundle { fields, .. } => TrackerDetail::Fields(
                fields
                    .iter()
                    .map(|field| ModificationTracker::new(field.meta))
                    .collect(),
            ),
            MetaPayload::List { len, .. } => {
                TrackerDetail::Elements(vec![EngineTime::MAX_DT; *len])
            }
            MetaPayload::Set { .. } | MetaPayload::Map { .. } => {
                TrackerDetail::Slots(SlotTracker::default())
            }
            MetaPayload::Window { .. } => TrackerDetail::Window(WindowTracker::default()),
            MetaPayload::Ref { .. } => TrackerDetail::Ref(RefTracker::default()),
        };
        Self {
            last_modified: EngineTime::MAX_DT,
            detail,
        }
    }

    /// MAX_DT until the first modification.
    pub fn last_modified_time(&self) -> EngineTime {
        self.last_modified
    }

    pub fn modified_at(&self, time: EngineTime) -> bool {
        self.last_modified == time
    }

    /// Monotonic: a regression in time is a protocol error.
    pub fn mark_modified(&mut self, time: EngineTime) -> Result<(), RuntimeError> {
        if !self.last_modified.is_never() && time < self.last_modified {
            return Err(RuntimeError::Protocol(format!(
                "non-monotonic modification: {time} < {}",
                self.last_modified
            )));
        }
        self.last_modified = time;
        Ok(())
    }

    pub fn detail(&self) -> &TrackerDetail {
        &self.detail
    }

    pub(crate) fn slots(&self) -> &SlotTracker {
        match &self.detail {
            TrackerDetail::Slots(slots) => slots,
            _ => panic!("not a slot-tracked value"),
        }
    }

    pub(crate) fn slots_mut(&mut self) -> &mut SlotTracker {
        match &mut self.detail {
            TrackerDetail::Slots(slots) => slots,
            _ => panic!("not a slot-tracked value"),
        }
    }

    pub(crate) fn window(&self) -> &WindowTracker {
        match &self.detail {
            TrackerDetail::Window(window) => window,
            _ => panic!("not a window value"),
        }
    }

    pub(crate) fn window_mut(&mut self) -> &mut WindowTracker {
        match &mut self.detail {
            TrackerDetail::Window(window) => window,
            _ => panic!("not a window value"),
        }
    }

    pub(crate) fn ref_tracker(&self) -> &RefTracker {
        match &self.detail {
            TrackerDetail::Ref(r) => r,
            _ => panic!("not a ref value"),
        }
    }

    pub(crate) fn ref_mut(&mut self) -> &mut RefTracker {
        match &mut self.detail {
            TrackerDetail::Ref(r) => r,
            _ => panic!("not a ref value"),
        }
    }

    pub fn field(&self, ndx: usize) -> &ModificationTracker {
        match &self.detail {
            TrackerDetail::Fields(fields) => &fields[ndx],
            _ => panic!("not a bundle value"),
        }
    }

    pub(crate) fn field_mut(&mut self, ndx: usize) -> &mut ModificationTracker {
        match &mut self.detail {
            TrackerDetail::Fields(fields) => &mut fields[ndx],
            _ => panic!("not a bundle value"),
        }
    }

    pub fn element_time(&self, ndx: usize) -> EngineTime {
        match &self.detail {
            TrackerDetail::Elements(times) => {
                times.get(ndx).copied().unwrap_or(EngineTime::MAX_DT)
            }
            _ => panic!("not a list value"),
        }
    }

    pub(crate) fn mark_element(&mut self, ndx: usize, time: EngineTime) {
        match &mut self.detail {
            TrackerDetail::Elements(times) => times[ndx] = time,
            _ => panic!("not a list value"),
        }
    }

    /// Reset the per-tick sets, recursively.
    pub fn end_tick(&mut self) {
        match &mut self.detail {
            TrackerDetail::Whole | TrackerDetail::Elements(_) | TrackerDetail::Ref(_) => {}
            TrackerDetail::Fields(fields) => {
                for field in fields.iter_mut() {
                    field.end_tick();
                }
            }
            TrackerDetail::Slots(slots) => slots.end_tick(),
            TrackerDetail::Window(window) => window.end_tick(),
        }
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    fn t(v: u64) -> EngineTime {
        EngineTime::new(v)
    }

    #[test]
    fn monotonic_marking() {
        let meta = TypeMeta::int();
        let mut tracker = ModificationTracker::new(meta);
        assert!(tracker.last_modified_time().is_never());
        tracker.mark_modified(t(5)).unwrap();
        tracker.mark_modified(t(5)).unwrap();
        tracker.mark_modified(t(6)).unwrap();
        let err = tracker.mark_modified(t(4));
        assert!(matches!(err, Err(RuntimeError::Protocol(_))));
        assert_eq!(tracker.last_modified_time(), t(6));
        assert!(tracker.modified_at(t(6)));
        assert!(!tracker.modified_at(t(5)));
    }

    #[test]
    fn add_then_remove_same_tick_cancels() {
        let mut slots = SlotTracker::default();
        slots.record_add(0, t(1));
        slots.record_remove(0, t(1));
        assert!(slots.added().is_empty());
        assert!(slots.removed().is_empty());
    }

    #[test]
    fn update_then_remove_same_tick_keeps_remove_only() {
        let mut slots = SlotTracker::default();
        slots.record_update(3, t(1));
        slots.record_remove(3, t(1));
        assert!(slots.updated().is_empty());
        assert_eq!(slots.removed(), &[3]);
    }

    #[test]
    fn per_tick_sets_reset() {
        let meta = TypeMeta::set_of(TypeMeta::int()).unwrap();
        let mut tracker = ModificationTracker::new(meta);
        tracker.mark_modified(t(1)).unwrap();
        tracker.slots_mut().record_add(0, t(1));
        tracker.slots_mut().record_remove(7, t(1));
        tracker.end_tick();
        assert!(tracker.slots().added().is_empty());
        assert!(tracker.slots().removed().is_empty());
        // slot times survive the reset
        assert_eq!(tracker.slots().slot_time(0), t(1));
    }
}
