//! Per-graph scheduling: a min-heap of nodes keyed by
//! `(scheduled_time, node_ndx)`, per-node notify deduplication, and the
//! end-of-tick callback set that resets deltas and advances slot
//! freelists.

use priority_queue::PriorityQueue;
use std::cell::RefCell;
use std::cmp::Reverse;
use std::rc::Weak;

use crate::time::EngineTime;
use crate::ts::{TsOutput, TsRefTargetLink};

/// Per-graph min-heap of scheduled nodes.  Scheduling the same node twice
/// coalesces to the earliest time.
pub struct Scheduler {
    heap: PriorityQueue<usize, Reverse<(EngineTime, usize)>>,
    next_time: Vec<EngineTime>,
    notify_time: Vec<EngineTime>,
    evaluating: Option<usize>,
    current_tick: EngineTime,
}

impl Scheduler {
    pub fn new(node_count: usize) -> Self {
        Self {
            heap: PriorityQueue::new(),
            next_time: vec![EngineTime::MAX_DT; node_count],
            notify_time: vec![EngineTime::MAX_DT; node_count],
            evaluating: None,
            current_tick: EngineTime::MIN_DT,
        }
    }

    /// Idempotent: coalesces to the earliest of the current and given
    /// times.
    pub fn update_next_scheduled_evaluation_time(&mut self, ndx: usize, time: EngineTime) {
        self.heap.push_increase(ndx, Reverse((time, ndx)));
        if time < self.next_time[ndx] {
            self.next_time[ndx] = time;
        }
    }

    /// The top of the heap, or MAX_DT when empty.
    pub fn next_scheduled_evaluation_time(&self) -> EngineTime {
        match self.heap.peek() {
            Some((_, Reverse((time, _)))) => *time,
            None => EngineTime::MAX_DT,
        }
    }

    /// Next scheduled time of one node, MAX_DT when unscheduled.
    pub fn node_next_time(&self, ndx: usize) -> EngineTime {
        self.next_time[ndx]
    }

    /// Subscriber-callback entry point.  Duplicate notifications within a
    /// tick are dropped silently.  A notification for a node at or below
    /// the currently evaluating index defers to the next tick; a higher
    /// index runs later within this tick.
    pub fn notify(&mut self, ndx: usize, time: EngineTime) {
        if self.notify_time[ndx] == time {
            return;
        }
        self.notify_time[ndx] = time;
        let mut at = time;
        if let Some(current) = self.evaluating
            && ndx <= current
            && time == self.current_tick
        {
            at = time.next();
        }
        self.update_next_scheduled_evaluation_time(ndx, at);
    }

    pub(crate) fn begin_tick(&mut self, now: EngineTime) {
        self.current_tick = now;
    }

    pub(crate) fn set_evaluating(&mut self, ndx: Option<usize>) {
        self.evaluating = ndx;
    }

    /// Pops the next node due at or before `now`.
    pub(crate) fn pop_due(&mut self, now: EngineTime) -> Option<usize> {
        match self.heap.peek() {
            Some((_, Reverse((time, _)))) if *time <= now => {
                let (ndx, _) = self.heap.pop().unwrap();
                self.next_time[ndx] = EngineTime::MAX_DT;
                Some(ndx)
            }
            _ => None,
        }
    }
}

/// Engine services handed down through output applications and subscriber
/// notifications within one node evaluation.
pub struct EngineCtx<'a> {
    pub time: EngineTime,
    pub scheduler: &'a mut Scheduler,
    pub end_of_tick: &'a mut EndOfTickQueue,
}

/// What an end-of-tick reset task points at.  A single callback set owned
/// by the engine with small descriptors avoids per-output closures.
pub(crate) enum ResetTask {
    Output(Weak<RefCell<TsOutput>>),
    RefLink(Weak<RefCell<TsRefTargetLink>>),
}

/// The engine's end-of-tick callback set: delta resets, slot-freelist
/// advances and rebind-delta clears registered during the tick.
#[derive(Default)]
pub struct EndOfTickQueue {
    tasks: Vec<ResetTask>,
}

impl EndOfTickQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register_output(&mut self, output: Weak<RefCell<TsOutput>>) {
        self.tasks.push(ResetTask::Output(output));
    }

    pub(crate) fn register_ref_link(&mut self, link: Weak<RefCell<TsRefTargetLink>>) {
        self.tasks.push(ResetTask::RefLink(link));
    }

    pub(crate) fn run(&mut self) {
        for task in self.tasks.drain(..) {
            match task {
                ResetTask::Output(output) => {
                    if let Some(output) = output.upgrade() {
                        output.borrow_mut().end_tick();
                    }
                }
                ResetTask::RefLink(link) => {
                    if let Some(link) = link.upgrade() {
                        link.borrow_mut().end_tick();
                    }
                }
            }
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
    fn orders_by_time_then_index() {
        let mut sched = Scheduler::new(4);
        sched.update_next_scheduled_evaluation_time(3, t(10));
        sched.update_next_scheduled_evaluation_time(1, t(10));
        sched.update_next_scheduled_evaluation_time(2, t(5));
        assert_eq!(sched.next_scheduled_evaluation_time(), t(5));
        assert_eq!(sched.pop_due(t(10)), Some(2));
        assert_eq!(sched.pop_due(t(10)), Some(1));
        assert_eq!(sched.pop_due(t(10)), Some(3));
        assert_eq!(sched.pop_due(t(10)), None);
        assert_eq!(sched.next_scheduled_evaluation_time(), EngineTime::MAX_DT);
    }

    #[test]
    fn scheduling_coalesces_to_earliest() {
        let mut sched = Scheduler::new(2);
        sched.update_next_scheduled_evaluation_time(0, t(20));
        sched.update_next_scheduled_evaluation_time(0, t(10));
        sched.update_next_scheduled_evaluation_time(0, t(30));
        assert_eq!(sched.node_next_time(0), t(10));
        assert_eq!(sched.pop_due(t(30)), Some(0));
        assert_eq!(sched.pop_due(t(30)), None);
        assert_eq!(sched.node_next_time(0), EngineTime::MAX_DT);
    }

    #[test]
    fn notify_dedups_within_tick() {
        let mut sched = Scheduler::new(2);
        sched.begin_tick(t(5));
        sched.notify(1, t(5));
        sched.notify(1, t(5));
        assert_eq!(sched.pop_due(t(5)), Some(1));
        // the duplicate was dropped
        assert_eq!(sched.pop_due(t(5)), None);
    }

    #[test]
    fn notify_defers_lower_index_to_next_tick() {
        let mut sched = Scheduler::new(5);
        sched.begin_tick(t(5));
        sched.set_evaluating(Some(2));
        sched.notify(1, t(5));
        sched.notify(4, t(5));
        sched.set_evaluating(None);
        // higher index runs within this tick
        assert_eq!(sched.pop_due(t(5)), Some(4));
        assert_eq!(sched.pop_due(t(5)), None);
        // lower index deferred to the next tick
        assert_eq!(sched.next_scheduled_evaluation_time(), t(5).next());
    }
}
