use indexmap::IndexSet;
use smallvec::SmallVec;
use std::cell::{Ref, RefCell};
use std::rc::{Rc, Weak};

use super::hash_by_ref::HashByRef;
use super::link::Notify;
use crate::delta::DeltaView;
use crate::error::RuntimeError;
use crate::meta::TypeMeta;
use crate::node::NodeKey;
use crate::scheduler::EngineCtx;
use crate::time::EngineTime;
use crate::tracker::ModificationTracker;
use crate::value::{HostValue, PortRef, RefPath, Value};

/// An output's subscriber set plus per-tick callback registration.
/// Subscribe is idempotent; notification order is set-insertion order.
#[derive(Default)]
pub struct Overlay {
    subscribers: IndexSet<HashByRef<RefCell<dyn Notify>>>,
}

impl Overlay {
    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    pub(crate) fn subscribe(&mut self, subscriber: Rc<RefCell<dyn Notify>>) -> bool {
        self.subscribers.insert(HashByRef::new(subscriber))
    }

    pub(crate) fn unsubscribe(&mut self, subscriber: &Rc<RefCell<dyn Notify>>) -> bool {
        // shift_remove keeps the notification order deterministic
        self.subscribers
            .shift_remove(&HashByRef::new(subscriber.clone()))
    }

    fn snapshot(&self) -> SmallVec<[Rc<RefCell<dyn Notify>>; 8]> {
        self.subscribers.iter().map(|s| s.val.clone()).collect()
    }
}

/// The writable endpoint of a time-series edge: a typed value, its
/// modification tracker and the overlay of subscribers.
pub struct TsOutput {
    meta: &'static TypeMeta,
    value: Value,
    tracker: ModificationTracker,
    valid: bool,
    owner: NodeKey,
    pub(crate) overlay: Overlay,
    host_cache: Option<(EngineTime, HostValue)>,
    reset_pending: bool,
}

impl TsOutput {
    fn new(meta: &'static TypeMeta, owner: NodeKey) -> Self {
        Self {
            meta,
            value: (meta.ops().construct)(meta),
            tracker: ModificationTracker::new(meta),
            valid: false,
            owner,
            overlay: Overlay::default(),
            host_cache: None,
            reset_pending: false,
        }
    }

    pub fn meta(&self) -> &'static TypeMeta {
        self.meta
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn tracker(&self) -> &ModificationTracker {
        &self.tracker
    }

    pub fn valid(&self) -> bool {
        self.valid
    }

    pub fn owner(&self) -> NodeKey {
        self.owner
    }

    pub fn last_modified_time(&self) -> EngineTime {
        self.tracker.last_modified_time()
    }

    pub fn modified_at(&self, time: EngineTime) -> bool {
        self.tracker.modified_at(time)
    }

    /// Host conversion, cached until `last_modified_time` advances.
    pub(crate) fn host_value(&mut self) -> HostValue {
        let at = self.tracker.last_modified_time();
        if let Some((cached_at, cached)) = &self.host_cache
            && *cached_at == at
        {
            return cached.clone();
        }
        let host = (self.meta.ops().to_host)(self.meta, &self.value);
        self.host_cache = Some((at, host.clone()));
        host
    }

    pub(crate) fn end_tick(&mut self) {
        self.tracker.end_tick();
        self.value.end_tick();
        self.reset_pending = false;
    }
}

/// Shared handle to a [TsOutput].  The owning node holds one; links and
/// the graph's output directory hold non-owning copies.
#[derive(Clone)]
pub struct OutputRef(Rc<RefCell<TsOutput>>);

impl OutputRef {
    pub(crate) fn new(meta: &'static TypeMeta, owner: NodeKey) -> Self {
        Self(Rc::new(RefCell::new(TsOutput::new(meta, owner))))
    }

    pub fn ptr_eq(&self, other: &OutputRef) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn downgrade(&self) -> Weak<RefCell<TsOutput>> {
        Rc::downgrade(&self.0)
    }

    pub fn meta(&self) -> &'static TypeMeta {
        self.0.borrow().meta
    }

    pub fn owner(&self) -> NodeKey {
        self.0.borrow().owner
    }

    pub fn valid(&self) -> bool {
        self.0.borrow().valid
    }

    pub fn last_modified_time(&self) -> EngineTime {
        self.0.borrow().last_modified_time()
    }

    pub fn modified_at(&self, time: EngineTime) -> bool {
        self.0.borrow().modified_at(time)
    }

    /// Non-owning view of the value and its delta.
    pub fn view(&self) -> OutputView<'_> {
        OutputView(self.0.borrow())
    }

    /// Current host conversion; None while invalid.
    pub fn to_host(&self) -> Option<HostValue> {
        let mut out = self.0.borrow_mut();
        if !out.valid {
            return None;
        }
        Some(out.host_value())
    }

    /// Applies a host value at `time`.  The host null marks the output
    /// invalid instead; subscribers are notified either way.
    pub fn apply(&self, host: HostValue, ctx: &mut EngineCtx) -> Result<(), RuntimeError> {
        if host.is_null() {
            return self.mark_invalid(ctx);
        }
        {
            let mut out = self.0.borrow_mut();
            let meta = out.meta;
            let TsOutput { value, tracker, .. } = &mut *out;
            (meta.ops().apply_host)(meta, value, tracker, host, ctx.time)?;
            out.valid = true;
            out.host_cache = None;
            if !out.reset_pending {
                out.reset_pending = true;
                ctx.end_of_tick.register_output(self.downgrade());
            }
        }
        self.fire(ctx);
        Ok(())
    }

    /// Clears the value and cached conversions; subscribers are notified
    /// with the invalid-value signal.
    pub fn mark_invalid(&self, ctx: &mut EngineCtx) -> Result<(), RuntimeError> {
        {
            let mut out = self.0.borrow_mut();
            out.tracker.mark_modified(ctx.time)?;
            let meta = out.meta;
            out.value = (meta.ops().construct)(meta);
            out.valid = false;
            out.host_cache = None;
            if !out.reset_pending {
                out.reset_pending = true;
                ctx.end_of_tick.register_output(self.downgrade());
            }
        }
        self.fire(ctx);
        Ok(())
    }

    /// Marks the whole value modified without touching storage.
    /// Monotonic: `time` must be at or after the last modification.
    pub fn mark_modified(&self, ctx: &mut EngineCtx) -> Result<(), RuntimeError> {
        {
            let mut out = self.0.borrow_mut();
            out.tracker.mark_modified(ctx.time)?;
            out.host_cache = None;
            if !out.reset_pending {
                out.reset_pending = true;
                ctx.end_of_tick.register_output(self.downgrade());
            }
        }
        self.fire(ctx);
        Ok(())
    }

    /// Idempotent; a new subscriber is not notified retroactively.
    pub fn subscribe(&self, subscriber: Rc<RefCell<dyn Notify>>) {
        self.0.borrow_mut().overlay.subscribe(subscriber);
    }

    pub fn unsubscribe(&self, subscriber: &Rc<RefCell<dyn Notify>>) {
        self.0.borrow_mut().overlay.unsubscribe(subscriber);
    }

    pub fn subscriber_count(&self) -> usize {
        self.0.borrow().overlay.len()
    }

    /// Notify the overlay's subscribers.  The snapshot is taken first so
    /// subscribers may read this output or adjust subscriptions freely.
    pub(crate) fn fire(&self, ctx: &mut EngineCtx) {
        let subscribers = self.0.borrow().overlay.snapshot();
        for subscriber in subscribers {
            subscriber.borrow_mut().notify(ctx);
        }
    }
}

/// Non-owning view over an output's value.
pub struct OutputView<'a>(Ref<'a, TsOutput>);

impl OutputView<'_> {
    pub fn meta(&self) -> &'static TypeMeta {
        self.0.meta
    }

    pub fn value(&self) -> &Value {
        &self.0.value
    }

    pub fn valid(&self) -> bool {
        self.0.valid
    }

    pub fn last_modified_time(&self) -> EngineTime {
        self.0.last_modified_time()
    }

    /// The delta at `time`; None outside the open tick at `time`.  The
    /// end-of-tick reset closes the tick and invalidates the view.
    pub fn delta(&self, time: EngineTime) -> Option<DeltaView<'_>> {
        if !self.0.reset_pending {
            return None;
        }
        DeltaView::new(self.0.meta, &self.0.value, &self.0.tracker, time)
    }

    /// Typed view navigated into a bundle-field / list-element chain.
    pub fn navigated(&self, nav: &[usize]) -> Option<&Value> {
        self.0.value.navigate(nav)
    }
}

/// Shared per-graph directory resolving [RefPath]s to outputs.  Entry `n`
/// holds node `n`'s own output and, per input, the output its input is
/// peered to.
#[derive(Clone, Default)]
pub struct OutputDirectory(Rc<RefCell<Vec<DirEntry>>>);

#[derive(Default)]
pub(crate) struct DirEntry {
    pub output: Option<OutputRef>,
    pub input_peers: Vec<Option<OutputRef>>,
}

impl OutputDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push_entry(&self, entry: DirEntry) {
        self.0.borrow_mut().push(entry);
    }

    pub(crate) fn set_input_peer(&self, node: usize, input: usize, output: Option<OutputRef>) {
        let mut entries = self.0.borrow_mut();
        let peers = &mut entries[node].input_peers;
        if peers.len() <= input {
            peers.resize_with(input + 1, || None);
        }
        peers[input] = output;
    }

    /// Resolves a path to the output it names.  Navigation indices are
    /// applied by the reader against the resolved output's view.
    pub fn resolve(&self, path: &RefPath) -> Result<OutputRef, RuntimeError> {
        let entries = self.0.borrow();
        let entry = entries
            .get(path.node)
            .ok_or_else(|| RuntimeError::Wiring(format!("no node {} in graph", path.node)))?;
        let output = match path.port {
            PortRef::Output => entry.output.clone(),
            PortRef::Input(input) => entry.input_peers.get(input).cloned().flatten(),
        };
        output.ok_or_else(|| {
            RuntimeError::Wiring(format!(
                "reference path {:?} does not resolve to an output",
                path
            ))
        })
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::scheduler::{EndOfTickQueue, Scheduler};
    use crate::ts::{TsLink, bind_link};

    fn t(v: u64) -> EngineTime {
        EngineTime::new(v)
    }

    fn key() -> NodeKey {
        NodeKey {
            graph_id: 0,
            node_ndx: 0,
        }
    }

    #[test]
    fn apply_is_monotonic() {
        let output = OutputRef::new(TypeMeta::int(), key());
        let mut sched = Scheduler::new(1);
        let mut eot = EndOfTickQueue::new();
        let mut ctx = EngineCtx {
            time: t(5),
            scheduler: &mut sched,
            end_of_tick: &mut eot,
        };
        output.apply(HostValue::Int(1), &mut ctx).unwrap();
        assert_eq!(output.last_modified_time(), t(5));
        ctx.time = t(7);
        output.apply(HostValue::Int(2), &mut ctx).unwrap();
        ctx.time = t(3);
        let err = output.apply(HostValue::Int(3), &mut ctx);
        assert!(matches!(err, Err(RuntimeError::Protocol(_))));
        // the failed apply left value and time untouched
        assert_eq!(output.last_modified_time(), t(7));
        assert_eq!(output.to_host(), Some(HostValue::Int(2)));
    }

    #[test]
    fn type_mismatch_is_fatal() {
        let output = OutputRef::new(TypeMeta::int(), key());
        let mut sched = Scheduler::new(1);
        let mut eot = EndOfTickQueue::new();
        let mut ctx = EngineCtx {
            time: t(1),
            scheduler: &mut sched,
            end_of_tick: &mut eot,
        };
        let err = output.apply(HostValue::Str("oops".into()), &mut ctx);
        match err {
            Err(e) => assert!(e.is_fatal()),
            Ok(_) => panic!("mismatched apply must fail"),
        }
    }

    #[test]
    fn null_marks_invalid_and_still_notifies() {
        let output = OutputRef::new(TypeMeta::int(), key());
        let owner = NodeKey {
            graph_id: 0,
            node_ndx: 1,
        };
        let link = TsLink::create(owner, None, false);
        bind_link(&link, &output, t(0));
        let mut sched = Scheduler::new(2);
        let mut eot = EndOfTickQueue::new();
        sched.begin_tick(t(1));
        let mut ctx = EngineCtx {
            time: t(1),
            scheduler: &mut sched,
            end_of_tick: &mut eot,
        };
        output.apply(HostValue::Null, &mut ctx).unwrap();
        assert!(!output.valid());
        assert_eq!(output.to_host(), None);
        assert_eq!(output.modified_at(t(1)), true);
        // the subscriber still heard about it
        assert_eq!(sched.pop_due(t(1)), Some(1));
    }

    #[test]
    fn subscribe_is_idempotent_and_ordered() {
        let output = OutputRef::new(TypeMeta::int(), key());
        let a = TsLink::create(
            NodeKey {
                graph_id: 0,
                node_ndx: 1,
            },
            None,
            false,
        );
        let b = TsLink::create(
            NodeKey {
                graph_id: 0,
                node_ndx: 2,
            },
            None,
            false,
        );
        output.subscribe(a.clone());
        output.subscribe(b.clone());
        output.subscribe(a.clone());
        assert_eq!(output.subscriber_count(), 2);
        let mut sched = Scheduler::new(3);
        let mut eot = EndOfTickQueue::new();
        sched.begin_tick(t(1));
        let mut ctx = EngineCtx {
            time: t(1),
            scheduler: &mut sched,
            end_of_tick: &mut eot,
        };
        output.apply(HostValue::Int(1), &mut ctx).unwrap();
        // set-insertion order
        assert_eq!(sched.pop_due(t(1)), Some(1));
        assert_eq!(sched.pop_due(t(1)), Some(2));
    }

    #[test]
    fn host_conversion_is_cached_until_modified() {
        let output = OutputRef::new(TypeMeta::int(), key());
        let mut sched = Scheduler::new(1);
        let mut eot = EndOfTickQueue::new();
        let mut ctx = EngineCtx {
            time: t(1),
            scheduler: &mut sched,
            end_of_tick: &mut eot,
        };
        output.apply(HostValue::Int(5), &mut ctx).unwrap();
        assert_eq!(output.to_host(), Some(HostValue::Int(5)));
        assert_eq!(output.to_host(), Some(HostValue::Int(5)));
        ctx.time = t(2);
        output.apply(HostValue::Int(6), &mut ctx).unwrap();
        assert_eq!(output.to_host(), Some(HostValue::Int(6)));
    }
}
