use smallvec::SmallVec;
use std::cell::RefCell;
use std::rc::{Rc, Weak};

use super::output::{OutputDirectory, OutputRef};
use crate::meta::{TsKind, TypeMeta};
use crate::node::NodeKey;
use crate::scheduler::EngineCtx;
use crate::time::EngineTime;
use crate::value::{HostValue, RefValue, ScalarValue, Value};

/// Subscriber callback.  Implemented by [TsLink] (schedules the owning
/// node) and [TsRefTargetLink] (rewrites its data channel first).
pub trait Notify {
    fn notify(&mut self, ctx: &mut EngineCtx);
}

pub type LinkRef = Rc<RefCell<TsLink>>;

/// A direct binding of an input (or an input child slot) to an output.
/// Active links are registered with the output's overlay; passive links
/// are not.  Unbind preserves `active` so a rebind resubscribes.
pub struct TsLink {
    pub(crate) output: Option<OutputRef>,
    owner: NodeKey,
    active: bool,
    element_index: Option<usize>,
    sample_time: EngineTime,
    notify_time: EngineTime,
    notify_once: bool,
    fired_since_bind: bool,
}

impl TsLink {
    pub(crate) fn create(owner: NodeKey, element_index: Option<usize>, notify_once: bool) -> LinkRef {
        Rc::new(RefCell::new(TsLink {
            output: None,
            owner,
            active: true,
            element_index,
            sample_time: EngineTime::MAX_DT,
            notify_time: EngineTime::MAX_DT,
            notify_once,
            fired_since_bind: false,
        }))
    }

    pub fn output(&self) -> Option<&OutputRef> {
        self.output.as_ref()
    }

    pub fn owner(&self) -> NodeKey {
        self.owner
    }

    pub fn active(&self) -> bool {
        self.active
    }

    pub fn element_index(&self) -> Option<usize> {
        self.element_index
    }

    pub fn sample_time(&self) -> EngineTime {
        self.sample_time
    }

    pub fn modified_at(&self, time: EngineTime) -> bool {
        self.output
            .as_ref()
            .is_some_and(|output| output.modified_at(time))
    }

    pub fn last_modified_time(&self) -> EngineTime {
        self.output
            .as_ref()
            .map(|output| output.last_modified_time())
            .unwrap_or(EngineTime::MAX_DT)
    }
}

impl Notify for TsLink {
    fn notify(&mut self, ctx: &mut EngineCtx) {
        if self.notify_time == ctx.time {
            return;
        }
        self.notify_time = ctx.time;
        if self.notify_once && self.fired_since_bind {
            return;
        }
        self.fired_since_bind = true;
        ctx.scheduler.notify(self.owner.node_ndx, ctx.time);
    }
}

/// Binds a link to an output.  Re-binding to the same output is a no-op
/// for the subscriber set.
pub(crate) fn bind_link(link: &LinkRef, target: &OutputRef, time: EngineTime) {
    {
        let l = link.borrow();
        if let Some(old) = &l.output
            && old.ptr_eq(target)
        {
            return;
        }
    }
    unbind_link(link);
    let active = {
        let mut l = link.borrow_mut();
        l.output = Some(target.clone());
        l.sample_time = time;
        l.fired_since_bind = false;
        l.active
    };
    if active {
        target.subscribe(link.clone());
    }
}

/// Unbinds a link, preserving its `active` flag.
pub(crate) fn unbind_link(link: &LinkRef) {
    let old = link.borrow_mut().output.take();
    if let Some(old) = old {
        let subscriber: Rc<RefCell<dyn Notify>> = link.clone();
        old.unsubscribe(&subscriber);
    }
}

/// Toggles the link's subscription with the bound output's overlay.
pub(crate) fn set_link_active(link: &LinkRef, active: bool) {
    let (changed, output) = {
        let mut l = link.borrow_mut();
        let changed = l.active != active;
        l.active = active;
        (changed, l.output.clone())
    };
    if !changed {
        return;
    }
    if let Some(output) = output {
        if active {
            output.subscribe(link.clone());
        } else {
            let subscriber: Rc<RefCell<dyn Notify>> = link.clone();
            output.unsubscribe(&subscriber);
        }
    }
}

/// Eagerly computed collection delta between the old and new target of a
/// rebound ref, cleared by the end-of-tick callback.
#[derive(Debug, Default)]
pub struct RebindDelta {
    pub added: Vec<(ScalarValue, Option<Value>)>,
    pub removed: Vec<ScalarValue>,
    pub updated: Vec<(ScalarValue, Value)>,
}

fn compute_rebind_delta(
    target_meta: &'static TypeMeta,
    old: Option<&OutputRef>,
    new: &OutputRef,
) -> Option<RebindDelta> {
    match target_meta.kind() {
        TsKind::Set => {
            let mut delta = RebindDelta::default();
            let new_view = new.view();
            let new_set = new_view.value().as_set()?;
            match old {
                Some(old) => {
                    let old_view = old.view();
                    let old_set = old_view.value().as_set()?;
                    for (_, key) in new_set.iter() {
                        if !old_set.contains(key) {
                            delta.added.push((key.clone(), None));
                        }
                    }
                    for (_, key) in old_set.iter() {
                        if !new_set.contains(key) {
                            delta.removed.push(key.clone());
                        }
                    }
                }
                None => {
                    for (_, key) in new_set.iter() {
                        delta.added.push((key.clone(), None));
                    }
                }
            }
            Some(delta)
        }
        TsKind::Map => {
            let value_meta = target_meta.element()?;
            let mut delta = RebindDelta::default();
            let new_view = new.view();
            let new_map = new_view.value().as_map()?;
            match old {
                Some(old) => {
                    let old_view = old.view();
                    let old_map = old_view.value().as_map()?;
                    for (_, key, value) in new_map.iter() {
                        match old_map.get(key) {
                            None => delta.added.push((key.clone(), Some(value.clone()))),
                            Some(prior) => {
                                if !(value_meta.ops().equals)(value_meta, prior, value) {
                                    delta.updated.push((key.clone(), value.clone()));
                                }
                            }
                        }
                    }
                    for (_, key, _) in old_map.iter() {
                        if !new_map.contains(key) {
                            delta.removed.push(key.clone());
                        }
                    }
                }
                None => {
                    for (_, key, value) in new_map.iter() {
                        delta.added.push((key.clone(), Some(value.clone())));
                    }
                }
            }
            Some(delta)
        }
        _ => None,
    }
}

/// The single-notifiable REF indirection link: a control channel
/// permanently subscribed to a Ref output's overlay, plus data channels
/// rewritten whenever the control channel fires.
pub struct TsRefTargetLink {
    owner: NodeKey,
    directory: OutputDirectory,
    ref_output: OutputRef,
    target_meta: &'static TypeMeta,
    control_sample_time: EngineTime,
    notify_time: EngineTime,
    active: bool,
    data: Vec<LinkRef>,
    data_nav: Vec<SmallVec<[usize; 4]>>,
    prev_target: Option<OutputRef>,
    rebind_delta: Option<RebindDelta>,
    self_ref: Weak<RefCell<TsRefTargetLink>>,
}

impl TsRefTargetLink {
    pub(crate) fn create(
        owner: NodeKey,
        directory: OutputDirectory,
        ref_output: &OutputRef,
        target_meta: &'static TypeMeta,
    ) -> Rc<RefCell<TsRefTargetLink>> {
        let link = Rc::new(RefCell::new(TsRefTargetLink {
            owner,
            directory,
            ref_output: ref_output.clone(),
            target_meta,
            control_sample_time: EngineTime::MAX_DT,
            notify_time: EngineTime::MAX_DT,
            active: true,
            data: Vec::new(),
            data_nav: Vec::new(),
            prev_target: None,
            rebind_delta: None,
            self_ref: Weak::new(),
        }));
        link.borrow_mut().self_ref = Rc::downgrade(&link);
        // the control channel is permanently subscribed
        ref_output.subscribe(link.clone());
        link
    }

    pub fn owner(&self) -> NodeKey {
        self.owner
    }

    pub fn active(&self) -> bool {
        self.active
    }

    /// The ref-channel sample time: the last tick the ref output fired.
    pub fn sample_time(&self) -> EngineTime {
        self.control_sample_time
    }

    /// The current single-channel target, when the ref is Peered.
    pub fn target(&self) -> Option<OutputRef> {
        match self.data.as_slice() {
            [only] => only.borrow().output.clone(),
            _ => None,
        }
    }

    pub fn prev_target(&self) -> Option<&OutputRef> {
        self.prev_target.as_ref()
    }

    pub fn rebind_delta(&self) -> Option<&RebindDelta> {
        self.rebind_delta.as_ref()
    }

    /// `modified_at` of the indirection: the ref channel sampled this
    /// tick, or any bound target modified this tick.
    pub fn modified_at(&self, time: EngineTime) -> bool {
        self.control_sample_time == time
            || self
                .data
                .iter()
                .any(|link| link.borrow().modified_at(time))
    }

    pub fn last_modified_time(&self) -> EngineTime {
        let mut last = EngineTime::MAX_DT;
        let mut seen = false;
        if !self.control_sample_time.is_never() {
            last = self.control_sample_time;
            seen = true;
        }
        for link in &self.data {
            let t = link.borrow().last_modified_time();
            if !t.is_never() && (!seen || t > last) {
                last = t;
                seen = true;
            }
        }
        last
    }

    /// Resolved value seen through the indirection: the navigated single
    /// target, or the element-wise composition for non-peered refs.
    pub fn read_host(&self) -> Option<HostValue> {
        match self.data.as_slice() {
            [] => None,
            [only] => self.read_leaf(only, &self.data_nav[0]),
            many => Some(HostValue::List(
                many.iter()
                    .zip(self.data_nav.iter())
                    .map(|(link, nav)| self.read_leaf(link, nav).unwrap_or(HostValue::Null))
                    .collect(),
            )),
        }
    }

    fn read_leaf(&self, link: &LinkRef, nav: &[usize]) -> Option<HostValue> {
        let link = link.borrow();
        let output = link.output.as_ref()?;
        if !output.valid() {
            return None;
        }
        if nav.is_empty() {
            return output.to_host();
        }
        let sub_meta = output.meta().navigate(nav).ok()?;
        let view = output.view();
        let value = view.navigated(nav)?;
        Some((sub_meta.ops().to_host)(sub_meta, value))
    }

    pub(crate) fn set_active(&mut self, active: bool) {
        self.active = active;
        for link in &self.data {
            set_link_active(link, active);
        }
    }

    /// End-of-tick: drop the captured previous target and rebind delta.
    pub(crate) fn end_tick(&mut self) {
        self.prev_target = None;
        self.rebind_delta = None;
    }

    fn apply_ref(&mut self, rv: &RefValue, ctx: &mut EngineCtx) {
        let leaves = rv.leaves();
        let single = leaves.len() == 1;
        while self.data.len() < leaves.len() {
            let link = TsLink::create(self.owner, None, false);
            if !self.active {
                set_link_active(&link, false);
            }
            self.data.push(link);
            self.data_nav.push(SmallVec::new());
        }
        // channels beyond the new leaf count unbind but are kept
        for link in self.data.iter().skip(leaves.len()) {
            unbind_link(link);
        }
        for (i, leaf) in leaves.iter().enumerate() {
            match leaf {
                None => {
                    unbind_link(&self.data[i]);
                    self.data_nav[i].clear();
                }
                Some(path) => match self.directory.resolve(path) {
                    Err(err) => {
                        log::error!("ref target {path:?} failed to resolve: {err}");
                        unbind_link(&self.data[i]);
                        self.data_nav[i].clear();
                    }
                    Ok(new_target) => {
                        let differs = match self.data[i].borrow().output.as_ref() {
                            Some(old) => !old.ptr_eq(&new_target),
                            None => true,
                        };
                        if differs {
                            if single {
                                let old = self.data[i].borrow().output.clone();
                                self.rebind_delta = compute_rebind_delta(
                                    self.target_meta,
                                    old.as_ref(),
                                    &new_target,
                                );
                                self.prev_target = old;
                            }
                            bind_link(&self.data[i], &new_target, ctx.time);
                        }
                        self.data_nav[i] = path.navigation.clone();
                    }
                },
            }
        }
    }
}

impl Notify for TsRefTargetLink {
    fn notify(&mut self, ctx: &mut EngineCtx) {
        if self.notify_time == ctx.time {
            return;
        }
        self.notify_time = ctx.time;
        let rv = match self.ref_output.view().value().as_ref_value() {
            Some(rv) => rv.clone(),
            None => RefValue::Empty,
        };
        self.apply_ref(&rv, ctx);
        self.control_sample_time = ctx.time;
        ctx.end_of_tick.register_ref_link(self.self_ref.clone());
        ctx.scheduler.notify(self.owner.node_ndx, ctx.time);
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::engine::{EvaluationEngine, RunFor, RunMode};
    use crate::graph::GraphBuilder;
    use crate::meta::TypeMeta;
    use crate::node::NodeKey;
    use crate::ts::OutputRef;
    use crate::value::RefPath;
    use std::cell::RefCell;

    fn t(v: u64) -> EngineTime {
        EngineTime::new(v)
    }

    fn key(ndx: usize) -> NodeKey {
        NodeKey {
            graph_id: 0,
            node_ndx: ndx,
        }
    }

    #[test]
    fn active_survives_unbind_and_rebind_resubscribes() {
        let output = OutputRef::new(TypeMeta::int(), key(0));
        let link = TsLink::create(key(1), None, false);
        bind_link(&link, &output, t(0));
        assert_eq!(output.subscriber_count(), 1);
        unbind_link(&link);
        assert_eq!(output.subscriber_count(), 0);
        assert!(link.borrow().active());
        bind_link(&link, &output, t(1));
        assert_eq!(output.subscriber_count(), 1);
        // re-binding to the same output is a no-op for the subscriber set
        bind_link(&link, &output, t(2));
        assert_eq!(output.subscriber_count(), 1);
        assert_eq!(link.borrow().sample_time(), t(1));
    }

    #[test]
    fn notify_once_fires_once_per_bind() {
        use crate::scheduler::{EndOfTickQueue, Scheduler};
        let output = OutputRef::new(TypeMeta::int(), key(0));
        let link = TsLink::create(key(1), None, true);
        bind_link(&link, &output, t(0));
        let mut sched = Scheduler::new(2);
        let mut eot = EndOfTickQueue::new();
        let mut ctx = EngineCtx {
            time: t(1),
            scheduler: &mut sched,
            end_of_tick: &mut eot,
        };
        output.apply(HostValue::Int(1), &mut ctx).unwrap();
        ctx.time = t(2);
        output.apply(HostValue::Int(2), &mut ctx).unwrap();
        assert_eq!(ctx.scheduler.pop_due(t(2)), Some(1));
        // the second apply was swallowed by notify_once
        assert_eq!(ctx.scheduler.pop_due(t(2)), None);
        // a fresh bind re-arms it
        unbind_link(&link);
        bind_link(&link, &output, t(3));
        ctx.time = t(3);
        output.apply(HostValue::Int(3), &mut ctx).unwrap();
        assert_eq!(ctx.scheduler.pop_due(t(3)), Some(1));
    }

    #[test]
    fn passive_link_never_subscribes() {
        let output = OutputRef::new(TypeMeta::int(), key(0));
        let link = TsLink::create(key(1), None, false);
        set_link_active(&link, false);
        bind_link(&link, &output, t(0));
        assert_eq!(output.subscriber_count(), 0);
        set_link_active(&link, true);
        assert_eq!(output.subscriber_count(), 1);
        set_link_active(&link, false);
        assert_eq!(output.subscriber_count(), 0);
    }

    #[test]
    fn ref_rebind_sees_target_value_set_earlier() {
        let _ = env_logger::try_init();
        let ref_meta = TypeMeta::ref_to(TypeMeta::int());
        let mut builder = GraphBuilder::new();
        let a = builder.pull_source(
            "a",
            TypeMeta::int(),
            vec![(t(1), HostValue::Int(7))],
        );
        let b = builder.pull_source(
            "b",
            TypeMeta::int(),
            vec![(t(3), HostValue::Int(9))],
        );
        let r = builder.pull_source(
            "r",
            ref_meta,
            vec![
                (t(0), HostValue::Ref(RefValue::Peered(RefPath::output(a.ndx())))),
                (t(5), HostValue::Ref(RefValue::Peered(RefPath::output(b.ndx())))),
            ],
        );
        let events: Rc<RefCell<Vec<(EngineTime, Option<i64>, bool)>>> = Default::default();
        let record = events.clone();
        let observer = builder.compute("observer", &[r], TypeMeta::int(), move |ctx| {
            let now = ctx.time();
            let value = ctx.input(0).to_host().and_then(|v| v.as_int());
            record
                .borrow_mut()
                .push((now, value, ctx.input(0).modified_at(now)));
            Ok(())
        });
        let graph = builder.build().unwrap();
        let observer_input_last = {
            let mut engine = EvaluationEngine::new(graph, RunMode::HistoricalFrom(t(0)));
            engine.run(RunFor::Forever).unwrap();
            engine
                .graph()
                .node(observer.ndx())
                .inputs()[0]
                .last_modified_time()
        };
        // T0 bind to A (invalid), T1 A ticks, T5 rebind to B; B's tick at
        // T3 must not notify because A was the bound target
        assert_eq!(
            &*events.borrow(),
            &[
                (t(0), None, true),
                (t(1), Some(7), true),
                (t(5), Some(9), true),
            ]
        );
        assert_eq!(observer_input_last, t(5));
    }

    #[test]
    fn collection_rebind_computes_eager_delta() {
        let set_meta = TypeMeta::set_of(TypeMeta::int()).unwrap();
        let ref_meta = TypeMeta::ref_to(set_meta);
        let mut builder = GraphBuilder::new();
        let s1 = builder.pull_source(
            "s1",
            set_meta,
            vec![(t(0), HostValue::Set(vec![HostValue::Int(1), HostValue::Int(2)]))],
        );
        let s2 = builder.pull_source(
            "s2",
            set_meta,
            vec![(t(0), HostValue::Set(vec![HostValue::Int(2), HostValue::Int(3)]))],
        );
        let r = builder.pull_source(
            "r",
            ref_meta,
            vec![
                (t(1), HostValue::Ref(RefValue::Peered(RefPath::output(s1.ndx())))),
                (t(2), HostValue::Ref(RefValue::Peered(RefPath::output(s2.ndx())))),
            ],
        );
        let deltas: Rc<RefCell<Vec<(Vec<i64>, Vec<i64>)>>> = Default::default();
        let record = deltas.clone();
        builder.compute("observer", &[r], set_meta, move |ctx| {
            if let Some(link) = ctx.input(0).ref_link() {
                let link = link.borrow();
                if let Some(delta) = link.rebind_delta() {
                    let added = delta
                        .added
                        .iter()
                        .map(|(k, _)| match k {
                            ScalarValue::Int(v) => *v,
                            _ => panic!(),
                        })
                        .collect();
                    let removed = delta
                        .removed
                        .iter()
                        .map(|k| match k {
                            ScalarValue::Int(v) => *v,
                            _ => panic!(),
                        })
                        .collect();
                    record.borrow_mut().push((added, removed));
                }
            }
            Ok(())
        });
        let graph = builder.build().unwrap();
        let observer_ref_link = graph.node(3).inputs()[0].ref_link().unwrap();
        let mut engine = EvaluationEngine::new(graph, RunMode::HistoricalFrom(t(0)));
        engine.run(RunFor::Forever).unwrap();
        // first bind: everything added; rebind s1 -> s2: 3 added, 1 removed
        assert_eq!(
            &*deltas.borrow(),
            &[(vec![1, 2], vec![]), (vec![3], vec![1])]
        );
        // the rebind delta cleared at end of tick
        assert!(observer_ref_link.borrow().rebind_delta().is_none());
    }

    #[test]
    fn empty_ref_unbinds_the_data_channel() {
        let ref_meta = TypeMeta::ref_to(TypeMeta::int());
        let mut builder = GraphBuilder::new();
        let a = builder.pull_source("a", TypeMeta::int(), vec![(t(0), HostValue::Int(4))]);
        let r = builder.pull_source(
            "r",
            ref_meta,
            vec![
                (t(1), HostValue::Ref(RefValue::Peered(RefPath::output(a.ndx())))),
                (t(2), HostValue::Ref(RefValue::Empty)),
            ],
        );
        let seen: Rc<RefCell<Vec<Option<i64>>>> = Default::default();
        let record = seen.clone();
        builder.compute("observer", &[r], TypeMeta::int(), move |ctx| {
            record
                .borrow_mut()
                .push(ctx.input(0).to_host().and_then(|v| v.as_int()));
            Ok(())
        });
        let graph = builder.build().unwrap();
        let mut engine = EvaluationEngine::new(graph, RunMode::HistoricalFrom(t(0)));
        engine.run(RunFor::Forever).unwrap();
        assert_eq!(&*seen.borrow(), &[Some(4), None]);
    }

    #[test]
    fn ref_wrapper_presents_a_synthetic_ref() {
        let ref_meta = TypeMeta::ref_to(TypeMeta::int());
        let mut builder = GraphBuilder::new();
        let a = builder.pull_source("a", TypeMeta::int(), vec![(t(1), HostValue::Int(4))]);
        let holder = builder.add_node(
            "holder",
            crate::node::NodeKind::Compute,
            crate::nodes::ComputeBody::new(|_ctx| Ok(())),
        );
        let input = builder.add_input(holder, "in", ref_meta);
        builder.connect(a, holder, input);
        let graph = builder.build().unwrap();
        let wrapped = graph.node(holder.ndx()).inputs()[0].to_host();
        match wrapped {
            Some(HostValue::Ref(RefValue::Peered(path))) => {
                assert_eq!(path.node, a.ndx());
            }
            other => panic!("expected a synthetic ref, got {other:?}"),
        }
        let start = t(0);
        let mut engine = EvaluationEngine::new(graph, RunMode::HistoricalFrom(start));
        engine.run(RunFor::Forever).unwrap();
        // modified only at bind time, which is graph start
        let input = &engine.graph().node(holder.ndx()).inputs()[0];
        assert_eq!(input.last_modified_time(), start);
        assert!(input.modified_at(start));
        assert!(!input.modified_at(t(1)));
    }
}
