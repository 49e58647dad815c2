//! A library of source, compute and sink node bodies plus the builder
//! shorthand used to wire them.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::graph::{GraphBuilder, NodeId};
use crate::meta::{TsKind, TypeMeta};
use crate::node::{NodeBody, NodeContext, NodeKind};
use crate::time::EngineTime;
use crate::value::HostValue;

/// Time-driven source: emits queued values at their times, scheduling
/// itself for the next pending entry.
pub struct PullSourceBody {
    pending: VecDeque<(EngineTime, HostValue)>,
}

impl PullSourceBody {
    pub fn new(mut values: Vec<(EngineTime, HostValue)>) -> Self {
        values.sort_by_key(|(time, _)| *time);
        Self {
            pending: values.into(),
        }
    }

    pub fn push(&mut self, time: EngineTime, value: HostValue) {
        self.pending.push_back((time, value));
    }
}

impl NodeBody for PullSourceBody {
    fn start(&mut self, ctx: &mut NodeContext) -> anyhow::Result<()> {
        if let Some((time, _)) = self.pending.front() {
            let at = (*time).max(ctx.time());
            ctx.schedule(at);
        }
        Ok(())
    }

    fn eval(&mut self, ctx: &mut NodeContext) -> anyhow::Result<()> {
        let now = ctx.time();
        while let Some((time, _)) = self.pending.front() {
            if *time > now {
                break;
            }
            let (_, value) = self.pending.pop_front().unwrap();
            ctx.apply(value)?;
        }
        if let Some((time, _)) = self.pending.front() {
            ctx.schedule(*time);
        }
        Ok(())
    }
}

/// Externally pushed source: applies whatever the tick loop staged from
/// the graph inbox, in arrival order.
#[derive(Default)]
pub struct PushSourceBody;

impl NodeBody for PushSourceBody {
    fn eval(&mut self, ctx: &mut NodeContext) -> anyhow::Result<()> {
        for value in ctx.take_staged() {
            ctx.apply(value)?;
        }
        Ok(())
    }
}

/// Emits one value on the first tick and never again.
pub struct ConstBody {
    value: Option<HostValue>,
}

impl ConstBody {
    pub fn new(value: HostValue) -> Self {
        Self { value: Some(value) }
    }
}

impl NodeBody for ConstBody {
    fn start(&mut self, ctx: &mut NodeContext) -> anyhow::Result<()> {
        ctx.schedule(ctx.time());
        Ok(())
    }

    fn eval(&mut self, ctx: &mut NodeContext) -> anyhow::Result<()> {
        if let Some(value) = self.value.take() {
            ctx.apply(value)?;
        }
        Ok(())
    }
}

/// Compute body backed by a closure over the node context.
pub struct ComputeBody<F>
where
    F: FnMut(&mut NodeContext) -> anyhow::Result<()> + 'static,
{
    func: F,
}

impl<F> ComputeBody<F>
where
    F: FnMut(&mut NodeContext) -> anyhow::Result<()> + 'static,
{
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

impl<F> NodeBody for ComputeBody<F>
where
    F: FnMut(&mut NodeContext) -> anyhow::Result<()> + 'static,
{
    fn eval(&mut self, ctx: &mut NodeContext) -> anyhow::Result<()> {
        (self.func)(ctx)
    }
}

/// Sink body: hands each modified value of input 0 to a closure.
pub struct SinkBody<F>
where
    F: FnMut(HostValue, EngineTime) + 'static,
{
    func: F,
}

impl<F> SinkBody<F>
where
    F: FnMut(HostValue, EngineTime) + 'static,
{
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

impl<F> NodeBody for SinkBody<F>
where
    F: FnMut(HostValue, EngineTime) + 'static,
{
    fn eval(&mut self, ctx: &mut NodeContext) -> anyhow::Result<()> {
        let now = ctx.time();
        let input = ctx.input(0);
        if input.modified_at(now)
            && let Some(value) = input.to_host()
        {
            (self.func)(value, now);
        }
        Ok(())
    }
}

/// Captured debug line with its tick time.
pub type DebugLines = Rc<RefCell<Vec<(EngineTime, String)>>>;

/// Prints `label: value` through the log facade for each modified value,
/// optionally capturing lines for assertions.
pub struct DebugPrintBody {
    label: String,
    lines: Option<DebugLines>,
}

impl DebugPrintBody {
    pub fn new(label: &str, lines: Option<DebugLines>) -> Self {
        Self {
            label: label.to_string(),
            lines,
        }
    }
}

impl NodeBody for DebugPrintBody {
    fn eval(&mut self, ctx: &mut NodeContext) -> anyhow::Result<()> {
        let now = ctx.time();
        let input = ctx.input(0);
        if input.modified_at(now)
            && let Some(value) = input.to_host()
        {
            let line = format!("{}: {value}", self.label);
            ctx.log(log::Level::Info, &line);
            if let Some(lines) = &self.lines {
                lines.borrow_mut().push((now, line));
            }
        }
        Ok(())
    }
}

impl GraphBuilder {
    /// A source that emits `value` once, on the first tick.
    pub fn const_source(
        &mut self,
        name: &str,
        meta: &'static TypeMeta,
        value: HostValue,
    ) -> NodeId {
        let id = self.add_node(name, NodeKind::PullSource, ConstBody::new(value));
        self.set_output(id, meta);
        id
    }

    /// A source that replays `(time, value)` pairs at their times.
    pub fn pull_source(
        &mut self,
        name: &str,
        meta: &'static TypeMeta,
        values: Vec<(EngineTime, HostValue)>,
    ) -> NodeId {
        let id = self.add_node(name, NodeKind::PullSource, PullSourceBody::new(values));
        self.set_output(id, meta);
        id
    }

    /// A source fed through [PushHandle](crate::graph::PushHandle).
    pub fn push_source(&mut self, name: &str, meta: &'static TypeMeta) -> NodeId {
        let id = self.add_node(name, NodeKind::PushSource, PushSourceBody);
        self.set_output(id, meta);
        id
    }

    /// A compute node wired to `srcs` in order.  Input metas derive from
    /// the source outputs; a Ref source binds in observer mode, so the
    /// input sees the resolved target.
    pub fn compute(
        &mut self,
        name: &str,
        srcs: &[NodeId],
        out_meta: &'static TypeMeta,
        func: impl FnMut(&mut NodeContext) -> anyhow::Result<()> + 'static,
    ) -> NodeId {
        let id = self.add_node(name, NodeKind::Compute, ComputeBody::new(func));
        self.set_output(id, out_meta);
        for (i, src) in srcs.iter().enumerate() {
            let src_meta = self
                .output_meta(*src)
                .unwrap_or_else(|| panic!("compute source {i} has no output"));
            let in_meta = match src_meta.kind() {
                TsKind::Ref => src_meta.ref_target().unwrap(),
                _ => src_meta,
            };
            let input = self.add_input(id, &format!("in{i}"), in_meta);
            self.connect(*src, id, input);
        }
        id
    }

    /// A sink invoking `func` on each modified value of its source.
    pub fn sink(
        &mut self,
        name: &str,
        src: NodeId,
        func: impl FnMut(HostValue, EngineTime) + 'static,
    ) -> NodeId {
        let id = self.add_node(name, NodeKind::Sink, SinkBody::new(func));
        self.wire_sink_input(id, src);
        id
    }

    /// A sink logging `label: value` per modified source value.
    pub fn debug_print(&mut self, label: &str, src: NodeId) -> NodeId {
        let id = self.add_node(label, NodeKind::Sink, DebugPrintBody::new(label, None));
        self.wire_sink_input(id, src);
        id
    }

    /// As [debug_print](Self::debug_print), capturing lines for tests.
    pub fn debug_print_captured(&mut self, label: &str, src: NodeId, lines: DebugLines) -> NodeId {
        let id = self.add_node(
            label,
            NodeKind::Sink,
            DebugPrintBody::new(label, Some(lines)),
        );
        self.wire_sink_input(id, src);
        id
    }

    fn wire_sink_input(&mut self, id: NodeId, src: NodeId) {
        let src_meta = self
            .output_meta(src)
            .unwrap_or_else(|| panic!("sink source has no output"));
        let in_meta = match src_meta.kind() {
            TsKind::Ref => src_meta.ref_target().unwrap(),
            _ => src_meta,
        };
        let input = self.add_input(id, "in", in_meta);
        self.connect(src, id, input);
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::engine::{EvaluationEngine, RunFor, RunMode};
    use crate::error::RunOutcome;
    use crate::meta::TypeMeta;
    use crate::observer::EvaluationCounter;

    fn t(v: u64) -> EngineTime {
        EngineTime::new(v)
    }

    fn int_input(ctx: &NodeContext, ndx: usize) -> i64 {
        ctx.input(ndx)
            .to_host()
            .and_then(|v| v.as_int())
            .unwrap_or(0)
    }

    #[test]
    fn constant_plus_add_works() {
        let _ = env_logger::try_init();
        let t0 = t(1_000);
        let mut builder = GraphBuilder::new();
        let a = builder.const_source("a", TypeMeta::int(), HostValue::Int(1));
        let c = builder.compute("c", &[a], TypeMeta::int(), |ctx| {
            let value = int_input(ctx, 0) + 2;
            ctx.apply(HostValue::Int(value))
        });
        let lines: DebugLines = Default::default();
        builder.debug_print_captured("a+2", c, lines.clone());
        let graph = builder.build().unwrap();
        let output = graph.output(c).unwrap();
        let mut engine = EvaluationEngine::new(graph, RunMode::HistoricalFrom(t0));
        let outcome = engine.run(RunFor::Forever).unwrap();
        assert_eq!(outcome, RunOutcome::Completed { at: t0 });
        assert_eq!(output.to_host(), Some(HostValue::Int(3)));
        assert_eq!(output.last_modified_time(), t0);
        assert_eq!(&*lines.borrow(), &[(t0, "a+2: 3".to_string())]);
    }

    #[test]
    fn pull_source_replays_in_order() {
        let mut builder = GraphBuilder::new();
        let src = builder.pull_source(
            "src",
            TypeMeta::int(),
            vec![
                (t(300), HostValue::Int(3)),
                (t(100), HostValue::Int(1)),
                (t(200), HostValue::Int(2)),
            ],
        );
        let captured = Rc::new(RefCell::new(Vec::new()));
        let sink = captured.clone();
        builder.sink("capture", src, move |value, time| {
            sink.borrow_mut().push((time, value));
        });
        let graph = builder.build().unwrap();
        let mut engine = EvaluationEngine::new(graph, RunMode::HistoricalFrom(EngineTime::MIN_DT));
        engine.run(RunFor::Forever).unwrap();
        assert_eq!(
            &*captured.borrow(),
            &[
                (t(100), HostValue::Int(1)),
                (t(200), HostValue::Int(2)),
                (t(300), HostValue::Int(3)),
            ]
        );
    }

    #[test]
    fn bounded_queue_keeps_newest() {
        let mut builder = GraphBuilder::new();
        let src = builder.pull_source(
            "src",
            TypeMeta::int(),
            (0..4)
                .map(|i| (t(i * 100), HostValue::Int(i as i64 + 1)))
                .collect(),
        );
        let queue_meta = TypeMeta::queue_of(TypeMeta::int(), Some(2));
        let lengths = Rc::new(RefCell::new(Vec::new()));
        let observed = lengths.clone();
        let queue = builder.compute("queue", &[src], queue_meta, move |ctx| {
            if ctx.input(0).modified_at(ctx.time()) {
                let value = ctx.input(0).to_host().unwrap();
                ctx.apply(value)?;
                let len = ctx
                    .output()
                    .unwrap()
                    .view()
                    .value()
                    .as_queue()
                    .unwrap()
                    .len();
                observed.borrow_mut().push(len);
            }
            Ok(())
        });
        let graph = builder.build().unwrap();
        let output = graph.output(queue).unwrap();
        let mut engine = EvaluationEngine::new(graph, RunMode::HistoricalFrom(EngineTime::MIN_DT));
        engine.run(RunFor::Forever).unwrap();
        // contents at T3 = [3, 4]; no push failed and length stayed at 2
        assert_eq!(
            output.to_host(),
            Some(HostValue::List(vec![HostValue::Int(3), HostValue::Int(4)]))
        );
        assert_eq!(&*lengths.borrow(), &[1, 2, 2, 2]);
    }

    #[test]
    fn active_links_notify_and_passive_links_do_not() {
        let mut builder = GraphBuilder::new();
        let src = builder.pull_source(
            "src",
            TypeMeta::int(),
            (0..3).map(|i| (t(i * 10), HostValue::Int(i as i64))).collect(),
        );
        let active_hits = Rc::new(RefCell::new(0));
        let hits = active_hits.clone();
        builder.sink("active", src, move |_, _| {
            *hits.borrow_mut() += 1;
        });
        let passive_hits = Rc::new(RefCell::new(0));
        let hits = passive_hits.clone();
        let passive = builder.add_node(
            "passive",
            NodeKind::Sink,
            SinkBody::new(move |_, _| {
                *hits.borrow_mut() += 1;
            }),
        );
        let input = builder.add_input(passive, "in", TypeMeta::int());
        builder.connect_passive(src, passive, input);
        let graph = builder.build().unwrap();
        let mut engine = EvaluationEngine::new(graph, RunMode::HistoricalFrom(EngineTime::MIN_DT));
        engine.run(RunFor::Forever).unwrap();
        // notification sufficiency for the active link
        assert_eq!(*active_hits.borrow(), 3);
        // no phantom notifications through the passive link
        assert_eq!(*passive_hits.borrow(), 0);
    }

    #[test]
    fn writes_are_visible_to_later_nodes_in_same_tick() {
        let mut builder = GraphBuilder::new();
        let src = builder.pull_source(
            "src",
            TypeMeta::int(),
            vec![(t(10), HostValue::Int(5)), (t(20), HostValue::Int(7))],
        );
        let doubled = builder.compute("double", &[src], TypeMeta::int(), |ctx| {
            ctx.apply(HostValue::Int(int_input(ctx, 0) * 2))
        });
        let summed = builder.compute("sum", &[src, doubled], TypeMeta::int(), |ctx| {
            ctx.apply(HostValue::Int(int_input(ctx, 0) + int_input(ctx, 1)))
        });
        let graph = builder.build().unwrap();
        let output = graph.output(summed).unwrap();
        let mut engine = EvaluationEngine::new(graph, RunMode::HistoricalFrom(EngineTime::MIN_DT));
        engine.run(RunFor::Forever).unwrap();
        // 7 + 14, never a stale read of `double`
        assert_eq!(output.to_host(), Some(HostValue::Int(21)));
        assert_eq!(output.last_modified_time(), t(20));
    }

    #[test]
    fn eval_error_routes_to_error_output() {
        let mut builder = GraphBuilder::new();
        let src = builder.pull_source(
            "src",
            TypeMeta::int(),
            vec![(t(10), HostValue::Int(1)), (t(20), HostValue::Int(2))],
        );
        let failing = builder.compute("failing", &[src], TypeMeta::int(), |ctx| {
            if int_input(ctx, 0) == 1 {
                anyhow::bail!("odd one out");
            }
            ctx.apply(HostValue::Int(0))
        });
        builder.with_error_output(failing);
        let graph = builder.build().unwrap();
        let error_output = graph.node(failing.ndx()).error_output().unwrap().clone();
        let output = graph.output(failing).unwrap();
        let mut engine = EvaluationEngine::new(graph, RunMode::HistoricalFrom(EngineTime::MIN_DT));
        // the tick carries on: the error went to the error output
        engine.run(RunFor::Forever).unwrap();
        assert_eq!(
            error_output.to_host(),
            Some(HostValue::Str("odd one out".to_string()))
        );
        assert_eq!(error_output.last_modified_time(), t(10));
        assert_eq!(output.last_modified_time(), t(20));
    }

    #[test]
    fn eval_error_without_error_output_fails_the_tick() {
        let mut builder = GraphBuilder::new();
        let src = builder.pull_source("src", TypeMeta::int(), vec![(t(10), HostValue::Int(1))]);
        builder.compute("failing", &[src], TypeMeta::int(), |_ctx| {
            anyhow::bail!("boom")
        });
        let graph = builder.build().unwrap();
        let mut engine = EvaluationEngine::new(graph, RunMode::HistoricalFrom(EngineTime::MIN_DT));
        let err = engine.run(RunFor::Forever).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("boom"), "{msg}");
        assert!(msg.contains("failing"), "{msg}");
    }

    #[test]
    fn observer_sees_every_evaluation() {
        let mut builder = GraphBuilder::new();
        let src = builder.pull_source(
            "src",
            TypeMeta::int(),
            (0..5).map(|i| (t(i), HostValue::Int(i as i64))).collect(),
        );
        let doubled = builder.compute("double", &[src], TypeMeta::int(), |ctx| {
            ctx.apply(HostValue::Int(int_input(ctx, 0) * 2))
        });
        let graph = builder.build().unwrap();
        let src_key = graph.node(src.ndx()).key();
        let doubled_key = graph.node(doubled.ndx()).key();
        let mut engine = EvaluationEngine::new(graph, RunMode::HistoricalFrom(EngineTime::MIN_DT));
        let counter = EvaluationCounter::new();
        engine.add_observer(counter.clone());
        engine.run(RunFor::Forever).unwrap();
        assert_eq!(counter.borrow().count(src_key), 5);
        assert_eq!(counter.borrow().count(doubled_key), 5);
        assert_eq!(counter.borrow().ticks, 5);
    }

    #[test]
    fn run_for_cycles_bounds_the_run() {
        let mut builder = GraphBuilder::new();
        let src = builder.pull_source(
            "src",
            TypeMeta::int(),
            (0..10).map(|i| (t(i * 10), HostValue::Int(i as i64))).collect(),
        );
        let graph = builder.build().unwrap();
        let output = graph.output(src).unwrap();
        let mut engine = EvaluationEngine::new(graph, RunMode::HistoricalFrom(EngineTime::MIN_DT));
        engine.run(RunFor::Cycles(3)).unwrap();
        assert_eq!(output.to_host(), Some(HostValue::Int(2)));
    }

    #[test]
    fn push_source_drains_at_tick_start() {
        let mut builder = GraphBuilder::new();
        let src = builder.push_source("src", TypeMeta::int());
        let captured = Rc::new(RefCell::new(Vec::new()));
        let sink = captured.clone();
        builder.sink("capture", src, move |value, _| {
            sink.borrow_mut().push(value);
        });
        let graph = builder.build().unwrap();
        let handle = graph.push_handle(src).unwrap();
        handle.push(HostValue::Int(1)).unwrap();
        handle.push(HostValue::Int(2)).unwrap();
        let mut engine = EvaluationEngine::new(graph, RunMode::HistoricalFrom(EngineTime::MIN_DT));
        engine.run(RunFor::Cycles(1)).unwrap();
        // both arrivals drain in one tick; the sink reads the newest value
        assert_eq!(&*captured.borrow(), &[HostValue::Int(2)]);
    }
}
