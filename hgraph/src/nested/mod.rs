//! Nested nodes: switch, map and mesh constructs that build and tear
//! down sub-graphs at runtime.  A nesting node owns its sub-graphs and
//! drives them through a nested evaluation pass whose clock is the
//! parent's; the sub-graph's next scheduled time bubbles into the parent
//! scheduler through [NodeContext::schedule](crate::node::NodeContext).
//! Values cross the boundary through explicit stub sources, never through
//! cross-graph subscriptions.

mod map;
mod mesh;
mod switch;

pub use map::{MapBody, MapConfig};
pub use mesh::{MeshBody, MeshConfig, WiringRule};
pub use switch::{SwitchBody, SwitchConfig};

use std::rc::Rc;

use crate::error::RuntimeError;
use crate::graph::{Graph, GraphBuilder, NodeId};
use crate::node::NodeKey;
use crate::time::EngineTime;
use crate::value::{HostValue, ScalarValue, Value};

/// A sub-graph description returned by a registered builder: the graph,
/// the stub sources the nesting node injects into, and the node whose
/// output becomes the instance output.
pub struct NestedGraphSpec {
    pub builder: GraphBuilder,
    pub inputs: Vec<NodeId>,
    pub output: NodeId,
}

/// Builds one sub-graph for a key.
pub type SubGraphBuilder = Rc<dyn Fn(&ScalarValue) -> NestedGraphSpec>;

/// A live sub-graph owned by a nesting node.
pub(crate) struct SubGraphInstance {
    key: ScalarValue,
    graph: Graph,
    inputs: Vec<NodeId>,
    output: NodeId,
}

impl SubGraphInstance {
    /// Builds, restores preserved recordable state and starts the
    /// instance at the parent's current time.
    pub(crate) fn build(
        key: ScalarValue,
        builder: &SubGraphBuilder,
        parent: NodeKey,
        preserved: &[(String, Value)],
        time: EngineTime,
    ) -> Result<SubGraphInstance, RuntimeError> {
        let spec = builder(&key);
        let mut graph = spec.builder.build()?;
        graph.set_parent(parent);
        graph.restore_recordables(preserved);
        graph.start(time, &[])?;
        Ok(SubGraphInstance {
            key,
            graph,
            inputs: spec.inputs,
            output: spec.output,
        })
    }

    pub(crate) fn key(&self) -> &ScalarValue {
        &self.key
    }

    /// Stages a value into stub `ndx` for the current tick.
    pub(crate) fn inject(&mut self, ndx: usize, value: HostValue, now: EngineTime) {
        if let Some(node) = self.inputs.get(ndx) {
            self.graph.stage(node.ndx(), value, now);
        }
    }

    /// One nested evaluation pass at the parent's time.
    pub(crate) fn evaluate(&mut self, now: EngineTime) -> Result<(), RuntimeError> {
        self.graph.evaluate_tick(now, &[])
    }

    pub(crate) fn output_modified_at(&self, now: EngineTime) -> bool {
        self.graph
            .output(self.output)
            .is_some_and(|output| output.modified_at(now))
    }

    pub(crate) fn output_host(&self) -> Option<HostValue> {
        self.graph.output(self.output)?.to_host()
    }

    pub(crate) fn next_time(&self) -> EngineTime {
        self.graph.next_scheduled_evaluation_time()
    }

    pub(crate) fn end_tick(&mut self, now: EngineTime) {
        self.graph.end_tick(now);
    }

    /// Stops the sub-graph, snapshotting recordable state first when the
    /// nesting node preserves it.
    pub(crate) fn teardown(mut self, now: EngineTime, preserve: bool) -> Vec<(String, Value)> {
        let states = if preserve {
            self.graph.snapshot_recordables()
        } else {
            Vec::new()
        };
        self.graph.stop(now, &[]);
        states
    }
}

/// Replaces entries with matching recordable ids, keeping the rest.
pub(crate) fn merge_preserved(into: &mut Vec<(String, Value)>, states: Vec<(String, Value)>) {
    for (id, state) in states {
        match into.iter_mut().find(|(k, _)| *k == id) {
            Some(entry) => entry.1 = state,
            None => into.push((id, state)),
        }
    }
}
