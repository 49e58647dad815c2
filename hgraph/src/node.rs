use std::fmt::{Debug, Display};
use strum_macros::Display as StrumDisplay;

use crate::error::NodePath;
use crate::scheduler::EngineCtx;
use crate::time::EngineTime;
use crate::ts::{OutputRef, TsInput};
use crate::value::{HostValue, Value};

/// Identity of a node: which graph it lives in and its index there.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeKey {
    pub graph_id: usize,
    pub node_ndx: usize,
}

/// The five node roles.
#[derive(StrumDisplay, Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeKind {
    /// Time-driven producer; schedules its own next evaluation.
    PullSource,
    /// Externally pushed producer fed from the graph inbox.
    PushSource,
    Compute,
    Sink,
    /// Runs sub-graphs built at runtime.
    Nested,
}

/// A node's public identity.
#[derive(Clone, Debug)]
pub struct NodeSignature {
    pub name: String,
    pub kind: NodeKind,
}

/// Everything a node body may touch during one lifecycle call: its own
/// inputs and output, the engine clock, the scheduler and staged push
/// values.
pub struct NodeContext<'a> {
    pub(crate) key: NodeKey,
    pub(crate) name: &'a str,
    pub(crate) inputs: &'a mut Vec<TsInput>,
    pub(crate) output: Option<&'a OutputRef>,
    pub(crate) error_output: Option<&'a OutputRef>,
    pub(crate) engine: EngineCtx<'a>,
    pub(crate) staged: Vec<HostValue>,
}

impl<'a> NodeContext<'a> {
    /// The current engine time.
    pub fn time(&self) -> EngineTime {
        self.engine.time
    }

    pub fn key(&self) -> NodeKey {
        self.key
    }

    pub fn name(&self) -> &str {
        self.name
    }

    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    pub fn input(&self, ndx: usize) -> &TsInput {
        &self.inputs[ndx]
    }

    pub fn input_mut(&mut self, ndx: usize) -> &mut TsInput {
        &mut self.inputs[ndx]
    }

    pub fn output(&self) -> Option<&OutputRef> {
        self.output
    }

    /// Applies a host value to this node's output at the current time.
    pub fn apply(&mut self, value: HostValue) -> anyhow::Result<()> {
        let output = self
            .output
            .ok_or_else(|| anyhow::anyhow!("node {} has no output", self.name))?;
        output.apply(value, &mut self.engine)?;
        Ok(())
    }

    /// Marks this node's output invalid at the current time.
    pub fn mark_invalid(&mut self) -> anyhow::Result<()> {
        let output = self
            .output
            .ok_or_else(|| anyhow::anyhow!("node {} has no output", self.name))?;
        output.mark_invalid(&mut self.engine)?;
        Ok(())
    }

    /// Requests evaluation of this node at `time`.
    pub fn schedule(&mut self, time: EngineTime) {
        self.engine
            .scheduler
            .update_next_scheduled_evaluation_time(self.key.node_ndx, time);
    }

    /// Push values staged for this node since the last tick, in arrival
    /// order.
    pub fn take_staged(&mut self) -> Vec<HostValue> {
        std::mem::take(&mut self.staged)
    }

    pub fn log(&self, level: log::Level, msg: &str) {
        if log::log_enabled!(level) {
            let NodeKey { graph_id, node_ndx } = self.key;
            log::log!(target: "hgraph", level, "[{graph_id},{node_ndx}]{} {msg}", self.name);
        }
    }
}

/// Implement this trait to create a node body.  Bodies are driven by the
/// graph through eval/start/stop; state snapshot hooks back recordable
/// state.
pub trait NodeBody: 'static {
    /// Called when the scheduler determines the node must run.
    fn eval(&mut self, ctx: &mut NodeContext) -> anyhow::Result<()>;

    /// Called once before the first tick.  Can request an initial
    /// evaluation via [NodeContext::schedule].
    #[allow(unused_variables)]
    fn start(&mut self, ctx: &mut NodeContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called after the last tick, in reverse node order.
    #[allow(unused_variables)]
    fn stop(&mut self, ctx: &mut NodeContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// End-of-tick housekeeping for bodies that own nested state.
    #[allow(unused_variables)]
    fn on_tick_end(&mut self, time: EngineTime) {}

    /// Recordable state snapshot, taken before teardown.
    fn snapshot_state(&self) -> Option<Value> {
        None
    }

    /// Restores a previously snapshotted state.
    #[allow(unused_variables)]
    fn restore_state(&mut self, state: Value) {}

    fn type_name(&self) -> String {
        tynm::type_name::<Self>()
    }
}

/// A runtime node: identity, signature, I/O endpoints and the body that
/// implements its behaviour.
pub struct Node {
    pub(crate) key: NodeKey,
    pub(crate) signature: NodeSignature,
    pub(crate) inputs: Vec<TsInput>,
    pub(crate) output: Option<OutputRef>,
    pub(crate) error_output: Option<OutputRef>,
    pub(crate) body: Box<dyn NodeBody>,
    pub(crate) recordable_id: Option<String>,
}

impl Node {
    pub fn key(&self) -> NodeKey {
        self.key
    }

    pub fn signature(&self) -> &NodeSignature {
        &self.signature
    }

    pub fn inputs(&self) -> &[TsInput] {
        &self.inputs
    }

    pub fn output(&self) -> Option<&OutputRef> {
        self.output.as_ref()
    }

    pub fn error_output(&self) -> Option<&OutputRef> {
        self.error_output.as_ref()
    }

    pub fn recordable_id(&self) -> Option<&str> {
        self.recordable_id.as_deref()
    }

    pub fn path(&self) -> NodePath {
        NodePath {
            graph_id: self.key.graph_id,
            node_ndx: self.key.node_ndx,
            name: self.signature.name.clone(),
        }
    }
}

impl Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} [{}] {}",
            self.signature.name,
            self.signature.kind,
            self.body.type_name()
        )
    }
}

impl Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self}")
    }
}
