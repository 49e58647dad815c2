use crossbeam::channel::{Receiver, Sender};
use once_cell::sync::Lazy;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{NodePath, RuntimeError};
use crate::meta::{TsKind, TypeMeta};
use crate::node::{Node, NodeBody, NodeContext, NodeKey, NodeKind, NodeSignature};
use crate::observer::{GraphInfo, NodeInfo, ObserverRef};
use crate::scheduler::{EndOfTickQueue, EngineCtx, Scheduler};
use crate::time::EngineTime;
use crate::ts::{
    DirEntry, InputBinding, OutputDirectory, OutputRef, TsInput, TsLink, TsRefTargetLink,
    bind_link, set_link_active,
};
use crate::value::{HostValue, RefPath, Value};

static GRAPH_ID: Lazy<Mutex<usize>> = Lazy::new(|| Mutex::new(0));

fn next_graph_id() -> usize {
    let mut id = GRAPH_ID.lock().unwrap();
    let current = *id;
    *id += 1;
    current
}

/// A value pushed from outside the graph, addressed to one push source.
#[derive(Debug)]
pub struct PushEnvelope {
    pub(crate) node_ndx: usize,
    pub(crate) value: HostValue,
}

/// Producer half of a push source.  Cloneable and `Send`; arrivals are
/// drained by the tick loop at the start of each tick.
#[derive(Clone)]
pub struct PushHandle {
    node_ndx: usize,
    sender: Sender<PushEnvelope>,
}

impl PushHandle {
    pub fn push(&self, value: HostValue) -> Result<(), RuntimeError> {
        self.sender
            .send(PushEnvelope {
                node_ndx: self.node_ndx,
                value,
            })
            .map_err(|_| RuntimeError::Resource("push inbox disconnected".to_string()))
    }
}

/// A flat ordered list of nodes plus their wiring.  One graph is one
/// logical thread; the engine (or a nesting node) drives it through
/// start / tick / stop.
pub struct Graph {
    id: usize,
    nodes: Vec<Node>,
    directory: OutputDirectory,
    scheduler: Scheduler,
    end_of_tick: EndOfTickQueue,
    inbox_tx: Sender<PushEnvelope>,
    inbox_rx: Receiver<PushEnvelope>,
    staged: Vec<Vec<HostValue>>,
    parent: Option<NodeKey>,
}

impl Graph {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, ndx: usize) -> &Node {
        &self.nodes[ndx]
    }

    pub fn parent(&self) -> Option<NodeKey> {
        self.parent
    }

    pub(crate) fn set_parent(&mut self, parent: NodeKey) {
        self.parent = Some(parent);
    }

    pub fn output(&self, node: NodeId) -> Option<OutputRef> {
        self.nodes.get(node.0).and_then(|n| n.output.clone())
    }

    pub fn directory(&self) -> &OutputDirectory {
        &self.directory
    }

    pub fn info(&self) -> GraphInfo {
        GraphInfo {
            id: self.id,
            node_count: self.nodes.len(),
        }
    }

    fn node_info(&self, ndx: usize) -> NodeInfo<'_> {
        let node = &self.nodes[ndx];
        NodeInfo {
            key: node.key,
            name: &node.signature.name,
            kind: node.signature.kind,
        }
    }

    pub fn path(&self, ndx: usize) -> NodePath {
        self.nodes[ndx].path()
    }

    /// Producer handle for a push source.
    pub fn push_handle(&self, node: NodeId) -> Result<PushHandle, RuntimeError> {
        let n = self
            .nodes
            .get(node.0)
            .ok_or_else(|| RuntimeError::Wiring(format!("no node {}", node.0)))?;
        if n.signature.kind != NodeKind::PushSource {
            return Err(RuntimeError::Wiring(format!(
                "node {} is not a push source",
                n.path()
            )));
        }
        Ok(PushHandle {
            node_ndx: node.0,
            sender: self.inbox_tx.clone(),
        })
    }

    pub fn has_push_source(&self) -> bool {
        self.nodes
            .iter()
            .any(|n| n.signature.kind == NodeKind::PushSource)
    }

    pub fn next_scheduled_evaluation_time(&self) -> EngineTime {
        self.scheduler.next_scheduled_evaluation_time()
    }

    /// Stages a value for a node and schedules it.  Used by the inbox
    /// drain and by nesting nodes injecting into sub-graph stubs.
    pub(crate) fn stage(&mut self, node_ndx: usize, value: HostValue, time: EngineTime) {
        self.staged[node_ndx].push(value);
        self.scheduler
            .update_next_scheduled_evaluation_time(node_ndx, time);
    }

    /// Drains the push inbox into staged notifications at `now`.
    pub(crate) fn drain_inbox(&mut self, now: EngineTime) -> bool {
        let mut any = false;
        while let Ok(envelope) = self.inbox_rx.try_recv() {
            self.stage(envelope.node_ndx, envelope.value, now);
            any = true;
        }
        any
    }

    pub(crate) fn inbox_is_empty(&self) -> bool {
        self.inbox_rx.is_empty()
    }

    pub(crate) fn wait_inbox(&self, timeout: Duration) -> Option<PushEnvelope> {
        self.inbox_rx.recv_timeout(timeout).ok()
    }

    fn with_node_ctx<R>(
        &mut self,
        ndx: usize,
        time: EngineTime,
        f: impl FnOnce(&mut dyn NodeBody, &mut NodeContext) -> R,
    ) -> R {
        let staged = std::mem::take(&mut self.staged[ndx]);
        let node = &mut self.nodes[ndx];
        let Node {
            key,
            signature,
            inputs,
            output,
            error_output,
            body,
            ..
        } = node;
        let mut ctx = NodeContext {
            key: *key,
            name: &signature.name,
            inputs,
            output: output.as_ref(),
            error_output: error_output.as_ref(),
            engine: EngineCtx {
                time,
                scheduler: &mut self.scheduler,
                end_of_tick: &mut self.end_of_tick,
            },
            staged,
        };
        let result = f(body.as_mut(), &mut ctx);
        let leftover = ctx.staged;
        self.staged[ndx] = leftover;
        result
    }

    /// Fires the start lifecycle for every node in index order.  An error
    /// aborts the start and stops the already-started prefix.
    pub(crate) fn start(
        &mut self,
        time: EngineTime,
        observers: &[ObserverRef],
    ) -> Result<(), RuntimeError> {
        let info = self.info();
        for observer in observers {
            observer.borrow_mut().on_before_start_graph(&info);
        }
        // ref wrappers report modified at bind time, which is graph start
        for node in self.nodes.iter_mut() {
            for input in node.inputs.iter_mut() {
                input.set_wrapper_bind_time(time);
            }
        }
        self.scheduler.begin_tick(time);
        for ndx in 0..self.nodes.len() {
            for observer in observers {
                observer
                    .borrow_mut()
                    .on_before_start_node(&self.node_info(ndx));
            }
            let result = self.with_node_ctx(ndx, time, |body, ctx| body.start(ctx));
            if let Err(err) = result {
                let path = self.nodes[ndx].path();
                log::error!("start failed at {path}: {err:#}");
                for prior in (0..ndx).rev() {
                    if let Err(stop_err) =
                        self.with_node_ctx(prior, time, |body, ctx| body.stop(ctx))
                    {
                        log::error!("stop failed at {}: {stop_err:#}", self.nodes[prior].path());
                    }
                }
                return Err(RuntimeError::Evaluation {
                    node: path,
                    message: format!("{err:#}"),
                });
            }
            for observer in observers {
                observer
                    .borrow_mut()
                    .on_after_start_node(&self.node_info(ndx));
            }
        }
        for observer in observers {
            observer.borrow_mut().on_after_start_graph(&info);
        }
        Ok(())
    }

    /// Drains every node due at `now`, in `(scheduled_time, node_ndx)`
    /// order.
    pub(crate) fn evaluate_tick(
        &mut self,
        now: EngineTime,
        observers: &[ObserverRef],
    ) -> Result<(), RuntimeError> {
        self.scheduler.begin_tick(now);
        while let Some(ndx) = self.scheduler.pop_due(now) {
            for observer in observers {
                observer
                    .borrow_mut()
                    .on_before_node_evaluation(&self.node_info(ndx), now);
            }
            self.scheduler.set_evaluating(Some(ndx));
            let result = self.with_node_ctx(ndx, now, |body, ctx| body.eval(ctx));
            self.scheduler.set_evaluating(None);
            if let Err(err) = result {
                self.route_eval_error(ndx, now, err)?;
            }
            for observer in observers {
                observer
                    .borrow_mut()
                    .on_after_node_evaluation(&self.node_info(ndx), now);
            }
        }
        Ok(())
    }

    /// Routes an eval error to the node's error output when one is wired;
    /// wiring and protocol errors stay fatal.
    fn route_eval_error(
        &mut self,
        ndx: usize,
        now: EngineTime,
        err: anyhow::Error,
    ) -> Result<(), RuntimeError> {
        let fatal = err
            .downcast_ref::<RuntimeError>()
            .map(|e| e.is_fatal())
            .unwrap_or(false);
        let error_output = self.nodes[ndx].error_output.clone();
        if !fatal && let Some(output) = error_output {
            let path = self.nodes[ndx].path();
            log::warn!("eval error at {path} routed to error output: {err:#}");
            let mut ctx = EngineCtx {
                time: now,
                scheduler: &mut self.scheduler,
                end_of_tick: &mut self.end_of_tick,
            };
            output.apply(HostValue::Str(format!("{err:#}")), &mut ctx)?;
            return Ok(());
        }
        Err(match err.downcast::<RuntimeError>() {
            Ok(runtime) => runtime,
            Err(other) => RuntimeError::Evaluation {
                node: self.nodes[ndx].path(),
                message: format!("{other:#}"),
            },
        })
    }

    /// End-of-tick callbacks: delta resets, slot-freelist advance,
    /// rebind-delta clears, nested tick closure.
    pub(crate) fn end_tick(&mut self, now: EngineTime) {
        self.end_of_tick.run();
        for node in self.nodes.iter_mut() {
            node.body.on_tick_end(now);
        }
    }

    /// Stops every node in reverse index order.  Stop errors are logged
    /// and do not prevent subsequent nodes from stopping.
    pub(crate) fn stop(&mut self, time: EngineTime, observers: &[ObserverRef]) {
        let info = self.info();
        for observer in observers {
            observer.borrow_mut().on_before_stop_graph(&info);
        }
        for ndx in (0..self.nodes.len()).rev() {
            for observer in observers {
                observer
                    .borrow_mut()
                    .on_before_stop_node(&self.node_info(ndx));
            }
            if let Err(err) = self.with_node_ctx(ndx, time, |body, ctx| body.stop(ctx)) {
                log::error!("stop failed at {}: {err:#}", self.nodes[ndx].path());
            }
            for observer in observers {
                observer
                    .borrow_mut()
                    .on_after_stop_node(&self.node_info(ndx));
            }
        }
        for observer in observers {
            observer.borrow_mut().on_after_stop_graph(&info);
        }
    }

    /// Snapshot of every recordable node's state, keyed by recordable id.
    pub fn snapshot_recordables(&self) -> Vec<(String, Value)> {
        self.nodes
            .iter()
            .filter_map(|node| {
                let id = node.recordable_id.clone()?;
                let state = node.body.snapshot_state()?;
                Some((id, state))
            })
            .collect()
    }

    /// Restores recordable state into matching nodes by recordable id.
    pub fn restore_recordables(&mut self, states: &[(String, Value)]) {
        for node in self.nodes.iter_mut() {
            if let Some(id) = &node.recordable_id
                && let Some((_, state)) = states.iter().find(|(k, _)| k == id)
            {
                node.body.restore_state(state.clone());
            }
        }
    }

    pub fn print(&self) -> &Graph {
        for (i, node) in self.nodes.iter().enumerate() {
            println!("[{i:02}] {node}");
        }
        self
    }

    pub fn export(&self, path: &str) -> Result<(), std::io::Error> {
        let path = Path::new(&path);
        let mut output = File::create(path)?;
        writeln!(output, "graph [")?;
        for (i, node) in self.nodes.iter().enumerate() {
            writeln!(output, "    node [")?;
            writeln!(output, "        id {i}")?;
            writeln!(output, "        label \"[{i}] {node}\"")?;
            writeln!(output, "        graphics")?;
            writeln!(output, "        [")?;
            writeln!(output, "            w 200.0")?;
            writeln!(output, "            h 30.0")?;
            writeln!(output, "        ]")?;
            writeln!(output, "    ]")?;
        }
        for (i, node) in self.nodes.iter().enumerate() {
            for input in node.inputs.iter() {
                if let Some(peer) = input.peer() {
                    let src = peer.owner().node_ndx;
                    writeln!(output, "    edge [")?;
                    writeln!(output, "        source {src}")?;
                    writeln!(output, "        target {i}")?;
                    writeln!(output, "    ]")?;
                }
            }
        }
        writeln!(output, "]")
    }
}

/// Handle to a node within one [GraphBuilder] / [Graph].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    pub fn ndx(&self) -> usize {
        self.0
    }
}

struct BuilderNode {
    name: String,
    kind: NodeKind,
    body: Box<dyn NodeBody>,
    inputs: Vec<(String, &'static TypeMeta)>,
    output: Option<&'static TypeMeta>,
    error_output: bool,
    recordable_id: Option<String>,
}

struct Edge {
    src: NodeId,
    dst: NodeId,
    input: usize,
    passive: bool,
}

struct ElementEdge {
    srcs: Vec<NodeId>,
    dst: NodeId,
    input: usize,
}

/// Receives a graph description from the (out-of-scope) surface language
/// and wires it.  All type checking happens in [build](Self::build);
/// mismatches are wiring errors, fatal before the graph starts.
#[derive(Default)]
pub struct GraphBuilder {
    nodes: Vec<BuilderNode>,
    edges: Vec<Edge>,
    element_edges: Vec<ElementEdge>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, name: &str, kind: NodeKind, body: impl NodeBody) -> NodeId {
        self.add_boxed_node(name, kind, Box::new(body))
    }

    pub fn add_boxed_node(
        &mut self,
        name: &str,
        kind: NodeKind,
        body: Box<dyn NodeBody>,
    ) -> NodeId {
        self.nodes.push(BuilderNode {
            name: name.to_string(),
            kind,
            body,
            inputs: Vec::new(),
            output: None,
            error_output: false,
            recordable_id: None,
        });
        NodeId(self.nodes.len() - 1)
    }

    pub fn set_output(&mut self, node: NodeId, meta: &'static TypeMeta) {
        self.nodes[node.0].output = Some(meta);
    }

    pub fn output_meta(&self, node: NodeId) -> Option<&'static TypeMeta> {
        self.nodes[node.0].output
    }

    pub fn add_input(&mut self, node: NodeId, name: &str, meta: &'static TypeMeta) -> usize {
        let inputs = &mut self.nodes[node.0].inputs;
        inputs.push((name.to_string(), meta));
        inputs.len() - 1
    }

    pub fn with_error_output(&mut self, node: NodeId) {
        self.nodes[node.0].error_output = true;
    }

    pub fn set_recordable_id(&mut self, node: NodeId, id: &str) {
        self.nodes[node.0].recordable_id = Some(id.to_string());
    }

    pub fn connect(&mut self, src: NodeId, dst: NodeId, input: usize) {
        self.edges.push(Edge {
            src,
            dst,
            input,
            passive: false,
        });
    }

    /// Wires without subscribing: the destination reads the source but is
    /// not notified when it ticks.
    pub fn connect_passive(&mut self, src: NodeId, dst: NodeId, input: usize) {
        self.edges.push(Edge {
            src,
            dst,
            input,
            passive: true,
        });
    }

    /// Element-wise binding of several outputs into one collection input.
    pub fn connect_elements(&mut self, srcs: Vec<NodeId>, dst: NodeId, input: usize) {
        self.element_edges.push(ElementEdge { srcs, dst, input });
    }

    pub fn build(self) -> Result<Graph, RuntimeError> {
        let graph_id = next_graph_id();
        let directory = OutputDirectory::new();
        let mut nodes: Vec<Node> = Vec::with_capacity(self.nodes.len());
        for (ndx, decl) in self.nodes.into_iter().enumerate() {
            let key = NodeKey {
                graph_id,
                node_ndx: ndx,
            };
            let output = decl.output.map(|meta| OutputRef::new(meta, key));
            let error_output = decl
                .error_output
                .then(|| OutputRef::new(TypeMeta::str(), key));
            directory.push_entry(DirEntry {
                output: output.clone(),
                input_peers: Vec::new(),
            });
            nodes.push(Node {
                key,
                signature: NodeSignature {
                    name: decl.name,
                    kind: decl.kind,
                },
                inputs: decl
                    .inputs
                    .into_iter()
                    .map(|(name, meta)| TsInput::new(name, meta, key))
                    .collect(),
                output,
                error_output,
                body: decl.body,
                recordable_id: decl.recordable_id,
            });
        }

        for edge in &self.edges {
            let src_output = nodes[edge.src.0].output.clone().ok_or_else(|| {
                RuntimeError::Wiring(format!("source node {} has no output", nodes[edge.src.0].path()))
            })?;
            let out_meta = src_output.meta();
            let dst_key = nodes[edge.dst.0].key;
            let dst = &mut nodes[edge.dst.0];
            let input = dst.inputs.get_mut(edge.input).ok_or_else(|| {
                RuntimeError::Wiring(format!("no input {} on destination node", edge.input))
            })?;
            let in_meta = input.meta();
            if in_meta == out_meta {
                // same time-series kind on both sides: direct peer
                let link = TsLink::create(dst_key, None, false);
                if edge.passive {
                    set_link_active(&link, false);
                }
                bind_link(&link, &src_output, EngineTime::MIN_DT);
                input.set_binding(InputBinding::Peered(link));
                directory.set_input_peer(edge.dst.0, edge.input, Some(src_output));
            } else if out_meta.kind() == TsKind::Ref && out_meta.ref_target() == Some(in_meta) {
                // non-Ref input watching a Ref output
                let link =
                    TsRefTargetLink::create(dst_key, directory.clone(), &src_output, in_meta);
                if edge.passive {
                    link.borrow_mut().set_active(false);
                }
                input.set_binding(InputBinding::RefObserver(link));
            } else if in_meta.kind() == TsKind::Ref && in_meta.ref_target() == Some(out_meta) {
                // Ref input wrapping a non-Ref output
                input.set_binding(TsInput::wrapper_value(
                    src_output.clone(),
                    RefPath::output(edge.src.0),
                ));
                directory.set_input_peer(edge.dst.0, edge.input, Some(src_output));
            } else {
                return Err(RuntimeError::Wiring(format!(
                    "cannot bind output {out_meta} to input {in_meta}"
                )));
            }
        }

        for edge in &self.element_edges {
            let dst_key = nodes[edge.dst.0].key;
            let in_meta = nodes[edge.dst.0]
                .inputs
                .get(edge.input)
                .ok_or_else(|| {
                    RuntimeError::Wiring(format!("no input {} on destination node", edge.input))
                })?
                .meta();
            if !in_meta.flags().container {
                return Err(RuntimeError::Wiring(format!(
                    "element-wise binding needs a container input, got {in_meta}"
                )));
            }
            let mut links = Vec::with_capacity(edge.srcs.len());
            for (i, src) in edge.srcs.iter().enumerate() {
                let src_output = nodes[src.0].output.clone().ok_or_else(|| {
                    RuntimeError::Wiring(format!("source node {} has no output", src.0))
                })?;
                let expected = match in_meta.kind() {
                    TsKind::Bundle => in_meta
                        .fields()
                        .get(i)
                        .map(|f| f.meta)
                        .ok_or_else(|| {
                            RuntimeError::Wiring(format!("too many elements for {in_meta}"))
                        })?,
                    _ => in_meta.element().ok_or_else(|| {
                        RuntimeError::Wiring(format!("{in_meta} has no element type"))
                    })?,
                };
                if expected != src_output.meta() {
                    return Err(RuntimeError::Wiring(format!(
                        "element {i}: cannot bind {} to {expected}",
                        src_output.meta()
                    )));
                }
                let link = TsLink::create(dst_key, Some(i), false);
                bind_link(&link, &src_output, EngineTime::MIN_DT);
                links.push(link);
            }
            nodes[edge.dst.0].inputs[edge.input].set_binding(InputBinding::NonPeered(links));
        }

        let node_count = nodes.len();
        let (inbox_tx, inbox_rx) = crossbeam::channel::unbounded();
        Ok(Graph {
            id: graph_id,
            nodes,
            directory,
            scheduler: Scheduler::new(node_count),
            end_of_tick: EndOfTickQueue::new(),
            inbox_tx,
            inbox_rx,
            staged: (0..node_count).map(|_| Vec::new()).collect(),
            parent: None,
        })
    }
}
