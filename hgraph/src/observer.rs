use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::node::{NodeKey, NodeKind};
use crate::time::EngineTime;

/// What an observer may see of a graph.
#[derive(Clone, Copy, Debug)]
pub struct GraphInfo {
    pub id: usize,
    pub node_count: usize,
}

/// What an observer may see of a node.
#[derive(Clone, Copy, Debug)]
pub struct NodeInfo<'a> {
    pub key: NodeKey,
    pub name: &'a str,
    pub kind: NodeKind,
}

/// Lifecycle and evaluation hooks.  Observers must not mutate the graph;
/// they may read state and accumulate metrics.
pub trait LifecycleObserver {
    #[allow(unused_variables)]
    fn on_before_start_graph(&mut self, graph: &GraphInfo) {}
    #[allow(unused_variables)]
    fn on_after_start_graph(&mut self, graph: &GraphInfo) {}
    #[allow(unused_variables)]
    fn on_before_start_node(&mut self, node: &NodeInfo) {}
    #[allow(unused_variables)]
    fn on_after_start_node(&mut self, node: &NodeInfo) {}
    #[allow(unused_variables)]
    fn on_before_graph_evaluation(&mut self, graph: &GraphInfo, time: EngineTime) {}
    #[allow(unused_variables)]
    fn on_before_node_evaluation(&mut self, node: &NodeInfo, time: EngineTime) {}
    #[allow(unused_variables)]
    fn on_after_node_evaluation(&mut self, node: &NodeInfo, time: EngineTime) {}
    #[allow(unused_variables)]
    fn on_after_graph_push_nodes_evaluation(&mut self, graph: &GraphInfo, time: EngineTime) {}
    #[allow(unused_variables)]
    fn on_after_graph_evaluation(&mut self, graph: &GraphInfo, time: EngineTime) {}
    #[allow(unused_variables)]
    fn on_before_stop_node(&mut self, node: &NodeInfo) {}
    #[allow(unused_variables)]
    fn on_after_stop_node(&mut self, node: &NodeInfo) {}
    #[allow(unused_variables)]
    fn on_before_stop_graph(&mut self, graph: &GraphInfo) {}
    #[allow(unused_variables)]
    fn on_after_stop_graph(&mut self, graph: &GraphInfo) {}
}

pub type ObserverRef = Rc<RefCell<dyn LifecycleObserver>>;

/// Accumulates evaluation counts per node.  Useful in tests and as a
/// cheap profiling hook.
#[derive(Default)]
pub struct EvaluationCounter {
    pub evaluations: HashMap<NodeKey, usize>,
    pub ticks: usize,
}

impl EvaluationCounter {
    pub fn new() -> Rc<RefCell<EvaluationCounter>> {
        Rc::new(RefCell::new(EvaluationCounter::default()))
    }

    pub fn count(&self, key: NodeKey) -> usize {
        self.evaluations.get(&key).copied().unwrap_or(0)
    }
}

impl LifecycleObserver for EvaluationCounter {
    fn on_after_node_evaluation(&mut self, node: &NodeInfo, _time: EngineTime) {
        *self.evaluations.entry(node.key).or_insert(0) += 1;
    }

    fn on_after_graph_evaluation(&mut self, _graph: &GraphInfo, _time: EngineTime) {
        self.ticks += 1;
    }
}
