use thiserror::Error;

use crate::time::EngineTime;

/// Path of a node for diagnostics: `graph_id/node_ndx:name`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodePath {
    pub graph_id: usize,
    pub node_ndx: usize,
    pub name: String,
}

impl std::fmt::Display for NodePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}:{}", self.graph_id, self.node_ndx, self.name)
    }
}

/// Runtime error taxonomy.  Wiring and Protocol errors are always fatal;
/// Evaluation errors are routed to a node's error output when one is wired.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("wiring: {0}")]
    Wiring(String),

    #[error("evaluation failed at node {node}: {message}")]
    Evaluation { node: NodePath, message: String },

    #[error("protocol: {0}")]
    Protocol(String),

    #[error("resource: {0}")]
    Resource(String),
}

impl RuntimeError {
    /// True for error kinds that may never be routed to an error output.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RuntimeError::Wiring(_) | RuntimeError::Protocol(_))
    }
}

/// Structured outcome of an engine run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// The run bound was reached or all work drained.
    Completed { at: EngineTime },
    /// A cooperative stop was observed at a tick boundary.
    Halted { at: EngineTime },
}

impl RunOutcome {
    pub fn at(&self) -> EngineTime {
        match self {
            RunOutcome::Completed { at } | RunOutcome::Halted { at } => *at,
        }
    }
}
