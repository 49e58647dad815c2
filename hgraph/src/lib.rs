#![warn(clippy::perf)]
#![allow(clippy::type_complexity)]

//! # hgraph
//!
//! A functional reactive graph runtime.  A graph is a DAG of nodes whose
//! edges carry time-series values; the engine drives the graph forward
//! through engine time, reevaluating only the nodes whose inputs changed.
//!
//! ```rust
//! use hgraph::*;
//!
//! fn main() {
//!     let mut builder = GraphBuilder::new();
//!     let a = builder.const_source("a", TypeMeta::int(), HostValue::Int(1));
//!     let c = builder.compute("c", &[a], TypeMeta::int(), |ctx| {
//!         let a = ctx.input(0).to_host().and_then(|v| v.as_int()).unwrap_or(0);
//!         ctx.apply(HostValue::Int(a + 2))
//!     });
//!     builder.debug_print("a+2", c);
//!     let graph = builder.build().unwrap();
//!     let mut engine = EvaluationEngine::new(
//!         graph,
//!         RunMode::HistoricalFrom(EngineTime::MIN_DT),
//!     );
//!     engine.run(RunFor::Forever).unwrap();
//! }
//! ```
//!
//! Outputs are the single writers of their own values; inputs are
//! read-only borrows bound through links.  Modification tracking is
//! per-slot, so observers read zero-copy [DeltaView]s of exactly what
//! changed in the open tick.  Reference-typed outputs allow dynamic
//! rebinding, and nested nodes (switch / map / mesh) build and tear down
//! sub-graphs at runtime.

mod delta;
mod engine;
mod error;
mod graph;
mod meta;
mod nested;
mod node;
mod nodes;
mod observer;
mod record;
mod scheduler;
mod time;
mod tracker;
mod ts;
mod value;

pub use delta::*;
pub use engine::*;
pub use error::*;
pub use graph::*;
pub use meta::*;
pub use nested::*;
pub use node::*;
pub use nodes::*;
pub use observer::*;
pub use record::{from_bytes, to_bytes};
pub use scheduler::{EndOfTickQueue, EngineCtx, Scheduler};
pub use time::*;
pub use tracker::*;
pub use ts::*;
pub use value::*;
