//! gib - an incremental, parallel build orchestrator.
//!
//! `src/bin/` hosts the two executables: `gib` itself (`main.rs`) and the
//! `gib-wrapcc` compiler wrapper (`bin/wrapcc.rs`).

pub mod env;
pub mod graph;
pub mod job;
pub mod manifest;
pub mod ordmap;
pub mod queue;
pub mod rules;
pub mod span;
pub mod stampdb;
pub mod wrapcc;

pub use graph::{Graph, GraphError, NodeId, NodeType};
pub use queue::{Queue, QueueError, RunSummary};
pub use rules::{GoalBuilder, Loader, NullBuilder, RuleError};
