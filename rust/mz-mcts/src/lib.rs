//! Parallel PUCT search over a rules-engine oracle.
//!
//! The design uses:
//! - Arena-backed trees whose edges carry [`mz_core::ActionLabel`]s
//! - Several workers per decision, each with a private tree, merged by label
//! - Pluggable leaf evaluation, including asynchronous remote inference with
//!   virtual loss while results are in flight

pub mod arena;
pub mod coordinator;
pub mod evaluator;
pub mod node;
pub mod policy;
pub mod tree;
pub mod worker;

pub use arena::{Arena, NodeId};
pub use coordinator::{think_budget, Decision, ParallelCoordinator};
pub use evaluator::{
    build_evaluator, client_options, select_policy, EvalError, Evaluation, EvaluatorChoice,
    HashModel, HeuristicEvaluator, HeuristicFn, LeafEvaluator, LocalModel, LocalModelEvaluator,
    RemoteEvaluator,
};
pub use node::SearchNode;
pub use tree::{best_child_temperature, MergeReport, SearchTree};
pub use worker::{Budget, SearchError, SearchWorker, WorkerOutcome, WorkerStats};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
