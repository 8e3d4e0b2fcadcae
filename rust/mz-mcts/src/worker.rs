//! One search worker: repeated select / expand / evaluate / backprop passes
//! over a private tree until a deadline, a simulation cap, or cancellation.
//!
//! Asynchronous evaluations are parked on the tree with virtual loss and a
//! pending flag. The worker keeps selecting while results are in flight
//! (up to `max_inflight_per_worker`) and folds completions in as they land.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mz_core::{outcome_value, Oracle, OracleError, SearchConfig};
use mz_features::SessionContext;
use mz_infer::{ClientError, EvaluationResult, Ticket};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use thiserror::Error;

use crate::arena::NodeId;
use crate::evaluator::{select_policy, EvalError, Evaluation, LeafEvaluator};
use crate::tree::SearchTree;

/// Longest single wait for evaluator progress while at the in-flight cap.
const PROGRESS_POLL: Duration = Duration::from_millis(2);

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("oracle: {0}")]
    Oracle(#[from] OracleError),
    #[error("position is terminal")]
    Terminal,
    #[error("action {0} is not legal at the root")]
    UnknownAction(mz_core::ActionLabel),
    #[error("worker pool: {0}")]
    Pool(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

/// When a worker stops.
#[derive(Debug, Clone, Copy)]
pub struct Budget {
    pub deadline: Instant,
    /// Stop selecting after this many simulations; outstanding evaluations
    /// are still awaited until the deadline.
    pub max_simulations: Option<u64>,
}

impl Budget {
    pub fn until(deadline: Instant) -> Self {
        Self {
            deadline,
            max_simulations: None,
        }
    }

    pub fn simulations(n: u64, wait: Duration) -> Self {
        Self {
            deadline: Instant::now() + wait,
            max_simulations: Some(n),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Completed select passes (each starts exactly one evaluation or backup).
    pub simulations: u64,
    pub terminal_hits: u64,
    pub expansions: u64,
    pub evaluations: u64,
    pub dispatched: u64,
    pub completed: u64,
    /// Asynchronous evaluations that came back as errors (or never left).
    pub failed: u64,
    /// Evaluations still in flight when the worker stopped.
    pub abandoned: u64,
    pub inflight_max: usize,
}

#[derive(Debug)]
pub struct WorkerOutcome<S> {
    pub tree: SearchTree<S>,
    pub stats: WorkerStats,
}

/// Steps of one simulation.
#[derive(Debug, Clone, Copy)]
enum Phase {
    Select,
    Expand(NodeId),
    Evaluate(NodeId),
    Backprop(NodeId, f32),
    Done,
}

#[derive(Debug)]
struct InFlight {
    node: NodeId,
    ticket: Ticket,
}

pub struct SearchWorker<O: Oracle> {
    oracle: Arc<O>,
    evaluator: Arc<dyn LeafEvaluator<O::State>>,
    ctx: Arc<SessionContext>,
    cfg: SearchConfig,
    tree: SearchTree<O::State>,
    rng: ChaCha8Rng,
    cancel: Arc<AtomicBool>,
    pending: VecDeque<InFlight>,
    stats: WorkerStats,
}

impl<O: Oracle> SearchWorker<O> {
    pub fn new(
        oracle: Arc<O>,
        evaluator: Arc<dyn LeafEvaluator<O::State>>,
        ctx: Arc<SessionContext>,
        cfg: SearchConfig,
        tree: SearchTree<O::State>,
        seed: u64,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        Self {
            oracle,
            evaluator,
            ctx,
            cfg,
            tree,
            rng: ChaCha8Rng::seed_from_u64(seed),
            cancel,
            pending: VecDeque::new(),
            stats: WorkerStats::default(),
        }
    }

    /// Search until the budget runs out or the cancel flag is raised, then
    /// hand the tree back with no virtual statistics left on it.
    pub fn run(mut self, budget: Budget) -> Result<WorkerOutcome<O::State>, SearchError> {
        let cap = self.cfg.max_inflight_per_worker.max(1);
        loop {
            if self.cancelled() || Instant::now() >= budget.deadline {
                break;
            }
            if budget
                .max_simulations
                .is_some_and(|n| self.stats.simulations >= n)
            {
                break;
            }
            self.drain_completions();
            if self.pending.len() >= cap {
                self.wait(budget.deadline);
                continue;
            }
            self.simulate()?;
        }
        self.settle(budget.deadline);
        Ok(self.finish())
    }

    /// One pass from the root down to a single evaluation or terminal hit.
    fn simulate(&mut self) -> Result<(), SearchError> {
        let c_puct = self.cfg.c_puct;
        let perspective = self.tree.perspective();
        let mut phase = Phase::Select;
        loop {
            phase = match phase {
                Phase::Select => {
                    let mut id = self.tree.root();
                    while !self.tree.node(id).terminal && !self.tree.node(id).is_leaf() {
                        match self.tree.select(id, c_puct) {
                            Some(c) => id = c,
                            None => break,
                        }
                    }
                    let node = self.tree.node(id);
                    if node.terminal {
                        self.stats.terminal_hits += 1;
                        Phase::Backprop(id, outcome_value(node.winner, perspective))
                    } else if !node.is_root()
                        && node.network_value.is_none()
                        && !node.evaluation_pending
                    {
                        // Reached a leaf nobody has evaluated yet.
                        Phase::Evaluate(id)
                    } else {
                        // Evaluated (or in-flight) leaf: grow below it.
                        Phase::Expand(id)
                    }
                }
                Phase::Expand(id) => {
                    let noise = if id == self.tree.root() && self.noise_enabled() {
                        Some(&mut self.rng)
                    } else {
                        None
                    };
                    let created =
                        self.tree
                            .expand(&*self.oracle, id, &self.ctx, &self.cfg, noise)?;
                    if created > 0 {
                        self.stats.expansions += 1;
                    }
                    match self.tree.select(id, c_puct) {
                        Some(c) => Phase::Evaluate(c),
                        None => {
                            return Err(OracleError::Inconsistent {
                                msg: "expanded node has no children".to_string(),
                            }
                            .into())
                        }
                    }
                }
                Phase::Evaluate(id) => self.evaluate(id),
                Phase::Backprop(id, v) => {
                    self.tree.backpropagate(id, v, false, self.cfg.discount);
                    Phase::Done
                }
                Phase::Done => break,
            };
        }
        self.stats.simulations += 1;
        self.ctx.record_simulation();
        Ok(())
    }

    fn evaluate(&mut self, id: NodeId) -> Phase {
        let perspective = self.tree.perspective();
        let node = self.tree.node(id);
        if node.terminal {
            self.stats.terminal_hits += 1;
            return Phase::Backprop(id, outcome_value(node.winner, perspective));
        }
        if let Some(v) = node.network_value {
            return Phase::Backprop(id, v);
        }
        if node.evaluation_pending {
            // Another pass already owns this leaf; leave the counts alone.
            return Phase::Done;
        }

        self.stats.evaluations += 1;
        match self.evaluator.evaluate(&node.state, perspective, &self.ctx) {
            Ok(Evaluation::Ready(result)) if !result.value.is_finite() => {
                log::warn!("evaluation for node {id} returned value {}", result.value);
                self.stats.failed += 1;
                Phase::Backprop(id, 0.0)
            }
            Ok(Evaluation::Ready(result)) => {
                self.absorb(id, &result);
                Phase::Backprop(id, result.value)
            }
            Ok(Evaluation::Pending(ticket)) => {
                self.tree.node_mut(id).evaluation_pending = true;
                self.tree
                    .backpropagate(id, self.cfg.virtual_loss, true, self.cfg.discount);
                self.pending.push_back(InFlight { node: id, ticket });
                self.stats.dispatched += 1;
                self.stats.inflight_max = self.stats.inflight_max.max(self.pending.len());
                Phase::Done
            }
            Err(e) => {
                if matches!(e, EvalError::Client(ClientError::Backpressure(_))) {
                    log::debug!("evaluation rejected: {e}");
                } else {
                    log::warn!("evaluation failed: {e}");
                }
                self.stats.failed += 1;
                Phase::Backprop(id, 0.0)
            }
        }
    }

    /// Record a value and policy on `id`.
    fn absorb(&mut self, id: NodeId, result: &EvaluationResult) {
        let perspective = self.tree.perspective();
        let node = self.tree.node(id);
        let logits = select_policy(result, node.decision, node.to_play, perspective)
            .map(|p| p.to_vec());
        self.tree.node_mut(id).network_value = Some(result.value);
        if let Some(logits) = logits {
            self.tree
                .apply_policy(id, logits, &self.ctx, self.cfg.policy_temperature);
        }
    }

    /// Fold in every in-flight evaluation that has already completed.
    fn drain_completions(&mut self) {
        for _ in 0..self.pending.len() {
            let Some(f) = self.pending.pop_front() else {
                break;
            };
            match f.ticket.try_recv() {
                Ok(Some(result)) => self.complete(f.node, Ok(result)),
                Ok(None) => self.pending.push_back(f),
                Err(e) => self.complete(f.node, Err(e)),
            }
        }
    }

    fn complete(&mut self, id: NodeId, result: Result<EvaluationResult, ClientError>) {
        self.tree
            .revert_virtual_loss(id, self.cfg.virtual_loss, self.cfg.discount);
        self.tree.node_mut(id).evaluation_pending = false;
        match result {
            Ok(r) if !r.value.is_finite() => {
                log::warn!("evaluation for node {id} returned value {}", r.value);
                self.stats.failed += 1;
                self.tree.backpropagate(id, 0.0, false, self.cfg.discount);
            }
            Ok(r) => {
                self.stats.completed += 1;
                self.absorb(id, &r);
                self.tree.backpropagate(id, r.value, false, self.cfg.discount);
            }
            Err(e) => {
                log::debug!("evaluation for node {id} failed: {e}");
                self.stats.failed += 1;
                self.tree.backpropagate(id, 0.0, false, self.cfg.discount);
            }
        }
    }

    fn wait(&self, deadline: Instant) {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if !remaining.is_zero() {
            self.evaluator.wait_for_progress(remaining.min(PROGRESS_POLL));
        }
    }

    /// Keep draining until nothing is in flight, the deadline passes, or
    /// the search is cancelled.
    fn settle(&mut self, deadline: Instant) {
        self.drain_completions();
        while !self.pending.is_empty() && !self.cancelled() && Instant::now() < deadline {
            self.wait(deadline);
            self.drain_completions();
        }
    }

    /// Drop whatever is still in flight and return the tree.
    fn finish(mut self) -> WorkerOutcome<O::State> {
        while let Some(f) = self.pending.pop_front() {
            self.tree
                .revert_virtual_loss(f.node, self.cfg.virtual_loss, self.cfg.discount);
            self.tree.node_mut(f.node).evaluation_pending = false;
            f.ticket.cancel();
            self.stats.abandoned += 1;
        }
        WorkerOutcome {
            tree: self.tree,
            stats: self.stats,
        }
    }

    fn noise_enabled(&self) -> bool {
        self.cfg.noise_seed.is_some() && self.cfg.dirichlet_epsilon > 0.0
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }
}
