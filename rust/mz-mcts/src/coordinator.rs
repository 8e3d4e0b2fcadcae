//! Parallel root coordinator.
//!
//! Each decision fans out to `workers` independent searches started from the
//! same root, waits for them until the think budget (plus a grace period)
//! runs out, merges what came back into the canonical tree and picks the
//! most robust child. Between decisions the chosen subtree is promoted to be
//! the new root so its statistics carry over.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use mz_core::{ActionLabel, Config, CoordinatorConfig, DecisionKind, Oracle, PlayerId, SearchConfig};
use mz_features::SessionContext;
use mz_infer::client::ClientStatsSnapshot;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::evaluator::LeafEvaluator;
use crate::tree::SearchTree;
use crate::worker::{Budget, SearchError, SearchWorker, WorkerOutcome};

/// Result of one [`ParallelCoordinator::decide`] call.
#[derive(Debug, Clone)]
pub struct Decision {
    pub action: ActionLabel,
    pub decision: DecisionKind,
    pub budget: Duration,
    pub elapsed: Duration,
    /// Root visits after merging.
    pub root_visits: u32,
    pub root_children: usize,
    pub root_value: f32,
    pub workers_merged: usize,
    pub workers_failed: usize,
    /// Workers that missed the join deadline.
    pub workers_late: usize,
    pub simulations: u64,
    /// Visit distribution over the root's children.
    pub policy: Vec<(ActionLabel, f32)>,
}

pub struct ParallelCoordinator<O: Oracle> {
    oracle: Arc<O>,
    evaluator: Arc<dyn LeafEvaluator<O::State>>,
    ctx: Arc<SessionContext>,
    search: SearchConfig,
    coord: CoordinatorConfig,
    pool: rayon::ThreadPool,
    tree: SearchTree<O::State>,
    rng: ChaCha8Rng,
    base_seed: u64,
    decisions: u64,
}

impl<O: Oracle + 'static> ParallelCoordinator<O> {
    pub fn new(
        oracle: Arc<O>,
        evaluator: Arc<dyn LeafEvaluator<O::State>>,
        ctx: Arc<SessionContext>,
        cfg: &Config,
        state: O::State,
        perspective: PlayerId,
    ) -> Result<Self, SearchError> {
        cfg.validate()
            .map_err(|e| SearchError::InvalidConfig(e.to_string()))?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(cfg.coordinator.workers)
            .thread_name(|i| format!("mz-search-{i}"))
            .build()
            .map_err(|e| SearchError::Pool(e.to_string()))?;
        let base_seed = cfg
            .search
            .noise_seed
            .unwrap_or_else(|| rand::thread_rng().next_u64());
        let tree = SearchTree::new(&*oracle, state, perspective);
        log::debug!(
            "coordinator: {} workers, evaluator {}",
            cfg.coordinator.workers,
            evaluator.name()
        );
        Ok(Self {
            oracle,
            evaluator,
            ctx,
            search: cfg.search.clone(),
            coord: cfg.coordinator.clone(),
            pool,
            tree,
            rng: ChaCha8Rng::seed_from_u64(base_seed ^ 0xB357_C41D),
            base_seed,
            decisions: 0,
        })
    }

    pub fn tree(&self) -> &SearchTree<O::State> {
        &self.tree
    }

    pub fn state(&self) -> &O::State {
        &self.tree.root_node().state
    }

    pub fn perspective(&self) -> PlayerId {
        self.tree.perspective()
    }

    pub fn evaluator_name(&self) -> &'static str {
        self.evaluator.name()
    }

    pub fn client_stats(&self) -> Option<ClientStatsSnapshot> {
        self.evaluator.client_stats()
    }

    /// Think about the current root and return the chosen action. The tree
    /// is not advanced; call [`advance`](Self::advance) with whatever action
    /// was actually played.
    pub fn decide(&mut self) -> Result<Decision, SearchError> {
        let start = Instant::now();
        let root = self.tree.root();
        if self.tree.root_node().terminal {
            return Err(SearchError::Terminal);
        }
        self.tree
            .expand(&*self.oracle, root, &self.ctx, &self.search, None::<&mut ChaCha8Rng>)?;
        let children = self.tree.children(root).len();
        let decision = self.tree.root_node().decision;
        self.decisions += 1;

        // Forced move: nothing to think about.
        let (budget, merged, failed, late, simulations) = if children == 1 {
            (Duration::ZERO, 0, 0, 0, 0)
        } else {
            let budget = think_budget(self.tree.root_node().visits, children, decision, &self.coord);
            let (merged, failed, late, simulations) = self.search_round(start + budget)?;
            (budget, merged, failed, late, simulations)
        };

        let best = self
            .tree
            .best_child(&self.search, &mut self.rng)
            .ok_or(SearchError::Terminal)?;
        let action = self
            .tree
            .node(best)
            .label
            .clone()
            .ok_or(SearchError::Terminal)?;
        let root_node = self.tree.root_node();
        let out = Decision {
            action,
            decision,
            budget,
            elapsed: start.elapsed(),
            root_visits: root_node.visits,
            root_children: children,
            root_value: self.tree.root_value(),
            workers_merged: merged,
            workers_failed: failed,
            workers_late: late,
            simulations,
            policy: self.tree.policy_target(),
        };
        log::debug!(
            "decide: {} after {:?} (budget {:?}, visits {}, {} merged, {} failed, {} late)",
            out.action,
            out.elapsed,
            out.budget,
            out.root_visits,
            merged,
            failed,
            late
        );
        Ok(out)
    }

    /// Run every worker until `deadline` and merge the trees that come back.
    /// Returns (merged, failed, late, simulations).
    fn search_round(&mut self, deadline: Instant) -> Result<(usize, usize, usize, u64), SearchError> {
        let workers = self.coord.workers;
        let cancel = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel::<(usize, Result<WorkerOutcome<O::State>, SearchError>)>();
        for w in 0..workers {
            let worker = SearchWorker::new(
                Arc::clone(&self.oracle),
                Arc::clone(&self.evaluator),
                Arc::clone(&self.ctx),
                self.search.clone(),
                SearchTree::from_root_node(self.tree.root_node(), self.tree.perspective()),
                self.worker_seed(w),
                Arc::clone(&cancel),
            );
            let tx = tx.clone();
            self.pool.spawn(move || {
                let out = worker.run(Budget::until(deadline));
                // Receiver is gone if the coordinator already gave up on us.
                let _ = tx.send((w, out));
            });
        }
        drop(tx);

        let hard_stop = deadline + Duration::from_millis(self.coord.join_grace_ms);
        let mut results = Vec::with_capacity(workers);
        while results.len() < workers {
            let wait = hard_stop.saturating_duration_since(Instant::now());
            match rx.recv_timeout(wait) {
                Ok(r) => results.push(r),
                Err(_) => break,
            }
        }
        cancel.store(true, Ordering::Relaxed);
        let late = workers - results.len();
        if late > 0 {
            log::warn!("{late} search worker(s) missed the join deadline");
        }

        results.sort_by_key(|(w, _)| *w);
        let (mut merged, mut failed, mut simulations) = (0, 0, 0);
        for (w, out) in results {
            match out {
                Ok(o) => {
                    let report = self.tree.merge(&o.tree);
                    if report.skipped > 0 {
                        log::warn!("worker {w}: {} diverged subtrees skipped", report.skipped);
                    }
                    simulations += o.stats.simulations;
                    merged += 1;
                }
                Err(e) if self.coord.strict => return Err(e),
                Err(e) => {
                    log::warn!("worker {w} excluded: {e}");
                    failed += 1;
                }
            }
        }
        Ok((merged, failed, late, simulations))
    }

    /// Make the position after `action` the new root. A searched child keeps
    /// its subtree; otherwise the position is built fresh.
    pub fn advance(&mut self, action: &ActionLabel) -> Result<(), SearchError> {
        let root = self.tree.root();
        match self.tree.child_by_label(root, action) {
            Some(child) => {
                let mut next = self.tree.emancipate(child);
                let released = next.purge();
                log::trace!("advance: promoted {action}, {released} slots released");
                self.tree = next;
            }
            None if !self.tree.root_node().is_leaf() => {
                return Err(SearchError::UnknownAction(action.clone()));
            }
            None => {
                let state = self.oracle.apply(&self.tree.root_node().state, action)?;
                self.tree = SearchTree::new(&*self.oracle, state, self.tree.perspective());
            }
        }
        Ok(())
    }

    fn worker_seed(&self, w: usize) -> u64 {
        self.base_seed
            ^ self.decisions.wrapping_mul(0x9E37_79B9_7F4A_7C15)
            ^ (w as u64 + 1).wrapping_mul(0xD1E7_C437_9E37_79B9)
    }
}

/// Wall-clock budget for one decision.
///
/// Scales `base_think_ms` by how explored the root already is (root visits
/// per child): under `low_water` it grows by `under_explored_multiplier`,
/// above `high_water` it shrinks linearly, reaching zero at twice the high
/// water mark. Combat declarations get `combat_multiplier`. The result is
/// clamped to `[min_think_ms, max_think_ms]`.
pub fn think_budget(
    root_visits: u32,
    children: usize,
    decision: DecisionKind,
    cfg: &CoordinatorConfig,
) -> Duration {
    let base = cfg.base_think_ms as f32;
    let ratio = if children == 0 {
        0.0
    } else {
        root_visits as f32 / children as f32
    };
    let high = cfg.high_water_visits_per_child;
    let mut ms = if ratio < cfg.low_water_visits_per_child {
        base * cfg.under_explored_multiplier
    } else if ratio > high && high > 0.0 {
        base * (1.0 - (ratio - high) / high).max(0.0)
    } else {
        base
    };
    if decision.is_combat() {
        ms *= cfg.combat_multiplier;
    }
    let ms = (ms.max(0.0).round() as u64).clamp(cfg.min_think_ms, cfg.max_think_ms);
    Duration::from_millis(ms)
}
