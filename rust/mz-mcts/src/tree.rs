//! Search tree: PUCT selection, expansion, backpropagation, merging and
//! subtree promotion over an arena of [`SearchNode`]s.

use std::collections::VecDeque;

use mz_core::{ActionLabel, DecisionKind, Oracle, OracleError, PlayerId, SearchConfig};
use mz_features::SessionContext;
use rand::Rng;

use crate::arena::{Arena, NodeId};
use crate::node::SearchNode;
use crate::policy::{mix_dirichlet_noise, sample_index, softmax, uniform, visit_distribution};

/// Below this, the best-child temperature is treated as zero.
const MIN_TEMPERATURE: f32 = 1e-3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Node pairs combined by label.
    pub matched: usize,
    /// Subtrees taken over from the other tree.
    pub grafted: usize,
    /// Same-label pairs whose positions disagreed.
    pub skipped: usize,
}

#[derive(Debug, Clone)]
pub struct SearchTree<S> {
    arena: Arena<SearchNode<S>>,
    root: NodeId,
    /// Player whose point of view all scores are kept in.
    perspective: PlayerId,
}

impl<S: Clone> SearchTree<S> {
    pub fn new<O: Oracle<State = S>>(oracle: &O, state: S, perspective: PlayerId) -> Self {
        let mut arena = Arena::new();
        let root = arena.push(make_node(oracle, state, None, None, 1.0));
        Self {
            arena,
            root,
            perspective,
        }
    }

    /// A one-node tree for the same position as `node`, carrying its cached
    /// evaluation but none of its statistics.
    pub fn from_root_node(node: &SearchNode<S>, perspective: PlayerId) -> Self {
        let mut copy = node.detached_copy();
        copy.label = None;
        let mut arena = Arena::new();
        let root = arena.push(copy);
        Self {
            arena,
            root,
            perspective,
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn root_node(&self) -> &SearchNode<S> {
        self.arena.get(self.root)
    }

    pub fn perspective(&self) -> PlayerId {
        self.perspective
    }

    pub fn node(&self, id: NodeId) -> &SearchNode<S> {
        self.arena.get(id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut SearchNode<S> {
        self.arena.get_mut(id)
    }

    /// Arena size, including nodes no longer reachable from the root.
    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.arena.get(id).children
    }

    pub fn child_by_label(&self, id: NodeId, label: &ActionLabel) -> Option<NodeId> {
        self.children(id)
            .iter()
            .copied()
            .find(|&c| self.arena.get(c).label.as_ref() == Some(label))
    }

    /// Ids of `id` and every node below it, parents before children.
    pub fn subtree(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut queue = VecDeque::from([id]);
        while let Some(n) = queue.pop_front() {
            out.push(n);
            queue.extend(self.children(n).iter().copied());
        }
        out
    }

    /// PUCT choice among the children of `id`.
    ///
    /// `sign·Q(child) + c_puct·prior·sqrt(N(node)) / (1 + N(child))`, with
    /// `sign = -1` where the other player acts and counts including virtual
    /// visits. Ties go to the earliest child.
    pub fn select(&self, id: NodeId, c_puct: f32) -> Option<NodeId> {
        let node = self.arena.get(id);
        match node.children.len() {
            0 => return None,
            1 => return Some(node.children[0]),
            _ => {}
        }
        let sign = if node.to_play == self.perspective {
            1.0
        } else {
            -1.0
        };
        let sqrt_n = (node.effective_visits() as f32).sqrt();

        let mut best = node.children[0];
        let mut best_score = f32::NEG_INFINITY;
        for &c in &node.children {
            let child = self.arena.get(c);
            let u = c_puct * child.prior * sqrt_n / (1.0 + child.effective_visits() as f32);
            let score = sign * child.q() + u;
            if score > best_score {
                best_score = score;
                best = c;
            }
        }
        Some(best)
    }

    /// Create one child per legal option at `id`.
    ///
    /// Priors come from the node's stored policy logits when present
    /// (softmax over the children actually created), uniform otherwise.
    /// Dirichlet noise is mixed in only at the root, and only when `noise`
    /// is given. Returns the number of children created; an already
    /// expanded or terminal node is left as is.
    pub fn expand<O, R>(
        &mut self,
        oracle: &O,
        id: NodeId,
        ctx: &SessionContext,
        cfg: &SearchConfig,
        noise: Option<&mut R>,
    ) -> Result<usize, OracleError>
    where
        O: Oracle<State = S>,
        R: Rng,
    {
        let node = self.arena.get(id);
        if node.terminal || !node.children.is_empty() {
            return Ok(0);
        }
        let labels = oracle.legal_actions(&node.state);
        if labels.is_empty() {
            return Err(OracleError::NoLegalOptions);
        }
        let mut states = Vec::with_capacity(labels.len());
        for label in &labels {
            states.push(oracle.apply(&node.state, label)?);
        }

        let mut priors = match &node.policy_logits {
            Some(logits) => softmax(
                &child_logits(node.decision, &labels, logits, ctx),
                cfg.policy_temperature,
            ),
            None => uniform(labels.len()),
        };
        if id == self.root {
            if let Some(rng) = noise {
                mix_dirichlet_noise(&mut priors, cfg.dirichlet_alpha, cfg.dirichlet_epsilon, rng);
            }
        }

        let n = labels.len();
        for ((label, state), prior) in labels.into_iter().zip(states).zip(priors) {
            let child = self
                .arena
                .push(make_node(oracle, state, Some(id), Some(label), prior));
            self.arena.get_mut(id).children.push(child);
        }
        Ok(n)
    }

    /// Store policy logits for `id`; if it already has children, re-derive
    /// their priors from them.
    pub fn apply_policy(
        &mut self,
        id: NodeId,
        logits: Vec<f32>,
        ctx: &SessionContext,
        temperature: f32,
    ) {
        let node = self.arena.get(id);
        if !node.children.is_empty() {
            let labels: Vec<ActionLabel> = node
                .children
                .iter()
                .filter_map(|&c| self.arena.get(c).label.clone())
                .collect();
            let priors = softmax(
                &child_logits(node.decision, &labels, &logits, ctx),
                temperature,
            );
            let children = node.children.clone();
            for (c, p) in children.into_iter().zip(priors) {
                self.arena.get_mut(c).prior = p;
            }
        }
        self.arena.get_mut(id).policy_logits = Some(logits);
    }

    /// Back a result up from `id` to the root, decaying it by `discount` once
    /// per edge.
    ///
    /// A real update (`is_virtual == false`) adds `value` (searching
    /// player's POV) to `visits`/`score` and counts one local visit at `id`.
    /// A virtual update treats `value` as a loss magnitude: every node on the
    /// path gets one virtual visit and a virtual score that looks like a loss
    /// to the player choosing it. Undo it with [`revert_virtual_loss`].
    ///
    /// [`revert_virtual_loss`]: SearchTree::revert_virtual_loss
    pub fn backpropagate(&mut self, id: NodeId, value: f32, is_virtual: bool, discount: f32) {
        if is_virtual {
            self.walk_virtual(id, value, discount, 1);
            return;
        }
        self.arena.get_mut(id).local_visits += 1;
        let mut v = value;
        let mut cur = Some(id);
        while let Some(n) = cur {
            let node = self.arena.get_mut(n);
            node.visits += 1;
            node.score += v;
            v *= discount;
            cur = node.parent;
        }
    }

    /// Exact inverse of a virtual `backpropagate` with the same arguments.
    pub fn revert_virtual_loss(&mut self, id: NodeId, magnitude: f32, discount: f32) {
        self.walk_virtual(id, magnitude, discount, -1);
    }

    fn walk_virtual(&mut self, id: NodeId, magnitude: f32, discount: f32, dir: i32) {
        let mut m = magnitude;
        let mut cur = Some(id);
        while let Some(n) = cur {
            let parent = self.arena.get(n).parent;
            let chooser = parent.map_or(self.arena.get(n).to_play, |p| self.arena.get(p).to_play);
            let sign = if chooser == self.perspective { 1.0 } else { -1.0 };
            let amount = -m * sign;
            let node = self.arena.get_mut(n);
            if dir > 0 {
                node.virtual_visits += 1;
                node.virtual_score += amount;
            } else {
                node.virtual_visits = node.virtual_visits.saturating_sub(1);
                node.virtual_score -= amount;
                if node.virtual_visits == 0 {
                    node.virtual_score = 0.0;
                }
            }
            m *= discount;
            cur = parent;
        }
    }

    /// Fold `other` (grown independently from the same position) into this
    /// tree.
    ///
    /// Statistics are summed; children are matched by action label. Children
    /// only `other` has are copied in whole. A same-label pair whose
    /// positions differ is logged and left out; its visits stay on the parent
    /// as local visits so the counts still add up.
    pub fn merge(&mut self, other: &SearchTree<S>) -> MergeReport {
        let mut report = MergeReport::default();
        if self.root_node().fingerprint != other.root_node().fingerprint {
            log::warn!(
                "merge skipped: root fingerprints differ ({:#x} vs {:#x})",
                self.root_node().fingerprint,
                other.root_node().fingerprint
            );
            report.skipped += 1;
            return report;
        }

        let mut stack = vec![(self.root, other.root)];
        while let Some((a, b)) = stack.pop() {
            report.matched += 1;
            let src = other.node(b);
            {
                let dst = self.arena.get_mut(a);
                dst.visits += src.visits;
                dst.score += src.score;
                dst.local_visits += src.local_visits;
                if dst.network_value.is_none() {
                    dst.network_value = src.network_value;
                }
                if dst.policy_logits.is_none() {
                    dst.policy_logits = src.policy_logits.clone();
                }
            }
            for &cb in &src.children {
                let Some(label) = other.node(cb).label.as_ref() else {
                    continue;
                };
                match self.child_by_label(a, label) {
                    Some(ca) => {
                        let (fa, fb) = (self.node(ca).fingerprint, other.node(cb).fingerprint);
                        if fa == fb {
                            stack.push((ca, cb));
                        } else {
                            log::warn!(
                                "merge: child {label} diverged ({fa:#x} vs {fb:#x}); skipping"
                            );
                            report.skipped += 1;
                            let dropped = other.node(cb).visits;
                            self.arena.get_mut(a).local_visits += dropped;
                        }
                    }
                    None => {
                        self.copy_from(other, cb, Some(a), false);
                        report.grafted += 1;
                    }
                }
            }
        }
        report
    }

    /// Detach `id` from its parent and return its subtree as a new tree.
    ///
    /// Statistics below `id` are carried over unchanged. This tree no longer
    /// lists `id` among its parent's children.
    pub fn emancipate(&mut self, id: NodeId) -> SearchTree<S> {
        if let Some(p) = self.arena.get(id).parent {
            self.arena.get_mut(p).children.retain(|&c| c != id);
        }
        let mut out = SearchTree {
            arena: Arena::with_capacity(64),
            root: 0,
            perspective: self.perspective,
        };
        out.root = out.copy_from(self, id, None, false);
        out.arena.get_mut(out.root).label = None;
        out
    }

    /// Most robust child of the root.
    ///
    /// Normally the most visited (earliest on ties; highest prior if nothing
    /// was visited). When the root value is extreme, a temperature grows
    /// from zero and the choice is sampled in proportion to
    /// `visits^(1/T)`.
    pub fn best_child<R: Rng>(&self, cfg: &SearchConfig, rng: &mut R) -> Option<NodeId> {
        let children = self.children(self.root);
        if children.is_empty() {
            return None;
        }
        let visits: Vec<u32> = children.iter().map(|&c| self.node(c).visits).collect();
        if visits.iter().all(|&v| v == 0) {
            let mut best = children[0];
            for &c in children {
                if self.node(c).prior > self.node(best).prior {
                    best = c;
                }
            }
            return Some(best);
        }
        let t = best_child_temperature(self.root_node().q_real(), cfg);
        let dist = visit_distribution(&visits, if t < MIN_TEMPERATURE { 0.0 } else { t });
        let idx = if t < MIN_TEMPERATURE {
            dist.iter().position(|&p| p > 0.0).unwrap_or(0)
        } else {
            sample_index(&dist, rng)
        };
        Some(children[idx])
    }

    /// Compact the arena to nodes reachable from the root, collapsing
    /// unvisited, non-pending subtrees to bare leaves. Returns how many
    /// arena slots were released.
    pub fn purge(&mut self) -> usize {
        let before = self.arena.len();
        let mut out = SearchTree {
            arena: Arena::with_capacity(before / 2 + 1),
            root: 0,
            perspective: self.perspective,
        };
        out.root = out.copy_from(self, self.root, None, true);
        *self = out;
        before - self.arena.len()
    }

    /// Visit-count distribution over the root's children (training target).
    pub fn policy_target(&self) -> Vec<(ActionLabel, f32)> {
        let children = self.children(self.root);
        let visits: Vec<u32> = children.iter().map(|&c| self.node(c).visits).collect();
        let dist = if visits.iter().all(|&v| v == 0) {
            uniform(visits.len())
        } else {
            visit_distribution(&visits, 1.0)
        };
        children
            .iter()
            .zip(dist)
            .filter_map(|(&c, p)| self.node(c).label.clone().map(|l| (l, p)))
            .collect()
    }

    /// Mean backed-up value at the root, searching player's POV.
    pub fn root_value(&self) -> f32 {
        self.root_node().q_real()
    }

    /// Whether every reachable node satisfies
    /// `visits == Σ child visits + local_visits`.
    pub fn mass_conserved(&self) -> bool {
        self.subtree(self.root).into_iter().all(|id| {
            let n = self.node(id);
            let below: u32 = n.children.iter().map(|&c| self.node(c).visits).sum();
            n.visits == below + n.local_visits
        })
    }

    /// Whether any reachable node still carries virtual statistics or a
    /// pending flag.
    pub fn has_in_flight(&self) -> bool {
        self.subtree(self.root).into_iter().any(|id| {
            let n = self.node(id);
            n.evaluation_pending || n.virtual_visits != 0
        })
    }

    /// Copy `src_id`'s subtree from `src` under `parent` (or as a detached
    /// node when `parent` is `None`). Children keep their order.
    fn copy_from(
        &mut self,
        src: &SearchTree<S>,
        src_id: NodeId,
        parent: Option<NodeId>,
        collapse_unvisited: bool,
    ) -> NodeId {
        let mut top = None;
        let mut queue = VecDeque::from([(src_id, parent)]);
        while let Some((s, p)) = queue.pop_front() {
            let mut n = src.node(s).clone();
            n.parent = p;
            let keep_children =
                !(collapse_unvisited && p.is_some() && n.visits == 0 && !n.evaluation_pending);
            let kids = std::mem::take(&mut n.children);
            let id = self.arena.push(n);
            if let Some(p) = p {
                self.arena.get_mut(p).children.push(id);
            }
            top.get_or_insert(id);
            if keep_children {
                queue.extend(kids.into_iter().map(|k| (k, Some(id))));
            }
        }
        top.unwrap_or(self.root)
    }
}

/// Temperature used by [`SearchTree::best_child`] for a root value `q`.
pub fn best_child_temperature(q: f32, cfg: &SearchConfig) -> f32 {
    let onset = cfg.best_child_temperature_onset;
    if !onset.is_finite() || onset >= 1.0 || !q.is_finite() {
        return 0.0;
    }
    let x = ((q.abs() - onset) / (1.0 - onset)).max(0.0);
    cfg.best_child_temperature * x
}

fn make_node<O: Oracle>(
    oracle: &O,
    state: O::State,
    parent: Option<NodeId>,
    label: Option<ActionLabel>,
    prior: f32,
) -> SearchNode<O::State> {
    let terminal = oracle.is_terminal(&state);
    SearchNode {
        parent,
        children: Vec::new(),
        label,
        to_play: oracle.to_play(&state),
        decision: oracle.decision(&state),
        terminal,
        winner: if terminal { oracle.winner(&state) } else { None },
        fingerprint: oracle.fingerprint(&state),
        state,
        visits: 0,
        score: 0.0,
        virtual_visits: 0,
        virtual_score: 0.0,
        local_visits: 0,
        prior,
        network_value: None,
        policy_logits: None,
        evaluation_pending: false,
    }
}

/// Logit of each label. Yes/no decisions index `[no, yes]` directly; every
/// other decision indexes the session's action vocabulary. Missing entries
/// count as `0.0`.
fn child_logits(
    decision: DecisionKind,
    labels: &[ActionLabel],
    logits: &[f32],
    ctx: &SessionContext,
) -> Vec<f32> {
    labels
        .iter()
        .map(|label| {
            let idx = match (decision, label) {
                (DecisionKind::Binary, ActionLabel::Boolean(b)) => Some(*b as usize),
                _ => usize::try_from(ctx.action_index(label)).ok(),
            };
            idx.and_then(|i| logits.get(i)).copied().unwrap_or(0.0)
        })
        .collect()
}
