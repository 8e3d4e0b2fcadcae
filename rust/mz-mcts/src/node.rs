//! Search tree vertex and its statistics.

use mz_core::{ActionLabel, DecisionKind, PlayerId};

use crate::arena::NodeId;

/// One vertex of the search tree.
///
/// `score` and `virtual_score` are kept from the searching player's point
/// of view; selection flips the sign at nodes where the other player acts.
#[derive(Debug, Clone)]
pub struct SearchNode<S> {
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    /// Edge from the parent. `None` only at a root.
    pub label: Option<ActionLabel>,

    pub to_play: PlayerId,
    pub decision: DecisionKind,
    pub terminal: bool,
    pub winner: Option<PlayerId>,
    pub fingerprint: u64,
    pub state: S,

    pub visits: u32,
    pub score: f32,
    pub virtual_visits: u32,
    pub virtual_score: f32,
    /// Real backups that started at this node (leaf or terminal evaluations).
    pub local_visits: u32,

    pub prior: f32,
    /// Last value estimate received for this node.
    pub network_value: Option<f32>,
    /// Full action-vocabulary logits for this node's decision, kept until the
    /// node is expanded.
    pub policy_logits: Option<Vec<f32>>,
    pub evaluation_pending: bool,
}

impl<S> SearchNode<S> {
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Mean value including in-flight (virtual) statistics; `0` if unvisited.
    pub fn q(&self) -> f32 {
        let n = self.visits.saturating_add(self.virtual_visits);
        if n == 0 {
            0.0
        } else {
            (self.score + self.virtual_score) / (n as f32)
        }
    }

    /// Mean of real backups only.
    pub fn q_real(&self) -> f32 {
        if self.visits == 0 {
            0.0
        } else {
            self.score / (self.visits as f32)
        }
    }

    pub fn effective_visits(&self) -> u32 {
        self.visits.saturating_add(self.virtual_visits)
    }

    /// Copy of the position-level data with statistics zeroed and no links.
    pub fn detached_copy(&self) -> Self
    where
        S: Clone,
    {
        Self {
            parent: None,
            children: Vec::new(),
            label: self.label.clone(),
            to_play: self.to_play,
            decision: self.decision,
            terminal: self.terminal,
            winner: self.winner,
            fingerprint: self.fingerprint,
            state: self.state.clone(),
            visits: 0,
            score: 0.0,
            virtual_visits: 0,
            virtual_score: 0.0,
            local_visits: 0,
            prior: self.prior,
            network_value: self.network_value,
            policy_logits: self.policy_logits.clone(),
            evaluation_pending: false,
        }
    }
}
