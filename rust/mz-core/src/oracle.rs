//! Boundary to the rules engine.
//!
//! The search never interprets game rules itself: it asks the oracle for the
//! legal options at a position and for the position that results from taking
//! one. States have value semantics: `apply` must return a fresh, independent
//! state and leave its input untouched.

use thiserror::Error;

use crate::action::{ActionLabel, DecisionKind, PlayerId};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OracleError {
    #[error("illegal action {action} in current state")]
    IllegalAction { action: ActionLabel },
    #[error("non-terminal state has no legal options")]
    NoLegalOptions,
    #[error("inconsistent state: {msg}")]
    Inconsistent { msg: String },
}

pub trait Oracle: Send + Sync {
    type State: Clone + Send + Sync + 'static;

    /// Ordered legal options at `state`. Empty only for terminal states.
    fn legal_actions(&self, state: &Self::State) -> Vec<ActionLabel>;

    fn apply(&self, state: &Self::State, action: &ActionLabel) -> Result<Self::State, OracleError>;

    fn is_terminal(&self, state: &Self::State) -> bool;

    fn is_winner(&self, state: &Self::State, player: PlayerId) -> bool;

    /// Player who takes the pending decision at `state`.
    fn to_play(&self, state: &Self::State) -> PlayerId;

    /// What kind of decision is pending at `state`.
    fn decision(&self, state: &Self::State) -> DecisionKind;

    /// Compact fingerprint of the observable position; equal positions must
    /// produce equal fingerprints.
    fn fingerprint(&self, state: &Self::State) -> u64;

    /// Winner of a terminal state, `None` for a draw.
    fn winner(&self, state: &Self::State) -> Option<PlayerId> {
        (0..crate::action::NUM_PLAYERS as PlayerId).find(|&p| self.is_winner(state, p))
    }
}
