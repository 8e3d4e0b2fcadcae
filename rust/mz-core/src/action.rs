//! Action labels carried by search-tree edges.
//!
//! A label says *what kind of decision* an edge represents: a priority action
//! (activating an ability, passing) or one of the micro-decisions taken while
//! that action resolves (picking a target, a mode, a yes/no, a named choice).
//! Labels compare by value so two independently built trees can be matched
//! edge by edge.

use std::fmt;

/// Seat index of a player. The engine is two-player: `0` or `1`.
pub type PlayerId = u8;

pub const NUM_PLAYERS: usize = 2;

/// The other seat.
pub fn opponent(p: PlayerId) -> PlayerId {
    1u8.saturating_sub(p)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ActionLabel {
    /// A priority action; `0` is reserved for passing priority.
    Ability(u64),
    /// A target (object or player id) for a resolving ability.
    Target(u64),
    /// Index of a chosen mode of a modal ability.
    Mode(u32),
    /// A yes/no micro-decision ("use this optional effect?").
    Boolean(bool),
    /// A free-form discrete choice (e.g. a named option in a combat declaration).
    Choice(String),
}

impl ActionLabel {
    pub const PASS: ActionLabel = ActionLabel::Ability(0);

    pub fn is_pass(&self) -> bool {
        matches!(self, ActionLabel::Ability(0))
    }

    /// Stable textual key, used to intern labels into a vocabulary.
    pub fn key(&self) -> String {
        match self {
            ActionLabel::Ability(id) => format!("ability:{id}"),
            ActionLabel::Target(id) => format!("target:{id}"),
            ActionLabel::Mode(m) => format!("mode:{m}"),
            ActionLabel::Boolean(b) => format!("bool:{b}"),
            ActionLabel::Choice(c) => format!("choice:{c}"),
        }
    }
}

impl fmt::Display for ActionLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Kind of decision pending at a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecisionKind {
    /// Routine priority: play something or pass.
    Priority,
    DeclareAttackers,
    DeclareBlockers,
    /// Choosing a target for a resolving effect.
    Target,
    /// Choosing a mode of a modal effect.
    Mode,
    /// Yes/no on an optional effect.
    Binary,
    /// Any other discrete choice.
    Choice,
}

impl DecisionKind {
    /// Combat declarations get a larger think budget than routine decisions.
    pub fn is_combat(self) -> bool {
        matches!(self, DecisionKind::DeclareAttackers | DecisionKind::DeclareBlockers)
    }
}

/// Convert a game outcome into a value from the POV of `pov`.
///
/// `None` winner means a draw.
pub fn outcome_value(winner: Option<PlayerId>, pov: PlayerId) -> f32 {
    match winner {
        Some(w) if w == pov => 1.0,
        Some(_) => -1.0,
        None => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_compare_by_value() {
        assert_eq!(ActionLabel::Target(7), ActionLabel::Target(7));
        assert_ne!(ActionLabel::Target(7), ActionLabel::Ability(7));
        assert_eq!(
            ActionLabel::Choice("attack".to_string()),
            ActionLabel::Choice("attack".to_string())
        );
        assert!(ActionLabel::PASS.is_pass());
    }

    #[test]
    fn keys_are_distinct_across_variants() {
        let labels = [
            ActionLabel::Ability(1),
            ActionLabel::Target(1),
            ActionLabel::Mode(1),
            ActionLabel::Boolean(true),
            ActionLabel::Choice("1".to_string()),
        ];
        let mut keys: Vec<String> = labels.iter().map(|l| l.key()).collect();
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), labels.len());
    }

    #[test]
    fn outcome_sign_convention() {
        assert_eq!(outcome_value(Some(0), 0), 1.0);
        assert_eq!(outcome_value(Some(1), 0), -1.0);
        assert_eq!(outcome_value(None, 1), 0.0);
        assert_eq!(opponent(0), 1);
        assert_eq!(opponent(1), 0);
    }
}
