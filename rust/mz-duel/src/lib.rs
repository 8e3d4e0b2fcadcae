//! mz-duel: a small two-player duel used to drive the search end to end.
//!
//! Each turn the active player holds priority and may, while charge lasts,
//! strike (then pick a target), drain (the opponent may spend charge to
//! resist), or cast a modal charm once. Passing moves to a combat
//! declaration (attack or hold) that ends the turn. A player at 0 life
//! loses; at the turn cap the higher life total wins.
//!
//! The decision shapes mirror the ones a real rules engine produces:
//! priority actions, target picks, yes/no choices by the non-active player,
//! mode picks, and named combat choices.

use mz_core::{opponent, ActionLabel, DecisionKind, Oracle, OracleError, PlayerId};
use mz_features::{intern_features, FeatureEncoder, SessionContext};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

pub const STRIKE: ActionLabel = ActionLabel::Ability(1);
pub const DRAIN: ActionLabel = ActionLabel::Ability(2);
pub const CHARM: ActionLabel = ActionLabel::Ability(3);

pub const ATTACK: &str = "attack";
pub const HOLD: &str = "hold";

const MAX_LIFE: i16 = 20;
const MAX_CHARGE: u8 = 9;
const STRIKE_DAMAGE: i16 = 2;
const ATTACK_DAMAGE: i16 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pending {
    Priority,
    StrikeTarget,
    DrainResist,
    CharmMode,
    Combat,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DuelState {
    pub life: [i16; 2],
    pub charge: [u8; 2],
    pub active: PlayerId,
    pub turn: u16,
    pub charm_used: bool,
    pub pending: Pending,
}

/// Rules of the duel. `max_turns` bounds every game.
#[derive(Debug, Clone)]
pub struct Duel {
    pub max_turns: u16,
    pub starting_life: i16,
}

impl Default for Duel {
    fn default() -> Self {
        Self {
            max_turns: 20,
            starting_life: 10,
        }
    }
}

impl Duel {
    pub fn new(max_turns: u16, starting_life: i16) -> Self {
        Self {
            max_turns,
            starting_life,
        }
    }

    pub fn initial_state(&self) -> DuelState {
        DuelState {
            life: [self.starting_life; 2],
            charge: [1, 1],
            active: 0,
            turn: 0,
            charm_used: false,
            pending: Pending::Priority,
        }
    }

    /// A randomized but legal opening, for varied test and self-play positions.
    pub fn random_start(&self, seed: u64) -> DuelState {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let spread = (self.starting_life / 3).max(1);
        let mut s = self.initial_state();
        for p in 0..2 {
            s.life[p] = self.starting_life + rng.gen_range(-spread..=spread);
            s.charge[p] = rng.gen_range(0..=3);
        }
        s.active = rng.gen_range(0..2);
        s
    }

    /// Static evaluation from `pov`'s side, in (-1, 1).
    pub fn heuristic(&self, state: &DuelState, pov: PlayerId) -> f32 {
        if self.is_terminal(state) {
            return mz_core::outcome_value(self.winner(state), pov);
        }
        let me = pov as usize;
        let them = opponent(pov) as usize;
        let life = (state.life[me] - state.life[them]) as f32;
        let charge = state.charge[me] as f32 - state.charge[them] as f32;
        ((life + 0.5 * charge) / 6.0).tanh()
    }

    fn outcome(&self, state: &DuelState) -> Option<Option<PlayerId>> {
        let dead = [state.life[0] <= 0, state.life[1] <= 0];
        match dead {
            [true, true] => Some(None),
            [true, false] => Some(Some(1)),
            [false, true] => Some(Some(0)),
            [false, false] if state.turn >= self.max_turns => {
                Some(match state.life[0].cmp(&state.life[1]) {
                    std::cmp::Ordering::Greater => Some(0),
                    std::cmp::Ordering::Less => Some(1),
                    std::cmp::Ordering::Equal => None,
                })
            }
            _ => None,
        }
    }

    fn end_turn(&self, s: &mut DuelState) {
        s.active = opponent(s.active);
        s.turn += 1;
        s.charm_used = false;
        let a = s.active as usize;
        s.charge[a] = (s.charge[a] + 1).min(MAX_CHARGE);
        s.pending = Pending::Priority;
    }
}

fn gain_life(life: &mut i16, n: i16) {
    *life = (*life + n).min(MAX_LIFE);
}

impl Oracle for Duel {
    type State = DuelState;

    fn legal_actions(&self, s: &DuelState) -> Vec<ActionLabel> {
        if self.is_terminal(s) {
            return Vec::new();
        }
        let a = s.active as usize;
        let o = opponent(s.active) as usize;
        match s.pending {
            Pending::Priority => {
                let mut v = vec![ActionLabel::PASS];
                if s.charge[a] >= 1 {
                    v.push(STRIKE);
                }
                if s.charge[a] >= 2 {
                    v.push(DRAIN);
                }
                if !s.charm_used {
                    v.push(CHARM);
                }
                v
            }
            Pending::StrikeTarget => vec![
                ActionLabel::Target(o as u64),
                ActionLabel::Target(a as u64),
            ],
            Pending::DrainResist => {
                if s.charge[o] >= 1 {
                    vec![ActionLabel::Boolean(false), ActionLabel::Boolean(true)]
                } else {
                    vec![ActionLabel::Boolean(false)]
                }
            }
            Pending::CharmMode => vec![ActionLabel::Mode(0), ActionLabel::Mode(1)],
            Pending::Combat => vec![
                ActionLabel::Choice(ATTACK.to_string()),
                ActionLabel::Choice(HOLD.to_string()),
            ],
        }
    }

    fn apply(&self, s: &DuelState, action: &ActionLabel) -> Result<DuelState, OracleError> {
        if !self.legal_actions(s).contains(action) {
            return Err(OracleError::IllegalAction {
                action: action.clone(),
            });
        }
        let mut n = s.clone();
        let a = s.active as usize;
        let o = opponent(s.active) as usize;
        match (s.pending, action) {
            (Pending::Priority, ActionLabel::Ability(0)) => n.pending = Pending::Combat,
            (Pending::Priority, ActionLabel::Ability(1)) => {
                n.charge[a] -= 1;
                n.pending = Pending::StrikeTarget;
            }
            (Pending::Priority, ActionLabel::Ability(2)) => {
                n.charge[a] -= 2;
                n.pending = Pending::DrainResist;
            }
            (Pending::Priority, ActionLabel::Ability(3)) => {
                n.charm_used = true;
                n.pending = Pending::CharmMode;
            }
            (Pending::StrikeTarget, ActionLabel::Target(p)) => {
                n.life[*p as usize] -= STRIKE_DAMAGE;
                n.pending = Pending::Priority;
            }
            (Pending::DrainResist, ActionLabel::Boolean(resist)) => {
                if *resist {
                    n.charge[o] -= 1;
                } else {
                    n.life[o] -= 1;
                    gain_life(&mut n.life[a], 1);
                }
                n.pending = Pending::Priority;
            }
            (Pending::CharmMode, ActionLabel::Mode(m)) => {
                if *m == 0 {
                    n.charge[a] = (n.charge[a] + 2).min(MAX_CHARGE);
                } else {
                    gain_life(&mut n.life[a], 1);
                }
                n.pending = Pending::Priority;
            }
            (Pending::Combat, ActionLabel::Choice(c)) => {
                if c == ATTACK {
                    n.life[o] -= ATTACK_DAMAGE;
                    n.life[a] -= 1;
                }
                if self.outcome(&n).is_none() {
                    self.end_turn(&mut n);
                }
            }
            _ => {
                return Err(OracleError::Inconsistent {
                    msg: format!("{action} accepted in {:?}", s.pending),
                })
            }
        }
        Ok(n)
    }

    fn is_terminal(&self, s: &DuelState) -> bool {
        self.outcome(s).is_some()
    }

    fn is_winner(&self, s: &DuelState, player: PlayerId) -> bool {
        matches!(self.outcome(s), Some(Some(w)) if w == player)
    }

    fn winner(&self, s: &DuelState) -> Option<PlayerId> {
        self.outcome(s).flatten()
    }

    fn to_play(&self, s: &DuelState) -> PlayerId {
        match s.pending {
            Pending::DrainResist => opponent(s.active),
            _ => s.active,
        }
    }

    fn decision(&self, s: &DuelState) -> DecisionKind {
        match s.pending {
            Pending::Priority => DecisionKind::Priority,
            Pending::StrikeTarget => DecisionKind::Target,
            Pending::DrainResist => DecisionKind::Binary,
            Pending::CharmMode => DecisionKind::Mode,
            Pending::Combat => DecisionKind::DeclareAttackers,
        }
    }

    fn fingerprint(&self, s: &DuelState) -> u64 {
        let pending = s.pending as u64;
        let life0 = (s.life[0] as i64 + 128) as u64 & 0xff;
        let life1 = (s.life[1] as i64 + 128) as u64 & 0xff;
        life0
            | life1 << 8
            | (s.charge[0] as u64) << 16
            | (s.charge[1] as u64) << 24
            | (s.active as u64) << 32
            | (s.charm_used as u64) << 33
            | pending << 34
            | (s.turn as u64) << 40
    }
}

/// Sparse encoding of a duel position from `player`'s side.
#[derive(Debug, Clone, Default)]
pub struct DuelEncoder;

impl FeatureEncoder<DuelState> for DuelEncoder {
    fn encode(&self, s: &DuelState, player: PlayerId, ctx: &SessionContext) -> Vec<i64> {
        let me = player as usize;
        let them = opponent(player) as usize;
        let names = [
            format!("life:me:{}", s.life[me].clamp(0, MAX_LIFE)),
            format!("life:opp:{}", s.life[them].clamp(0, MAX_LIFE)),
            format!("charge:me:{}", s.charge[me]),
            format!("charge:opp:{}", s.charge[them]),
            format!("pending:{:?}", s.pending),
            format!("active:{}", s.active == player),
            format!("charm_used:{}", s.charm_used),
            format!("turn_bucket:{}", s.turn / 4),
        ];
        intern_features(ctx, names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn play(duel: &Duel, s: &DuelState, actions: &[ActionLabel]) -> DuelState {
        actions
            .iter()
            .fold(s.clone(), |acc, a| duel.apply(&acc, a).unwrap())
    }

    #[test]
    fn priority_options_follow_charge() {
        let duel = Duel::default();
        let mut s = duel.initial_state();
        assert_eq!(
            duel.legal_actions(&s),
            vec![ActionLabel::PASS, STRIKE, CHARM]
        );
        s.charge[0] = 2;
        assert_eq!(
            duel.legal_actions(&s),
            vec![ActionLabel::PASS, STRIKE, DRAIN, CHARM]
        );
        assert_eq!(duel.decision(&s), DecisionKind::Priority);
    }

    #[test]
    fn strike_then_target_deals_damage() {
        let duel = Duel::default();
        let s = play(
            &duel,
            &duel.initial_state(),
            &[STRIKE, ActionLabel::Target(1)],
        );
        assert_eq!(s.life, [10, 8]);
        assert_eq!(s.charge[0], 0);
        assert_eq!(s.pending, Pending::Priority);
    }

    #[test]
    fn drain_resist_is_decided_by_the_opponent() {
        let duel = Duel::default();
        let mut s = duel.initial_state();
        s.charge = [2, 1];
        let s = duel.apply(&s, &DRAIN).unwrap();
        assert_eq!(duel.to_play(&s), 1);
        assert_eq!(duel.decision(&s), DecisionKind::Binary);
        assert_eq!(duel.legal_actions(&s).len(), 2);

        let resisted = duel.apply(&s, &ActionLabel::Boolean(true)).unwrap();
        assert_eq!(resisted.life, [10, 10]);
        assert_eq!(resisted.charge, [0, 0]);

        let drained = duel.apply(&s, &ActionLabel::Boolean(false)).unwrap();
        assert_eq!(drained.life, [11, 9]);
    }

    #[test]
    fn pass_and_attack_ends_the_turn() {
        let duel = Duel::default();
        let s = play(
            &duel,
            &duel.initial_state(),
            &[ActionLabel::PASS, ActionLabel::Choice(ATTACK.to_string())],
        );
        assert_eq!(s.life, [9, 7]);
        assert_eq!(s.active, 1);
        assert_eq!(s.turn, 1);
        assert_eq!(s.charge, [1, 2]);
        assert!(!s.charm_used);
    }

    #[test]
    fn illegal_actions_are_rejected() {
        let duel = Duel::default();
        let s = duel.initial_state();
        assert_eq!(
            duel.apply(&s, &ActionLabel::Mode(0)),
            Err(OracleError::IllegalAction {
                action: ActionLabel::Mode(0)
            })
        );
        // Not enough charge to drain.
        assert!(duel.apply(&s, &DRAIN).is_err());
    }

    #[test]
    fn turn_cap_decides_by_life() {
        let duel = Duel::new(1, 10);
        let s = play(
            &duel,
            &duel.initial_state(),
            &[ActionLabel::PASS, ActionLabel::Choice(HOLD.to_string())],
        );
        assert!(duel.is_terminal(&s));
        assert_eq!(duel.winner(&s), None);
        assert!(duel.legal_actions(&s).is_empty());

        let mut s2 = s.clone();
        s2.life = [5, 3];
        assert!(duel.is_winner(&s2, 0));
        assert!(!duel.is_winner(&s2, 1));
        assert_eq!(duel.heuristic(&s2, 0), 1.0);
    }

    #[test]
    fn lethal_attack_ends_the_game_immediately() {
        let duel = Duel::default();
        let mut s = duel.initial_state();
        s.life[1] = 3;
        let s = play(
            &duel,
            &s,
            &[ActionLabel::PASS, ActionLabel::Choice(ATTACK.to_string())],
        );
        assert!(duel.is_terminal(&s));
        assert_eq!(duel.winner(&s), Some(0));
        assert_eq!(s.turn, 0);
    }

    #[test]
    fn fingerprint_separates_positions() {
        let duel = Duel::default();
        let a = duel.initial_state();
        let b = duel.apply(&a, &STRIKE).unwrap();
        assert_eq!(duel.fingerprint(&a), duel.fingerprint(&a.clone()));
        assert_ne!(duel.fingerprint(&a), duel.fingerprint(&b));
    }

    #[test]
    fn random_start_is_reproducible() {
        let duel = Duel::default();
        assert_eq!(duel.random_start(7), duel.random_start(7));
        let s = duel.random_start(7);
        assert!(!duel.is_terminal(&s));
    }

    #[test]
    fn encoder_is_perspective_dependent() {
        let duel = Duel::default();
        let ctx = SessionContext::new();
        let mut s = duel.initial_state();
        s.life = [10, 4];
        let f0 = DuelEncoder.encode(&s, 0, &ctx);
        let f1 = DuelEncoder.encode(&s, 1, &ctx);
        assert_eq!(f0.len(), 8);
        assert_ne!(f0, f1);
        assert_eq!(f0, DuelEncoder.encode(&s, 0, &ctx));
    }

    #[test]
    fn random_games_terminate() {
        let duel = Duel::default();
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        for seed in 0..20 {
            let mut s = duel.random_start(seed);
            let mut steps = 0;
            while !duel.is_terminal(&s) {
                let legal = duel.legal_actions(&s);
                assert!(!legal.is_empty());
                let a = &legal[rng.gen_range(0..legal.len())];
                s = duel.apply(&s, a).unwrap();
                steps += 1;
                assert!(steps < 10_000);
            }
        }
    }
}
