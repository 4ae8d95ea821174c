//! Draw-offer and resignation policy.
//!
//! Pure predicates over the rolling score history; re-evaluated fresh on
//! every move, with no pending-offer state. The server de-duplicates
//! repeated draw offers.

use serde::Deserialize;

use crate::score::ScoreHistory;

/// Configuration for offering draws in equal positions.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DrawPolicy {
    pub enabled: bool,
    /// Maximum |score| in centipawns for a position to count as equal.
    pub score: i32,
    /// How many most-recent consecutive scores must be inside the band.
    pub consecutive_moves: usize,
    /// Minimum fullmove number before offering.
    pub min_game_length: u32,
    /// Whether to offer draws to human opponents.
    pub against_humans: bool,
}

impl Default for DrawPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            score: 10,
            consecutive_moves: 10,
            min_game_length: 35,
            against_humans: false,
        }
    }
}

/// Configuration for resigning lost positions.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResignPolicy {
    pub enabled: bool,
    /// Scores below this (negative) threshold count as lost.
    pub score: i32,
    pub consecutive_moves: usize,
    pub against_humans: bool,
}

impl Default for ResignPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            score: -1000,
            consecutive_moves: 5,
            against_humans: false,
        }
    }
}

/// Per-move facts the predicates are gated on.
#[derive(Debug, Clone, Copy)]
pub struct PolicyGate {
    pub opponent_is_human: bool,
    /// Opponent critically low on time without increment; conceding
    /// anything here would gift a flagging opponent an escape.
    pub opponent_low_time_no_increment: bool,
}

/// Whether to offer a draw this move.
pub fn should_offer_draw(
    cfg: &DrawPolicy,
    history: &ScoreHistory,
    fullmoves: u32,
    gate: PolicyGate,
) -> bool {
    if !cfg.enabled || fullmoves < cfg.min_game_length {
        return false;
    }
    if gate.opponent_is_human && !cfg.against_humans {
        return false;
    }
    if gate.opponent_low_time_no_increment {
        return false;
    }
    let Some(window) = history.window(cfg.consecutive_moves) else {
        return false;
    };
    window
        .iter()
        .all(|s| matches!(s, Some(score) if score.abs() <= cfg.score))
}

/// Whether to resign this move.
pub fn should_resign(cfg: &ResignPolicy, history: &ScoreHistory, gate: PolicyGate) -> bool {
    if !cfg.enabled {
        return false;
    }
    if gate.opponent_is_human && !cfg.against_humans {
        return false;
    }
    if gate.opponent_low_time_no_increment {
        return false;
    }
    let Some(window) = history.window(cfg.consecutive_moves) else {
        return false;
    };
    window
        .iter()
        .all(|s| matches!(s, Some(score) if *score < cfg.score))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::score::Eval;

    fn history_of(scores: &[Option<i32>]) -> ScoreHistory {
        let mut history = ScoreHistory::new();
        for s in scores {
            history.push(s.map(Eval::Cp));
        }
        history
    }

    fn open_gate() -> PolicyGate {
        PolicyGate {
            opponent_is_human: false,
            opponent_low_time_no_increment: false,
        }
    }

    fn draw_cfg(score: i32, consecutive: usize, min_len: u32) -> DrawPolicy {
        DrawPolicy {
            enabled: true,
            score,
            consecutive_moves: consecutive,
            min_game_length: min_len,
            against_humans: false,
        }
    }

    #[test]
    fn draw_offered_when_window_inside_band() {
        let cfg = draw_cfg(100, 3, 1);
        let history = history_of(&[Some(50), Some(60), Some(55)]);
        assert!(should_offer_draw(&cfg, &history, 10, open_gate()));
    }

    #[test]
    fn draw_not_offered_when_band_too_tight() {
        let cfg = draw_cfg(40, 3, 1);
        let history = history_of(&[Some(50), Some(60), Some(55)]);
        assert!(!should_offer_draw(&cfg, &history, 10, open_gate()));
    }

    #[test]
    fn short_history_never_qualifies() {
        let draw = draw_cfg(100, 3, 1);
        let resign = ResignPolicy {
            enabled: true,
            score: -1000,
            consecutive_moves: 3,
            against_humans: true,
        };
        let history = history_of(&[Some(0), Some(0)]);
        assert!(!should_offer_draw(&draw, &history, 50, open_gate()));
        assert!(!should_resign(&resign, &history, open_gate()));
    }

    #[test]
    fn missing_scores_block_draw() {
        let cfg = draw_cfg(100, 3, 1);
        let history = history_of(&[Some(50), None, Some(55)]);
        assert!(!should_offer_draw(&cfg, &history, 10, open_gate()));
    }

    #[test]
    fn draw_respects_min_game_length() {
        let cfg = draw_cfg(100, 3, 20);
        let history = history_of(&[Some(0), Some(0), Some(0)]);
        assert!(!should_offer_draw(&cfg, &history, 19, open_gate()));
        assert!(should_offer_draw(&cfg, &history, 20, open_gate()));
    }

    #[test]
    fn human_gate_blocks_unless_configured() {
        let mut cfg = draw_cfg(100, 3, 1);
        let history = history_of(&[Some(0), Some(0), Some(0)]);
        let gate = PolicyGate {
            opponent_is_human: true,
            opponent_low_time_no_increment: false,
        };
        assert!(!should_offer_draw(&cfg, &history, 40, gate));
        cfg.against_humans = true;
        assert!(should_offer_draw(&cfg, &history, 40, gate));
    }

    #[test]
    fn flagging_opponent_blocks_both() {
        let draw = draw_cfg(100, 3, 1);
        let resign = ResignPolicy {
            enabled: true,
            score: -500,
            consecutive_moves: 3,
            against_humans: true,
        };
        let gate = PolicyGate {
            opponent_is_human: false,
            opponent_low_time_no_increment: true,
        };
        let equal = history_of(&[Some(0), Some(0), Some(0)]);
        let lost = history_of(&[Some(-900), Some(-950), Some(-990)]);
        assert!(!should_offer_draw(&draw, &equal, 40, gate));
        assert!(!should_resign(&resign, &lost, gate));
    }

    #[test]
    fn resign_requires_all_scores_below_threshold() {
        let cfg = ResignPolicy {
            enabled: true,
            score: -800,
            consecutive_moves: 3,
            against_humans: true,
        };
        let lost = history_of(&[Some(-900), Some(-1200), Some(-2000)]);
        assert!(should_resign(&cfg, &lost, open_gate()));

        let holding = history_of(&[Some(-900), Some(-700), Some(-2000)]);
        assert!(!should_resign(&cfg, &holding, open_gate()));
    }

    #[test]
    fn mate_scores_sit_outside_draw_band() {
        let cfg = draw_cfg(100, 2, 1);
        let mut history = ScoreHistory::new();
        history.push(Some(Eval::Mate(4)));
        history.push(Some(Eval::Mate(3)));
        assert!(!should_offer_draw(&cfg, &history, 40, open_gate()));
    }
}
