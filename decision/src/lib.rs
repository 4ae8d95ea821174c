//! Move-decision pipeline for the Squire lichess bot.
//!
//! This crate owns everything needed to turn a position into a move:
//! the board wrapper, clock/budget tracking, the ordered move-source
//! chain (tablebases, opening books, online lookups, engine), and the
//! draw/resign policy. It performs no network or process I/O of its
//! own; external knowledge arrives through the collaborator traits in
//! [`sources`].

pub mod board;
pub mod clock;
pub mod policy;
pub mod score;
pub mod sources;

pub use board::{Board, BoardError};
pub use clock::{ClockState, ThinkLimit};
pub use score::{Eval, ScoreHistory, MATE_SENTINEL};

use shakmaty::Color;

/// Immutable per-game metadata the decision pipeline cares about.
///
/// Captured once from the initial game snapshot; never mutated.
#[derive(Debug, Clone)]
pub struct GameMeta {
    /// Variant key as reported by the server (e.g. "standard").
    pub variant: String,
    /// Speed bucket as reported by the server (e.g. "blitz").
    pub speed: String,
    /// The color this bot plays.
    pub our_color: Color,
    /// Whether the game counts for rating.
    pub rated: bool,
    /// Whether the opponent holds a BOT title.
    pub opponent_is_bot: bool,
}

impl GameMeta {
    pub fn opponent_is_human(&self) -> bool {
        !self.opponent_is_bot
    }
}
