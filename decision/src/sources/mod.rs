//! The move-source chain: an ordered list of strategies that may supply
//! a move for the current position.
//!
//! Exact sources (tablebases) are tried first, then the priority-ordered
//! knowledge sources (book, explorer, cloud eval, external DB), and the
//! engine answers unconditionally as the last resort. Each source either
//! returns a proposal or declines; only the engine may fail the chain.

mod book;
mod engine;
mod online;
mod tablebase;

pub use book::{BookEntry, BookReader, BookSelection, BookSource, MemoryBook};
pub use engine::{Engine, EngineSource, SearchReply};
pub use online::{
    EgtbBackend, EgtbConfig, EgtbReply, KnowledgeBackend, Lookup, OnlineConfig, OnlineEgtbSource,
    OnlineSource,
};
pub use tablebase::{classify, TableEntry, TablebaseProber, TablebaseSource, Wdl};

use async_trait::async_trait;
use shakmaty::uci::UciMove;
use thiserror::Error;
use tracing::{debug, warn};

use crate::board::Board;
use crate::clock::ClockState;
use crate::score::{Eval, ScoreHistory};
use crate::GameMeta;

/// Book and online sources stop being consulted for the rest of the game
/// after this many consecutive misses. Tablebase and engine sources are
/// never suppressed.
pub(crate) const MAX_CONSECUTIVE_MISSES: u32 = 5;

/// Errors that abort the decision for one move. Declining sources are not
/// errors; only the engine failing is unrecoverable for a game.
#[derive(Debug, Error)]
pub enum DecisionError {
    /// The engine produced no best move. Indicates an engine-process
    /// problem and must be surfaced loudly.
    #[error("engine returned no move")]
    EngineNoMove,

    #[error("engine failure: {0}")]
    Engine(#[source] anyhow::Error),
}

/// Everything a source may consult (and, for the clock, charge) while
/// producing a move.
pub struct MoveQuery<'a> {
    pub board: &'a Board,
    pub clock: &'a mut ClockState,
    pub history: &'a ScoreHistory,
    pub meta: &'a GameMeta,
}

/// A move plus the rationale the controller needs to act on it.
#[derive(Debug, Clone)]
pub struct MoveProposal {
    pub uci: UciMove,
    /// Evaluation to append to the score history, when the source has one.
    pub eval: Option<Eval>,
    /// The position is lost; resign instead of playing on.
    pub resign: bool,
    /// Offer a draw alongside the move.
    pub offer_draw: bool,
    /// Start pondering after this move is pushed.
    pub start_ponder: bool,
    /// Set by the engine source once the move stack is deep enough.
    pub engine_move: bool,
    pub source: &'static str,
}

impl MoveProposal {
    pub fn new(uci: UciMove, source: &'static str) -> Self {
        Self {
            uci,
            eval: None,
            resign: false,
            offer_draw: false,
            start_ponder: false,
            engine_move: false,
            source,
        }
    }
}

/// One strategy capable of proposing a move. Sources decline by returning
/// `Ok(None)`; internal backend failures are handled inside the source
/// (treated as "no answer"), so `Err` is reserved for the engine.
#[async_trait]
pub trait MoveSource: Send {
    fn name(&self) -> &'static str;

    /// Ordering weight within the non-exact group; higher runs first.
    fn priority(&self) -> i32 {
        0
    }

    async fn propose(
        &mut self,
        query: &mut MoveQuery<'_>,
    ) -> Result<Option<MoveProposal>, DecisionError>;
}

/// The assembled chain for one game: exact sources, ranked knowledge
/// sources, and the engine as unconditional fallback.
pub struct MoveSourceChain {
    exact: Vec<Box<dyn MoveSource>>,
    ranked: Vec<Box<dyn MoveSource>>,
    engine: EngineSource,
}

impl MoveSourceChain {
    pub fn new(engine: EngineSource) -> Self {
        Self {
            exact: Vec::new(),
            ranked: Vec::new(),
            engine,
        }
    }

    /// Add an exact source (tablebases); tried before the ranked group in
    /// insertion order.
    pub fn push_exact(&mut self, source: Box<dyn MoveSource>) {
        self.exact.push(source);
    }

    /// Add a ranked knowledge source; the group is kept sorted by
    /// descending priority.
    pub fn push_ranked(&mut self, source: Box<dyn MoveSource>) {
        self.ranked.push(source);
        self.ranked.sort_by_key(|s| std::cmp::Reverse(s.priority()));
    }

    /// Produce the move for the current position: first non-declining
    /// source wins, engine search if all decline.
    pub async fn choose(
        &mut self,
        query: &mut MoveQuery<'_>,
    ) -> Result<MoveProposal, DecisionError> {
        for source in self.exact.iter_mut().chain(self.ranked.iter_mut()) {
            match source.propose(query).await? {
                Some(proposal) => {
                    // A proposal for a move that is not legal here means a
                    // stale or corrupt backend; fall through rather than
                    // send a move the server will reject.
                    if query.board.to_move(&proposal.uci).is_err() {
                        warn!(
                            source = proposal.source,
                            uci = %proposal.uci,
                            "source proposed illegal move, skipping"
                        );
                        continue;
                    }
                    debug!(source = proposal.source, uci = %proposal.uci, "move source answered");
                    return Ok(proposal);
                }
                None => continue,
            }
        }
        self.engine.search_move(query).await
    }

    /// Replace the engine's per-move overhead once the game's clock
    /// parameters are known.
    pub fn set_move_overhead(&mut self, overhead: std::time::Duration) {
        self.engine.set_move_overhead(overhead);
    }

    /// Start background pondering on the current position.
    pub async fn start_ponder(&mut self, board: &Board) -> anyhow::Result<()> {
        self.engine.start_ponder(board).await
    }

    /// Stop any background engine activity.
    pub async fn stop_engine(&mut self) -> anyhow::Result<()> {
        self.engine.stop().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ClockState;
    use shakmaty::Color;
    use std::time::Duration;

    pub(crate) fn test_meta() -> GameMeta {
        GameMeta {
            variant: "standard".into(),
            speed: "blitz".into(),
            our_color: Color::White,
            rated: true,
            opponent_is_bot: true,
        }
    }

    struct FixedSource {
        name: &'static str,
        priority: i32,
        answer: Option<&'static str>,
    }

    impl FixedSource {
        fn answering(name: &'static str, priority: i32, uci: &'static str) -> Self {
            Self {
                name,
                priority,
                answer: Some(uci),
            }
        }

        fn declining(name: &'static str, priority: i32) -> Self {
            Self {
                name,
                priority,
                answer: None,
            }
        }
    }

    #[async_trait]
    impl MoveSource for FixedSource {
        fn name(&self) -> &'static str {
            self.name
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        async fn propose(
            &mut self,
            _query: &mut MoveQuery<'_>,
        ) -> Result<Option<MoveProposal>, DecisionError> {
            Ok(self
                .answer
                .map(|uci| MoveProposal::new(uci.parse().unwrap(), self.name)))
        }
    }

    struct FixedEngine {
        uci: &'static str,
    }

    #[async_trait]
    impl Engine for FixedEngine {
        async fn search(
            &mut self,
            _board: &Board,
            _clock: &ClockState,
            _limit: &crate::clock::ThinkLimit,
        ) -> anyhow::Result<Option<SearchReply>> {
            Ok(Some(SearchReply {
                uci: self.uci.parse().unwrap(),
                eval: Some(Eval::Cp(15)),
            }))
        }

        async fn start_ponder(&mut self, _board: &Board) -> anyhow::Result<()> {
            Ok(())
        }

        async fn stop(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn test_chain(engine_uci: &'static str) -> MoveSourceChain {
        MoveSourceChain::new(EngineSource::new(
            Box::new(FixedEngine { uci: engine_uci }),
            Duration::from_millis(100),
        ))
    }

    #[tokio::test]
    async fn first_answering_source_wins() {
        let mut chain = test_chain("a2a3");
        chain.push_ranked(Box::new(FixedSource::declining("book", 50)));
        chain.push_ranked(Box::new(FixedSource::answering("explorer", 40, "e2e4")));
        chain.push_ranked(Box::new(FixedSource::answering("cloud", 30, "d2d4")));

        let board = Board::startpos();
        let mut clock = ClockState::from_millis(60_000, 60_000, 0);
        let history = ScoreHistory::new();
        let meta = test_meta();
        let mut query = MoveQuery {
            board: &board,
            clock: &mut clock,
            history: &history,
            meta: &meta,
        };

        let proposal = chain.choose(&mut query).await.unwrap();
        assert_eq!(proposal.source, "explorer");
        assert_eq!(proposal.uci.to_string(), "e2e4");
    }

    #[tokio::test]
    async fn ranked_sources_are_tried_in_priority_order() {
        let mut chain = test_chain("a2a3");
        chain.push_ranked(Box::new(FixedSource::answering("low", 1, "d2d4")));
        chain.push_ranked(Box::new(FixedSource::answering("high", 99, "e2e4")));

        let board = Board::startpos();
        let mut clock = ClockState::from_millis(60_000, 60_000, 0);
        let history = ScoreHistory::new();
        let meta = test_meta();
        let mut query = MoveQuery {
            board: &board,
            clock: &mut clock,
            history: &history,
            meta: &meta,
        };

        let proposal = chain.choose(&mut query).await.unwrap();
        assert_eq!(proposal.source, "high");
    }

    #[tokio::test]
    async fn engine_answers_when_all_sources_decline() {
        let mut chain = test_chain("g1f3");
        chain.push_ranked(Box::new(FixedSource::declining("book", 50)));

        let board = Board::startpos();
        let mut clock = ClockState::from_millis(60_000, 60_000, 0);
        let history = ScoreHistory::new();
        let meta = test_meta();
        let mut query = MoveQuery {
            board: &board,
            clock: &mut clock,
            history: &history,
            meta: &meta,
        };

        let proposal = chain.choose(&mut query).await.unwrap();
        assert_eq!(proposal.source, "engine");
        assert_eq!(proposal.uci.to_string(), "g1f3");
    }

    #[tokio::test]
    async fn illegal_proposal_falls_through() {
        let mut chain = test_chain("g1f3");
        // e2e5 is not legal from the starting position.
        chain.push_ranked(Box::new(FixedSource::answering("stale", 50, "e2e5")));

        let board = Board::startpos();
        let mut clock = ClockState::from_millis(60_000, 60_000, 0);
        let history = ScoreHistory::new();
        let meta = test_meta();
        let mut query = MoveQuery {
            board: &board,
            clock: &mut clock,
            history: &history,
            meta: &meta,
        };

        let proposal = chain.choose(&mut query).await.unwrap();
        assert_eq!(proposal.source, "engine");
    }
}
