//! The engine as a move source: always available, unconditional last
//! resort of the chain.

use async_trait::async_trait;
use shakmaty::uci::UciMove;
use std::time::Duration;

use super::{DecisionError, MoveProposal, MoveQuery};
use crate::board::Board;
use crate::clock::{ClockState, ThinkLimit};
use crate::score::Eval;

/// Best move plus evaluation from one search.
#[derive(Debug, Clone)]
pub struct SearchReply {
    pub uci: UciMove,
    pub eval: Option<Eval>,
}

/// The engine collaborator: search to a limit, start/stop pondering.
/// Process management lives outside this crate.
#[async_trait]
pub trait Engine: Send {
    /// Search the current position. `Ok(None)` means the engine produced
    /// no best move, which is unrecoverable for the game.
    async fn search(
        &mut self,
        board: &Board,
        clock: &ClockState,
        limit: &ThinkLimit,
    ) -> anyhow::Result<Option<SearchReply>>;

    /// Start background pondering on the current position.
    async fn start_ponder(&mut self, board: &Board) -> anyhow::Result<()>;

    /// Stop any running search or ponder.
    async fn stop(&mut self) -> anyhow::Result<()>;
}

/// Wraps the engine for the end of the chain. Not a [`super::MoveSource`]
/// because it may not decline and its errors abort the game.
pub struct EngineSource {
    engine: Box<dyn Engine>,
    move_overhead: Duration,
}

impl EngineSource {
    pub fn new(engine: Box<dyn Engine>, move_overhead: Duration) -> Self {
        Self {
            engine,
            move_overhead,
        }
    }

    /// Replace the per-move overhead once the game's clock parameters are
    /// known.
    pub fn set_move_overhead(&mut self, overhead: Duration) {
        self.move_overhead = overhead;
    }

    pub async fn search_move(
        &mut self,
        query: &mut MoveQuery<'_>,
    ) -> Result<MoveProposal, DecisionError> {
        let limit = query
            .clock
            .think_budget(query.board.moves_played(), self.move_overhead);
        let reply = self
            .engine
            .search(query.board, query.clock, &limit)
            .await
            .map_err(DecisionError::Engine)?
            .ok_or(DecisionError::EngineNoMove)?;

        // The flag is only set once the move stack is deeper than one ply,
        // so the very first engine move of a game does not start pondering.
        let engine_move = query.board.moves_played() > 1;
        let mut proposal = MoveProposal::new(reply.uci, "engine");
        proposal.eval = reply.eval;
        proposal.engine_move = engine_move;
        proposal.start_ponder = limit.ponder && engine_move;
        Ok(proposal)
    }

    pub async fn start_ponder(&mut self, board: &Board) -> anyhow::Result<()> {
        self.engine.start_ponder(board).await
    }

    pub async fn stop(&mut self) -> anyhow::Result<()> {
        self.engine.stop().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::score::ScoreHistory;
    use crate::sources::tests::test_meta;

    struct ScriptedEngine {
        reply: Option<SearchReply>,
        seen_limit: Option<ThinkLimit>,
    }

    #[async_trait]
    impl Engine for ScriptedEngine {
        async fn search(
            &mut self,
            _board: &Board,
            _clock: &ClockState,
            limit: &ThinkLimit,
        ) -> anyhow::Result<Option<SearchReply>> {
            self.seen_limit = Some(*limit);
            Ok(self.reply.clone())
        }

        async fn start_ponder(&mut self, _board: &Board) -> anyhow::Result<()> {
            Ok(())
        }

        async fn stop(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn query_parts() -> (Board, ClockState, ScoreHistory) {
        (
            Board::startpos(),
            ClockState::from_millis(60_000, 60_000, 1_000),
            ScoreHistory::new(),
        )
    }

    #[tokio::test]
    async fn no_move_is_fatal() {
        let mut source = EngineSource::new(
            Box::new(ScriptedEngine {
                reply: None,
                seen_limit: None,
            }),
            Duration::from_millis(100),
        );
        let (board, mut clock, history) = query_parts();
        let meta = test_meta();
        let mut query = MoveQuery {
            board: &board,
            clock: &mut clock,
            history: &history,
            meta: &meta,
        };
        let err = source.search_move(&mut query).await.unwrap_err();
        assert!(matches!(err, DecisionError::EngineNoMove));
    }

    #[tokio::test]
    async fn first_engine_move_does_not_ponder() {
        let reply = SearchReply {
            uci: "e2e4".parse().unwrap(),
            eval: Some(Eval::Cp(30)),
        };
        let mut source = EngineSource::new(
            Box::new(ScriptedEngine {
                reply: Some(reply),
                seen_limit: None,
            }),
            Duration::from_millis(100),
        );
        let (board, mut clock, history) = query_parts();
        let meta = test_meta();
        let mut query = MoveQuery {
            board: &board,
            clock: &mut clock,
            history: &history,
            meta: &meta,
        };
        let proposal = source.search_move(&mut query).await.unwrap();
        assert!(!proposal.engine_move);
        assert!(!proposal.start_ponder);
        assert_eq!(proposal.eval, Some(Eval::Cp(30)));
    }

    #[tokio::test]
    async fn later_engine_moves_ponder() {
        let reply = SearchReply {
            uci: "g1f3".parse().unwrap(),
            eval: Some(Eval::Cp(10)),
        };
        let mut source = EngineSource::new(
            Box::new(ScriptedEngine {
                reply: Some(reply),
                seen_limit: None,
            }),
            Duration::from_millis(100),
        );
        let mut board = Board::startpos();
        board.play_uci("e2e4").unwrap();
        board.play_uci("e7e5").unwrap();
        let mut clock = ClockState::from_millis(60_000, 60_000, 1_000);
        let history = ScoreHistory::new();
        let meta = test_meta();
        let mut query = MoveQuery {
            board: &board,
            clock: &mut clock,
            history: &history,
            meta: &meta,
        };
        let proposal = source.search_move(&mut query).await.unwrap();
        assert!(proposal.engine_move);
        assert!(proposal.start_ponder);
    }
}
