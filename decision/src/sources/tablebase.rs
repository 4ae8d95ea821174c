//! Exact tablebase move source.
//!
//! Classifies every legal move by win/draw/loss with fifty-move-rule
//! awareness: a win whose distance-to-zero no longer fits under the
//! hundred-halfmove budget is only a cursed win (the opponent can claim a
//! draw before conversion), and symmetrically for losses.

use async_trait::async_trait;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use shakmaty::uci::UciMove;
use tracing::{debug, warn};

use super::{DecisionError, MoveProposal, MoveQuery, MoveSource};
use crate::board::Board;

/// Five-way outcome classification, ordered from worst to best for us.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Wdl {
    Loss,
    /// Lost, but the fifty-move rule rescues us before conversion.
    BlessedLoss,
    Draw,
    /// Won, but the fifty-move rule erases it before conversion.
    CursedWin,
    Win,
}

/// Raw probe result for one move: outcome plus distance-to-zero.
#[derive(Debug, Clone, Copy)]
pub struct TableEntry {
    pub wdl: Wdl,
    /// Halfmoves until a pawn move or capture resets the fifty-move
    /// counter on the winning path.
    pub dtz: u32,
}

/// Collaborator producing WDL/DTZ for every legal move of a position,
/// from our perspective. `Ok(None)` when the position is not covered.
#[async_trait]
pub trait TablebaseProber: Send + Sync {
    async fn probe(&self, board: &Board) -> anyhow::Result<Option<Vec<(UciMove, TableEntry)>>>;
}

/// Downgrade a raw win/loss when the needed distance-to-zero plus the
/// current halfmove clock exceeds the hundred-halfmove budget.
pub fn classify(entry: TableEntry, halfmove_clock: u32) -> Wdl {
    match entry.wdl {
        Wdl::Win if entry.dtz + halfmove_clock > 100 => Wdl::CursedWin,
        Wdl::Loss if entry.dtz + halfmove_clock > 100 => Wdl::BlessedLoss,
        wdl => wdl,
    }
}

/// Local tablebase probe, enabled under a piece-count ceiling. Exact, so
/// it runs before the ranked knowledge sources and has no miss counter.
pub struct TablebaseSource {
    prober: Box<dyn TablebaseProber>,
    max_pieces: usize,
    rng: ChaCha20Rng,
}

impl TablebaseSource {
    pub fn new(prober: Box<dyn TablebaseProber>, max_pieces: usize) -> Self {
        Self {
            prober,
            max_pieces,
            rng: ChaCha20Rng::from_entropy(),
        }
    }

    #[cfg(test)]
    pub fn with_seed(prober: Box<dyn TablebaseProber>, max_pieces: usize, seed: u64) -> Self {
        Self {
            prober,
            max_pieces,
            rng: ChaCha20Rng::seed_from_u64(seed),
        }
    }
}

/// Pick the best move: highest classification, then shortest
/// distance-to-conversion, uniformly at random among exact ties.
fn select_best(
    candidates: &[(UciMove, Wdl, u32)],
    rng: &mut ChaCha20Rng,
) -> Option<(UciMove, Wdl)> {
    let (_, best_wdl, best_dtz) = candidates
        .iter()
        .max_by(|a, b| a.1.cmp(&b.1).then(b.2.cmp(&a.2)))?;
    let (best_wdl, best_dtz) = (*best_wdl, *best_dtz);
    let ties: Vec<&(UciMove, Wdl, u32)> = candidates
        .iter()
        .filter(|(_, wdl, dtz)| *wdl == best_wdl && *dtz == best_dtz)
        .collect();
    ties.choose(rng)
        .map(|(uci, wdl, _)| (uci.clone(), *wdl))
}

#[async_trait]
impl MoveSource for TablebaseSource {
    fn name(&self) -> &'static str {
        "tablebase"
    }

    async fn propose(
        &mut self,
        query: &mut MoveQuery<'_>,
    ) -> Result<Option<MoveProposal>, DecisionError> {
        if query.board.piece_count() > self.max_pieces {
            return Ok(None);
        }
        let entries = match self.prober.probe(query.board).await {
            Ok(Some(entries)) if !entries.is_empty() => entries,
            Ok(_) => return Ok(None),
            Err(e) => {
                warn!(error = %e, "tablebase probe failed, skipping");
                return Ok(None);
            }
        };

        let halfmove_clock = query.board.halfmove_clock();
        let candidates: Vec<(UciMove, Wdl, u32)> = entries
            .into_iter()
            .map(|(uci, entry)| (uci, classify(entry, halfmove_clock), entry.dtz))
            .collect();

        let Some((uci, wdl)) = select_best(&candidates, &mut self.rng) else {
            return Ok(None);
        };
        debug!(uci = %uci, ?wdl, "tablebase classified position");

        let mut proposal = MoveProposal::new(uci, "tablebase");
        proposal.resign = wdl == Wdl::Loss;
        proposal.offer_draw = matches!(wdl, Wdl::Draw | Wdl::BlessedLoss);
        Ok(Some(proposal))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ClockState;
    use crate::score::ScoreHistory;
    use crate::sources::tests::test_meta;
    use std::collections::HashSet;

    #[test]
    fn win_within_budget_stays_win() {
        let entry = TableEntry {
            wdl: Wdl::Win,
            dtz: 30,
        };
        assert_eq!(classify(entry, 70), Wdl::Win);
    }

    #[test]
    fn win_over_budget_is_cursed() {
        let entry = TableEntry {
            wdl: Wdl::Win,
            dtz: 31,
        };
        assert_eq!(classify(entry, 70), Wdl::CursedWin);
    }

    #[test]
    fn loss_over_budget_is_blessed() {
        let entry = TableEntry {
            wdl: Wdl::Loss,
            dtz: 80,
        };
        assert_eq!(classify(entry, 40), Wdl::BlessedLoss);
    }

    #[test]
    fn draws_are_never_reclassified() {
        let entry = TableEntry {
            wdl: Wdl::Draw,
            dtz: 200,
        };
        assert_eq!(classify(entry, 90), Wdl::Draw);
    }

    #[test]
    fn classification_never_strict_win_when_budget_exceeded() {
        // Property from the fifty-move interaction: dtz + clock > 100
        // must never yield a strict Win or Loss.
        for dtz in 0..150 {
            for clock in 0..110 {
                for wdl in [Wdl::Win, Wdl::Loss] {
                    let out = classify(TableEntry { wdl, dtz }, clock);
                    if dtz + clock > 100 {
                        assert_ne!(out, Wdl::Win);
                        assert_ne!(out, Wdl::Loss);
                    }
                }
            }
        }
    }

    #[test]
    fn ties_broken_by_shortest_dtz() {
        let candidates = vec![
            ("a1a2".parse().unwrap(), Wdl::Win, 12),
            ("a1b1".parse().unwrap(), Wdl::Win, 4),
            ("a1b2".parse().unwrap(), Wdl::Draw, 0),
        ];
        let mut rng = ChaCha20Rng::seed_from_u64(7);
        let (uci, wdl) = select_best(&candidates, &mut rng).unwrap();
        assert_eq!(uci.to_string(), "a1b1");
        assert_eq!(wdl, Wdl::Win);
    }

    #[test]
    fn exact_ties_are_sampled_uniformly() {
        let candidates: Vec<(UciMove, Wdl, u32)> = vec![
            ("a1a2".parse().unwrap(), Wdl::Win, 6),
            ("a1b1".parse().unwrap(), Wdl::Win, 6),
        ];
        let mut rng = ChaCha20Rng::seed_from_u64(42);
        let mut seen = HashSet::new();
        for _ in 0..64 {
            let (uci, _) = select_best(&candidates, &mut rng).unwrap();
            seen.insert(uci.to_string());
        }
        assert_eq!(seen.len(), 2, "both tied moves should appear");
    }

    struct FixedProber {
        entries: Vec<(&'static str, TableEntry)>,
    }

    #[async_trait]
    impl TablebaseProber for FixedProber {
        async fn probe(
            &self,
            _board: &Board,
        ) -> anyhow::Result<Option<Vec<(UciMove, TableEntry)>>> {
            Ok(Some(
                self.entries
                    .iter()
                    .map(|(uci, entry)| (uci.parse().unwrap(), *entry))
                    .collect(),
            ))
        }
    }

    #[tokio::test]
    async fn piece_count_ceiling_gates_probe() {
        let prober = FixedProber {
            entries: vec![(
                "e2e4",
                TableEntry {
                    wdl: Wdl::Win,
                    dtz: 1,
                },
            )],
        };
        let mut source = TablebaseSource::with_seed(Box::new(prober), 7, 1);
        let board = Board::startpos(); // 32 pieces
        let mut clock = ClockState::from_millis(60_000, 60_000, 0);
        let history = ScoreHistory::new();
        let meta = test_meta();
        let mut query = MoveQuery {
            board: &board,
            clock: &mut clock,
            history: &history,
            meta: &meta,
        };
        assert!(source.propose(&mut query).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lost_position_sets_resign_intent() {
        // King vs king + queen endgame, all moves losing.
        let board = Board::from_fen("8/8/8/8/8/2k5/q7/2K5 w - - 0 1").unwrap();
        let prober = FixedProber {
            entries: vec![
                (
                    "c1d1",
                    TableEntry {
                        wdl: Wdl::Loss,
                        dtz: 8,
                    },
                ),
                (
                    "c1b1",
                    TableEntry {
                        wdl: Wdl::Loss,
                        dtz: 12,
                    },
                ),
            ],
        };
        let mut source = TablebaseSource::with_seed(Box::new(prober), 7, 1);
        let mut clock = ClockState::from_millis(60_000, 60_000, 0);
        let history = ScoreHistory::new();
        let meta = test_meta();
        let mut query = MoveQuery {
            board: &board,
            clock: &mut clock,
            history: &history,
            meta: &meta,
        };
        let proposal = source.propose(&mut query).await.unwrap().unwrap();
        assert!(proposal.resign);
        assert!(!proposal.offer_draw);
        assert!(!proposal.start_ponder);
    }
}
