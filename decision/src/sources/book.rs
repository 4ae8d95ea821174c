//! Opening book move source.
//!
//! Consults one or more weighted move lists. Moves that would immediately
//! recreate a previous position are skipped, a maximum ply depth is
//! respected, and five consecutive empty lookups retire the book for the
//! rest of the game.

use async_trait::async_trait;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::Deserialize;
use shakmaty::uci::UciMove;
use std::collections::HashMap;
use tracing::{debug, warn};

use super::{DecisionError, MoveProposal, MoveQuery, MoveSource, MAX_CONSECUTIVE_MISSES};
use crate::board::Board;
use crate::GameMeta;

/// How a move is picked from a weighted book line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookSelection {
    /// Sample proportionally to the book weights.
    WeightedRandom,
    /// Ignore weights, sample uniformly.
    UniformRandom,
    /// Always take the highest-weighted move.
    BestMove,
}

/// One candidate move from a book.
#[derive(Debug, Clone)]
pub struct BookEntry {
    pub uci: UciMove,
    pub weight: u16,
}

/// Collaborator that resolves a position to its book line. Multiple
/// readers are consulted in configuration order.
pub trait BookReader: Send + Sync {
    fn lookup(&self, board: &Board, meta: &GameMeta) -> anyhow::Result<Vec<BookEntry>>;
}

/// In-memory book keyed by FEN, used for small hand-curated books and in
/// tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryBook {
    lines: HashMap<String, Vec<BookEntry>>,
}

impl MemoryBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, fen: &str, entries: Vec<BookEntry>) {
        self.lines.insert(fen.to_string(), entries);
    }
}

impl BookReader for MemoryBook {
    fn lookup(&self, board: &Board, _meta: &GameMeta) -> anyhow::Result<Vec<BookEntry>> {
        Ok(self.lines.get(&board.fen()).cloned().unwrap_or_default())
    }
}

/// The book as a chain member.
pub struct BookSource {
    readers: Vec<Box<dyn BookReader>>,
    selection: BookSelection,
    max_depth_plies: usize,
    priority: i32,
    misses: u32,
    rng: ChaCha20Rng,
}

impl BookSource {
    pub fn new(
        readers: Vec<Box<dyn BookReader>>,
        selection: BookSelection,
        max_depth_plies: usize,
        priority: i32,
    ) -> Self {
        Self {
            readers,
            selection,
            max_depth_plies,
            priority,
            misses: 0,
            rng: ChaCha20Rng::from_entropy(),
        }
    }

    #[cfg(test)]
    pub fn with_seed(
        readers: Vec<Box<dyn BookReader>>,
        selection: BookSelection,
        max_depth_plies: usize,
        priority: i32,
        seed: u64,
    ) -> Self {
        Self {
            readers,
            selection,
            max_depth_plies,
            priority,
            misses: 0,
            rng: ChaCha20Rng::seed_from_u64(seed),
        }
    }

    fn select(&mut self, entries: &[BookEntry]) -> Option<UciMove> {
        match self.selection {
            BookSelection::BestMove => entries
                .iter()
                .max_by_key(|e| e.weight)
                .map(|e| e.uci.clone()),
            BookSelection::UniformRandom => {
                entries.choose(&mut self.rng).map(|e| e.uci.clone())
            }
            BookSelection::WeightedRandom => {
                let total: u32 = entries.iter().map(|e| e.weight as u32).sum();
                if total == 0 {
                    return entries.choose(&mut self.rng).map(|e| e.uci.clone());
                }
                let mut roll = self.rng.gen_range(0..total);
                for entry in entries {
                    let w = entry.weight as u32;
                    if roll < w {
                        return Some(entry.uci.clone());
                    }
                    roll -= w;
                }
                None
            }
        }
    }
}

#[async_trait]
impl MoveSource for BookSource {
    fn name(&self) -> &'static str {
        "book"
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    async fn propose(
        &mut self,
        query: &mut MoveQuery<'_>,
    ) -> Result<Option<MoveProposal>, DecisionError> {
        if self.misses >= MAX_CONSECUTIVE_MISSES {
            return Ok(None);
        }
        // Depth ceiling is a capability gate, not a miss.
        if query.board.moves_played() >= self.max_depth_plies {
            return Ok(None);
        }

        // Indexed so the reader borrow ends before the RNG is used.
        for i in 0..self.readers.len() {
            let entries = match self.readers[i].lookup(query.board, query.meta) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(error = %e, "book lookup failed, skipping reader");
                    continue;
                }
            };
            let playable: Vec<BookEntry> = entries
                .into_iter()
                .filter(|e| match query.board.to_move(&e.uci) {
                    Ok(m) => !query.board.would_repeat(&m),
                    Err(_) => false,
                })
                .collect();
            if playable.is_empty() {
                continue;
            }
            if let Some(uci) = self.select(&playable) {
                debug!(uci = %uci, "book answered");
                self.misses = 0;
                return Ok(Some(MoveProposal::new(uci, "book")));
            }
        }

        self.misses += 1;
        Ok(None)
    }
}
