//! Online knowledge sources: opening explorer, cloud evaluations,
//! external move databases, and the online endgame tablebase.
//!
//! Every network lookup runs under a hard timeout and charges its real
//! elapsed wall time against the own clock, so a slow backend costs
//! exactly what it burned. Timeouts and transport errors are transient
//! and never count toward the miss limit; only a clean "position not
//! known" answer does.

use async_trait::async_trait;
use serde::Deserialize;
use shakmaty::uci::UciMove;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

use super::tablebase::Wdl;
use super::{DecisionError, MoveProposal, MoveQuery, MoveSource, MAX_CONSECUTIVE_MISSES};
use crate::board::Board;
use crate::score::Eval;
use crate::GameMeta;

/// A successful answer from a knowledge backend.
#[derive(Debug, Clone)]
pub struct Lookup {
    pub uci: UciMove,
    /// Evaluation attached to the move, when the backend reports one
    /// (cloud eval does, the explorer does not).
    pub eval: Option<Eval>,
}

/// Collaborator performing the actual network query. `Ok(None)` means the
/// backend answered cleanly but does not know the position.
#[async_trait]
pub trait KnowledgeBackend: Send + Sync {
    async fn query(&self, board: &Board, meta: &GameMeta) -> anyhow::Result<Option<Lookup>>;
}

/// Shared knobs for every ranked online source.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OnlineConfig {
    pub enabled: bool,
    /// Ordering weight within the ranked group; higher runs first.
    pub priority: i32,
    /// Hard per-lookup deadline.
    pub timeout_ms: u64,
    /// Skip lookups when our clock is below this; the timeout alone could
    /// flag us in time trouble.
    pub min_own_time_ms: u64,
    /// Stop consulting this source past this many game plies.
    pub max_depth_plies: usize,
}

impl Default for OnlineConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            priority: 0,
            timeout_ms: 2_000,
            min_own_time_ms: 10_000,
            max_depth_plies: 60,
        }
    }
}

/// One ranked online source wrapping a backend.
pub struct OnlineSource {
    name: &'static str,
    backend: Box<dyn KnowledgeBackend>,
    config: OnlineConfig,
    misses: u32,
}

impl OnlineSource {
    pub fn new(name: &'static str, backend: Box<dyn KnowledgeBackend>, config: OnlineConfig) -> Self {
        Self {
            name,
            backend,
            config,
            misses: 0,
        }
    }
}

#[async_trait]
impl MoveSource for OnlineSource {
    fn name(&self) -> &'static str {
        self.name
    }

    fn priority(&self) -> i32 {
        self.config.priority
    }

    async fn propose(
        &mut self,
        query: &mut MoveQuery<'_>,
    ) -> Result<Option<MoveProposal>, DecisionError> {
        if self.misses >= MAX_CONSECUTIVE_MISSES {
            return Ok(None);
        }
        if query.board.moves_played() >= self.config.max_depth_plies {
            return Ok(None);
        }
        if query.clock.own < Duration::from_millis(self.config.min_own_time_ms) {
            return Ok(None);
        }

        let deadline = Duration::from_millis(self.config.timeout_ms);
        let started = Instant::now();
        let result = timeout(deadline, self.backend.query(query.board, query.meta)).await;
        query.clock.charge(started.elapsed());

        match result {
            Err(_) => {
                warn!(source = self.name, "online lookup timed out");
                Ok(None)
            }
            Ok(Err(e)) => {
                warn!(source = self.name, error = %e, "online lookup failed");
                Ok(None)
            }
            Ok(Ok(None)) => {
                self.misses += 1;
                Ok(None)
            }
            Ok(Ok(Some(lookup))) => {
                debug!(source = self.name, uci = %lookup.uci, "online source answered");
                self.misses = 0;
                let mut proposal = MoveProposal::new(lookup.uci, self.name);
                proposal.eval = lookup.eval;
                Ok(Some(proposal))
            }
        }
    }
}

/// Raw online tablebase answer for the best move of a position.
#[derive(Debug, Clone)]
pub struct EgtbReply {
    pub uci: UciMove,
    /// Already fifty-move-aware; the service reports cursed/blessed
    /// outcomes itself.
    pub wdl: Wdl,
    pub dtz: u32,
}

/// Collaborator querying the online endgame tablebase service.
#[async_trait]
pub trait EgtbBackend: Send + Sync {
    async fn probe(&self, board: &Board, meta: &GameMeta) -> anyhow::Result<Option<EgtbReply>>;
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EgtbConfig {
    pub enabled: bool,
    pub max_pieces: usize,
    pub timeout_ms: u64,
    pub min_own_time_ms: u64,
}

impl Default for EgtbConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_pieces: 7,
            timeout_ms: 2_000,
            min_own_time_ms: 10_000,
        }
    }
}

/// Online endgame tablebase as an exact source. No miss counter: once
/// under the piece ceiling the position stays under it, so every probe
/// remains worth its cost.
pub struct OnlineEgtbSource {
    backend: Box<dyn EgtbBackend>,
    config: EgtbConfig,
}

impl OnlineEgtbSource {
    pub fn new(backend: Box<dyn EgtbBackend>, config: EgtbConfig) -> Self {
        Self { backend, config }
    }
}

#[async_trait]
impl MoveSource for OnlineEgtbSource {
    fn name(&self) -> &'static str {
        "online-egtb"
    }

    async fn propose(
        &mut self,
        query: &mut MoveQuery<'_>,
    ) -> Result<Option<MoveProposal>, DecisionError> {
        if query.board.piece_count() > self.config.max_pieces {
            return Ok(None);
        }
        // A forced mate on the board means the engine already has the
        // shortest win; the probe would be a wasted network round trip.
        if query.history.saw_forced_mate() {
            return Ok(None);
        }
        if query.clock.own < Duration::from_millis(self.config.min_own_time_ms) {
            return Ok(None);
        }

        let deadline = Duration::from_millis(self.config.timeout_ms);
        let started = Instant::now();
        let result = timeout(deadline, self.backend.probe(query.board, query.meta)).await;
        query.clock.charge(started.elapsed());

        let reply = match result {
            Err(_) => {
                warn!("online tablebase probe timed out");
                return Ok(None);
            }
            Ok(Err(e)) => {
                warn!(error = %e, "online tablebase probe failed");
                return Ok(None);
            }
            Ok(Ok(None)) => return Ok(None),
            Ok(Ok(Some(reply))) => reply,
        };

        debug!(uci = %reply.uci, wdl = ?reply.wdl, dtz = reply.dtz, "online tablebase answered");
        let mut proposal = MoveProposal::new(reply.uci, "online-egtb");
        proposal.resign = reply.wdl == Wdl::Loss;
        proposal.offer_draw = matches!(reply.wdl, Wdl::Draw | Wdl::BlessedLoss);
        Ok(Some(proposal))
    }
}
