//! Per-game controller.
//!
//! Owns the authoritative board, clock and score history for one game and
//! reacts to the server's game stream. Move decisions run in a separate
//! task so the event loop keeps absorbing clock updates, chat and
//! opponent-gone notices while the chain thinks; the chain travels into
//! the decision task and comes back with the proposal.

use anyhow::{anyhow, Result};
use shakmaty::Color;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use decision_core::board::Board;
use decision_core::clock::ClockState;
use decision_core::policy::{
    should_offer_draw, should_resign, DrawPolicy, PolicyGate, ResignPolicy,
};
use decision_core::score::ScoreHistory;
use decision_core::sources::{DecisionError, MoveProposal, MoveQuery, MoveSourceChain};
use decision_core::GameMeta;

use crate::api::{GameEvent, GameFull, GameState, GameStatus, LichessApi};
use crate::central_config::CentralConfig;
use crate::metrics;

/// Per-game knobs lifted out of the central configuration.
#[derive(Debug, Clone)]
pub struct GameSettings {
    pub abort_after_bot: Duration,
    pub abort_after_human: Duration,
    pub low_time_threshold: Duration,
    /// Overhead for a one-minute game; scaled per game by the initial
    /// clock.
    pub move_overhead: Duration,
    pub ponder: bool,
    pub draw: DrawPolicy,
    pub resign: ResignPolicy,
}

impl GameSettings {
    pub fn from_config(cfg: &CentralConfig) -> Self {
        Self {
            abort_after_bot: Duration::from_secs(cfg.game.abort_after_bot_secs),
            abort_after_human: Duration::from_secs(cfg.game.abort_after_human_secs),
            low_time_threshold: Duration::from_millis(cfg.game.low_time_threshold_ms),
            move_overhead: Duration::from_millis(cfg.engine.move_overhead_ms),
            ponder: cfg.engine.ponder,
            draw: cfg.draw.clone(),
            resign: cfg.resign.clone(),
        }
    }
}

/// Lag never costs less than this, however short the game.
const MIN_MOVE_OVERHEAD: Duration = Duration::from_millis(100);

/// Per-game move overhead: the configured value covers a one-minute
/// initial clock and grows in proportion to it, since lag accrues over
/// the many more moves a longer game allows.
fn scaled_overhead(configured: Duration, initial_ms: u64) -> Duration {
    let scaled = configured.as_millis() as u64 * initial_ms / 60_000;
    Duration::from_millis(scaled).max(MIN_MOVE_OVERHEAD)
}

/// Terminal summary of one game, handed back to the manager.
#[derive(Debug, Clone)]
pub struct GameOutcome {
    pub game_id: String,
    /// Opponent user id, lowercased by the server.
    pub opponent: String,
    /// Speed bucket the game was played at ("bullet", "blitz", ...).
    pub perf: String,
    pub our_color: Color,
    pub status: GameStatus,
    pub winner: Option<Color>,
    pub duration: Duration,
}

impl GameOutcome {
    pub fn we_won(&self) -> bool {
        self.winner == Some(self.our_color)
    }

    pub fn we_lost(&self) -> bool {
        matches!(self.winner, Some(w) if w != self.our_color)
    }
}

/// Everything that travels back from a finished decision task.
struct DecisionOutcome {
    chain: MoveSourceChain,
    /// Clock including whatever the online sources charged.
    clock: ClockState,
    result: Result<MoveProposal, DecisionError>,
}

pub struct GameController {
    api: Arc<dyn LichessApi>,
    game_id: String,
    our_id: String,
    settings: GameSettings,
    /// Taken while a decision task holds it; `None` doubles as the
    /// "decision in flight" marker.
    chain: Option<MoveSourceChain>,
    board: Board,
    clock: ClockState,
    history: ScoreHistory,
    meta: Option<GameMeta>,
    opponent_id: String,
    opponent_name: String,
    perf: String,
    abort_deadline: Option<Instant>,
    claim_deadline: Option<Instant>,
    decision_task: Option<JoinHandle<()>>,
    decision_started: Option<std::time::Instant>,
    started_at: std::time::Instant,
}

/// Pends forever when no deadline is armed, so it can sit in a select arm
/// unconditionally.
async fn deadline(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn clock_for(our_color: Color, state: &GameState) -> ClockState {
    match our_color {
        Color::White => ClockState::from_millis(state.wtime, state.btime, state.winc),
        Color::Black => ClockState::from_millis(state.btime, state.wtime, state.binc),
    }
}

fn winner_color(state: &GameState) -> Option<Color> {
    match state.winner.as_deref() {
        Some("white") => Some(Color::White),
        Some("black") => Some(Color::Black),
        _ => None,
    }
}

/// Human-readable result line for the game-over log.
fn describe_result(outcome: &GameOutcome, board: &Board) -> String {
    let won = outcome.we_won();
    match outcome.status {
        GameStatus::Mate => if won { "won by checkmate" } else { "lost by checkmate" }.into(),
        GameStatus::Resign => if won {
            "won by resignation"
        } else {
            "lost by resignation"
        }
        .into(),
        GameStatus::Outoftime => if won { "won on time" } else { "lost on time" }.into(),
        GameStatus::Timeout => if won {
            "won, opponent left the game"
        } else {
            "lost by leaving the game"
        }
        .into(),
        GameStatus::Aborted | GameStatus::NoStart => "game aborted".into(),
        GameStatus::Stalemate => "draw by stalemate".into(),
        GameStatus::Draw => {
            if board.halfmove_clock() >= 100 {
                "draw by fifty-move rule"
            } else if board.insufficient_material() {
                "draw by insufficient material"
            } else if board.repetition_count() >= 3 {
                "draw by threefold repetition"
            } else {
                "draw by agreement"
            }
            .into()
        }
        GameStatus::VariantEnd => if won { "won by variant rule" } else { "lost by variant rule" }.into(),
        other => format!("game ended ({other:?})"),
    }
}

impl GameController {
    pub fn new(
        api: Arc<dyn LichessApi>,
        game_id: String,
        our_id: String,
        chain: MoveSourceChain,
        settings: GameSettings,
    ) -> Self {
        Self {
            api,
            game_id,
            our_id,
            settings,
            chain: Some(chain),
            board: Board::startpos(),
            clock: ClockState::from_millis(0, 0, 0),
            history: ScoreHistory::new(),
            meta: None,
            opponent_id: String::new(),
            opponent_name: String::new(),
            perf: String::new(),
            abort_deadline: None,
            claim_deadline: None,
            decision_task: None,
            decision_started: None,
            started_at: std::time::Instant::now(),
        }
    }

    /// Drive the game to completion. The first event must be the full
    /// snapshot; everything afterwards is incremental.
    pub async fn run(mut self, mut events: mpsc::Receiver<GameEvent>) -> Result<GameOutcome> {
        let (decision_tx, mut decision_rx) = mpsc::channel::<DecisionOutcome>(1);

        let outcome = loop {
            tokio::select! {
                biased;
                event = events.recv() => match event {
                    Some(event) => {
                        if let Some(outcome) = self.handle_event(event, &decision_tx).await? {
                            break outcome;
                        }
                    }
                    None => {
                        self.shutdown().await;
                        return Err(anyhow!(
                            "game stream for {} ended without a terminal state",
                            self.game_id
                        ));
                    }
                },
                Some(done) = decision_rx.recv() => {
                    if let Err(e) = self.finish_decision(done).await {
                        self.shutdown().await;
                        return Err(e);
                    }
                }
                _ = deadline(self.abort_deadline) => {
                    self.abort_deadline = None;
                    // Our own reply may have put the second ply on the
                    // board before the server echoed it back.
                    if self.board.moves_played() < 2 {
                        info!(game = %self.game_id, "no second move within the abort window, aborting");
                        if let Err(e) = self.api.abort(&self.game_id).await {
                            warn!(game = %self.game_id, error = %e, "abort request failed");
                        }
                    }
                }
                _ = deadline(self.claim_deadline) => {
                    info!(game = %self.game_id, "opponent did not return, claiming victory");
                    self.claim_deadline = None;
                    if let Err(e) = self.api.claim_victory(&self.game_id).await {
                        warn!(game = %self.game_id, error = %e, "victory claim failed");
                    }
                }
            }
        };

        self.shutdown().await;
        Ok(outcome)
    }

    async fn handle_event(
        &mut self,
        event: GameEvent,
        decision_tx: &mpsc::Sender<DecisionOutcome>,
    ) -> Result<Option<GameOutcome>> {
        match event {
            GameEvent::GameFull(full) => self.handle_full(full, decision_tx).await,
            GameEvent::GameState(state) => self.handle_state(state, decision_tx).await,
            GameEvent::ChatLine {
                room,
                username,
                text,
            } => {
                info!(game = %self.game_id, room, from = %username, text = %text, "chat");
                Ok(None)
            }
            GameEvent::OpponentGone {
                gone,
                claim_win_in_seconds,
            } => {
                if gone {
                    if let Some(secs) = claim_win_in_seconds {
                        info!(game = %self.game_id, in_secs = secs, "opponent gone, victory claimable");
                        self.claim_deadline = Some(Instant::now() + Duration::from_secs(secs));
                    }
                } else {
                    self.claim_deadline = None;
                }
                Ok(None)
            }
        }
    }

    async fn handle_full(
        &mut self,
        full: GameFull,
        decision_tx: &mpsc::Sender<DecisionOutcome>,
    ) -> Result<Option<GameOutcome>> {
        let we_are_white = full.white.id.as_deref() == Some(self.our_id.as_str());
        let our_color = if we_are_white {
            Color::White
        } else {
            Color::Black
        };
        let opponent = if we_are_white { &full.black } else { &full.white };
        self.opponent_name = opponent.display_name().to_string();
        self.opponent_id = opponent
            .id
            .clone()
            .unwrap_or_else(|| self.opponent_name.to_lowercase());
        self.perf = full.speed.clone();

        let meta = GameMeta {
            variant: full.variant.key.clone(),
            speed: full.speed.clone(),
            our_color,
            rated: full.rated,
            opponent_is_bot: opponent.is_bot(),
        };
        info!(
            game = %self.game_id,
            opponent = %self.opponent_name,
            color = ?our_color,
            speed = %meta.speed,
            rated = meta.rated,
            "game started"
        );

        self.board = match full.initial_fen.as_deref() {
            None | Some("startpos") => Board::startpos(),
            Some(fen) => Board::from_fen(fen).map_err(|e| anyhow!("bad initial position: {e}"))?,
        };
        for uci in full.state.moves.split_whitespace() {
            self.board
                .play_uci(uci)
                .map_err(|e| anyhow!("bad server move list: {e}"))?;
        }
        self.clock = clock_for(our_color, &full.state);
        self.meta = Some(meta.clone());

        if let Some(clock) = &full.clock {
            let overhead = scaled_overhead(self.settings.move_overhead, clock.initial);
            if let Some(chain) = self.chain.as_mut() {
                chain.set_move_overhead(overhead);
            }
        }

        if !full.state.status.is_ongoing() {
            return Ok(Some(self.outcome(full.state.status, winner_color(&full.state))));
        }

        // Watchdog until both sides have moved: a game that never starts
        // is aborted rather than left to rot in a slot.
        if self.board.moves_played() < 2 {
            let delay = if meta.opponent_is_bot {
                self.settings.abort_after_bot
            } else {
                self.settings.abort_after_human
            };
            self.abort_deadline = Some(Instant::now() + delay);
        }

        if self.is_our_turn() {
            self.spawn_decision(decision_tx, meta);
        } else if self.settings.ponder && self.board.moves_played() > 1 {
            if let Some(chain) = self.chain.as_mut() {
                if let Err(e) = chain.start_ponder(&self.board).await {
                    warn!(game = %self.game_id, error = %e, "failed to start pondering");
                }
            }
        }
        Ok(None)
    }

    async fn handle_state(
        &mut self,
        state: GameState,
        decision_tx: &mpsc::Sender<DecisionOutcome>,
    ) -> Result<Option<GameOutcome>> {
        let Some(meta) = self.meta.clone() else {
            warn!(game = %self.game_id, "state event before full snapshot, ignoring");
            return Ok(None);
        };

        let server_moves: Vec<&str> = state.moves.split_whitespace().collect();
        // The stream occasionally re-delivers an older state; the move
        // count tells stale apart from current.
        if server_moves.len() < self.board.moves_played() {
            debug!(game = %self.game_id, "stale state event, ignoring");
            return Ok(None);
        }
        let new_moves = &server_moves[self.board.moves_played()..];
        for uci in new_moves {
            self.board
                .play_uci(uci)
                .map_err(|e| anyhow!("bad server move list: {e}"))?;
        }
        if !new_moves.is_empty() {
            self.claim_deadline = None;
        }
        self.clock = clock_for(meta.our_color, &state);

        if !state.status.is_ongoing() {
            return Ok(Some(self.outcome(state.status, winner_color(&state))));
        }

        if self.board.moves_played() >= 2 {
            self.abort_deadline = None;
        }

        if self.is_our_turn() {
            self.spawn_decision(decision_tx, meta);
        }
        Ok(None)
    }

    fn is_our_turn(&self) -> bool {
        self.meta
            .as_ref()
            .is_some_and(|meta| self.board.turn() == meta.our_color)
    }

    /// Move the chain into a task and run the decision there, so the
    /// event loop stays responsive while the engine thinks. A `None`
    /// chain means a decision is already in flight.
    fn spawn_decision(&mut self, tx: &mpsc::Sender<DecisionOutcome>, meta: GameMeta) {
        let Some(mut chain) = self.chain.take() else {
            return;
        };
        self.decision_started = Some(std::time::Instant::now());
        let board = self.board.clone();
        let mut clock = self.clock;
        let history = self.history.clone();
        let tx = tx.clone();
        self.decision_task = Some(tokio::spawn(async move {
            let result = {
                let mut query = MoveQuery {
                    board: &board,
                    clock: &mut clock,
                    history: &history,
                    meta: &meta,
                };
                chain.choose(&mut query).await
            };
            let _ = tx.send(DecisionOutcome {
                chain,
                clock,
                result,
            })
            .await;
        }));
    }

    async fn finish_decision(&mut self, done: DecisionOutcome) -> Result<()> {
        self.decision_task = None;
        self.chain = Some(done.chain);
        self.clock = done.clock;

        let proposal = match done.result {
            Ok(proposal) => proposal,
            Err(e) => {
                error!(game = %self.game_id, error = %e, "move decision failed");
                return Err(e.into());
            }
        };
        let Some(meta) = self.meta.clone() else {
            return Ok(());
        };
        // A terminal event or takeback may have raced the decision.
        if self.board.turn() != meta.our_color {
            debug!(game = %self.game_id, "position moved on, dropping stale decision");
            return Ok(());
        }

        self.history.push(proposal.eval);

        let gate = PolicyGate {
            opponent_is_human: meta.opponent_is_human(),
            opponent_low_time_no_increment: self
                .clock
                .opponent_low_no_increment(self.settings.low_time_threshold),
        };

        if proposal.resign || should_resign(&self.settings.resign, &self.history, gate) {
            info!(game = %self.game_id, source = proposal.source, "resigning lost position");
            self.api
                .resign(&self.game_id)
                .await
                .map_err(|e| anyhow!("failed to resign: {e}"))?;
            return Ok(());
        }

        let offer_draw = proposal.offer_draw
            || should_offer_draw(&self.settings.draw, &self.history, self.board.fullmoves(), gate);

        let uci = proposal.uci.to_string();
        self.api
            .send_move(&self.game_id, &uci, offer_draw)
            .await
            .map_err(|e| anyhow!("failed to send move {uci}: {e}"))?;
        self.board
            .play_uci(&uci)
            .map_err(|e| anyhow!("chain produced illegal move {uci}: {e}"))?;

        if let Some(started) = self.decision_started.take() {
            metrics::MOVE_DECISION_SECONDS.observe(started.elapsed().as_secs_f64());
        }
        metrics::MOVES_BY_SOURCE
            .with_label_values(&[proposal.source])
            .inc();
        info!(
            game = %self.game_id,
            uci = %uci,
            source = proposal.source,
            offer_draw,
            "played move"
        );

        if proposal.start_ponder && self.settings.ponder {
            if let Some(chain) = self.chain.as_mut() {
                if let Err(e) = chain.start_ponder(&self.board).await {
                    warn!(game = %self.game_id, error = %e, "failed to start pondering");
                }
            }
        }
        Ok(())
    }

    fn outcome(&self, status: GameStatus, winner: Option<Color>) -> GameOutcome {
        let outcome = GameOutcome {
            game_id: self.game_id.clone(),
            opponent: self.opponent_id.clone(),
            perf: self.perf.clone(),
            our_color: self
                .meta
                .as_ref()
                .map(|m| m.our_color)
                .unwrap_or(Color::White),
            status,
            winner,
            duration: self.started_at.elapsed(),
        };
        info!(
            game = %self.game_id,
            opponent = %self.opponent_name,
            result = %describe_result(&outcome, &self.board),
            moves = self.board.moves_played(),
            "game over"
        );
        outcome
    }

    async fn shutdown(&mut self) {
        if let Some(task) = self.decision_task.take() {
            // Dropping the chain inside the task kills the engine process.
            task.abort();
        }
        if let Some(mut chain) = self.chain.take() {
            if let Err(e) = chain.stop_engine().await {
                debug!(game = %self.game_id, error = %e, "engine shutdown failed");
            }
        }
    }
}
