//! Concurrent game lifecycle management.
//!
//! One slot pool is shared between incoming challenges and the
//! matchmaker: a slot is reserved before a challenge is accepted or
//! issued, converts to active when the game starts, and is released when
//! the game task reports back. The pool is the single place the
//! concurrency limit is enforced.

use anyhow::{anyhow, Result};
use reqwest::Client;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use decision_core::sources::MemoryBook;

use crate::api::types::{Challenge, TimeControl};
use crate::api::{ApiError, Event, LichessApi};
use crate::central_config::{CentralConfig, ChallengeConfig};
use crate::chain::build_chain;
use crate::game::{GameController, GameOutcome, GameSettings};
use crate::metrics;

/// Slot accounting for concurrent games plus in-flight reservations.
#[derive(Debug)]
pub struct Slots {
    active: HashSet<String>,
    reserved: usize,
    limit: usize,
}

impl Slots {
    pub fn new(limit: usize) -> Self {
        Self {
            active: HashSet::new(),
            reserved: 0,
            limit,
        }
    }

    /// Claim a slot ahead of accepting or issuing a challenge. Counts
    /// active games and other reservations against the limit.
    pub fn try_reserve(&mut self) -> bool {
        if self.active.len() + self.reserved < self.limit {
            self.reserved += 1;
            true
        } else {
            false
        }
    }

    /// Give back a reservation that never became a game.
    pub fn cancel_reservation(&mut self) {
        self.reserved = self.reserved.saturating_sub(1);
    }

    /// Convert a reservation into an active game. Returns false when the
    /// game is already tracked (duplicate start events).
    pub fn activate(&mut self, game_id: &str) -> bool {
        if self.active.contains(game_id) {
            return false;
        }
        self.reserved = self.reserved.saturating_sub(1);
        self.active.insert(game_id.to_string());
        true
    }

    pub fn release(&mut self, game_id: &str) {
        self.active.remove(game_id);
    }

    pub fn in_use(&self) -> usize {
        self.active.len() + self.reserved
    }

    pub fn is_full(&self) -> bool {
        self.in_use() >= self.limit
    }
}

pub type SharedSlots = Arc<Mutex<Slots>>;

pub fn shared_slots(limit: usize) -> SharedSlots {
    Arc::new(Mutex::new(Slots::new(limit)))
}

/// Notifications the manager sends the matchmaker.
#[derive(Debug)]
pub enum MatchSignal {
    /// A game started; its id equals the originating challenge id.
    GameStarted { game_id: String },
    GameFinished { outcome: GameOutcome },
    /// An outgoing challenge was declined by the opponent.
    ChallengeDeclined { challenge_id: String },
}

/// Decide whether an incoming challenge is acceptable; `Err` carries the
/// decline reason understood by the server.
pub fn evaluate_challenge(cfg: &ChallengeConfig, challenge: &Challenge) -> Result<(), &'static str> {
    if !cfg.enabled {
        return Err("generic");
    }
    if !cfg.variants.iter().any(|v| v == &challenge.variant.key) {
        return Err("variant");
    }
    if !matches!(challenge.time_control, TimeControl::Clock { .. }) {
        return Err("timeControl");
    }
    if !cfg.speeds.iter().any(|s| s == &challenge.speed) {
        return Err("timeControl");
    }
    if challenge.rated && !cfg.accept_rated {
        return Err("casual");
    }
    if !challenge.rated && !cfg.accept_casual {
        return Err("rated");
    }
    if challenge.challenger.is_bot() && !cfg.accept_bots {
        return Err("noBot");
    }
    if !challenge.challenger.is_bot() && !cfg.accept_humans {
        return Err("onlyBot");
    }
    Ok(())
}

pub struct GameManager {
    api: Arc<dyn LichessApi>,
    our_id: String,
    cfg: &'static CentralConfig,
    slots: SharedSlots,
    client: Client,
    books: Arc<Vec<MemoryBook>>,
    engine_path: String,
    signals: mpsc::Sender<MatchSignal>,
    /// Challenges accepted but not yet started, for reservation cleanup
    /// when the challenger cancels.
    accepted: HashSet<String>,
}

impl GameManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        api: Arc<dyn LichessApi>,
        our_id: String,
        cfg: &'static CentralConfig,
        slots: SharedSlots,
        client: Client,
        books: Arc<Vec<MemoryBook>>,
        engine_path: String,
        signals: mpsc::Sender<MatchSignal>,
    ) -> Self {
        Self {
            api,
            our_id,
            cfg,
            slots,
            client,
            books,
            engine_path,
            signals,
            accepted: HashSet::new(),
        }
    }

    /// Consume the account event stream until it closes.
    pub async fn run(mut self) -> Result<()> {
        let mut events = self
            .api
            .stream_events()
            .await
            .map_err(|e| anyhow!("failed to open event stream: {e}"))?;
        let (done_tx, mut done_rx) = mpsc::channel::<(String, Result<GameOutcome>)>(16);

        loop {
            tokio::select! {
                biased;
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event, &done_tx).await,
                    None => return Err(anyhow!("account event stream closed")),
                },
                Some((game_id, result)) = done_rx.recv() => {
                    self.handle_done(game_id, result).await;
                }
            }
        }
    }

    async fn handle_event(
        &mut self,
        event: Event,
        done_tx: &mpsc::Sender<(String, Result<GameOutcome>)>,
    ) {
        match event {
            Event::Challenge { challenge } => {
                if challenge.challenger.id == self.our_id {
                    return;
                }
                self.handle_challenge(challenge).await;
            }
            Event::ChallengeCanceled { challenge } => {
                if self.accepted.remove(&challenge.id) {
                    debug!(challenge = %challenge.id, "accepted challenge canceled, freeing slot");
                    self.slots.lock().unwrap().cancel_reservation();
                }
            }
            Event::ChallengeDeclined { challenge } => {
                let _ = self
                    .signals
                    .send(MatchSignal::ChallengeDeclined {
                        challenge_id: challenge.id,
                    })
                    .await;
            }
            Event::GameStart { game } => self.start_game(game.id, done_tx).await,
            Event::GameFinish { game } => {
                debug!(game = %game.id, "server reports game finished");
            }
        }
    }

    async fn handle_challenge(&mut self, challenge: Challenge) {
        if let Err(reason) = evaluate_challenge(&self.cfg.challenge, &challenge) {
            info!(
                challenge = %challenge.id,
                from = %challenge.challenger.name,
                reason,
                "declining challenge"
            );
            metrics::CHALLENGES_DECLINED.inc();
            if let Err(e) = self.api.decline_challenge(&challenge.id, reason).await {
                warn!(challenge = %challenge.id, error = %e, "decline failed");
            }
            return;
        }

        if !self.slots.lock().unwrap().try_reserve() {
            info!(
                challenge = %challenge.id,
                from = %challenge.challenger.name,
                "all slots busy, declining for later"
            );
            metrics::CHALLENGES_DECLINED.inc();
            if let Err(e) = self.api.decline_challenge(&challenge.id, "later").await {
                warn!(challenge = %challenge.id, error = %e, "decline failed");
            }
            return;
        }

        match self.api.accept_challenge(&challenge.id).await {
            Ok(()) => {
                info!(
                    challenge = %challenge.id,
                    from = %challenge.challenger.name,
                    rated = challenge.rated,
                    speed = %challenge.speed,
                    "accepted challenge"
                );
                metrics::CHALLENGES_ACCEPTED.inc();
                self.accepted.insert(challenge.id);
            }
            Err(e) => {
                warn!(challenge = %challenge.id, error = %e, "accept failed, freeing slot");
                if matches!(e, ApiError::RateLimited) {
                    metrics::RATE_LIMITS.inc();
                }
                self.slots.lock().unwrap().cancel_reservation();
            }
        }
    }

    async fn start_game(
        &mut self,
        game_id: String,
        done_tx: &mpsc::Sender<(String, Result<GameOutcome>)>,
    ) {
        // The game id equals the challenge id it grew from.
        self.accepted.remove(&game_id);
        if !self.slots.lock().unwrap().activate(&game_id) {
            debug!(game = %game_id, "duplicate game start event, ignoring");
            return;
        }
        metrics::GAMES_STARTED.inc();
        metrics::ACTIVE_GAMES.inc();
        let _ = self
            .signals
            .send(MatchSignal::GameStarted {
                game_id: game_id.clone(),
            })
            .await;

        let api = self.api.clone();
        let our_id = self.our_id.clone();
        let cfg = self.cfg;
        let client = self.client.clone();
        let books = self.books.clone();
        let engine_path = self.engine_path.clone();
        let settings = GameSettings::from_config(cfg);
        let done_tx = done_tx.clone();
        tokio::spawn(async move {
            let result = async {
                let events = api
                    .stream_game(&game_id)
                    .await
                    .map_err(|e| anyhow!("failed to open game stream: {e}"))?;
                let chain = build_chain(cfg, &engine_path, &client, &books).await?;
                let controller =
                    GameController::new(api, game_id.clone(), our_id, chain, settings);
                controller.run(events).await
            }
            .await;
            let _ = done_tx.send((game_id, result)).await;
        });
    }

    async fn handle_done(&mut self, game_id: String, result: Result<GameOutcome>) {
        self.slots.lock().unwrap().release(&game_id);
        metrics::ACTIVE_GAMES.dec();
        match result {
            Ok(outcome) => {
                metrics::record_outcome(outcome.we_won(), outcome.we_lost());
                let _ = self
                    .signals
                    .send(MatchSignal::GameFinished { outcome })
                    .await;
            }
            Err(e) => {
                error!(game = %game_id, error = %e, "game task failed");
            }
        }
    }
}
