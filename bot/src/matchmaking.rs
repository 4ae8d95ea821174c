//! Matchmaking scheduler: keeps the bot busy by challenging other online
//! bots when slots are free.
//!
//! Opponents who decline or whose games end quickly are put on an
//! escalating cooldown, so the scheduler spreads its challenges across
//! the roster instead of hammering the same unwilling opponent.

use anyhow::{anyhow, Result};
use chrono::Utc;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use shakmaty::Color;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::api::{ApiError, BotUser, LichessApi};
use crate::central_config::{MatchmakingConfig, MatchTypeConfig};
use crate::manager::{MatchSignal, SharedSlots};
use crate::metrics;
use crate::storage::{ChallengeColor, CooldownStore, CooldownTable, OpponentRecord};

/// An issued challenge the opponent has not answered within this window
/// is canceled and the opponent penalized.
const CHALLENGE_TIMEOUT: Duration = Duration::from_secs(120);

/// Expected wall time of one game: base time plus forty increments per
/// side, for both sides.
fn estimated_game_secs(initial_secs: u64, increment_secs: u64) -> u64 {
    (initial_secs + 40 * increment_secs) * 2
}

/// Speed bucket for a time control, using the server's estimate of base
/// plus forty increments.
fn perf_key(initial_secs: u64, increment_secs: u64) -> &'static str {
    match initial_secs + 40 * increment_secs {
        0..=29 => "ultraBullet",
        30..=179 => "bullet",
        180..=479 => "blitz",
        480..=1499 => "rapid",
        _ => "classical",
    }
}

/// Cooldown before this opponent may be challenged again. Quadratic in
/// how fully the game used its expected duration: a full-length game at
/// multiplier 1 costs ten times its estimate; an instant decline costs
/// almost nothing beyond the multiplier escalation.
fn cooldown_secs(actual_secs: u64, estimated_secs: u64, multiplier: u32) -> u64 {
    if estimated_secs == 0 {
        return 0;
    }
    let ratio = actual_secs as f64 / estimated_secs as f64;
    (ratio * ratio * estimated_secs as f64 * 10.0 * multiplier as f64) as u64
}

/// Successful games shrink the multiplier, but only once it has grown
/// past the baseline band.
fn decay_multiplier(multiplier: u32) -> u32 {
    if multiplier > 5 {
        (multiplier / 2).max(1)
    } else {
        multiplier
    }
}

/// Roster entries with a usable rating inside the window, closest rating
/// first.
fn rank_candidates<'a>(
    roster: &'a [BotUser],
    our_rating: i32,
    perf: &str,
    window: i32,
) -> Vec<&'a BotUser> {
    let mut eligible: Vec<(&BotUser, i32)> = roster
        .iter()
        .filter_map(|bot| bot.rating(perf).map(|r| (bot, (r - our_rating).abs())))
        .filter(|(_, diff)| *diff <= window)
        .collect();
    eligible.sort_by_key(|(_, diff)| *diff);
    eligible.into_iter().map(|(bot, _)| bot).collect()
}

fn pick_sequential(available: &[usize], cursor: &mut usize) -> Option<usize> {
    if available.is_empty() {
        return None;
    }
    let index = available[*cursor % available.len()];
    *cursor = cursor.wrapping_add(1);
    Some(index)
}

fn pick_weighted(
    types: &[MatchTypeConfig],
    available: &[usize],
    rng: &mut ChaCha20Rng,
) -> Option<usize> {
    if available.is_empty() {
        return None;
    }
    let weights: Vec<f64> = available
        .iter()
        .map(|&i| {
            let mt = &types[i];
            mt.weight.unwrap_or_else(|| {
                1.0 / estimated_game_secs(mt.initial_secs, mt.increment_secs).max(1) as f64
            })
        })
        .collect();
    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        return available.first().copied();
    }
    let mut roll = rng.gen_range(0.0..total);
    for (&index, weight) in available.iter().zip(&weights) {
        if roll < *weight {
            return Some(index);
        }
        roll -= weight;
    }
    available.last().copied()
}

struct PendingChallenge {
    challenge_id: String,
    opponent: String,
    perf: &'static str,
    type_index: usize,
    issued_at: Instant,
}

pub struct Matchmaker {
    api: Arc<dyn LichessApi>,
    our_id: String,
    cfg: MatchmakingConfig,
    slots: SharedSlots,
    store: Box<dyn CooldownStore>,
    table: CooldownTable,
    roster: Vec<BotUser>,
    our_ratings: HashMap<String, i32>,
    /// Type indexes with no eligible opponent, until the next refresh.
    suspended: HashSet<usize>,
    /// Opponents found busy or offline, until the next refresh.
    busy: HashSet<String>,
    cursor: usize,
    pending: Option<PendingChallenge>,
    /// Games we started through matchmaking: game id to (opponent, perf,
    /// type index).
    matchmade: HashMap<String, (String, &'static str, usize)>,
    backoff_until: Option<Instant>,
    rng: ChaCha20Rng,
}

impl Matchmaker {
    pub fn new(
        api: Arc<dyn LichessApi>,
        our_id: String,
        cfg: MatchmakingConfig,
        slots: SharedSlots,
        store: Box<dyn CooldownStore>,
    ) -> Self {
        Self {
            api,
            our_id,
            cfg,
            slots,
            store,
            table: CooldownTable::default(),
            roster: Vec::new(),
            our_ratings: HashMap::new(),
            suspended: HashSet::new(),
            busy: HashSet::new(),
            cursor: 0,
            pending: None,
            matchmade: HashMap::new(),
            backoff_until: None,
            rng: ChaCha20Rng::from_entropy(),
        }
    }

    pub async fn run(mut self, mut signals: mpsc::Receiver<MatchSignal>) -> Result<()> {
        // A lost or corrupt table only costs cooldown memory; never a
        // reason to stop matchmaking.
        self.table = match self.store.load().await {
            Ok(table) => table,
            Err(e) => {
                warn!(error = %e, "cooldown table unreadable, starting fresh");
                CooldownTable::default()
            }
        };
        info!(records = self.table.len(), "loaded matchmaking cooldown table");
        self.refresh_roster().await;

        let mut roster_timer =
            tokio::time::interval(Duration::from_secs(self.cfg.roster_refresh_secs));
        roster_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        roster_timer.tick().await;
        let mut attempt_timer =
            tokio::time::interval(Duration::from_secs(self.cfg.attempt_delay_secs));
        attempt_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                signal = signals.recv() => match signal {
                    Some(signal) => self.handle_signal(signal).await,
                    None => return Ok(()),
                },
                _ = roster_timer.tick() => {
                    self.refresh_roster().await;
                    self.suspended.clear();
                    self.busy.clear();
                }
                _ = attempt_timer.tick() => self.attempt().await?,
            }
        }
    }

    async fn refresh_roster(&mut self) {
        match self.api.online_bots(self.cfg.roster_size).await {
            Ok(roster) => {
                info!(bots = roster.len(), "refreshed online bot roster");
                self.roster = roster;
            }
            Err(e) => {
                warn!(error = %e, "roster refresh failed, keeping previous roster");
                if matches!(e, ApiError::RateLimited) {
                    metrics::RATE_LIMITS.inc();
                    self.backoff_until = Some(
                        Instant::now() + Duration::from_secs(self.cfg.rate_limit_backoff_secs),
                    );
                }
            }
        }
        match self.api.account().await {
            Ok(account) => {
                self.our_ratings = account
                    .perfs
                    .iter()
                    .filter(|(_, p)| !p.prov)
                    .map(|(k, p)| (k.clone(), p.rating as i32))
                    .collect();
            }
            Err(e) => warn!(error = %e, "account refresh failed"),
        }
    }

    async fn attempt(&mut self) -> Result<()> {
        if let Some(pending) = &self.pending {
            if pending.issued_at.elapsed() < CHALLENGE_TIMEOUT {
                return Ok(());
            }
            let Some(pending) = self.pending.take() else {
                return Ok(());
            };
            info!(opponent = %pending.opponent, "challenge unanswered, canceling");
            if let Err(e) = self.api.cancel_challenge(&pending.challenge_id).await {
                warn!(error = %e, "cancel failed");
            }
            self.slots.lock().unwrap().cancel_reservation();
            let estimated = self
                .cfg
                .types
                .get(pending.type_index)
                .map(|mt| estimated_game_secs(mt.initial_secs, mt.increment_secs))
                .unwrap_or(600);
            self.penalize(&pending.opponent, pending.perf, estimated).await;
            return Ok(());
        }
        if let Some(until) = self.backoff_until {
            if Instant::now() < until {
                return Ok(());
            }
            self.backoff_until = None;
        }
        if self.cfg.types.is_empty() || self.slots.lock().unwrap().is_full() {
            return Ok(());
        }
        if self.suspended.len() >= self.cfg.types.len() {
            error!("every matchmaking type is out of opponents; check the configuration");
            return Err(anyhow!("no matchmaking type can find an opponent"));
        }

        let Some(type_index) = self.pick_type() else {
            return Ok(());
        };
        let mt = self.cfg.types[type_index].clone();
        let perf = perf_key(mt.initial_secs, mt.increment_secs);
        let our_rating = self.our_ratings.get(perf).copied().unwrap_or(1500);
        let window = mt.rating_window.unwrap_or(self.cfg.rating_window);
        let now = Utc::now();

        let mut chosen: Option<BotUser> = None;
        for bot in rank_candidates(&self.roster, our_rating, perf, window) {
            if bot.id == self.our_id
                || self.busy.contains(&bot.id)
                || self.table.is_cooling(&bot.id, perf, now)
            {
                continue;
            }
            match self.api.user_status(&bot.id).await {
                Ok(status) if status.online && !status.playing => {
                    chosen = Some(bot.clone());
                    break;
                }
                Ok(_) => {
                    // Busy now is not their fault; retry after refresh.
                    self.busy.insert(bot.id.clone());
                }
                Err(e) => warn!(opponent = %bot.id, error = %e, "status probe failed"),
            }
        }
        let Some(opponent) = chosen else {
            debug!(perf, "no eligible opponent for this type until the next refresh");
            self.suspended.insert(type_index);
            return Ok(());
        };

        if !self.slots.lock().unwrap().try_reserve() {
            return Ok(());
        }
        let color = self
            .table
            .get(&opponent.id, perf)
            .map(|r| r.preferred_color)
            .unwrap_or(ChallengeColor::White);

        info!(
            opponent = %opponent.id,
            perf,
            rated = mt.rated,
            color = color.as_str(),
            "issuing challenge"
        );
        match self
            .api
            .create_challenge(
                &opponent.id,
                mt.initial_secs,
                mt.increment_secs,
                mt.rated,
                &mt.variant,
                color.as_str(),
            )
            .await
        {
            Ok(challenge_id) => {
                metrics::MATCHMAKING_CHALLENGES.inc();
                self.pending = Some(PendingChallenge {
                    challenge_id,
                    opponent: opponent.id,
                    perf,
                    type_index,
                    issued_at: Instant::now(),
                });
            }
            Err(ApiError::RateLimited) => {
                warn!("rate limited while issuing a challenge, backing off");
                metrics::RATE_LIMITS.inc();
                self.slots.lock().unwrap().cancel_reservation();
                self.backoff_until = Some(
                    Instant::now() + Duration::from_secs(self.cfg.rate_limit_backoff_secs),
                );
            }
            Err(e) => {
                warn!(opponent = %opponent.id, error = %e, "challenge failed");
                self.slots.lock().unwrap().cancel_reservation();
                let estimated = estimated_game_secs(mt.initial_secs, mt.increment_secs);
                self.penalize(&opponent.id, perf, estimated).await;
            }
        }
        Ok(())
    }

    fn pick_type(&mut self) -> Option<usize> {
        let available: Vec<usize> = (0..self.cfg.types.len())
            .filter(|i| !self.suspended.contains(i))
            .collect();
        if self.cfg.selection == "sequential" {
            pick_sequential(&available, &mut self.cursor)
        } else {
            pick_weighted(&self.cfg.types, &available, &mut self.rng)
        }
    }

    async fn handle_signal(&mut self, signal: MatchSignal) {
        match signal {
            MatchSignal::GameStarted { game_id } => {
                // The game id equals the challenge id it grew from.
                match self.pending.take() {
                    Some(pending) if pending.challenge_id == game_id => {
                        debug!(game = %game_id, opponent = %pending.opponent, "matchmade game started");
                        self.matchmade
                            .insert(game_id, (pending.opponent, pending.perf, pending.type_index));
                    }
                    other => self.pending = other,
                }
            }
            MatchSignal::ChallengeDeclined { challenge_id } => {
                match self.pending.take() {
                    Some(pending) if pending.challenge_id == challenge_id => {
                        info!(opponent = %pending.opponent, "challenge declined");
                        self.slots.lock().unwrap().cancel_reservation();
                        let estimated = self
                            .cfg
                            .types
                            .get(pending.type_index)
                            .map(|mt| estimated_game_secs(mt.initial_secs, mt.increment_secs))
                            .unwrap_or(600);
                        self.penalize(&pending.opponent, pending.perf, estimated).await;
                    }
                    other => self.pending = other,
                }
            }
            MatchSignal::GameFinished { outcome } => {
                if let Some((opponent, perf, type_index)) = self.matchmade.remove(&outcome.game_id)
                {
                    let estimated = self
                        .cfg
                        .types
                        .get(type_index)
                        .map(|mt| estimated_game_secs(mt.initial_secs, mt.increment_secs))
                        .unwrap_or(600);
                    self.reward(
                        &opponent,
                        perf,
                        outcome.duration.as_secs(),
                        estimated,
                        outcome.our_color,
                    )
                    .await;
                }
            }
        }
    }

    /// Escalate the cooldown after a declined, canceled or failed
    /// challenge, charging the full estimated duration.
    async fn penalize(&mut self, opponent: &str, perf: &str, estimated_secs: u64) {
        let now = Utc::now();
        let mut record = self
            .table
            .get(opponent, perf)
            .cloned()
            .unwrap_or_else(|| OpponentRecord::fresh(now));
        record.multiplier += 1;
        let secs = cooldown_secs(estimated_secs, estimated_secs, record.multiplier);
        record.next_eligible = now + chrono::Duration::seconds(secs as i64);
        debug!(opponent, perf, multiplier = record.multiplier, cooldown_secs = secs, "penalizing opponent");
        self.table.set(opponent, perf, record);
        self.persist().await;
    }

    /// Record a completed matchmade game: decay the multiplier, start a
    /// cooldown scaled to how long the game actually ran, and alternate
    /// the color for next time.
    async fn reward(
        &mut self,
        opponent: &str,
        perf: &str,
        actual_secs: u64,
        estimated_secs: u64,
        our_color: Color,
    ) {
        let now = Utc::now();
        let mut record = self
            .table
            .get(opponent, perf)
            .cloned()
            .unwrap_or_else(|| OpponentRecord::fresh(now));
        record.multiplier = decay_multiplier(record.multiplier);
        let secs = cooldown_secs(actual_secs, estimated_secs, record.multiplier);
        record.next_eligible = now + chrono::Duration::seconds(secs as i64);
        record.preferred_color = match our_color {
            Color::White => ChallengeColor::Black,
            Color::Black => ChallengeColor::White,
        };
        debug!(opponent, perf, cooldown_secs = secs, "game complete, cooling down opponent");
        self.table.set(opponent, perf, record);
        self.persist().await;
    }

    async fn persist(&self) {
        if let Err(e) = self.store.save(&self.table).await {
            warn!(error = %e, "failed to persist cooldown table");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::types::Perf;

    #[test]
    fn full_length_game_costs_ten_estimates() {
        assert_eq!(cooldown_secs(600, 600, 1), 6_000);
        assert_eq!(cooldown_secs(600, 600, 3), 18_000);
    }

    #[test]
    fn short_games_cost_quadratically_less() {
        // A game that lasted a tenth of its estimate costs a hundredth.
        assert_eq!(cooldown_secs(60, 600, 1), 60);
        assert_eq!(cooldown_secs(0, 600, 4), 0);
    }

    #[test]
    fn multiplier_decays_only_past_the_baseline_band() {
        assert_eq!(decay_multiplier(1), 1);
        assert_eq!(decay_multiplier(5), 5);
        assert_eq!(decay_multiplier(6), 3);
        assert_eq!(decay_multiplier(12), 6);
        assert_eq!(decay_multiplier(3), 3);
    }

    #[test]
    fn perf_key_matches_server_buckets() {
        assert_eq!(perf_key(15, 0), "ultraBullet");
        assert_eq!(perf_key(60, 0), "bullet");
        assert_eq!(perf_key(180, 2), "blitz");
        assert_eq!(perf_key(600, 0), "rapid");
        assert_eq!(perf_key(1800, 20), "classical");
    }

    #[test]
    fn estimate_covers_both_sides() {
        assert_eq!(estimated_game_secs(300, 3), 840);
        assert_eq!(estimated_game_secs(60, 0), 120);
    }

    fn bot(id: &str, perf: &str, rating: u32, prov: bool) -> BotUser {
        BotUser {
            id: id.into(),
            username: id.into(),
            perfs: [(perf.to_string(), Perf { rating, prov })].into(),
        }
    }

    #[test]
    fn candidates_are_ranked_by_rating_distance() {
        let roster = vec![
            bot("far_below", "blitz", 1950, false),
            bot("closest", "blitz", 2010, false),
            bot("provisional", "blitz", 2001, true),
            bot("outside", "blitz", 2700, false),
            bot("wrong_perf", "bullet", 2000, false),
        ];
        let ranked = rank_candidates(&roster, 2000, "blitz", 600);
        let ids: Vec<&str> = ranked.iter().map(|b| b.id.as_str()).collect();
        assert_eq!(ids, vec!["closest", "far_below"]);
    }

    #[test]
    fn sequential_selection_cycles_the_available_types() {
        let available = vec![0, 2];
        let mut cursor = 0;
        assert_eq!(pick_sequential(&available, &mut cursor), Some(0));
        assert_eq!(pick_sequential(&available, &mut cursor), Some(2));
        assert_eq!(pick_sequential(&available, &mut cursor), Some(0));
        assert_eq!(pick_sequential(&[], &mut cursor), None);
    }

    fn match_type(initial_secs: u64, increment_secs: u64, weight: Option<f64>) -> MatchTypeConfig {
        MatchTypeConfig {
            initial_secs,
            increment_secs,
            rated: true,
            variant: "standard".into(),
            rating_window: None,
            weight,
        }
    }

    #[test]
    fn weighted_selection_reaches_every_available_type() {
        let types = vec![
            match_type(60, 0, None),
            match_type(300, 3, None),
            match_type(900, 10, Some(2.0)),
        ];
        let available = vec![0, 1, 2];
        let mut rng = ChaCha20Rng::seed_from_u64(11);
        let mut seen = HashSet::new();
        for _ in 0..256 {
            seen.insert(pick_weighted(&types, &available, &mut rng).unwrap());
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn weighted_selection_of_nothing_is_none() {
        let types = vec![match_type(60, 0, None)];
        let mut rng = ChaCha20Rng::seed_from_u64(11);
        assert_eq!(pick_weighted(&types, &[], &mut rng), None);
    }

    use crate::api::{ApiResult, Event, GameEvent, UserStatus};
    use crate::manager::shared_slots;
    use async_trait::async_trait;

    struct FakeApi;

    #[async_trait]
    impl LichessApi for FakeApi {
        async fn account(&self) -> ApiResult<BotUser> {
            Ok(BotUser {
                id: "squire".into(),
                username: "Squire".into(),
                perfs: HashMap::new(),
            })
        }

        async fn stream_events(&self) -> ApiResult<mpsc::Receiver<Event>> {
            Err(ApiError::Status(500))
        }

        async fn stream_game(&self, _game_id: &str) -> ApiResult<mpsc::Receiver<GameEvent>> {
            Err(ApiError::Status(500))
        }

        async fn send_move(&self, _game_id: &str, _uci: &str, _offer_draw: bool) -> ApiResult<()> {
            Ok(())
        }

        async fn resign(&self, _game_id: &str) -> ApiResult<()> {
            Ok(())
        }

        async fn abort(&self, _game_id: &str) -> ApiResult<()> {
            Ok(())
        }

        async fn claim_victory(&self, _game_id: &str) -> ApiResult<()> {
            Ok(())
        }

        async fn accept_challenge(&self, _challenge_id: &str) -> ApiResult<()> {
            Ok(())
        }

        async fn decline_challenge(&self, _challenge_id: &str, _reason: &str) -> ApiResult<()> {
            Ok(())
        }

        async fn create_challenge(
            &self,
            _opponent: &str,
            _initial_secs: u64,
            _increment_secs: u64,
            _rated: bool,
            _variant: &str,
            _color: &str,
        ) -> ApiResult<String> {
            Ok("ch".into())
        }

        async fn cancel_challenge(&self, _challenge_id: &str) -> ApiResult<()> {
            Ok(())
        }

        async fn online_bots(&self, _limit: usize) -> ApiResult<Vec<BotUser>> {
            Ok(Vec::new())
        }

        async fn user_status(&self, _user_id: &str) -> ApiResult<UserStatus> {
            Ok(UserStatus::default())
        }
    }

    struct NullStore;

    #[async_trait]
    impl CooldownStore for NullStore {
        async fn load(&self) -> anyhow::Result<CooldownTable> {
            Ok(CooldownTable::default())
        }

        async fn save(&self, _table: &CooldownTable) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct CorruptStore;

    #[async_trait]
    impl CooldownStore for CorruptStore {
        async fn load(&self) -> anyhow::Result<CooldownTable> {
            Err(anyhow::anyhow!("unexpected end of file"))
        }

        async fn save(&self, _table: &CooldownTable) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn matchmaker(store: Box<dyn CooldownStore>) -> Matchmaker {
        let cfg = MatchmakingConfig {
            types: vec![match_type(600, 0, None)],
            ..MatchmakingConfig::default()
        };
        Matchmaker::new(Arc::new(FakeApi), "squire".into(), cfg, shared_slots(1), store)
    }

    #[tokio::test]
    async fn unreadable_cooldown_table_starts_fresh() {
        let mm = matchmaker(Box::new(CorruptStore));
        let (tx, rx) = mpsc::channel(1);
        drop(tx);
        // Must come up with an empty table and exit cleanly once the
        // signal channel closes, not die on the bad file.
        mm.run(rx).await.unwrap();
    }

    #[tokio::test]
    async fn failures_escalate_the_multiplier_until_a_success_decays_it() {
        let mut mm = matchmaker(Box::new(NullStore));

        let mut last = 1;
        for _ in 0..6 {
            mm.penalize("rival", "blitz", 600).await;
            let m = mm.table.get("rival", "blitz").unwrap().multiplier;
            assert!(m > last);
            last = m;
        }
        assert_eq!(last, 7);

        mm.reward("rival", "blitz", 600, 600, Color::White).await;
        let record = mm.table.get("rival", "blitz").unwrap();
        assert_eq!(record.multiplier, 3);
        assert_eq!(record.preferred_color, ChallengeColor::Black);

        // Inside the baseline band a further success no longer shrinks
        // the multiplier, but the color keeps alternating.
        mm.reward("rival", "blitz", 600, 600, Color::Black).await;
        let record = mm.table.get("rival", "blitz").unwrap();
        assert_eq!(record.multiplier, 3);
        assert_eq!(record.preferred_color, ChallengeColor::White);
    }
}
