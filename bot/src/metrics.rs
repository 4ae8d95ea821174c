//! Prometheus metrics for the bot, served by the health endpoint.

use lazy_static::lazy_static;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use std::sync::Once;
use tracing::warn;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    pub static ref GAMES_STARTED: IntCounter =
        IntCounter::new("squire_games_started_total", "Games started")
            .expect("metric can be created");
    pub static ref GAMES_FINISHED: IntCounter =
        IntCounter::new("squire_games_finished_total", "Games finished")
            .expect("metric can be created");
    pub static ref GAMES_WON: IntCounter =
        IntCounter::new("squire_games_won_total", "Games won").expect("metric can be created");
    pub static ref GAMES_LOST: IntCounter =
        IntCounter::new("squire_games_lost_total", "Games lost").expect("metric can be created");
    pub static ref GAMES_DRAWN: IntCounter =
        IntCounter::new("squire_games_drawn_total", "Games drawn").expect("metric can be created");
    pub static ref ACTIVE_GAMES: IntGauge =
        IntGauge::new("squire_active_games", "Games currently in progress")
            .expect("metric can be created");

    pub static ref MOVES_BY_SOURCE: IntCounterVec = IntCounterVec::new(
        Opts::new("squire_moves_total", "Moves played, labeled by deciding source"),
        &["source"],
    )
    .expect("metric can be created");
    pub static ref MOVE_DECISION_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "squire_move_decision_seconds",
            "Wall time from decision start to move sent",
        )
        .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
    )
    .expect("metric can be created");

    pub static ref CHALLENGES_ACCEPTED: IntCounter =
        IntCounter::new("squire_challenges_accepted_total", "Incoming challenges accepted")
            .expect("metric can be created");
    pub static ref CHALLENGES_DECLINED: IntCounter =
        IntCounter::new("squire_challenges_declined_total", "Incoming challenges declined")
            .expect("metric can be created");
    pub static ref MATCHMAKING_CHALLENGES: IntCounter =
        IntCounter::new("squire_matchmaking_challenges_total", "Outgoing challenges issued")
            .expect("metric can be created");
    pub static ref RATE_LIMITS: IntCounter =
        IntCounter::new("squire_rate_limits_total", "Rate-limit responses from the server")
            .expect("metric can be created");

    pub static ref BOT_INFO: IntGaugeVec = IntGaugeVec::new(
        Opts::new("squire_bot_info", "Static bot information"),
        &["username"],
    )
    .expect("metric can be created");
}

static INIT: Once = Once::new();

/// Register all metrics with the registry. Safe to call more than once.
pub fn init_metrics() {
    INIT.call_once(|| {
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(GAMES_STARTED.clone()),
            Box::new(GAMES_FINISHED.clone()),
            Box::new(GAMES_WON.clone()),
            Box::new(GAMES_LOST.clone()),
            Box::new(GAMES_DRAWN.clone()),
            Box::new(ACTIVE_GAMES.clone()),
            Box::new(MOVES_BY_SOURCE.clone()),
            Box::new(MOVE_DECISION_SECONDS.clone()),
            Box::new(CHALLENGES_ACCEPTED.clone()),
            Box::new(CHALLENGES_DECLINED.clone()),
            Box::new(MATCHMAKING_CHALLENGES.clone()),
            Box::new(RATE_LIMITS.clone()),
            Box::new(BOT_INFO.clone()),
        ];
        for collector in collectors {
            if let Err(e) = REGISTRY.register(collector) {
                warn!("Failed to register metric: {}", e);
            }
        }
    });
}

/// Encode all registered metrics in the Prometheus text format.
pub fn encode_metrics() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        warn!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Record the outcome of one finished game in the win/loss/draw counters.
pub fn record_outcome(won: bool, lost: bool) {
    GAMES_FINISHED.inc();
    if won {
        GAMES_WON.inc();
    } else if lost {
        GAMES_LOST.inc();
    } else {
        GAMES_DRAWN.inc();
    }
}
