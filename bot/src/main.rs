//! Squire - autonomous lichess bot orchestrator
//!
//! A long-running process that:
//! 1. Authenticates a BOT account and follows its event stream
//! 2. Accepts challenges and plays games concurrently, each through a
//!    configurable move-source chain backed by a UCI engine
//! 3. Optionally matchmakes against other online bots when idle
//! 4. Exposes health and Prometheus endpoints for orchestration

use anyhow::{anyhow, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

mod api;
mod backends;
mod central_config;
mod chain;
mod config;
mod game;
mod health;
mod manager;
mod matchmaking;
mod metrics;
mod storage;
mod uci;

use crate::api::{HttpApi, LichessApi};
use crate::chain::load_books;
use crate::config::{Config, CENTRAL_CONFIG};
use crate::health::{start_health_server, HealthState};
use crate::manager::{shared_slots, GameManager};
use crate::matchmaking::Matchmaker;
use crate::storage::FileCooldownStore;

fn init_tracing(level: &str) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();
    config.validate()?;
    init_tracing(&config.log_level)?;

    let cfg = &*CENTRAL_CONFIG;
    metrics::init_metrics();

    let api: Arc<dyn LichessApi> =
        Arc::new(HttpApi::new(&config.url, &config.token).map_err(|e| anyhow!("{e}"))?);
    let account = api
        .account()
        .await
        .map_err(|e| anyhow!("failed to authenticate: {e}"))?;
    info!(username = %account.username, "authenticated as bot account");
    metrics::BOT_INFO
        .with_label_values(&[&account.username])
        .set(1);

    let books = if cfg.book.enabled {
        load_books(&cfg.book.paths)?
    } else {
        Vec::new()
    };
    let books = Arc::new(books);
    let slots = shared_slots(config.max_games);
    let client = reqwest::Client::builder().build()?;

    let health_state = HealthState::new();
    {
        let state = health_state.clone();
        let host = cfg.health.host.clone();
        let port = cfg.health.port;
        tokio::spawn(async move {
            if let Err(e) = start_health_server(&host, port, state.clone()).await {
                error!("health server failed: {}", e);
                state.set_unhealthy();
            }
        });
    }

    let (signal_tx, mut signal_rx) = mpsc::channel(32);
    let manager = GameManager::new(
        Arc::clone(&api),
        account.id.clone(),
        cfg,
        slots.clone(),
        client,
        books,
        config.engine_path.clone(),
        signal_tx,
    );
    let mut manager_handle = tokio::spawn(manager.run());

    let mut matchmaker_handle = if config.matchmaking {
        info!(
            types = cfg.matchmaking.types.len(),
            "matchmaking scheduler enabled"
        );
        let store = Box::new(FileCooldownStore::new(config.cooldown_path()));
        let matchmaker = Matchmaker::new(
            Arc::clone(&api),
            account.id.clone(),
            cfg.matchmaking.clone(),
            slots,
            store,
        );
        tokio::spawn(matchmaker.run(signal_rx))
    } else {
        // Drain match signals so the manager never blocks on a full
        // channel.
        tokio::spawn(async move {
            while signal_rx.recv().await.is_some() {}
            std::future::pending::<()>().await;
            Ok::<(), anyhow::Error>(())
        })
    };

    health_state.set_ready();

    // A matchmaking failure only loses matchmaking; games in progress
    // keep running on the manager. Only the manager ends the process.
    let mut matchmaking_alive = true;
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("shutdown signal received, stopping");
                break;
            }
            result = &mut manager_handle => {
                health_state.set_unhealthy();
                return match result {
                    Ok(Ok(())) => Err(anyhow!("game manager exited unexpectedly")),
                    Ok(Err(e)) => {
                        error!("game manager failed: {:#}", e);
                        Err(e)
                    }
                    Err(e) => Err(anyhow!("game manager panicked: {e}")),
                };
            }
            result = &mut matchmaker_handle, if matchmaking_alive => {
                matchmaking_alive = false;
                match result {
                    Ok(Ok(())) => warn!("matchmaking stopped"),
                    Ok(Err(e)) => {
                        error!("matchmaking failed, continuing without it: {:#}", e)
                    }
                    Err(e) => error!("matchmaking panicked, continuing without it: {e}"),
                }
            }
        }
    }

    manager_handle.abort();
    matchmaker_handle.abort();
    info!("shut down cleanly");
    Ok(())
}
