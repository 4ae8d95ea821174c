//! Configuration for the bot binary.
//!
//! Configuration is loaded from config.toml with environment variable
//! overrides. CLI arguments take highest priority, followed by env vars,
//! then config.toml.

use anyhow::{anyhow, Result};
use clap::Parser;
use once_cell::sync::Lazy;
use tracing::level_filters::LevelFilter;

use crate::central_config::{load_config, CentralConfig};

// Load central config once at startup
pub static CENTRAL_CONFIG: Lazy<CentralConfig> = Lazy::new(load_config);

fn default_token() -> String {
    std::env::var("LICHESS_TOKEN").unwrap_or_else(|_| CENTRAL_CONFIG.server.token.clone())
}

fn default_url() -> String {
    CENTRAL_CONFIG.server.url.clone()
}

fn default_engine_path() -> String {
    CENTRAL_CONFIG.engine.path.clone()
}

fn default_max_games() -> usize {
    CENTRAL_CONFIG.challenge.max_games
}

fn default_log_level() -> String {
    std::env::var("SQUIRE_LOG_LEVEL").unwrap_or_else(|_| CENTRAL_CONFIG.common.log_level.clone())
}

fn default_data_dir() -> String {
    CENTRAL_CONFIG.common.data_dir.clone()
}

fn default_matchmaking() -> bool {
    CENTRAL_CONFIG.matchmaking.enabled
}

#[derive(Parser, Debug, Clone)]
#[command(name = "squire")]
#[command(about = "Squire - autonomous lichess bot orchestrator")]
#[command(
    long_about = "Connects a UCI engine to lichess: accepts challenges, plays
concurrent games through a configurable move-source chain, and optionally
matchmakes against other bots.

Configuration is loaded from config.toml with environment variable overrides.
CLI arguments take highest priority."
)]
pub struct Config {
    /// Lichess API token of the BOT account
    #[arg(long, default_value_t = default_token())]
    pub token: String,

    /// Base URL of the lichess server
    #[arg(long, default_value_t = default_url())]
    pub url: String,

    /// Path to the UCI engine binary
    #[arg(long, default_value_t = default_engine_path())]
    pub engine_path: String,

    /// Maximum concurrent games (shared by challenges and matchmaking)
    #[arg(long, default_value_t = default_max_games())]
    pub max_games: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value_t = default_log_level())]
    pub log_level: String,

    /// Data directory for books and the matchmaking cooldown table
    #[arg(long, default_value_t = default_data_dir())]
    pub data_dir: String,

    /// Enable the matchmaking scheduler
    #[arg(long, default_value_t = default_matchmaking())]
    pub matchmaking: bool,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.token.is_empty() {
            return Err(anyhow!(
                "no API token configured (set server.token, SQUIRE_SERVER_TOKEN, or --token)"
            ));
        }

        if self.engine_path.is_empty() {
            return Err(anyhow!("engine path cannot be empty"));
        }

        if self.max_games == 0 {
            return Err(anyhow!("max_games must be greater than 0"));
        }

        if self.log_level.parse::<LevelFilter>().is_err() {
            return Err(anyhow!(
                "invalid log level '{}', expected one of trace, debug, info, warn, error",
                self.log_level
            ));
        }

        Ok(())
    }

    /// Path to the persisted matchmaking cooldown table.
    pub fn cooldown_path(&self) -> String {
        format!("{}/matchmaking.json", self.data_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            token: "lip_token".into(),
            url: "https://lichess.org".into(),
            engine_path: "stockfish".into(),
            max_games: 2,
            log_level: "info".into(),
            data_dir: "./data".into(),
            matchmaking: false,
        }
    }

    #[test]
    fn validate_accepts_valid_configuration() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn validate_rejects_missing_token() {
        let mut cfg = base_config();
        cfg.token.clear();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("token"));
    }

    #[test]
    fn validate_rejects_zero_max_games() {
        let mut cfg = base_config();
        cfg.max_games = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("max_games"));
    }

    #[test]
    fn validate_rejects_invalid_log_level() {
        let mut cfg = base_config();
        cfg.log_level = "nope".into();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("invalid log level"));
    }

    #[test]
    fn cooldown_path_lives_in_data_dir() {
        assert_eq!(base_config().cooldown_path(), "./data/matchmaking.json");
    }
}
