//! Centralized configuration loading from config.toml.
//!
//! Single source of truth for configuration values, loaded from
//! config.toml with support for SQUIRE_* environment variable overrides.

use decision_core::policy::{DrawPolicy, ResignPolicy};
use decision_core::sources::{BookSelection, EgtbConfig, OnlineConfig};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{debug, info, warn};

mod defaults {
    pub const LOG_LEVEL: &str = "info";
    pub const DATA_DIR: &str = "./data";
    pub const SERVER_URL: &str = "https://lichess.org";
    pub const EXPLORER_URL: &str = "https://explorer.lichess.ovh";
    pub const TABLEBASE_URL: &str = "https://tablebase.lichess.ovh";
    pub const CHESSDB_URL: &str = "https://www.chessdb.cn";
    pub const ENGINE_PATH: &str = "stockfish";
    pub const MOVE_OVERHEAD_MS: u64 = 1_000;
    pub const MAX_GAMES: usize = 1;
    pub const BOOK_MAX_DEPTH_PLIES: usize = 16;
    pub const BOOK_PRIORITY: i32 = 400;
    pub const TABLEBASE_MAX_PIECES: usize = 7;
    pub const HEALTH_HOST: &str = "0.0.0.0";
    pub const HEALTH_PORT: u16 = 8080;
    pub const ROSTER_REFRESH_SECS: u64 = 1_800;
    pub const ROSTER_SIZE: usize = 200;
    pub const ATTEMPT_DELAY_SECS: u64 = 30;
    pub const RATE_LIMIT_BACKOFF_SECS: u64 = 3_600;
    pub const RATING_WINDOW: i32 = 600;
    pub const ABORT_AFTER_BOT_SECS: u64 = 30;
    pub const ABORT_AFTER_HUMAN_SECS: u64 = 60;
    pub const LOW_TIME_THRESHOLD_MS: u64 = 10_000;
}

/// Root configuration structure matching config.toml.
#[derive(Debug, Deserialize, Default)]
pub struct CentralConfig {
    #[serde(default)]
    pub common: CommonConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub challenge: ChallengeConfig,
    #[serde(default)]
    pub game: GameConfig,
    #[serde(default)]
    pub draw: DrawPolicy,
    #[serde(default)]
    pub resign: ResignPolicy,
    #[serde(default)]
    pub book: BookConfig,
    #[serde(default)]
    pub explorer: OnlineConfig,
    #[serde(default)]
    pub cloud_eval: OnlineConfig,
    #[serde(default)]
    pub external_db: OnlineConfig,
    #[serde(default)]
    pub online_egtb: EgtbConfig,
    #[serde(default)]
    pub tablebase: TablebaseConfig,
    #[serde(default)]
    pub matchmaking: MatchmakingConfig,
    #[serde(default)]
    pub health: HealthConfig,
}

fn d_log_level() -> String {
    defaults::LOG_LEVEL.into()
}
fn d_data_dir() -> String {
    defaults::DATA_DIR.into()
}
fn d_server_url() -> String {
    defaults::SERVER_URL.into()
}
fn d_explorer_url() -> String {
    defaults::EXPLORER_URL.into()
}
fn d_tablebase_url() -> String {
    defaults::TABLEBASE_URL.into()
}
fn d_chessdb_url() -> String {
    defaults::CHESSDB_URL.into()
}
fn d_engine_path() -> String {
    defaults::ENGINE_PATH.into()
}
fn d_move_overhead_ms() -> u64 {
    defaults::MOVE_OVERHEAD_MS
}
fn d_max_games() -> usize {
    defaults::MAX_GAMES
}
fn d_true() -> bool {
    true
}
fn d_book_max_depth() -> usize {
    defaults::BOOK_MAX_DEPTH_PLIES
}
fn d_book_priority() -> i32 {
    defaults::BOOK_PRIORITY
}
fn d_tablebase_max_pieces() -> usize {
    defaults::TABLEBASE_MAX_PIECES
}
fn d_health_host() -> String {
    defaults::HEALTH_HOST.into()
}
fn d_health_port() -> u16 {
    defaults::HEALTH_PORT
}
fn d_roster_refresh() -> u64 {
    defaults::ROSTER_REFRESH_SECS
}
fn d_roster_size() -> usize {
    defaults::ROSTER_SIZE
}
fn d_attempt_delay() -> u64 {
    defaults::ATTEMPT_DELAY_SECS
}
fn d_rate_limit_backoff() -> u64 {
    defaults::RATE_LIMIT_BACKOFF_SECS
}
fn d_rating_window() -> i32 {
    defaults::RATING_WINDOW
}
fn d_abort_bot() -> u64 {
    defaults::ABORT_AFTER_BOT_SECS
}
fn d_abort_human() -> u64 {
    defaults::ABORT_AFTER_HUMAN_SECS
}
fn d_low_time_ms() -> u64 {
    defaults::LOW_TIME_THRESHOLD_MS
}
fn d_variants() -> Vec<String> {
    vec!["standard".into()]
}
fn d_speeds() -> Vec<String> {
    vec!["bullet".into(), "blitz".into(), "rapid".into()]
}
fn d_selection() -> String {
    "weighted_random".into()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CommonConfig {
    #[serde(default = "d_log_level")]
    pub log_level: String,
    #[serde(default = "d_data_dir")]
    pub data_dir: String,
}

impl Default for CommonConfig {
    fn default() -> Self {
        Self {
            log_level: defaults::LOG_LEVEL.into(),
            data_dir: defaults::DATA_DIR.into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    #[serde(default = "d_server_url")]
    pub url: String,
    /// Personal API token of the BOT account.
    #[serde(default)]
    pub token: String,
    #[serde(default = "d_explorer_url")]
    pub explorer_url: String,
    #[serde(default = "d_tablebase_url")]
    pub tablebase_url: String,
    #[serde(default = "d_chessdb_url")]
    pub chessdb_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: defaults::SERVER_URL.into(),
            token: String::new(),
            explorer_url: defaults::EXPLORER_URL.into(),
            tablebase_url: defaults::TABLEBASE_URL.into(),
            chessdb_url: defaults::CHESSDB_URL.into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    #[serde(default = "d_engine_path")]
    pub path: String,
    /// Per-move overhead in milliseconds subtracted from the think budget
    /// to cover network and process latency.
    #[serde(default = "d_move_overhead_ms")]
    pub move_overhead_ms: u64,
    #[serde(default = "d_true")]
    pub ponder: bool,
    /// Raw UCI options forwarded to the engine at startup.
    #[serde(default)]
    pub uci_options: HashMap<String, String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            path: defaults::ENGINE_PATH.into(),
            move_overhead_ms: defaults::MOVE_OVERHEAD_MS,
            ponder: true,
            uci_options: HashMap::new(),
        }
    }
}

/// Which incoming challenges are accepted. Lists are allow-lists.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChallengeConfig {
    #[serde(default = "d_true")]
    pub enabled: bool,
    #[serde(default = "d_max_games")]
    pub max_games: usize,
    #[serde(default = "d_variants")]
    pub variants: Vec<String>,
    #[serde(default = "d_speeds")]
    pub speeds: Vec<String>,
    #[serde(default = "d_true")]
    pub accept_rated: bool,
    #[serde(default = "d_true")]
    pub accept_casual: bool,
    #[serde(default = "d_true")]
    pub accept_bots: bool,
    #[serde(default = "d_true")]
    pub accept_humans: bool,
}

impl Default for ChallengeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_games: defaults::MAX_GAMES,
            variants: d_variants(),
            speeds: d_speeds(),
            accept_rated: true,
            accept_casual: true,
            accept_bots: true,
            accept_humans: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GameConfig {
    /// Abort watchdog delay when the opponent is a bot.
    #[serde(default = "d_abort_bot")]
    pub abort_after_bot_secs: u64,
    /// Abort watchdog delay when the opponent is human.
    #[serde(default = "d_abort_human")]
    pub abort_after_human_secs: u64,
    /// Opponent clock below this without increment blocks draw offers
    /// and resignations.
    #[serde(default = "d_low_time_ms")]
    pub low_time_threshold_ms: u64,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            abort_after_bot_secs: defaults::ABORT_AFTER_BOT_SECS,
            abort_after_human_secs: defaults::ABORT_AFTER_HUMAN_SECS,
            low_time_threshold_ms: defaults::LOW_TIME_THRESHOLD_MS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BookConfig {
    #[serde(default)]
    pub enabled: bool,
    pub selection: BookSelection,
    #[serde(default = "d_book_max_depth")]
    pub max_depth_plies: usize,
    #[serde(default = "d_book_priority")]
    pub priority: i32,
    /// JSON book files, consulted in order.
    #[serde(default)]
    pub paths: Vec<String>,
}

impl Default for BookConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            selection: BookSelection::WeightedRandom,
            max_depth_plies: defaults::BOOK_MAX_DEPTH_PLIES,
            priority: defaults::BOOK_PRIORITY,
            paths: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TablebaseConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "d_tablebase_max_pieces")]
    pub max_pieces: usize,
}

impl Default for TablebaseConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_pieces: defaults::TABLEBASE_MAX_PIECES,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MatchmakingConfig {
    #[serde(default)]
    pub enabled: bool,
    /// "weighted_random" or "sequential".
    #[serde(default = "d_selection")]
    pub selection: String,
    #[serde(default = "d_rating_window")]
    pub rating_window: i32,
    #[serde(default = "d_roster_refresh")]
    pub roster_refresh_secs: u64,
    #[serde(default = "d_roster_size")]
    pub roster_size: usize,
    #[serde(default = "d_attempt_delay")]
    pub attempt_delay_secs: u64,
    #[serde(default = "d_rate_limit_backoff")]
    pub rate_limit_backoff_secs: u64,
    #[serde(default)]
    pub types: Vec<MatchTypeConfig>,
}

impl Default for MatchmakingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            selection: d_selection(),
            rating_window: defaults::RATING_WINDOW,
            roster_refresh_secs: defaults::ROSTER_REFRESH_SECS,
            roster_size: defaults::ROSTER_SIZE,
            attempt_delay_secs: defaults::ATTEMPT_DELAY_SECS,
            rate_limit_backoff_secs: defaults::RATE_LIMIT_BACKOFF_SECS,
            types: Vec::new(),
        }
    }
}

/// One configured (time control, variant, rating window, weight) tuple.
#[derive(Debug, Clone, Deserialize)]
pub struct MatchTypeConfig {
    pub initial_secs: u64,
    #[serde(default)]
    pub increment_secs: u64,
    #[serde(default = "d_true")]
    pub rated: bool,
    #[serde(default = "d_standard")]
    pub variant: String,
    /// Overrides the global rating window for this type.
    #[serde(default)]
    pub rating_window: Option<i32>,
    /// Explicit selection weight; defaults to the inverse of the
    /// estimated game duration.
    #[serde(default)]
    pub weight: Option<f64>,
}

fn d_standard() -> String {
    "standard".into()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    #[serde(default = "d_health_host")]
    pub host: String,
    #[serde(default = "d_health_port")]
    pub port: u16,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            host: defaults::HEALTH_HOST.into(),
            port: defaults::HEALTH_PORT,
        }
    }
}

/// Standard locations to search for config.toml
const CONFIG_SEARCH_PATHS: &[&str] = &["config.toml", "../config.toml", "/etc/squire/config.toml"];

/// Load the central configuration from config.toml.
pub fn load_config() -> CentralConfig {
    if let Ok(path) = std::env::var("SQUIRE_CONFIG") {
        let path = PathBuf::from(&path);
        if path.exists() {
            info!("Loading config from SQUIRE_CONFIG: {}", path.display());
            return load_from_path(&path);
        }
        warn!(
            "SQUIRE_CONFIG={} not found, searching defaults",
            path.display()
        );
    }

    for path_str in CONFIG_SEARCH_PATHS {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading config from {}", path.display());
            return load_from_path(&path);
        }
    }

    debug!("No config.toml found, using built-in defaults");
    apply_env_overrides(CentralConfig::default())
}

fn load_from_path(path: &PathBuf) -> CentralConfig {
    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => apply_env_overrides(config),
            Err(e) => {
                warn!("Failed to parse {}: {}, using defaults", path.display(), e);
                apply_env_overrides(CentralConfig::default())
            }
        },
        Err(e) => {
            warn!("Failed to read {}: {}, using defaults", path.display(), e);
            apply_env_overrides(CentralConfig::default())
        }
    }
}

/// Macro to reduce env override boilerplate
macro_rules! env_override {
    // String field
    ($config:expr, $section:ident . $field:ident, $key:expr) => {
        if let Ok(v) = std::env::var($key) {
            $config.$section.$field = v;
        }
    };
    // Parseable field (bool, u64, i32, etc.)
    ($config:expr, $section:ident . $field:ident, $key:expr, parse) => {
        if let Ok(v) =
            std::env::var($key).and_then(|s| s.parse().map_err(|_| std::env::VarError::NotPresent))
        {
            $config.$section.$field = v;
        }
    };
}

fn apply_env_overrides(mut config: CentralConfig) -> CentralConfig {
    // Common
    env_override!(config, common.log_level, "SQUIRE_COMMON_LOG_LEVEL");
    env_override!(config, common.data_dir, "SQUIRE_COMMON_DATA_DIR");

    // Server
    env_override!(config, server.url, "SQUIRE_SERVER_URL");
    env_override!(config, server.token, "SQUIRE_SERVER_TOKEN");
    env_override!(config, server.explorer_url, "SQUIRE_SERVER_EXPLORER_URL");
    env_override!(config, server.tablebase_url, "SQUIRE_SERVER_TABLEBASE_URL");
    env_override!(config, server.chessdb_url, "SQUIRE_SERVER_CHESSDB_URL");

    // Engine
    env_override!(config, engine.path, "SQUIRE_ENGINE_PATH");
    env_override!(
        config,
        engine.move_overhead_ms,
        "SQUIRE_ENGINE_MOVE_OVERHEAD_MS",
        parse
    );
    env_override!(config, engine.ponder, "SQUIRE_ENGINE_PONDER", parse);

    // Challenge
    env_override!(config, challenge.enabled, "SQUIRE_CHALLENGE_ENABLED", parse);
    env_override!(
        config,
        challenge.max_games,
        "SQUIRE_CHALLENGE_MAX_GAMES",
        parse
    );
    env_override!(
        config,
        challenge.accept_rated,
        "SQUIRE_CHALLENGE_ACCEPT_RATED",
        parse
    );
    env_override!(
        config,
        challenge.accept_casual,
        "SQUIRE_CHALLENGE_ACCEPT_CASUAL",
        parse
    );
    env_override!(
        config,
        challenge.accept_bots,
        "SQUIRE_CHALLENGE_ACCEPT_BOTS",
        parse
    );
    env_override!(
        config,
        challenge.accept_humans,
        "SQUIRE_CHALLENGE_ACCEPT_HUMANS",
        parse
    );

    // Game
    env_override!(
        config,
        game.abort_after_bot_secs,
        "SQUIRE_GAME_ABORT_AFTER_BOT_SECS",
        parse
    );
    env_override!(
        config,
        game.abort_after_human_secs,
        "SQUIRE_GAME_ABORT_AFTER_HUMAN_SECS",
        parse
    );
    env_override!(
        config,
        game.low_time_threshold_ms,
        "SQUIRE_GAME_LOW_TIME_THRESHOLD_MS",
        parse
    );

    // Book / tablebase toggles
    env_override!(config, book.enabled, "SQUIRE_BOOK_ENABLED", parse);
    env_override!(config, tablebase.enabled, "SQUIRE_TABLEBASE_ENABLED", parse);

    // Matchmaking
    env_override!(
        config,
        matchmaking.enabled,
        "SQUIRE_MATCHMAKING_ENABLED",
        parse
    );
    env_override!(config, matchmaking.selection, "SQUIRE_MATCHMAKING_SELECTION");
    env_override!(
        config,
        matchmaking.rating_window,
        "SQUIRE_MATCHMAKING_RATING_WINDOW",
        parse
    );
    env_override!(
        config,
        matchmaking.roster_refresh_secs,
        "SQUIRE_MATCHMAKING_ROSTER_REFRESH_SECS",
        parse
    );
    env_override!(
        config,
        matchmaking.attempt_delay_secs,
        "SQUIRE_MATCHMAKING_ATTEMPT_DELAY_SECS",
        parse
    );

    // Health
    env_override!(config, health.host, "SQUIRE_HEALTH_HOST");
    env_override!(config, health.port, "SQUIRE_HEALTH_PORT", parse);

    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = CentralConfig::default();
        assert_eq!(config.common.log_level, "info");
        assert_eq!(config.server.url, "https://lichess.org");
        assert_eq!(config.challenge.max_games, 1);
        assert_eq!(config.engine.move_overhead_ms, 1_000);
        assert!(!config.matchmaking.enabled);
        assert!(config.matchmaking.types.is_empty());
    }

    #[test]
    fn squire_env_overrides() {
        std::env::set_var("SQUIRE_ENGINE_PATH", "/opt/sf/stockfish");
        std::env::set_var("SQUIRE_CHALLENGE_MAX_GAMES", "4");
        std::env::set_var("SQUIRE_MATCHMAKING_ENABLED", "true");

        let config = apply_env_overrides(CentralConfig::default());
        assert_eq!(config.engine.path, "/opt/sf/stockfish");
        assert_eq!(config.challenge.max_games, 4);
        assert!(config.matchmaking.enabled);

        std::env::remove_var("SQUIRE_ENGINE_PATH");
        std::env::remove_var("SQUIRE_CHALLENGE_MAX_GAMES");
        std::env::remove_var("SQUIRE_MATCHMAKING_ENABLED");
    }

    #[test]
    fn parse_config_toml() {
        let toml_content = r#"
[server]
token = "lip_secret"

[engine]
path = "/usr/bin/stockfish"
move_overhead_ms = 500

[challenge]
max_games = 2
variants = ["standard", "chess960"]

[matchmaking]
enabled = true
selection = "sequential"

[[matchmaking.types]]
initial_secs = 180
increment_secs = 2

[[matchmaking.types]]
initial_secs = 60
rated = false
weight = 0.5
"#;
        let config: CentralConfig = toml::from_str(toml_content).unwrap();
        assert_eq!(config.server.token, "lip_secret");
        assert_eq!(config.engine.move_overhead_ms, 500);
        assert_eq!(config.challenge.variants.len(), 2);
        assert_eq!(config.matchmaking.selection, "sequential");
        assert_eq!(config.matchmaking.types.len(), 2);
        assert_eq!(config.matchmaking.types[0].initial_secs, 180);
        assert!(config.matchmaking.types[0].rated);
        assert_eq!(config.matchmaking.types[1].weight, Some(0.5));
    }

    #[test]
    fn partial_config_falls_back_to_defaults() {
        let toml_content = r#"
[draw]
enabled = true
score = 20

[resign]
enabled = true
"#;
        let config: CentralConfig = toml::from_str(toml_content).unwrap();
        assert!(config.draw.enabled);
        assert_eq!(config.draw.score, 20);
        assert_eq!(config.draw.consecutive_moves, 10);
        assert!(config.resign.enabled);
        assert_eq!(config.resign.score, -1000);
        assert_eq!(config.common.data_dir, "./data");
    }

    #[test]
    fn book_selection_parses_snake_case() {
        let toml_content = r#"
[book]
enabled = true
selection = "best_move"
paths = ["./books/main.json"]
"#;
        let config: CentralConfig = toml::from_str(toml_content).unwrap();
        assert_eq!(config.book.selection, BookSelection::BestMove);
        assert_eq!(config.book.paths.len(), 1);
    }
}
