//! Typed surface over the lichess HTTP/streaming API.
//!
//! The orchestration layer only ever talks to the [`LichessApi`] trait;
//! the reqwest implementation lives in [`http`] and carries no decision
//! logic. Rate limits surface as a distinct error variant so callers can
//! back off instead of retrying.

pub mod http;
pub mod types;

pub use http::HttpApi;
pub use types::{
    BotUser, Challenge, Event, GameEvent, GameEventInfo, GameFull, GameState, GameStatus,
    UserStatus,
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum ApiError {
    /// HTTP 429. Callers must back off, not retry.
    #[error("rate limited by server")]
    RateLimited,

    #[error("server returned status {0}")]
    Status(u16),

    #[error(transparent)]
    Transport(#[from] reqwest::Error),

    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Everything the orchestrator needs from the server.
#[async_trait]
pub trait LichessApi: Send + Sync {
    /// Our own account profile.
    async fn account(&self) -> ApiResult<BotUser>;

    /// Open the account event stream. The channel closes when the
    /// underlying connection does.
    async fn stream_events(&self) -> ApiResult<mpsc::Receiver<Event>>;

    /// Open the event stream for one game.
    async fn stream_game(&self, game_id: &str) -> ApiResult<mpsc::Receiver<GameEvent>>;

    async fn send_move(&self, game_id: &str, uci: &str, offer_draw: bool) -> ApiResult<()>;
    async fn resign(&self, game_id: &str) -> ApiResult<()>;
    async fn abort(&self, game_id: &str) -> ApiResult<()>;
    async fn claim_victory(&self, game_id: &str) -> ApiResult<()>;

    async fn accept_challenge(&self, challenge_id: &str) -> ApiResult<()>;
    async fn decline_challenge(&self, challenge_id: &str, reason: &str) -> ApiResult<()>;
    /// Issue an outgoing challenge; returns the challenge id.
    async fn create_challenge(
        &self,
        opponent: &str,
        initial_secs: u64,
        increment_secs: u64,
        rated: bool,
        variant: &str,
        color: &str,
    ) -> ApiResult<String>;
    async fn cancel_challenge(&self, challenge_id: &str) -> ApiResult<()>;

    async fn online_bots(&self, limit: usize) -> ApiResult<Vec<BotUser>>;
    async fn user_status(&self, user_id: &str) -> ApiResult<UserStatus>;
}
