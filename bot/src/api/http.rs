//! Thin reqwest implementation of [`LichessApi`].
//!
//! NDJSON streams are pumped into bounded channels by background tasks;
//! keep-alive blank lines are dropped and undecodable lines are logged
//! and skipped rather than killing the stream.

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::types::{BotUser, Event, GameEvent, UserStatus};
use super::{ApiError, ApiResult, LichessApi};

pub struct HttpApi {
    client: Client,
    base: String,
    token: String,
}

impl HttpApi {
    pub fn new(base: &str, token: &str) -> ApiResult<Self> {
        let client = Client::builder().build()?;
        Ok(Self {
            client,
            base: base.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn get(&self, path: &str) -> ApiResult<Response> {
        let resp = self
            .client
            .get(self.url(path))
            .bearer_auth(&self.token)
            .send()
            .await?;
        check(resp)
    }

    async fn post(&self, path: &str, form: &[(&str, String)]) -> ApiResult<Response> {
        let resp = self
            .client
            .post(self.url(path))
            .bearer_auth(&self.token)
            .form(form)
            .send()
            .await?;
        check(resp)
    }

    async fn open_stream<T>(&self, path: &str) -> ApiResult<mpsc::Receiver<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let resp = self.get(path).await?;
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(pump_ndjson(resp, tx));
        Ok(rx)
    }
}

fn check(resp: Response) -> ApiResult<Response> {
    let status = resp.status();
    if status.as_u16() == 429 {
        return Err(ApiError::RateLimited);
    }
    if !status.is_success() {
        return Err(ApiError::Status(status.as_u16()));
    }
    Ok(resp)
}

async fn pump_ndjson<T>(mut resp: Response, tx: mpsc::Sender<T>)
where
    T: DeserializeOwned + Send + 'static,
{
    let mut buf: Vec<u8> = Vec::new();
    loop {
        let chunk = match resp.chunk().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => {
                debug!("stream ended");
                return;
            }
            Err(e) => {
                warn!(error = %e, "stream transport error");
                return;
            }
        };
        buf.extend_from_slice(&chunk);
        while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buf.drain(..=pos).collect();
            let line = match line.strip_suffix(b"\r\n").or_else(|| line.strip_suffix(b"\n")) {
                Some(stripped) => stripped,
                None => &line[..],
            };
            // Blank lines are stream keep-alives.
            if line.is_empty() {
                continue;
            }
            match serde_json::from_slice::<T>(line) {
                Ok(value) => {
                    if tx.send(value).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "skipping undecodable stream line");
                }
            }
        }
    }
}

#[derive(Deserialize)]
struct CreatedChallenge {
    id: String,
}

#[async_trait]
impl LichessApi for HttpApi {
    async fn account(&self) -> ApiResult<BotUser> {
        Ok(self.get("/api/account").await?.json().await?)
    }

    async fn stream_events(&self) -> ApiResult<mpsc::Receiver<Event>> {
        self.open_stream("/api/stream/event").await
    }

    async fn stream_game(&self, game_id: &str) -> ApiResult<mpsc::Receiver<GameEvent>> {
        self.open_stream(&format!("/api/bot/game/stream/{game_id}"))
            .await
    }

    async fn send_move(&self, game_id: &str, uci: &str, offer_draw: bool) -> ApiResult<()> {
        let path = format!("/api/bot/game/{game_id}/move/{uci}");
        let resp = self
            .client
            .post(self.url(&path))
            .bearer_auth(&self.token)
            .query(&[("offeringDraw", offer_draw)])
            .send()
            .await?;
        check(resp)?;
        Ok(())
    }

    async fn resign(&self, game_id: &str) -> ApiResult<()> {
        self.post(&format!("/api/bot/game/{game_id}/resign"), &[])
            .await?;
        Ok(())
    }

    async fn abort(&self, game_id: &str) -> ApiResult<()> {
        self.post(&format!("/api/bot/game/{game_id}/abort"), &[])
            .await?;
        Ok(())
    }

    async fn claim_victory(&self, game_id: &str) -> ApiResult<()> {
        self.post(&format!("/api/bot/game/{game_id}/claim-victory"), &[])
            .await?;
        Ok(())
    }

    async fn accept_challenge(&self, challenge_id: &str) -> ApiResult<()> {
        self.post(&format!("/api/challenge/{challenge_id}/accept"), &[])
            .await?;
        Ok(())
    }

    async fn decline_challenge(&self, challenge_id: &str, reason: &str) -> ApiResult<()> {
        self.post(
            &format!("/api/challenge/{challenge_id}/decline"),
            &[("reason", reason.to_string())],
        )
        .await?;
        Ok(())
    }

    async fn create_challenge(
        &self,
        opponent: &str,
        initial_secs: u64,
        increment_secs: u64,
        rated: bool,
        variant: &str,
        color: &str,
    ) -> ApiResult<String> {
        let resp = self
            .post(
                &format!("/api/challenge/{opponent}"),
                &[
                    ("rated", rated.to_string()),
                    ("clock.limit", initial_secs.to_string()),
                    ("clock.increment", increment_secs.to_string()),
                    ("variant", variant.to_string()),
                    ("color", color.to_string()),
                ],
            )
            .await?;
        let created: CreatedChallenge = resp.json().await?;
        Ok(created.id)
    }

    async fn cancel_challenge(&self, challenge_id: &str) -> ApiResult<()> {
        self.post(&format!("/api/challenge/{challenge_id}/cancel"), &[])
            .await?;
        Ok(())
    }

    async fn online_bots(&self, limit: usize) -> ApiResult<Vec<BotUser>> {
        let body = self
            .get(&format!("/api/bot/online?nb={limit}"))
            .await?
            .text()
            .await?;
        let mut bots = Vec::new();
        for line in body.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<BotUser>(line) {
                Ok(bot) => bots.push(bot),
                Err(e) => warn!(error = %e, "skipping undecodable roster entry"),
            }
        }
        Ok(bots)
    }

    async fn user_status(&self, user_id: &str) -> ApiResult<UserStatus> {
        let mut statuses: Vec<UserStatus> = self
            .get(&format!("/api/users/status?ids={user_id}"))
            .await?
            .json()
            .await?;
        Ok(statuses.pop().unwrap_or_default())
    }
}
