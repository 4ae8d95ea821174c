//! UCI engine process adapter.
//!
//! Owns the engine child process and speaks the UCI text protocol over
//! its pipes. Implements the decision crate's [`Engine`] trait so the
//! move-source chain stays ignorant of process management.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use decision_core::board::Board;
use decision_core::clock::{ClockState, ThinkLimit};
use decision_core::score::Eval;
use decision_core::sources::{Engine, SearchReply};

/// Handshake and stop commands must answer within this window or the
/// engine process is considered broken.
const PROTOCOL_TIMEOUT: Duration = Duration::from_secs(10);

/// Slack on top of the search budget before a missing bestmove is
/// treated as an engine failure.
const SEARCH_GRACE: Duration = Duration::from_secs(10);

pub struct UciEngine {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    pondering: bool,
}

impl UciEngine {
    /// Spawn the engine binary and complete the UCI handshake, applying
    /// the configured options before the first search.
    pub async fn spawn(path: &str, options: &HashMap<String, String>) -> Result<Self> {
        let mut child = Command::new(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn engine '{path}'"))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("engine stdin unavailable"))?;
        let stdout = BufReader::new(
            child
                .stdout
                .take()
                .ok_or_else(|| anyhow!("engine stdout unavailable"))?,
        );

        let mut engine = Self {
            child,
            stdin,
            stdout,
            pondering: false,
        };
        engine.send("uci").await?;
        engine.wait_for("uciok", PROTOCOL_TIMEOUT).await?;
        for (name, value) in options {
            engine
                .send(&format!("setoption name {name} value {value}"))
                .await?;
        }
        engine.send("isready").await?;
        engine.wait_for("readyok", PROTOCOL_TIMEOUT).await?;
        debug!(path, "engine ready");
        Ok(engine)
    }

    async fn send(&mut self, command: &str) -> Result<()> {
        trace!(command, "engine <-");
        self.stdin
            .write_all(command.as_bytes())
            .await
            .context("engine stdin closed")?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;
        Ok(())
    }

    async fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        let n = self
            .stdout
            .read_line(&mut line)
            .await
            .context("engine stdout read failed")?;
        if n == 0 {
            return Err(anyhow!("engine process closed its stdout"));
        }
        let line = line.trim().to_string();
        trace!(line = %line, "engine ->");
        Ok(line)
    }

    async fn wait_for(&mut self, token: &str, deadline: Duration) -> Result<()> {
        timeout(deadline, async {
            loop {
                if self.read_line().await?.starts_with(token) {
                    return Ok(());
                }
            }
        })
        .await
        .map_err(|_| anyhow!("engine did not answer '{token}' within {deadline:?}"))?
    }

    async fn set_position(&mut self, board: &Board) -> Result<()> {
        self.send(&format!("position fen {}", board.fen())).await
    }

    /// Stop any running search and drain its bestmove so the next
    /// command starts from a quiet protocol state.
    async fn halt(&mut self) -> Result<()> {
        if !self.pondering {
            return Ok(());
        }
        self.pondering = false;
        self.send("stop").await?;
        self.wait_for("bestmove", PROTOCOL_TIMEOUT).await
    }
}

/// Last `score` seen in the info stream, from our perspective.
fn parse_info_score(line: &str) -> Option<Eval> {
    let mut tokens = line.split_whitespace();
    while let Some(token) = tokens.next() {
        if token != "score" {
            continue;
        }
        let kind = tokens.next()?;
        let value: i32 = tokens.next()?.parse().ok()?;
        return match kind {
            "cp" => Some(Eval::Cp(value)),
            "mate" => Some(Eval::Mate(value)),
            _ => None,
        };
    }
    None
}

fn parse_bestmove(line: &str) -> Option<&str> {
    let mut tokens = line.split_whitespace();
    match tokens.next()? {
        "bestmove" => tokens.next(),
        _ => None,
    }
}

#[async_trait]
impl Engine for UciEngine {
    async fn search(
        &mut self,
        board: &Board,
        _clock: &ClockState,
        limit: &ThinkLimit,
    ) -> Result<Option<SearchReply>> {
        self.halt().await?;
        self.set_position(board).await?;
        self.send(&format!("go movetime {}", limit.total.as_millis()))
            .await?;

        let deadline = limit.total + SEARCH_GRACE;
        let mut eval = None;
        let reply = timeout(deadline, async {
            loop {
                let line = self.read_line().await?;
                if line.starts_with("info") {
                    if let Some(score) = parse_info_score(&line) {
                        eval = Some(score);
                    }
                    continue;
                }
                if let Some(token) = parse_bestmove(&line) {
                    if token == "(none)" || token == "0000" {
                        return Ok::<_, anyhow::Error>(None);
                    }
                    let uci = token
                        .parse()
                        .map_err(|_| anyhow!("engine returned bad uci '{token}'"))?;
                    return Ok(Some(uci));
                }
            }
        })
        .await
        .map_err(|_| anyhow!("engine produced no bestmove within {deadline:?}"))??;

        Ok(reply.map(|uci| SearchReply { uci, eval }))
    }

    async fn start_ponder(&mut self, board: &Board) -> Result<()> {
        self.halt().await?;
        self.set_position(board).await?;
        self.send("go infinite").await?;
        self.pondering = true;
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.halt().await?;
        self.send("quit").await.ok();
        if timeout(Duration::from_secs(2), self.child.wait())
            .await
            .is_err()
        {
            warn!("engine ignored quit, killing process");
            self.child.kill().await.ok();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_line_yields_centipawn_score() {
        let line = "info depth 20 seldepth 28 multipv 1 score cp 35 nodes 1824251 pv e2e4 e7e5";
        assert_eq!(parse_info_score(line), Some(Eval::Cp(35)));
    }

    #[test]
    fn info_line_yields_negative_mate_score() {
        let line = "info depth 31 score mate -3 nodes 4212 pv a2a1";
        assert_eq!(parse_info_score(line), Some(Eval::Mate(-3)));
    }

    #[test]
    fn info_line_without_score_is_ignored() {
        assert_eq!(parse_info_score("info depth 5 currmove e2e4"), None);
        assert_eq!(parse_info_score("info string low memory"), None);
    }

    #[test]
    fn bestmove_line_yields_move_token() {
        assert_eq!(parse_bestmove("bestmove e2e4 ponder e7e5"), Some("e2e4"));
        assert_eq!(parse_bestmove("bestmove g1f3"), Some("g1f3"));
    }

    #[test]
    fn non_bestmove_lines_are_ignored() {
        assert_eq!(parse_bestmove("info depth 1"), None);
        assert_eq!(parse_bestmove("readyok"), None);
    }

    #[test]
    fn bestmove_none_token_passes_through() {
        assert_eq!(parse_bestmove("bestmove (none)"), Some("(none)"));
    }
}
