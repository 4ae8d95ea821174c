//! reqwest backends behind the online move-source traits.
//!
//! Each backend is a thin query-and-parse adapter; gating, timeouts and
//! clock charging live in the decision crate. Parsing is split into pure
//! functions so response handling is testable without a server.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use decision_core::board::Board;
use decision_core::score::Eval;
use decision_core::sources::{
    EgtbBackend, EgtbReply, KnowledgeBackend, Lookup, TableEntry, TablebaseProber, Wdl,
};
use decision_core::GameMeta;

/// Opening explorer: plays the most-played move from master/lichess games.
pub struct ExplorerBackend {
    client: Client,
    base: String,
}

impl ExplorerBackend {
    pub fn new(client: Client, base: &str) -> Self {
        Self {
            client,
            base: base.trim_end_matches('/').to_string(),
        }
    }
}

#[derive(Deserialize)]
struct ExplorerResponse {
    #[serde(default)]
    moves: Vec<ExplorerMove>,
}

#[derive(Deserialize)]
struct ExplorerMove {
    uci: String,
    #[serde(default)]
    white: u64,
    #[serde(default)]
    draws: u64,
    #[serde(default)]
    black: u64,
}

fn parse_explorer(body: &str) -> Result<Option<Lookup>> {
    let resp: ExplorerResponse = serde_json::from_str(body)?;
    let best = resp
        .moves
        .iter()
        .max_by_key(|m| m.white + m.draws + m.black);
    match best {
        Some(m) => Ok(Some(Lookup {
            uci: m
                .uci
                .parse()
                .map_err(|_| anyhow!("explorer returned bad uci '{}'", m.uci))?,
            eval: None,
        })),
        None => Ok(None),
    }
}

#[async_trait]
impl KnowledgeBackend for ExplorerBackend {
    async fn query(&self, board: &Board, meta: &GameMeta) -> Result<Option<Lookup>> {
        let fen = board.fen();
        let resp = self
            .client
            .get(format!("{}/lichess", self.base))
            .query(&[
                ("variant", meta.variant.as_str()),
                ("speeds", meta.speed.as_str()),
                ("fen", fen.as_str()),
            ])
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = resp.error_for_status()?.text().await?;
        parse_explorer(&body)
    }
}

/// Cloud evaluation cache: plays the top engine line when the position
/// has been analyzed before, carrying the evaluation into the history.
pub struct CloudEvalBackend {
    client: Client,
    base: String,
}

impl CloudEvalBackend {
    pub fn new(client: Client, base: &str) -> Self {
        Self {
            client,
            base: base.trim_end_matches('/').to_string(),
        }
    }
}

#[derive(Deserialize)]
struct CloudEvalResponse {
    #[serde(default)]
    pvs: Vec<CloudPv>,
}

#[derive(Deserialize)]
struct CloudPv {
    moves: String,
    #[serde(default)]
    cp: Option<i32>,
    #[serde(default)]
    mate: Option<i32>,
}

fn parse_cloud_eval(body: &str) -> Result<Option<Lookup>> {
    let resp: CloudEvalResponse = serde_json::from_str(body)?;
    let Some(pv) = resp.pvs.first() else {
        return Ok(None);
    };
    let Some(first) = pv.moves.split_whitespace().next() else {
        return Ok(None);
    };
    let eval = match (pv.mate, pv.cp) {
        (Some(mate), _) => Some(Eval::Mate(mate)),
        (None, Some(cp)) => Some(Eval::Cp(cp)),
        (None, None) => None,
    };
    Ok(Some(Lookup {
        uci: first
            .parse()
            .map_err(|_| anyhow!("cloud eval returned bad uci '{first}'"))?,
        eval,
    }))
}

#[async_trait]
impl KnowledgeBackend for CloudEvalBackend {
    async fn query(&self, board: &Board, _meta: &GameMeta) -> Result<Option<Lookup>> {
        let fen = board.fen();
        let resp = self
            .client
            .get(format!("{}/api/cloud-eval", self.base))
            .query(&[("fen", fen.as_str()), ("multiPv", "1")])
            .send()
            .await?;
        // 404 is the documented "position not in the cache" answer.
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = resp.error_for_status()?.text().await?;
        parse_cloud_eval(&body)
    }
}

/// External move database (chessdb.cn style querybest endpoint).
pub struct ChessDbBackend {
    client: Client,
    base: String,
}

impl ChessDbBackend {
    pub fn new(client: Client, base: &str) -> Self {
        Self {
            client,
            base: base.trim_end_matches('/').to_string(),
        }
    }
}

#[derive(Deserialize)]
struct ChessDbResponse {
    status: String,
    #[serde(default, rename = "move")]
    best: Option<String>,
}

fn parse_chessdb(body: &str) -> Result<Option<Lookup>> {
    let resp: ChessDbResponse = serde_json::from_str(body)?;
    if resp.status != "ok" {
        return Ok(None);
    }
    let Some(best) = resp.best else {
        return Ok(None);
    };
    Ok(Some(Lookup {
        uci: best
            .parse()
            .map_err(|_| anyhow!("external db returned bad uci '{best}'"))?,
        eval: None,
    }))
}

#[async_trait]
impl KnowledgeBackend for ChessDbBackend {
    async fn query(&self, board: &Board, _meta: &GameMeta) -> Result<Option<Lookup>> {
        let fen = board.fen();
        let body = self
            .client
            .get(format!("{}/cdb.php", self.base))
            .query(&[
                ("action", "querybest"),
                ("json", "1"),
                ("board", fen.as_str()),
            ])
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        parse_chessdb(&body)
    }
}

/// Online syzygy tablebase service. Serves both the exact per-move prober
/// and the single-best-move endgame backend from the same endpoint.
pub struct TablebaseBackend {
    client: Client,
    base: String,
}

impl TablebaseBackend {
    pub fn new(client: Client, base: &str) -> Self {
        Self {
            client,
            base: base.trim_end_matches('/').to_string(),
        }
    }

    async fn fetch(&self, board: &Board) -> Result<Option<String>> {
        let fen = board.fen();
        let resp = self
            .client
            .get(format!("{}/standard", self.base))
            .query(&[("fen", fen.as_str())])
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(resp.error_for_status()?.text().await?))
    }
}

#[derive(Deserialize)]
struct TablebaseResponse {
    #[serde(default)]
    moves: Vec<TablebaseMove>,
}

#[derive(Deserialize)]
struct TablebaseMove {
    uci: String,
    category: String,
    #[serde(default)]
    dtz: Option<i32>,
}

/// Per-move categories are reported from the perspective of the side to
/// move after the move, so a move leaving the opponent lost is a win for
/// us. Uncertain categories are dropped.
fn invert_category(category: &str) -> Option<Wdl> {
    match category {
        "loss" => Some(Wdl::Win),
        "blessed-loss" => Some(Wdl::CursedWin),
        "draw" => Some(Wdl::Draw),
        "cursed-win" => Some(Wdl::BlessedLoss),
        "win" => Some(Wdl::Loss),
        _ => None,
    }
}

fn parse_tablebase_moves(body: &str) -> Result<Option<Vec<(shakmaty::uci::UciMove, TableEntry)>>> {
    let resp: TablebaseResponse = serde_json::from_str(body)?;
    let mut entries = Vec::with_capacity(resp.moves.len());
    for m in &resp.moves {
        let Some(wdl) = invert_category(&m.category) else {
            continue;
        };
        let uci = m
            .uci
            .parse()
            .map_err(|_| anyhow!("tablebase returned bad uci '{}'", m.uci))?;
        let dtz = m.dtz.unwrap_or(0).unsigned_abs();
        entries.push((uci, TableEntry { wdl, dtz }));
    }
    if entries.is_empty() {
        return Ok(None);
    }
    Ok(Some(entries))
}

/// The service sorts moves best-first, so the top usable entry is the
/// best move of the position.
fn parse_tablebase_best(body: &str) -> Result<Option<EgtbReply>> {
    let resp: TablebaseResponse = serde_json::from_str(body)?;
    for m in &resp.moves {
        let Some(wdl) = invert_category(&m.category) else {
            continue;
        };
        let uci = m
            .uci
            .parse()
            .map_err(|_| anyhow!("tablebase returned bad uci '{}'", m.uci))?;
        return Ok(Some(EgtbReply {
            uci,
            wdl,
            dtz: m.dtz.unwrap_or(0).unsigned_abs(),
        }));
    }
    Ok(None)
}

#[async_trait]
impl TablebaseProber for TablebaseBackend {
    async fn probe(
        &self,
        board: &Board,
    ) -> Result<Option<Vec<(shakmaty::uci::UciMove, TableEntry)>>> {
        match self.fetch(board).await? {
            Some(body) => parse_tablebase_moves(&body),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl EgtbBackend for TablebaseBackend {
    async fn probe(&self, board: &Board, _meta: &GameMeta) -> Result<Option<EgtbReply>> {
        match self.fetch(board).await? {
            Some(body) => parse_tablebase_best(&body),
            None => Ok(None),
        }
    }
}
