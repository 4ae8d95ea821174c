//! Per-game assembly of the move-source chain from configuration.
//!
//! Each game gets its own engine process and its own chain; book data is
//! loaded once at startup and cloned into every game.

use anyhow::{anyhow, Context, Result};
use reqwest::Client;
use std::collections::HashMap;
use std::time::Duration;
use tracing::info;

use decision_core::sources::{
    BookEntry, BookReader, BookSource, EngineSource, MemoryBook, MoveSourceChain,
    OnlineEgtbSource, OnlineSource, TablebaseSource,
};

use crate::backends::{ChessDbBackend, CloudEvalBackend, ExplorerBackend, TablebaseBackend};
use crate::central_config::CentralConfig;
use crate::uci::UciEngine;

#[derive(serde::Deserialize)]
struct BookFileEntry {
    uci: String,
    #[serde(default = "default_weight")]
    weight: u16,
}

fn default_weight() -> u16 {
    1
}

/// Load the configured JSON books. Each file maps a FEN to its weighted
/// move list:
///
/// ```json
/// { "<fen>": [{ "uci": "e2e4", "weight": 70 }, ...] }
/// ```
pub fn load_books(paths: &[String]) -> Result<Vec<MemoryBook>> {
    let mut books = Vec::with_capacity(paths.len());
    for path in paths {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read book '{path}'"))?;
        let raw: HashMap<String, Vec<BookFileEntry>> = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse book '{path}'"))?;
        let positions = raw.len();
        let mut book = MemoryBook::new();
        for (fen, entries) in raw {
            let mut line = Vec::with_capacity(entries.len());
            for entry in entries {
                let uci = entry
                    .uci
                    .parse()
                    .map_err(|_| anyhow!("bad uci '{}' in book '{path}'", entry.uci))?;
                line.push(BookEntry {
                    uci,
                    weight: entry.weight,
                });
            }
            book.insert(&fen, line);
        }
        info!(path, positions, "loaded opening book");
        books.push(book);
    }
    Ok(books)
}

/// Build the chain for one game: spawn a fresh engine process, then add
/// the enabled exact and ranked sources around it.
pub async fn build_chain(
    cfg: &CentralConfig,
    engine_path: &str,
    client: &Client,
    books: &[MemoryBook],
) -> Result<MoveSourceChain> {
    let engine = UciEngine::spawn(engine_path, &cfg.engine.uci_options).await?;
    let overhead = Duration::from_millis(cfg.engine.move_overhead_ms);
    let mut chain = MoveSourceChain::new(EngineSource::new(Box::new(engine), overhead));

    if cfg.tablebase.enabled {
        let prober = TablebaseBackend::new(client.clone(), &cfg.server.tablebase_url);
        chain.push_exact(Box::new(TablebaseSource::new(
            Box::new(prober),
            cfg.tablebase.max_pieces,
        )));
    }
    if cfg.online_egtb.enabled {
        let backend = TablebaseBackend::new(client.clone(), &cfg.server.tablebase_url);
        chain.push_exact(Box::new(OnlineEgtbSource::new(
            Box::new(backend),
            cfg.online_egtb.clone(),
        )));
    }

    if cfg.book.enabled && !books.is_empty() {
        let readers: Vec<Box<dyn BookReader>> = books
            .iter()
            .cloned()
            .map(|book| Box::new(book) as Box<dyn BookReader>)
            .collect();
        chain.push_ranked(Box::new(BookSource::new(
            readers,
            cfg.book.selection,
            cfg.book.max_depth_plies,
            cfg.book.priority,
        )));
    }
    if cfg.explorer.enabled {
        let backend = ExplorerBackend::new(client.clone(), &cfg.server.explorer_url);
        chain.push_ranked(Box::new(OnlineSource::new(
            "explorer",
            Box::new(backend),
            cfg.explorer.clone(),
        )));
    }
    if cfg.cloud_eval.enabled {
        let backend = CloudEvalBackend::new(client.clone(), &cfg.server.url);
        chain.push_ranked(Box::new(OnlineSource::new(
            "cloud-eval",
            Box::new(backend),
            cfg.cloud_eval.clone(),
        )));
    }
    if cfg.external_db.enabled {
        let backend = ChessDbBackend::new(client.clone(), &cfg.server.chessdb_url);
        chain.push_ranked(Box::new(OnlineSource::new(
            "external-db",
            Box::new(backend),
            cfg.external_db.clone(),
        )));
    }

    Ok(chain)
}
