//! File-backed cooldown store.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::PathBuf;

use super::{CooldownStore, CooldownTable};

pub struct FileCooldownStore {
    path: PathBuf,
}

impl FileCooldownStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl CooldownStore for FileCooldownStore {
    async fn load(&self) -> Result<CooldownTable> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => serde_json::from_str(&content)
                .with_context(|| format!("corrupt cooldown table at {}", self.path.display())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(CooldownTable::default()),
            Err(e) => Err(e)
                .with_context(|| format!("failed to read cooldown table at {}", self.path.display())),
        }
    }

    async fn save(&self, table: &CooldownTable) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        let json = serde_json::to_vec_pretty(table)?;
        // Write to a sibling temp file and rename over the target; the
        // rename is atomic, so a crash mid-save never truncates the table.
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, &json)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::OpponentRecord;
    use chrono::Utc;

    #[tokio::test]
    async fn missing_file_loads_as_empty_table() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCooldownStore::new(dir.path().join("matchmaking.json"));
        let table = store.load().await.unwrap();
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn table_survives_a_save_load_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("matchmaking.json");
        let store = FileCooldownStore::new(&path);

        let mut table = CooldownTable::default();
        let mut record = OpponentRecord::fresh(Utc::now());
        record.multiplier = 3;
        table.set("rival", "blitz", record);
        store.save(&table).await.unwrap();

        let restored = store.load().await.unwrap();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored.get("rival", "blitz").unwrap().multiplier, 3);
        // No temp file left behind.
        assert!(!path.with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn save_creates_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/data/matchmaking.json");
        let store = FileCooldownStore::new(&path);
        store.save(&CooldownTable::default()).await.unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn corrupt_table_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("matchmaking.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();
        let store = FileCooldownStore::new(&path);
        let err = store.load().await.unwrap_err();
        assert!(err.to_string().contains("corrupt"));
    }
}
