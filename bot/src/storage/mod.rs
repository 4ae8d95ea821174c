//! Persistence for matchmaking state.
//!
//! The cooldown table remembers, per opponent and speed, when we may
//! challenge them again, the escalation multiplier behind that timeout,
//! and which color to offer next. It survives restarts through the
//! [`CooldownStore`] trait.

pub mod file;

pub use file::FileCooldownStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Color we request for the next outgoing challenge to an opponent;
/// alternates after every completed matchmade game.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeColor {
    White,
    Black,
}

impl ChallengeColor {
    pub fn flipped(self) -> Self {
        match self {
            ChallengeColor::White => ChallengeColor::Black,
            ChallengeColor::Black => ChallengeColor::White,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChallengeColor::White => "white",
            ChallengeColor::Black => "black",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpponentRecord {
    /// Earliest moment this opponent may be challenged again.
    pub next_eligible: DateTime<Utc>,
    /// Timeout escalation multiplier; grows on failures, decays on
    /// successes.
    pub multiplier: u32,
    pub preferred_color: ChallengeColor,
}

impl OpponentRecord {
    pub fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            next_eligible: now,
            multiplier: 1,
            preferred_color: ChallengeColor::White,
        }
    }
}

/// All opponent records, keyed by `opponent/perf`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CooldownTable {
    #[serde(default)]
    records: HashMap<String, OpponentRecord>,
}

impl CooldownTable {
    fn key(opponent: &str, perf: &str) -> String {
        format!("{opponent}/{perf}")
    }

    pub fn get(&self, opponent: &str, perf: &str) -> Option<&OpponentRecord> {
        self.records.get(&Self::key(opponent, perf))
    }

    pub fn set(&mut self, opponent: &str, perf: &str, record: OpponentRecord) {
        self.records.insert(Self::key(opponent, perf), record);
    }

    pub fn is_cooling(&self, opponent: &str, perf: &str, now: DateTime<Utc>) -> bool {
        self.get(opponent, perf)
            .is_some_and(|r| r.next_eligible > now)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Where the cooldown table lives between restarts.
#[async_trait]
pub trait CooldownStore: Send + Sync {
    async fn load(&self) -> anyhow::Result<CooldownTable>;
    async fn save(&self, table: &CooldownTable) -> anyhow::Result<()>;
}
