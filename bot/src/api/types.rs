//! Typed wire events and objects from the server streams.

use serde::Deserialize;

/// Account-level event stream.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Event {
    Challenge { challenge: Challenge },
    ChallengeCanceled { challenge: Challenge },
    ChallengeDeclined { challenge: Challenge },
    GameStart { game: GameEventInfo },
    GameFinish { game: GameEventInfo },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Challenge {
    pub id: String,
    pub challenger: ChallengeUser,
    pub variant: Variant,
    pub speed: String,
    pub rated: bool,
    #[serde(default)]
    pub time_control: TimeControl,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeUser {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub rating: Option<u32>,
}

impl ChallengeUser {
    pub fn is_bot(&self) -> bool {
        self.title.as_deref() == Some("BOT")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Variant {
    pub key: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TimeControl {
    Clock {
        /// Initial time in seconds.
        limit: u64,
        /// Increment in seconds.
        increment: u64,
    },
    Correspondence {
        #[serde(rename = "daysPerTurn")]
        days_per_turn: u64,
    },
    #[default]
    Unlimited,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GameEventInfo {
    /// The event object carries both `gameId` and a redundant `id`
    /// alias; only the former is read.
    #[serde(rename = "gameId")]
    pub id: String,
}

/// Per-game event stream.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum GameEvent {
    GameFull(GameFull),
    GameState(GameState),
    ChatLine {
        room: String,
        username: String,
        text: String,
    },
    OpponentGone {
        gone: bool,
        #[serde(rename = "claimWinInSeconds")]
        claim_win_in_seconds: Option<u64>,
    },
}

/// Initial full snapshot of one game.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameFull {
    pub id: String,
    pub rated: bool,
    pub variant: Variant,
    pub speed: String,
    #[serde(default)]
    pub clock: Option<ClockInfo>,
    pub white: Player,
    pub black: Player,
    #[serde(default)]
    pub initial_fen: Option<String>,
    pub state: GameState,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ClockInfo {
    /// Initial time in milliseconds.
    pub initial: u64,
    /// Increment in milliseconds.
    pub increment: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Player {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub rating: Option<u32>,
}

impl Player {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("Anonymous")
    }

    pub fn is_bot(&self) -> bool {
        self.title.as_deref() == Some("BOT")
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameState {
    /// Space-separated UCI move list from the start of the game.
    pub moves: String,
    pub wtime: u64,
    pub btime: u64,
    pub winc: u64,
    pub binc: u64,
    pub status: GameStatus,
    #[serde(default)]
    pub winner: Option<String>,
    #[serde(default)]
    pub wdraw: bool,
    #[serde(default)]
    pub bdraw: bool,
}

impl GameState {
    pub fn move_count(&self) -> usize {
        self.moves.split_whitespace().count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GameStatus {
    Created,
    Started,
    Aborted,
    Mate,
    Resign,
    Stalemate,
    Timeout,
    Draw,
    Outoftime,
    Cheat,
    NoStart,
    UnknownFinish,
    VariantEnd,
}

impl GameStatus {
    pub fn is_ongoing(self) -> bool {
        matches!(self, GameStatus::Created | GameStatus::Started)
    }
}

/// One entry from the online-bots roster.
#[derive(Debug, Clone, Deserialize)]
pub struct BotUser {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub perfs: std::collections::HashMap<String, Perf>,
}

impl BotUser {
    pub fn rating(&self, perf: &str) -> Option<i32> {
        self.perfs
            .get(perf)
            .filter(|p| !p.prov)
            .map(|p| p.rating as i32)
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Perf {
    pub rating: u32,
    #[serde(default)]
    pub prov: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserStatus {
    pub id: String,
    #[serde(default)]
    pub online: bool,
    #[serde(default)]
    pub playing: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn challenge_event_decodes() {
        let line = r#"{"type":"challenge","challenge":{"id":"abc123","challenger":{"id":"rival","name":"Rival","title":"BOT","rating":2100},"variant":{"key":"standard"},"speed":"blitz","rated":true,"timeControl":{"type":"clock","limit":300,"increment":3}}}"#;
        let event: Event = serde_json::from_str(line).unwrap();
        match event {
            Event::Challenge { challenge } => {
                assert_eq!(challenge.id, "abc123");
                assert!(challenge.challenger.is_bot());
                assert!(matches!(
                    challenge.time_control,
                    TimeControl::Clock {
                        limit: 300,
                        increment: 3
                    }
                ));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn game_start_event_decodes() {
        let line = r#"{"type":"gameStart","game":{"gameId":"xyz","fullId":"xyzfull"}}"#;
        let event: Event = serde_json::from_str(line).unwrap();
        match event {
            Event::GameStart { game } => assert_eq!(game.id, "xyz"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn game_full_decodes() {
        let line = r#"{"type":"gameFull","id":"xyz","rated":false,"variant":{"key":"standard"},"speed":"blitz","clock":{"initial":300000,"increment":3000},"white":{"id":"us","name":"Squire","title":"BOT","rating":2000},"black":{"id":"them","name":"Them","rating":1990},"state":{"type":"gameState","moves":"","wtime":300000,"btime":300000,"winc":3000,"binc":3000,"status":"started"}}"#;
        let event: GameEvent = serde_json::from_str(line).unwrap();
        match event {
            GameEvent::GameFull(full) => {
                assert_eq!(full.id, "xyz");
                assert!(full.white.is_bot());
                assert!(!full.black.is_bot());
                assert!(full.state.status.is_ongoing());
                assert_eq!(full.state.move_count(), 0);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn terminal_game_state_decodes() {
        let line = r#"{"type":"gameState","moves":"e2e4 e7e5 d1h5 b8c6 f1c4 g8f6 h5f7","wtime":295000,"btime":284000,"winc":3000,"binc":3000,"status":"mate","winner":"white"}"#;
        let event: GameEvent = serde_json::from_str(line).unwrap();
        match event {
            GameEvent::GameState(state) => {
                assert_eq!(state.status, GameStatus::Mate);
                assert!(!state.status.is_ongoing());
                assert_eq!(state.winner.as_deref(), Some("white"));
                assert_eq!(state.move_count(), 7);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn opponent_gone_decodes() {
        let line = r#"{"type":"opponentGone","gone":true,"claimWinInSeconds":8}"#;
        let event: GameEvent = serde_json::from_str(line).unwrap();
        assert!(matches!(
            event,
            GameEvent::OpponentGone {
                gone: true,
                claim_win_in_seconds: Some(8)
            }
        ));
    }

    #[test]
    fn provisional_ratings_are_hidden() {
        let json = r#"{"id":"b1","username":"B1","perfs":{"blitz":{"rating":1900,"prov":true},"bullet":{"rating":2200}}}"#;
        let bot: BotUser = serde_json::from_str(json).unwrap();
        assert_eq!(bot.rating("blitz"), None);
        assert_eq!(bot.rating("bullet"), Some(2200));
        assert_eq!(bot.rating("rapid"), None);
    }
}
