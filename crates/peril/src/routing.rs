//! Exchange names, routing keys and message types shared by the Peril
//! server and clients.

use serde::{Deserialize, Serialize};

/// Direct exchange carrying server-wide control messages.
pub const EXCHANGE_PERIL_DIRECT: &str = "peril_direct";
/// Topic exchange carrying game events and logs.
pub const EXCHANGE_PERIL_TOPIC: &str = "peril_topic";
/// Fanout exchange rejected messages are dead-lettered to.
pub const EXCHANGE_PERIL_DLX: &str = "peril_dlx";

/// Routing key for [`PlayingState`] messages.
pub const PAUSE_KEY: &str = "pause";
/// Routing key prefix for [`GameLog`] messages (`game_logs.<username>`).
pub const GAME_LOG_SLUG: &str = "game_logs";

/// Queue a client consumes pause state from: `pause.<username>`.
pub fn pause_queue(username: &str) -> String {
    format!("{PAUSE_KEY}.{username}")
}

/// Routing key a client publishes its game logs under.
pub fn game_log_key(username: &str) -> String {
    format!("{GAME_LOG_SLUG}.{username}")
}

/// Binding key matching every player's game logs.
pub fn game_log_pattern() -> String {
    format!("{GAME_LOG_SLUG}.*")
}

/// Whether the game is paused. Published by the server on
/// [`EXCHANGE_PERIL_DIRECT`] under [`PAUSE_KEY`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PlayingState {
    #[serde(rename = "IsPaused")]
    pub is_paused: bool,
}

/// A line of game history sent by a client to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameLog {
    #[serde(rename = "CurrentTime")]
    pub current_time: String,
    #[serde(rename = "Message")]
    pub message: String,
    #[serde(rename = "Username")]
    pub username: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_and_key_names() {
        assert_eq!(pause_queue("lincoln"), "pause.lincoln");
        assert_eq!(game_log_key("grant"), "game_logs.grant");
        assert_eq!(game_log_pattern(), "game_logs.*");
    }

    #[test]
    fn test_playing_state_wire_shape() {
        let json = serde_json::to_string(&PlayingState { is_paused: true }).unwrap();
        assert_eq!(json, r#"{"IsPaused":true}"#);

        let state: PlayingState = serde_json::from_str(r#"{"IsPaused":false}"#).unwrap();
        assert!(!state.is_paused);
    }

    #[test]
    fn test_game_log_wire_shape() {
        let log: GameLog = serde_json::from_str(
            r#"{"CurrentTime":"2024-01-01T00:00:00Z","Message":"attack","Username":"grant"}"#,
        )
        .unwrap();
        assert_eq!(log.username, "grant");
        assert_eq!(log.message, "attack");
    }
}
