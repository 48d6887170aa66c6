//! Protocol Messages
//!
//! Wire format for client-server communication over the WebSocket.
//! Every frame is a newline-free JSON text.
//!
//! Outbound frames wrap the request in a payload:
//! `{"target_endpoint": "pong-api", "payload": {"type": .., "pong_data": {..}}}`
//!
//! Inbound frames are flat:
//! `{"target_endpoint": "pong-api", "type": .., <kind-specific fields>}`

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::game::input::Direction;
use crate::game::state::{GameListing, GameOver, Match};
use crate::NAMESPACE;

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Requests sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "pong_data", rename_all = "snake_case")]
pub enum ClientRequest {
    /// Create a remote game.
    CreateGame(CreateGameData),

    /// Join a waiting game.
    JoinGame(JoinGameData),

    /// Paddle intent for one tick.
    Input(InputData),

    /// Ask for the joinable games.
    GameList {},

    /// Ask for the joinable tournaments.
    TournamentList {},

    /// Create a four-player tournament.
    CreateTournament(CreateTournamentData),

    /// Join a waiting tournament.
    JoinTournament(JoinTournamentData),
}

/// Game creation parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateGameData {
    /// Alias shown to the opponent.
    pub player_alias: String,
    /// Always `remote` for this client.
    pub game_mode: String,
    /// Local opponent name (unused for remote games).
    pub local_opponent: String,
}

/// Game join parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinGameData {
    /// Joining user's name.
    #[serde(rename = "OpponentName")]
    pub opponent_name: String,
    /// Joining user's alias.
    #[serde(rename = "OpponentAlias")]
    pub opponent_alias: String,
    /// Game to join.
    #[serde(rename = "gameId")]
    pub game_id: String,
}

/// Paddle intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputData {
    /// Sending user's name.
    pub user_id: String,
    /// `true` for up, `false` for down.
    pub up: bool,
}

/// Tournament creation parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTournamentData {
    /// Alias shown in the bracket.
    pub player_alias: String,
    /// Always `remote` for this client.
    pub game_mode: String,
    /// Unused for remote tournaments.
    pub local_opponent: String,
    /// Bracket size.
    pub amount_players: usize,
    /// Always `true`.
    pub tournament: bool,
}

/// Tournament join parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinTournamentData {
    /// Joining user's alias.
    #[serde(rename = "OpponentAlias")]
    pub opponent_alias: String,
    /// Tournament to join.
    #[serde(rename = "gameId")]
    pub game_id: String,
}

impl ClientRequest {
    /// Remote game creation.
    pub fn create_game(alias: impl Into<String>) -> Self {
        ClientRequest::CreateGame(CreateGameData {
            player_alias: alias.into(),
            game_mode: "remote".to_string(),
            local_opponent: String::new(),
        })
    }

    /// Join an existing game.
    pub fn join_game(user_id: impl Into<String>, alias: impl Into<String>, game_id: impl Into<String>) -> Self {
        ClientRequest::JoinGame(JoinGameData {
            opponent_name: user_id.into(),
            opponent_alias: alias.into(),
            game_id: game_id.into(),
        })
    }

    /// Paddle intent.
    pub fn input(user_id: &str, direction: Direction) -> Self {
        ClientRequest::Input(InputData {
            user_id: user_id.to_string(),
            up: direction == Direction::Up,
        })
    }

    /// Tournament creation with the fixed bracket size.
    pub fn create_tournament(alias: impl Into<String>) -> Self {
        ClientRequest::CreateTournament(CreateTournamentData {
            player_alias: alias.into(),
            game_mode: "remote".to_string(),
            local_opponent: String::new(),
            amount_players: crate::TOURNAMENT_MAX_PLAYERS,
            tournament: true,
        })
    }

    /// Join an existing tournament.
    pub fn join_tournament(alias: impl Into<String>, tournament_id: impl Into<String>) -> Self {
        ClientRequest::JoinTournament(JoinTournamentData {
            opponent_alias: alias.into(),
            game_id: tournament_id.into(),
        })
    }

    /// Wire kind, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientRequest::CreateGame(_) => "create_game",
            ClientRequest::JoinGame(_) => "join_game",
            ClientRequest::Input(_) => "input",
            ClientRequest::GameList {} => "game_list",
            ClientRequest::TournamentList {} => "tournament_list",
            ClientRequest::CreateTournament(_) => "create_tournament",
            ClientRequest::JoinTournament(_) => "join_tournament",
        }
    }

    /// Serialize wrapped in the namespace envelope.
    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&OutboundEnvelope { target_endpoint: NAMESPACE, payload: self })
    }
}

#[derive(Serialize)]
struct OutboundEnvelope<'a> {
    target_endpoint: &'a str,
    payload: &'a ClientRequest,
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Events received from the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Application error (e.g. game full).
    Error {
        /// Error details.
        #[serde(default)]
        pong_data: FaultData,
    },

    /// Joinable games.
    GameList {
        /// Listed games.
        #[serde(default)]
        games: Vec<GameListing>,
    },

    /// Match state update.
    GameState {
        /// Full snapshot.
        game: Match,
    },

    /// Create/join acknowledgment.
    GameCreated {
        /// Issued identifier.
        #[serde(rename = "gameId")]
        game_id: String,
    },

    /// Match finished.
    GameOver {
        /// Final payload.
        #[serde(default)]
        pong_data: GameOver,
    },

    /// Joinable tournaments.
    TournamentList {
        /// Listed tournaments.
        #[serde(default)]
        games: Vec<GameListing>,
    },

    /// Tournament finished.
    TournamentEnd {
        /// Human-readable summary.
        #[serde(default)]
        value: String,
    },

    /// Countdown before a match starts.
    Countdown {
        /// Seconds left.
        #[serde(default)]
        value: u32,
    },

    /// Any kind this client does not handle.
    #[serde(other)]
    Unknown,
}

/// Server-reported error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultData {
    /// Human-readable message.
    #[serde(default = "default_fault_message")]
    pub message: String,
    /// Error code.
    #[serde(default = "default_fault_code")]
    pub code: i64,
}

impl Default for FaultData {
    fn default() -> Self {
        Self { message: default_fault_message(), code: default_fault_code() }
    }
}

fn default_fault_message() -> String {
    "Unknown error".to_string()
}

fn default_fault_code() -> i64 {
    500
}

impl ServerEvent {
    /// Wire kind, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::Error { .. } => "error",
            ServerEvent::GameList { .. } => "game_list",
            ServerEvent::GameState { .. } => "game_state",
            ServerEvent::GameCreated { .. } => "game_created",
            ServerEvent::GameOver { .. } => "game_over",
            ServerEvent::TournamentList { .. } => "tournament_list",
            ServerEvent::TournamentEnd { .. } => "tournament_end",
            ServerEvent::Countdown { .. } => "countdown",
            ServerEvent::Unknown => "unknown",
        }
    }
}

/// Why an inbound frame was dropped.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Not JSON, or a known kind with a malformed body.
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),
    /// Addressed to another namespace (or to none).
    #[error("foreign destination: {0:?}")]
    ForeignNamespace(Option<String>),
}

/// Decode an inbound text frame addressed to this client.
pub fn decode_frame(text: &str) -> Result<ServerEvent, DecodeError> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    let target = value.get("target_endpoint").and_then(|t| t.as_str());
    if target != Some(NAMESPACE) {
        return Err(DecodeError::ForeignNamespace(target.map(str::to_string)));
    }
    Ok(serde_json::from_value(value)?)
}
