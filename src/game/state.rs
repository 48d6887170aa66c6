//! Match State Definitions
//!
//! Snapshot types for the mirrored match and tournament. Field names follow
//! the backend's camelCase JSON; coordinates are normalized to [0, 1].

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::TOURNAMENT_MAX_PLAYERS;

// =============================================================================
// MATCH STATUS
// =============================================================================

/// Lifecycle of a match (and of a tournament).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[derive(Default)]
pub enum MatchStatus {
    /// Waiting for an opponent.
    #[default]
    Waiting,
    /// Countdown before play starts.
    Countdown,
    /// Ball in play.
    Playing,
    /// Temporarily halted by the server.
    Paused,
    /// Terminal; no further updates are accepted.
    Finished,
}

impl MatchStatus {
    /// Whether the status is terminal.
    pub fn is_finished(self) -> bool {
        self == MatchStatus::Finished
    }
}

// =============================================================================
// GEOMETRY
// =============================================================================

/// Normalized 2D point.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// Horizontal position in [0, 1].
    #[serde(deserialize_with = "lenient_f64")]
    pub x: f64,
    /// Vertical position in [0, 1].
    #[serde(deserialize_with = "lenient_f64")]
    pub y: f64,
}

impl Point {
    /// Create a point.
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Field centre.
    pub const CENTER: Point = Point::new(0.5, 0.5);
}

/// A paddle: its top point and normalized height.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Paddle {
    /// Top point of the paddle.
    pub top_point: Point,
    /// Height as a fraction of the field height.
    #[serde(deserialize_with = "lenient_f64")]
    pub height: f64,
}

impl Paddle {
    /// Default left paddle before the first server update.
    pub const LEFT: Paddle = Paddle { top_point: Point::new(0.0, 0.4), height: 0.2 };
    /// Default right paddle before the first server update.
    pub const RIGHT: Paddle = Paddle { top_point: Point::new(0.99, 0.4), height: 0.2 };

    /// Vertical centre of the paddle.
    pub fn center_y(&self) -> f64 {
        self.top_point.y + self.height / 2.0
    }
}

/// Score of one side.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerScore {
    /// Player alias, if the server sent one.
    #[serde(default)]
    pub alias: Option<String>,
    /// Points.
    #[serde(default)]
    pub score: u32,
}

// =============================================================================
// MATCH
// =============================================================================

/// Mirrored state of one match.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Match {
    /// Server-issued identifier.
    pub id: String,
    /// Lifecycle status.
    pub status: MatchStatus,
    /// Ball position.
    pub ball: Point,
    /// Left paddle.
    pub left_paddle: Paddle,
    /// Right paddle.
    pub right_paddle: Paddle,
    /// Scores, left side first.
    #[serde(default)]
    pub scores: Vec<PlayerScore>,
    /// Countdown value while in countdown.
    #[serde(default)]
    pub countdown: Option<u32>,
    /// Server timestamp of this snapshot (ms since epoch).
    #[serde(default)]
    pub last_update_time: i64,
    /// Game mode label.
    #[serde(default)]
    pub game_mode: Option<String>,
    /// Score that ends the match.
    #[serde(default)]
    pub max_score: Option<u32>,
}

impl Match {
    /// Placeholder used between a create/join confirmation and the first
    /// `game_state` frame.
    pub fn placeholder(id: impl Into<String>, max_score: Option<u32>) -> Self {
        Self {
            id: id.into(),
            status: MatchStatus::Waiting,
            ball: Point::CENTER,
            left_paddle: Paddle::LEFT,
            right_paddle: Paddle::RIGHT,
            scores: Vec::new(),
            countdown: None,
            last_update_time: Utc::now().timestamp_millis(),
            game_mode: Some("classic".to_string()),
            max_score,
        }
    }

    /// Left side score.
    pub fn left_score(&self) -> u32 {
        self.scores.first().map(|s| s.score).unwrap_or(0)
    }

    /// Right side score.
    pub fn right_score(&self) -> u32 {
        self.scores.get(1).map(|s| s.score).unwrap_or(0)
    }

    /// Side currently ahead.
    pub fn winner(&self) -> Winner {
        match self.left_score().cmp(&self.right_score()) {
            std::cmp::Ordering::Greater => Winner::Left,
            std::cmp::Ordering::Less => Winner::Right,
            std::cmp::Ordering::Equal => Winner::Tie,
        }
    }

    /// Snapshot timestamp as UTC, if representable.
    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.last_update_time).single()
    }

    /// Whether the ball is in play.
    pub fn is_playing(&self) -> bool {
        self.status == MatchStatus::Playing
    }
}

/// Outcome of a match by side.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Winner {
    /// Left side scored more.
    Left,
    /// Right side scored more.
    Right,
    /// Equal scores.
    Tie,
}

/// Final payload of a `game_over` notice.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameOver {
    /// Identifier of the finished match.
    #[serde(default)]
    pub game_id: Option<String>,
    /// Winner's user id.
    #[serde(default)]
    pub winner_id: Option<String>,
    /// Final score.
    #[serde(default)]
    pub final_score: Option<FinalScore>,
    /// Anything else the server attached.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Final score of a finished match.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalScore {
    /// Left side points.
    #[serde(default)]
    pub left: u32,
    /// Right side points.
    #[serde(default)]
    pub right: u32,
}

// =============================================================================
// LOBBY & TOURNAMENT
// =============================================================================

/// One entry of a `game_list` or `tournament_list` snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameListing {
    /// Game or tournament identifier.
    pub id: String,
    /// Owner's username.
    #[serde(default)]
    pub owner: String,
    /// Owner's alias.
    #[serde(default)]
    pub alias: String,
    /// Lifecycle status.
    pub state: MatchStatus,
}

impl GameListing {
    /// Whether another player can still join.
    pub fn is_joinable(&self) -> bool {
        self.state == MatchStatus::Waiting
    }
}

/// A tournament participant.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TournamentPlayer {
    /// Username.
    pub name: String,
    /// Alias shown in the bracket.
    pub alias: String,
}

/// Tournament membership as seen by this client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tournament {
    /// Tournament identifier.
    pub id: String,
    /// Owner's username.
    pub owner: String,
    /// Owner's alias.
    pub owner_alias: String,
    /// Lifecycle status.
    pub state: MatchStatus,
    /// Known participants.
    pub players: Vec<TournamentPlayer>,
    /// Always [`TOURNAMENT_MAX_PLAYERS`].
    pub max_players: usize,
    /// End-of-tournament summary, once announced.
    pub summary: Option<String>,
}

impl Tournament {
    /// Freshly created tournament owned by `owner`.
    pub fn new(id: impl Into<String>, owner: impl Into<String>, owner_alias: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            owner: owner.into(),
            owner_alias: owner_alias.into(),
            state: MatchStatus::Waiting,
            players: Vec::new(),
            max_players: TOURNAMENT_MAX_PLAYERS,
            summary: None,
        }
    }

    /// Build from a lobby listing.
    pub fn from_listing(listing: &GameListing) -> Self {
        Self {
            state: listing.state,
            ..Self::new(listing.id.clone(), listing.owner.clone(), listing.alias.clone())
        }
    }

    /// Whether the bracket is full.
    pub fn is_full(&self) -> bool {
        self.players.len() >= self.max_players
    }

    /// Whether the tournament can start.
    pub fn can_start(&self) -> bool {
        self.is_full() && self.state == MatchStatus::Waiting
    }
}

// =============================================================================
// SERDE HELPERS
// =============================================================================

/// Accept a JSON number or a numeric string.
fn lenient_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrString {
        Number(f64),
        String(String),
    }

    match NumberOrString::deserialize(deserializer)? {
        NumberOrString::Number(n) => Ok(n),
        NumberOrString::String(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}
