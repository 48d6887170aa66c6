//! Game Module
//!
//! Local mirror of server-authoritative state. No I/O happens here; the
//! network layer feeds decoded events in and reads snapshots out.
//!
//! ## Module Structure
//!
//! - `state`: Match, paddles, scores, tournaments, lobby listings
//! - `reconciler`: Precedence rules for applying match updates
//! - `input`: Key press state and the periodic intent sender

pub mod input;
pub mod reconciler;
pub mod state;

// Re-export key types
pub use input::{Direction, InputState, InputThrottler};
pub use reconciler::{ApplyOutcome, MatchReconciler};
pub use state::{GameListing, GameOver, Match, MatchStatus, Paddle, Point, Tournament};
