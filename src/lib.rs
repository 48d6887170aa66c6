//! # Pong Client
//!
//! Remote session client for the pong backend. Authenticates a user, opens
//! one persistent WebSocket, mirrors exactly one live match (or tournament
//! match) and streams paddle intent back to the server.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       PONG CLIENT                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  config.rs       - Endpoints, timeouts, tick rates           │
//! │                                                              │
//! │  game/           - Local mirror (no I/O)                     │
//! │  ├── state.rs    - Match, paddles, scores, tournaments       │
//! │  ├── reconciler.rs - One-match-at-a-time state mirror        │
//! │  └── input.rs    - Key state and the 60 Hz input throttler   │
//! │                                                              │
//! │  network/        - Everything that touches a socket          │
//! │  ├── auth.rs     - Sign-in, 2FA, token validate/refresh      │
//! │  ├── protocol.rs - Wire envelopes                            │
//! │  ├── transport.rs- WebSocket send/receive loops              │
//! │  ├── dispatcher.rs - Frame decoding and routing              │
//! │  ├── client.rs   - Game-aware facade for the render layer    │
//! │  └── session.rs  - Fail-fast task orchestration              │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Failure model
//!
//! Anything that invalidates the shared connection or the session (auth
//! failure, socket closed, token no longer valid) unwinds every activity
//! together. Malformed frames are dropped and server-reported faults are
//! buffered for the UI. A deliberate shutdown is reported as
//! [`network::session::ExitReason::Graceful`], never as an error.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod game;
pub mod network;

// Re-export commonly used types
pub use config::ClientConfig;
pub use game::input::{Direction, InputState, InputThrottler};
pub use game::reconciler::MatchReconciler;
pub use game::state::{Match, MatchStatus, Tournament};
pub use network::auth::{AuthClient, AuthError, Credentials, Session};
pub use network::client::GameClient;
pub use network::dispatcher::Fault;
pub use network::session::{ClientError, ExitReason};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Destination tag carried by every frame that belongs to this client.
pub const NAMESPACE: &str = "pong-api";

/// Input sender tick rate (Hz)
pub const INPUT_TICK_RATE: u32 = 60;

/// Tournament size, fixed by the backend.
pub const TOURNAMENT_MAX_PLAYERS: usize = 4;
