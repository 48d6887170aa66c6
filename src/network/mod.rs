//! Network Layer
//!
//! Everything that touches the backend: HTTP authentication, the single
//! WebSocket, frame decoding and the orchestration of the session's
//! long-running activities. Game state itself lives in `game/`.

pub mod auth;
pub mod client;
pub mod dispatcher;
pub mod protocol;
pub mod session;
pub mod transport;

pub use auth::{AuthClient, AuthError, AuthPhase, Credentials, Session, UserProfile};
pub use client::GameClient;
pub use dispatcher::{Fault, FaultSlot, MessageDispatcher};
pub use protocol::{ClientRequest, DecodeError, ServerEvent};
pub use session::{ClientError, ExitReason};
pub use transport::{Outbox, TransportError};
