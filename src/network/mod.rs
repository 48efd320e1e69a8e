//! Network Layer
//!
//! WebSocket transport, authentication, and message routing. This layer is
//! stateless about games - all lobby logic lives in `session/`.

pub mod auth;
pub mod dispatch;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod server;

pub use auth::{validate_token, AuthConfig, AuthError, TokenClaims};
pub use dispatch::BroadcastDispatcher;
pub use protocol::{ClientMessage, ErrorCode, LobbyUpdate, PlayerPublic, ServerMessage};
pub use registry::{ConnectionHandle, ConnectionId, ConnectionRegistry};
pub use router::{AuthenticatedUser, ConnectionContext, MessageRouter};
pub use server::{QuizServer, ServerConfig, ServerError};
