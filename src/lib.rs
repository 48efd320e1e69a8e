//! # Terra Quiz Server
//!
//! Real-time coordination server for multiplayer geography quiz sessions.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    TERRA QUIZ SERVER                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  session/        - Lobby state (pure, lock-per-lobby)        │
//! │  ├── state.rs    - Lobby/player state machine                │
//! │  └── store.rs    - In-memory lobby table                     │
//! │                                                              │
//! │  network/        - Transport and routing                     │
//! │  ├── server.rs   - WebSocket lifecycle                       │
//! │  ├── router.rs   - Frame routing + auth gate                 │
//! │  ├── registry.rs - User -> connection table                  │
//! │  ├── dispatch.rs - Lobby fan-out                             │
//! │  ├── protocol.rs - Wire message types                        │
//! │  └── auth.rs     - JWT validation                            │
//! │                                                              │
//! │  persist/        - Durable row mirror (reconnect recovery)   │
//! │  reconcile.rs    - Grace timers, restore, periodic sweep     │
//! │  presence.rs     - Online checks + friend notifications      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Consistency Model
//!
//! In-memory sessions are the source of truth for connected clients; every
//! mutation is mirrored to the durable store best-effort and replayed from
//! there after a disconnect or a process restart. Broadcasts never block on
//! a slow consumer.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod network;
pub mod persist;
pub mod presence;
pub mod reconcile;
pub mod session;

// Re-export commonly used types
pub use network::{ClientMessage, QuizServer, ServerConfig, ServerMessage};
pub use persist::{DurableStore, MemoryStore};
pub use reconcile::{ReconcileConfig, ReconciliationScheduler};
pub use session::{LobbyId, LobbySession, LobbyStatus, PlayerStatus, SessionStore, UserId};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
