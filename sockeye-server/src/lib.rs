//! # sockeye-server — WebSocket publish/subscribe relay
//!
//! Subscribers connect and authenticate to obtain an identifier; publishers
//! present a shared secret and ask for a payload to be pushed to one or more
//! identifiers.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐  authenticate   ┌─────────────┐
//! │ Subscriber │ ───────────────►│   Session   │──► IdentityResolver
//! └─────▲──────┘                 │ (per conn)  │          │
//!       │ push                   └──────┬──────┘          ▼
//!       │                               │         ┌──────────────────┐
//! ┌─────┴──────┐    deliver      ┌──────▼──────┐  │ConnectionRegistry│
//! │ Publisher  │ ───────────────►│ secret check│  │ id ↔ connections │
//! └────────────┘                 └──────┬──────┘  └────────▲─────────┘
//!                                       ▼                  │
//!                                ┌─────────────┐  lookup   │
//!                                │DeliveryEngine│──────────┘
//!                                └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON frames and reply envelopes
//! - [`auth`] — pluggable token → identifier resolution
//! - [`registry`] — identifier ↔ connection mapping
//! - [`delivery`] — best-effort fan-out
//! - [`session`] — per-connection state machine
//! - [`server`] — TCP/WebSocket host
//! - [`client`] — subscriber and publisher helpers

pub mod protocol;
pub mod auth;
pub mod registry;
pub mod delivery;
pub mod session;
pub mod server;
pub mod client;

// Re-exports for convenience
pub use protocol::{Frame, Identifier, Identifiers, ProtocolError, Reply, Status};
pub use auth::{Authenticator, DenyAll, IdentityResolver, Rejection, StaticTokens};
pub use registry::{ConnectionHandle, ConnectionId, ConnectionRegistry, DeliveryError, Registration};
pub use delivery::{DeliveryEngine, DeliveryReport, DeliveryStats};
pub use session::{Hub, Outcome, Session, SessionState};
pub use server::{RelayServer, ServerConfig, ServerError, ServerStats};
pub use client::{publish, ClientError, Subscriber};
