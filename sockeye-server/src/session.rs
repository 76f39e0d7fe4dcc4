//! Per-connection protocol state machine.
//!
//! ```text
//!   Open ──authenticate ok──► Authenticated ──(re)authenticate ok──┐
//!    │                            │   ▲                              │
//!    │                            │   └──────────────────────────────┘
//!    └─── any other outcome ──────┴──► Closed
//! ```
//!
//! Every frame that neither authenticates nor delivers closes the connection.
//! Publishers send one `deliver` and are disconnected; subscribers send one
//! `authenticate` and stay open to receive pushes.
//!
//! The session is transport-agnostic: it turns a text frame into an
//! [`Outcome`] and leaves writing and closing to the caller.

use std::sync::Arc;

use crate::auth::IdentityResolver;
use crate::delivery::DeliveryEngine;
use crate::protocol::{DeliverRequest, Frame, Identifier, ProtocolError, Reply};
use crate::registry::{ConnectionHandle, ConnectionId, ConnectionRegistry, Registration};

/// Everything a session needs from its server. One per server instance.
#[derive(Debug)]
pub struct Hub {
    registry: ConnectionRegistry,
    delivery: DeliveryEngine,
    resolver: IdentityResolver,
    secret_token: String,
}

impl Hub {
    pub fn new(resolver: IdentityResolver, secret_token: impl Into<String>) -> Self {
        let registry = ConnectionRegistry::new();
        Self {
            delivery: DeliveryEngine::new(registry.clone()),
            registry,
            resolver,
            secret_token: secret_token.into(),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn delivery(&self) -> &DeliveryEngine {
        &self.delivery
    }

    /// Exact comparison against the configured secret. A missing or
    /// non-string `secret_token` never matches.
    fn secret_matches(&self, presented: Option<&str>) -> bool {
        presented == Some(self.secret_token.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Authenticated(Identifier),
    Closed,
}

/// What the transport should do after a frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    /// Reply to send; `None` only for frames arriving after close.
    pub reply: Option<Reply>,
    /// Close the connection after sending the reply.
    pub close: bool,
}

impl Outcome {
    fn keep_open(reply: Reply) -> Self {
        Self {
            reply: Some(reply),
            close: false,
        }
    }

    fn close_with(reply: Reply) -> Self {
        Self {
            reply: Some(reply),
            close: true,
        }
    }

    fn ignored() -> Self {
        Self {
            reply: None,
            close: true,
        }
    }
}

pub struct Session {
    hub: Arc<Hub>,
    connection: ConnectionHandle,
    state: SessionState,
}

impl Session {
    pub fn new(hub: Arc<Hub>, connection: ConnectionHandle) -> Self {
        Self {
            hub,
            connection,
            state: SessionState::Open,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.connection.id()
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Handle one inbound text frame.
    pub async fn handle_text(&mut self, text: &str) -> Outcome {
        self.handle_decoded(Frame::decode(text)).await
    }

    /// Handle one inbound binary frame (treated as UTF-8 JSON).
    pub async fn handle_bytes(&mut self, bytes: &[u8]) -> Outcome {
        self.handle_decoded(Frame::decode_bytes(bytes)).await
    }

    async fn handle_decoded(&mut self, frame: Result<Frame, ProtocolError>) -> Outcome {
        if self.state == SessionState::Closed {
            log::debug!("{} ignoring frame after close", self.id());
            return Outcome::ignored();
        }

        let outcome = match frame {
            Err(e) => {
                log::warn!("{} sent an invalid message: {e}", self.id());
                Outcome::close_with(Reply::invalid_message())
            }
            Ok(Frame::Authenticate { token }) => self.authenticate(&token).await,
            Ok(Frame::Deliver(request)) => self.deliver(request).await,
            Ok(Frame::Unknown(action)) => {
                log::warn!("{} sent an invalid action: {action:?}", self.id());
                Outcome::close_with(Reply::invalid_action())
            }
        };

        if outcome.close {
            self.state = SessionState::Closed;
        }
        outcome
    }

    async fn authenticate(&mut self, token: &serde_json::Value) -> Outcome {
        log::debug!("{} authenticating", self.id());
        match self.hub.resolver.resolve(token) {
            Ok(identifier) => {
                let registration = self
                    .hub
                    .registry
                    .register(&identifier, self.connection.clone())
                    .await;
                if registration == Registration::New {
                    log::info!("{} authenticated as {identifier}", self.id());
                }
                self.state = SessionState::Authenticated(identifier);
                Outcome::keep_open(Reply::authenticated())
            }
            Err(rejection) => {
                log::warn!("{} authentication failure: {rejection}", self.id());
                Outcome::close_with(Reply::authentication_failure())
            }
        }
    }

    async fn deliver(&mut self, request: DeliverRequest) -> Outcome {
        if !self.hub.secret_matches(request.secret_token.as_deref()) {
            log::warn!("{} deliver rejected: secret token mismatch", self.id());
            return Outcome::close_with(Reply::authentication_failure());
        }

        log::debug!(
            "{} delivering to {} identifiers",
            self.id(),
            request.identifiers.len()
        );
        self.hub
            .delivery
            .deliver(&request.payload, request.identifiers.as_slice())
            .await;
        Outcome::close_with(Reply::payload_pushed())
    }

    /// Transport closed: drop the connection from the registry.
    ///
    /// Consumes the session, so it runs exactly once per connection.
    pub async fn finish(self) -> Option<Identifier> {
        let identifier = self.hub.registry.unregister(self.connection.id()).await;
        if let Some(identifier) = &identifier {
            log::info!("{} ({identifier}) disconnected", self.connection.id());
        }
        identifier
    }
}
