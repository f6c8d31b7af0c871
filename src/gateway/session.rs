//! Per-connection gateway state machine, independent of the WebSocket transport.
//!
//! `Authenticating` handles exactly one frame, whatever it contains, then the session moves
//! to `Dispatching` for the rest of the connection.

use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};

use super::auth::{AuthError, AuthSession, Authenticator};
use super::dispatch::{ActionDispatcher, DispatchError};

pub const INVALID_FORMAT: &str = "Invalid data format";
pub const NOT_AUTHENTICATED: &str = "Not authenticated.";

/// Handshake frame.
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    #[serde(rename = "UserId")]
    pub user_id: String,
    #[serde(rename = "Password")]
    pub password: String,
}

/// Post-handshake frame.
#[derive(Debug, Deserialize)]
pub struct ActionEnvelope {
    #[serde(rename = "Action")]
    pub action: String,
    #[serde(rename = "Data", default)]
    pub data: String,
}

/// What goes back over the connection for one inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayReply {
    Token(String),
    Result(String),
    Error(String),
}

impl GatewayReply {
    /// Wire form: the bare token, `Result: <payload>` or `Error: <message>`.
    pub fn to_frame(&self) -> String {
        match self {
            GatewayReply::Token(token) => token.clone(),
            GatewayReply::Result(payload) => format!("Result: {}", payload),
            GatewayReply::Error(message) => format!("Error: {}", message),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayPhase {
    Authenticating,
    Dispatching,
}

pub struct GatewaySession {
    phase: GatewayPhase,
    auth: Option<AuthSession>,
    authenticator: Arc<Authenticator>,
    dispatcher: Arc<dyn ActionDispatcher>,
    reject_unauthenticated: bool,
}

impl GatewaySession {
    pub fn new(
        authenticator: Arc<Authenticator>,
        dispatcher: Arc<dyn ActionDispatcher>,
        reject_unauthenticated: bool,
    ) -> Self {
        Self {
            phase: GatewayPhase::Authenticating,
            auth: None,
            authenticator,
            dispatcher,
            reject_unauthenticated,
        }
    }

    #[cfg(test)]
    pub fn phase(&self) -> GatewayPhase {
        self.phase
    }

    #[cfg(test)]
    pub fn auth(&self) -> Option<&AuthSession> {
        self.auth.as_ref()
    }

    pub async fn handle_frame(&mut self, frame: &str) -> GatewayReply {
        match self.phase {
            GatewayPhase::Authenticating => {
                self.phase = GatewayPhase::Dispatching;
                self.handshake(frame)
            }
            GatewayPhase::Dispatching => self.dispatch(frame).await,
        }
    }

    fn handshake(&mut self, frame: &str) -> GatewayReply {
        let login = match serde_json::from_str::<LoginRequest>(frame) {
            Ok(login) => login,
            Err(err) => {
                warn!(error = %err, "handshake frame is not a credential pair");
                return GatewayReply::Error(AuthError::InvalidCredentials.to_string());
            }
        };

        match self.authenticator.authenticate(&login.user_id, &login.password) {
            Ok(session) => {
                info!(user = %session.user_id, expires_at = %session.expires_at, "gateway client authenticated");
                let token = session.token.clone();
                self.auth = Some(session);
                GatewayReply::Token(token)
            }
            Err(err) => {
                warn!(user = %login.user_id, error = %err, "gateway handshake failed");
                GatewayReply::Error(err.to_string())
            }
        }
    }

    /// The handshake succeeded and its token still verifies for the same user.
    fn has_valid_token(&self) -> bool {
        let Some(auth) = self.auth.as_ref() else {
            return false;
        };
        if auth.is_expired() {
            return false;
        }
        match self.authenticator.verify(&auth.token) {
            Ok(claims) => claims.sub == auth.user_id,
            Err(err) => {
                warn!(user = %auth.user_id, error = %err, "gateway token no longer verifies");
                false
            }
        }
    }

    async fn dispatch(&mut self, frame: &str) -> GatewayReply {
        if self.reject_unauthenticated && !self.has_valid_token() {
            return GatewayReply::Error(NOT_AUTHENTICATED.to_string());
        }

        let envelope = match serde_json::from_str::<ActionEnvelope>(frame) {
            Ok(envelope) => envelope,
            Err(_) => return GatewayReply::Error(INVALID_FORMAT.to_string()),
        };

        match self.dispatcher.dispatch(&envelope.action, &envelope.data).await {
            Ok(payload) => {
                info!(action = %envelope.action, "gateway action completed");
                GatewayReply::Result(payload)
            }
            Err(DispatchError::InvalidAction(action)) => {
                warn!(action = %action, "rejected gateway action");
                GatewayReply::Error(INVALID_FORMAT.to_string())
            }
            Err(err) => {
                warn!(action = %envelope.action, error = %err, "gateway action failed");
                GatewayReply::Error(err.to_string())
            }
        }
    }
}
