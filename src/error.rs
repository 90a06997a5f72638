//! Error taxonomy shared by the session, gateway, mutation and feed layers.
use serde_json::Value;
use thiserror::Error;

/// Failures surfaced by the synchronization layer.
///
/// The type is `Clone` so one renewal outcome can be handed to every caller
/// waiting on it.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SyncError {
    /// Terminal for the current session: credentials are gone and the user
    /// must log in again.
    #[error("session expired; login required")]
    SessionExpired,
    /// The call was refused for this identity; the session stays valid.
    #[error("not authorized for this operation")]
    Unauthorized,
    #[error("validation failed: {0}")]
    ValidationFailed(String),
    #[error("network unavailable: {0}")]
    NetworkUnavailable(String),
    /// Server state diverged from what the client assumed. `server` carries
    /// the authoritative entity when the response included one.
    #[error("conflict with server state")]
    Conflict { server: Option<Value> },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("server error {status}: {body}")]
    Server { status: u16, body: String },
    #[error("invalid response: {0}")]
    Decode(String),
    #[error("operation aborted: {0}")]
    Aborted(String),
}

impl SyncError {
    /// Errors that end in the logout flow rather than an inline banner.
    pub fn is_auth(&self) -> bool {
        matches!(self, SyncError::SessionExpired | SyncError::Unauthorized)
    }

    /// Transient failures the user may retry by hand.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::NetworkUnavailable(_) | SyncError::Server { .. }
        )
    }

    /// Map a non-success HTTP status (other than the auth statuses the
    /// gateway handles itself) to an error.
    pub fn from_status(status: u16, body: Value) -> Self {
        match status {
            400 | 422 => SyncError::ValidationFailed(body_text(&body)),
            401 | 403 => SyncError::Unauthorized,
            404 => SyncError::NotFound(body_text(&body)),
            409 => SyncError::Conflict {
                server: body.is_object().then_some(body),
            },
            _ => SyncError::Server {
                status,
                body: body_text(&body),
            },
        }
    }
}

fn body_text(body: &Value) -> String {
    match body {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Decode(err.to_string())
    }
}
