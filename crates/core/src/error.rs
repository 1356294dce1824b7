use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Error taxonomy shared by every skerry crate. Clone so a single in-flight load
/// result can be handed to every joined caller.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("address conflict: {0} is already registered")]
    AddressConflict(String),
    #[error("store conflict: client {0} is already bound to a store")]
    StoreConflict(String),
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("stale resource version: {0}")]
    Stale(String),
    #[error("transport: {0}")]
    Transport(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("api error {code}: {message}")]
    Api { code: u16, message: String },
    #[error("decode: {0}")]
    Decode(String),
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("mismatch: {0}")]
    Mismatch(String),
    #[error("cancelled")]
    Cancelled,
}

impl Error {
    /// Transport class failures a watch connection retries with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transport(_) | Error::Timeout(_) => true,
            Error::Api { code, .. } => *code >= 500,
            _ => false,
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, Error::Unauthorized(_) | Error::Forbidden(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusDetails {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
}

/// The subset of a `Status` body used to classify failures.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiStatus {
    #[serde(default)]
    pub code: u16,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub details: Option<StatusDetails>,
}

impl ApiStatus {
    /// Decode a response body; non-JSON bodies (`404 page not found`) become the message.
    pub fn from_body(code: u16, body: &[u8]) -> Self {
        let mut status = serde_json::from_slice::<ApiStatus>(body).unwrap_or_else(|_| ApiStatus {
            message: String::from_utf8_lossy(body).trim().to_string(),
            ..Default::default()
        });
        if status.code == 0 {
            status.code = code;
        }
        status
    }

    /// True when the server says a named instance is missing, as opposed to the
    /// whole collection being unknown.
    pub fn names_instance(&self) -> bool {
        self.details.as_ref().and_then(|d| d.name.as_deref()).map(|n| !n.is_empty()).unwrap_or(false)
    }

    pub fn into_error(self) -> Error {
        match self.code {
            401 => Error::Unauthorized(self.message),
            403 => Error::Forbidden(self.message),
            404 => Error::NotFound(self.message),
            410 => Error::Stale(self.message),
            code => Error::Api { code, message: self.message },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_status_bodies() {
        let body = br#"{"kind":"Status","code":404,"reason":"NotFound","message":"deployments.apps \"web\" not found","details":{"name":"web","kind":"deployments"}}"#;
        let st = ApiStatus::from_body(404, body);
        assert!(st.names_instance());
        assert!(matches!(st.into_error(), Error::NotFound(_)));

        let plain = ApiStatus::from_body(404, b"404 page not found\n");
        assert_eq!(plain.code, 404);
        assert_eq!(plain.message, "404 page not found");
        assert!(!plain.names_instance());

        assert!(matches!(ApiStatus::from_body(410, b"{}").into_error(), Error::Stale(_)));
        assert!(ApiStatus::from_body(403, b"no").into_error().is_auth());
        assert!(ApiStatus::from_body(503, b"busy").into_error().is_retryable());
        assert!(!ApiStatus::from_body(422, b"bad").into_error().is_retryable());
    }
}
