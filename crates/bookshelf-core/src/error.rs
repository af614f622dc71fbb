//! Failure taxonomy shared by fetches, mutations and subscriptions.
//!
//! Errors are values: they are captured into cache entries and mutation
//! state and cloned to every observer. Cancellation is deliberately absent;
//! a cancelled operation simply produces no outcome.

use std::time::Duration;

use thiserror::Error;

/// Category of a rejected remote request, used for user-facing wording.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionKind {
    BadRequest,
    Forbidden,
    NotFound,
    RateLimited,
    Server,
}

impl RejectionKind {
    pub fn from_status(status: u16) -> Self {
        match status {
            401 | 403 => RejectionKind::Forbidden,
            404 => RejectionKind::NotFound,
            429 => RejectionKind::RateLimited,
            500..=599 => RejectionKind::Server,
            _ => RejectionKind::BadRequest,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            RejectionKind::BadRequest => "bad request",
            RejectionKind::Forbidden => "forbidden",
            RejectionKind::NotFound => "not found",
            RejectionKind::RateLimited => "rate limited",
            RejectionKind::Server => "server error",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Timeout, unreachable host, reset connection.
    #[error("network error: {0}")]
    TransientNetwork(String),
    /// The catalog answered with a 4xx/5xx status.
    #[error("HTTP {status} ({})", .kind.label())]
    RemoteRejection {
        status: u16,
        kind: RejectionKind,
        retry_after: Option<Duration>,
    },
    /// The catalog answered 2xx with a body we could not decode.
    #[error("malformed response: {0}")]
    Deserialization(String),
    /// Reading or writing the favorites store failed.
    #[error("favorites store error: {0}")]
    LocalStore(String),
}

impl SyncError {
    pub fn rejection(status: u16, retry_after: Option<Duration>) -> Self {
        SyncError::RemoteRejection {
            status,
            kind: RejectionKind::from_status(status),
            retry_after,
        }
    }

    pub fn rejection_kind(&self) -> Option<RejectionKind> {
        match self {
            SyncError::RemoteRejection { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Whether offering an inline retry makes sense.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::TransientNetwork(_))
    }

    /// Store failures surface as transient notices rather than screen errors.
    pub fn is_local(&self) -> bool {
        matches!(self, SyncError::LocalStore(_))
    }

    /// Short text for an error banner or toast.
    pub fn user_message(&self) -> String {
        match self {
            SyncError::TransientNetwork(_) => {
                "Network unavailable. Check your connection and retry.".to_string()
            }
            SyncError::RemoteRejection { kind, .. } => match kind {
                RejectionKind::BadRequest => "The search request was rejected (bad request).",
                RejectionKind::Forbidden => "Access to the catalog was denied (forbidden).",
                RejectionKind::NotFound => "The catalog endpoint was not found.",
                RejectionKind::RateLimited => "Too many requests. Try again shortly.",
                RejectionKind::Server => "The catalog is having trouble (server error).",
            }
            .to_string(),
            // Shown like a rejection; the distinct variant is for logs.
            SyncError::Deserialization(_) => {
                "The catalog sent an unexpected response.".to_string()
            }
            SyncError::LocalStore(_) => "Could not update your favorites.".to_string(),
        }
    }
}

impl From<bookshelf_store::StoreError> for SyncError {
    fn from(e: bookshelf_store::StoreError) -> Self {
        SyncError::LocalStore(e.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        // A body read that times out surfaces as a decode error too.
        if e.is_timeout() || e.is_connect() {
            SyncError::TransientNetwork(e.to_string())
        } else if e.is_decode() {
            SyncError::Deserialization(e.to_string())
        } else if let Some(status) = e.status() {
            SyncError::rejection(status.as_u16(), None)
        } else {
            SyncError::TransientNetwork(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_categories() {
        assert_eq!(RejectionKind::from_status(400), RejectionKind::BadRequest);
        assert_eq!(RejectionKind::from_status(401), RejectionKind::Forbidden);
        assert_eq!(RejectionKind::from_status(403), RejectionKind::Forbidden);
        assert_eq!(RejectionKind::from_status(404), RejectionKind::NotFound);
        assert_eq!(RejectionKind::from_status(429), RejectionKind::RateLimited);
        assert_eq!(RejectionKind::from_status(503), RejectionKind::Server);
        assert_eq!(RejectionKind::from_status(418), RejectionKind::BadRequest);
    }

    #[test]
    fn only_network_errors_are_retryable() {
        assert!(SyncError::TransientNetwork("timeout".into()).is_retryable());
        assert!(!SyncError::rejection(500, None).is_retryable());
        assert!(!SyncError::Deserialization("eof".into()).is_retryable());
        assert!(!SyncError::LocalStore("disk full".into()).is_retryable());
    }

    #[test]
    fn rejection_display_names_category() {
        let err = SyncError::rejection(429, Some(Duration::from_secs(3)));
        assert_eq!(err.to_string(), "HTTP 429 (rate limited)");
        assert!(err.user_message().contains("Too many requests"));
    }

    #[test]
    fn deserialization_reads_like_rejection_for_users() {
        let msg = SyncError::Deserialization("missing field `meta`".into()).user_message();
        assert!(!msg.contains("meta"));
    }

    #[test]
    fn store_errors_convert_to_local() {
        let err: SyncError = bookshelf_store::StoreError::Task("join".into()).into();
        assert!(err.is_local());
    }
}
