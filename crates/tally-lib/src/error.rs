//! Error types for resource listing, watching and aggregation

use thiserror::Error;

/// Result type alias for aggregation core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the aggregation core
///
/// Only the watch expiry signal is recovered internally (by the watch loop);
/// every variant here reaches the orchestrating caller unchanged.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed quantity literal
    #[error("invalid quantity {input:?}: {reason}")]
    InvalidQuantity { input: String, reason: String },

    /// List or watch request against the cluster API failed
    #[error("api request for {kind} failed: {source}")]
    Api {
        kind: String,
        #[source]
        source: anyhow::Error,
    },

    /// Server reported a watch error other than expiry
    #[error("watch on {kind} failed: {reason}")]
    Watch { kind: String, reason: String },

    /// Watch stream produced an event type we do not handle
    #[error("unknown watch event type {event_type:?} on {kind}")]
    UnknownEvent { kind: String, event_type: String },

    /// Factory asked for a kind that is not registered
    #[error("unknown resource kind {0:?}")]
    UnknownKind(String),

    /// The consumer receiving forwarded watch events went away
    #[error("watch event consumer for {kind} closed")]
    ConsumerClosed { kind: String },

    /// Object did not match the structure expected for its kind
    #[error("malformed {kind} object: {message}")]
    MalformedItem { kind: String, message: String },
}

impl Error {
    /// Create an invalid quantity error
    pub fn invalid_quantity(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidQuantity {
            input: input.into(),
            reason: reason.into(),
        }
    }

    /// Wrap a cluster API failure for the given kind
    pub fn api(kind: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Api {
            kind: kind.into(),
            source,
        }
    }

    /// Create a malformed item error
    pub fn malformed(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::MalformedItem {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Whether the watch stream itself was rejected (as opposed to transport or parsing)
    pub fn is_watch_failure(&self) -> bool {
        matches!(self, Self::Watch { .. } | Self::UnknownEvent { .. })
    }
}
