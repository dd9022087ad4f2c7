// ── Core error types ──
//
// Errors surfaced by the cache layer. Transport failures from
// `ontowatch-api` are folded in through `From`, so callers of the cache
// never need to match on HTTP or WebSocket details.

use thiserror::Error;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Fetch errors ─────────────────────────────────────────────────
    #[error("Fetch failed for {key}: {message}")]
    Fetch { key: String, message: String },

    #[error("Object not found: {api_name} with primary key {primary_key}")]
    NotFound {
        api_name: String,
        primary_key: String,
    },

    #[error("No further pages for {key}")]
    NoMorePages { key: String },

    #[error("Fetch cancelled")]
    Cancelled,

    // ── Store errors ─────────────────────────────────────────────────
    #[error("batch() called while another batch is in progress on this thread")]
    NestedBatch,

    #[error("Store has been shut down")]
    StoreClosed,

    #[error("Batch aborted: {message}")]
    Aborted { message: String },

    // ── Transport errors (wrapped) ───────────────────────────────────
    #[error(transparent)]
    Api(#[from] ontowatch_api::Error),

    // ── Configuration errors ─────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl CoreError {
    /// Whether retrying the same operation later might succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Api(e) => e.is_transient(),
            Self::Fetch { .. } | Self::Cancelled => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_errors_keep_their_classification() {
        let err = CoreError::from(ontowatch_api::Error::SubscriberClosed);
        assert_eq!(
            err.is_transient(),
            ontowatch_api::Error::SubscriberClosed.is_transient()
        );
    }

    #[test]
    fn nested_batch_is_not_transient() {
        assert!(!CoreError::NestedBatch.is_transient());
        assert!(CoreError::Cancelled.is_transient());
    }
}
