use thiserror::Error;

/// Top-level error type for the `ontowatch-api` crate.
///
/// Covers every failure mode of the change-feed transport: credentials,
/// HTTP and WebSocket connectivity, wire decoding, and ontology lookups.
/// `ontowatch-core` folds these into `CoreError`.
#[derive(Debug, Error)]
pub enum Error {
    // ── Credentials ─────────────────────────────────────────────────
    /// The token provider could not produce a bearer token.
    #[error("Token unavailable: {message}")]
    Token { message: String },

    // ── Transport ───────────────────────────────────────────────────
    /// HTTP transport error (connection refused, DNS failure, etc.)
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The server answered a subscribe request with a non-success status.
    #[error("HTTP {status} from change feed: {body}")]
    HttpStatus { status: u16, body: String },

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// TLS handshake or certificate error.
    #[error("TLS error: {0}")]
    Tls(String),

    // ── WebSocket ───────────────────────────────────────────────────
    /// WebSocket connection failed.
    #[error("WebSocket connection failed: {0}")]
    WebSocketConnect(String),

    /// WebSocket closed unexpectedly.
    #[error("WebSocket closed (code {code}): {reason}")]
    WebSocketClosed { code: u16, reason: String },

    /// The subscriber task has shut down and can no longer accept requests.
    #[error("Subscriber is shut down")]
    SubscriberClosed,

    // ── Data ────────────────────────────────────────────────────────
    /// JSON deserialization failed, with the raw body for debugging.
    #[error("Deserialization error: {message}")]
    Deserialization { message: String, body: String },

    /// A raw object could not be turned into an `ObjectInstance`.
    #[error("Invalid object payload: {0}")]
    InvalidObject(String),

    // ── Ontology ────────────────────────────────────────────────────
    /// No definition is known for the requested object or interface type.
    #[error("Unknown {kind} type: {api_name}")]
    UnknownType { kind: &'static str, api_name: String },
}

impl Error {
    /// Returns `true` if this is a transient error worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_timeout() || e.is_connect() || e.is_body(),
            Self::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            Self::WebSocketConnect(_) | Self::WebSocketClosed { .. } => true,
            _ => false,
        }
    }

    /// Returns `true` if the server rejected our credentials.
    pub fn is_auth_rejected(&self) -> bool {
        matches!(self, Self::HttpStatus { status: 401 | 403, .. })
    }

    /// Build a `Deserialization` error from a serde failure and the offending body.
    pub(crate) fn decode(err: &serde_json::Error, body: &str) -> Self {
        Self::Deserialization {
            message: err.to_string(),
            body: body.to_owned(),
        }
    }
}
