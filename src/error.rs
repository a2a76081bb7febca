use thiserror::Error;

/// Error taxonomy for the gateway core. Transport and protocol failures feed
/// the reconnect policy, rate-limit and transient faults are retried inside
/// the REST client and only surface once the attempt budget is spent, and
/// `Unauthorized`/`Internal` are never retried.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("websocket transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("http transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("failed to decode payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("gateway protocol error: {0}")]
    Protocol(String),

    #[error("gateway closed the connection with code {0}")]
    Closed(u16),

    #[error("rest error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("invalid bot token or tried to access something a bot can't")]
    Unauthorized,

    #[error("exceeded maximum number of retries: {method} {url}")]
    RetriesExhausted { method: String, url: String },

    #[error("malformed rate limit header {name}: {value}")]
    RateLimitHeader { name: &'static str, value: String },

    /// A value the crate itself constructed failed to encode, or a queue the
    /// crate itself owns was gone. Valid input can never produce this.
    #[error("internal invariant violated: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, GatewayError>;
