use thiserror::Error;

/// Failure modes the client dispatcher has to tell apart: a dial failure
/// maps to 404, everything else to 400 or a closed connection.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("malformed rtsp message: {0}")]
    Parse(String),

    #[error("failed to reach upstream: {0}")]
    Dial(String),

    #[error("upstream rejected our credentials")]
    Unauthorized,

    #[error("upstream request timed out")]
    Timeout,

    #[error("unsupported transport: {0}")]
    UnsupportedTransport(String),

    #[error("upstream request failed")]
    RequestFailed,

    #[error("connection closed")]
    ConnectionClosed,
}
