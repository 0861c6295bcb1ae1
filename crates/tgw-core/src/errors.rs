/// Core error type for the worker.
///
/// Adapter crates map their transport errors into this type. The loop only
/// lets `Config` and `Broker` errors escape; everything else is per-message.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed update: {0}")]
    MalformedUpdate(String),

    #[error("broker error: {0}")]
    Broker(String),

    #[error("delivery error: {0}")]
    Delivery(String),

    #[error("sidecar error: {0}")]
    Sidecar(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error must stop the worker instead of being absorbed.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Config(_) | Error::Broker(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
