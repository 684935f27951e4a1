use thiserror::Error;

#[derive(Debug, Error)]
pub enum RufletError {
    #[error("Truncated input: needed {needed} bytes, {available} available")]
    TruncatedInput { needed: usize, available: usize },

    #[error("Unsupported tag byte: 0x{0:02x}")]
    UnsupportedTag(u8),

    #[error("String payload is not valid UTF-8")]
    InvalidUtf8,

    #[error("{0} trailing bytes after decoded value")]
    TrailingBytes(usize),

    #[error("Handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("Target not found: {0}")]
    TargetNotFound(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Handler error: {0}")]
    Handler(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RufletError {
    /// Codec failures mean the byte stream can no longer be trusted.
    pub fn is_codec(&self) -> bool {
        matches!(
            self,
            Self::TruncatedInput { .. }
                | Self::UnsupportedTag(_)
                | Self::InvalidUtf8
                | Self::TrailingBytes(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, RufletError>;
