use thiserror::Error;

/// Errors produced by the bore protocol layer.
#[derive(Debug, Error)]
pub enum BoreError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("allocation failed: {0}")]
    Allocation(String),

    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("local service unreachable: {0}")]
    LocalUnreachable(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<ciborium::de::Error<std::io::Error>> for BoreError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        BoreError::Codec(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for BoreError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        BoreError::Codec(e.to_string())
    }
}

impl From<quinn::ConnectionError> for BoreError {
    fn from(e: quinn::ConnectionError) -> Self {
        BoreError::Transport(e.to_string())
    }
}

impl From<quinn::ConnectError> for BoreError {
    fn from(e: quinn::ConnectError) -> Self {
        BoreError::Transport(e.to_string())
    }
}

pub type BoreResult<T> = Result<T, BoreError>;
