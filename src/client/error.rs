use std::{io, time::Duration};

use thiserror::Error;

use crate::protocol::{CodecError, CorrelationId, ErrorCode, TransportError};

pub type ClientResult<T> = Result<T, ClientError>;

/// Every way a client operation can fail.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(TransportError),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("query failed ({code}): {message}")]
    QueryFailed { code: ErrorCode, message: String },

    #[error("query #{id} got no response within {timeout:?}")]
    QueryTimeout {
        id: CorrelationId,
        timeout: Duration,
    },

    #[error("connection is closed")]
    ConnectionClosed,

    #[error("command is {size} bytes, limit is {limit}")]
    SizeLimitExceeded { size: usize, limit: usize },

    #[error("a handshake is already in progress")]
    AlreadyConnecting,

    #[error("connection is already established")]
    AlreadyConnected,

    #[error("not connected to a server")]
    NotConnected,

    #[error("unexpected response: expected {expected}, got {actual}")]
    UnexpectedResponse {
        expected: &'static str,
        actual: String,
    },
}

impl From<TransportError> for ClientError {
    fn from(value: TransportError) -> Self {
        match value {
            TransportError::Codec(e) => e.into(),
            other => ClientError::Transport(other),
        }
    }
}

impl From<CodecError> for ClientError {
    fn from(value: CodecError) -> Self {
        match value {
            CodecError::SizeLimitExceeded { size, limit } => {
                ClientError::SizeLimitExceeded { size, limit }
            }
            other => ClientError::Transport(TransportError::Codec(other)),
        }
    }
}

impl From<io::Error> for ClientError {
    fn from(value: io::Error) -> Self {
        ClientError::Transport(TransportError::Io(value))
    }
}
