//! IPC error types

use thiserror::Error;

/// Result alias for codec and transport operations
pub type IpcResult<T> = Result<T, IpcError>;

/// IPC error types
#[derive(Debug, Error)]
pub enum IpcError {
    /// Command could not be encoded; nothing was written
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A received line could not be decoded
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// IO error
    #[error("IO error: {0}")]
    Io(String),

    /// The other end closed its stream
    #[error("Connection closed")]
    ConnectionClosed,

    /// Worker category name is empty or malformed
    #[error("Invalid worker category: '{0}'")]
    InvalidCategory(String),
}

/// Reasons a received line is rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("line of {len} bytes exceeds the {max} byte limit")]
    LineTooLong { len: usize, max: usize },

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("message has no correlationId")]
    MissingCorrelationId,

    #[error("line is not valid UTF-8")]
    InvalidUtf8,

    #[error("line contains an embedded newline")]
    EmbeddedNewline,
}

impl IpcError {
    /// Whether the error concerns a single line rather than the stream itself
    pub fn is_line_local(&self) -> bool {
        matches!(self, IpcError::Protocol(_))
    }
}

impl From<std::io::Error> for IpcError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::ConnectionReset => {
                IpcError::ConnectionClosed
            }
            _ => IpcError::Io(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for IpcError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_io() {
            IpcError::Io(err.to_string())
        } else if err.is_data() || err.is_syntax() || err.is_eof() {
            IpcError::Protocol(ProtocolError::Malformed(err.to_string()))
        } else {
            IpcError::Serialization(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_local_errors() {
        assert!(IpcError::Protocol(ProtocolError::MissingCorrelationId).is_line_local());
        assert!(!IpcError::ConnectionClosed.is_line_local());
        assert!(!IpcError::Io("broken pipe".to_string()).is_line_local());
    }

    #[test]
    fn test_broken_pipe_is_connection_closed() {
        let err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        assert!(matches!(IpcError::from(err), IpcError::ConnectionClosed));

        let err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        assert!(matches!(IpcError::from(err), IpcError::Io(_)));
    }

    #[test]
    fn test_json_syntax_error_maps_to_protocol() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let ipc: IpcError = err.into();
        assert!(matches!(ipc, IpcError::Protocol(ProtocolError::Malformed(_))));
    }
}
