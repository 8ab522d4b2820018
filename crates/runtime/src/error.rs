//! Error types for the driver runtime.

use thiserror::Error;

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the driver runtime.
#[derive(Debug, Error)]
pub enum Error {
    /// The driver's output stream ended.
    ///
    /// `truncated` is set when the stream ended in the middle of a frame.
    #[error("Transport closed{}", if *truncated { " (truncated frame)" } else { "" })]
    TransportClosed { truncated: bool },

    /// Transport-level error (stdio communication, oversized frames).
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed or inconsistent control message. Fatal to the connection.
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Error reported by the driver for one call.
    #[error("{name}: {message}")]
    Remote {
        /// Error type name (e.g., "TimeoutError", "Error", "TargetClosedError")
        name: String,
        /// Human-readable error message
        message: String,
        /// Stack trace from the driver (if available)
        stack: Option<String>,
    },

    /// Object not found in the connection registry.
    #[error("Object not found: {guid}")]
    ObjectNotFound { guid: String },

    /// The connection terminated while the operation was outstanding.
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// The remote object was disposed while the operation was outstanding.
    #[error("Target closed: object {guid} was disposed")]
    Disposed { guid: String },

    /// An incoming value does not fit the serialized value grammar.
    #[error("Codec error: {0}")]
    Codec(String),

    /// An outgoing value cannot be expressed on the wire.
    #[error("Unsupported value: {0}")]
    UnsupportedValue(String),

    /// Timeout waiting for operation.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// No constructor is registered for a remote type.
    #[error("Unknown protocol object type: {0}")]
    UnknownObjectType(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<pwchan_protocol::ValueError> for Error {
    fn from(err: pwchan_protocol::ValueError) -> Self {
        Error::Codec(err.to_string())
    }
}

impl Error {
    /// Returns the error name if this is a Remote error.
    pub fn error_name(&self) -> Option<&str> {
        match self {
            Error::Remote { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Returns the stack trace if this is a Remote error with a stack.
    pub fn stack_trace(&self) -> Option<&str> {
        match self {
            Error::Remote { stack, .. } => stack.as_deref(),
            _ => None,
        }
    }

    /// Returns true if this is a timeout error.
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Timeout(_) => true,
            Error::Remote { name, .. } => name == "TimeoutError",
            _ => false,
        }
    }

    /// Returns true if the target object or the whole connection is gone.
    pub fn is_target_closed(&self) -> bool {
        match self {
            Error::Disposed { .. } | Error::ConnectionClosed(_) => true,
            Error::Remote { name, .. } => name == "TargetClosedError",
            _ => false,
        }
    }

    /// Returns true for errors that terminate the connection when raised by
    /// the dispatch loop.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::TransportClosed { .. }
                | Error::Transport(_)
                | Error::ProtocolError(_)
                | Error::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_closed_display() {
        assert_eq!(
            Error::TransportClosed { truncated: false }.to_string(),
            "Transport closed"
        );
        assert_eq!(
            Error::TransportClosed { truncated: true }.to_string(),
            "Transport closed (truncated frame)"
        );
    }

    #[test]
    fn test_remote_error_classification() {
        let err = Error::Remote {
            name: "TimeoutError".to_string(),
            message: "waiting for selector".to_string(),
            stack: Some("at foo".to_string()),
        };
        assert!(err.is_timeout());
        assert!(!err.is_fatal());
        assert_eq!(err.error_name(), Some("TimeoutError"));
        assert_eq!(err.stack_trace(), Some("at foo"));
        assert_eq!(err.to_string(), "TimeoutError: waiting for selector");
    }

    #[test]
    fn test_fatal_classification() {
        assert!(Error::ProtocolError("dup".into()).is_fatal());
        assert!(Error::TransportClosed { truncated: true }.is_fatal());
        assert!(!Error::Codec("bad".into()).is_fatal());
        assert!(Error::Disposed { guid: "page@1".into() }.is_target_closed());
    }
}
