//! Protocol error types

use thiserror::Error;

/// Protocol-level errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Serialization error from serde_json
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Request line exceeds the maximum allowed length
    #[error("Request line too long: {length} bytes (max: {max})")]
    LineTooLong { length: usize, max: usize },

    /// I/O error while reading or writing the socket
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_too_long_display() {
        let err = ProtocolError::LineTooLong {
            length: 70_000,
            max: 65_536,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("70000"));
        assert!(msg.contains("65536"));
    }
}
