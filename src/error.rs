//! agentdeck error types

use thiserror::Error;

/// agentdeck error type
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Session id is empty, too long, or contains characters unusable as a storage key
    #[error("Invalid session id: {0}")]
    InvalidSessionId(String),

    /// Session options failed validation
    #[error("Invalid session options: {0}")]
    InvalidOptions(String),

    /// A live session with this id already exists
    #[error("Session already exists: {0}")]
    DuplicateSession(String),

    /// No session with this id
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Session is in the middle of a turn
    #[error("Session {0} is busy processing a prompt")]
    SessionBusy(String),

    /// Always-allow rule is malformed
    #[error("Invalid always-allow rule: {0}")]
    InvalidRule(String),

    /// Permission response did not match the pending request
    #[error("Unknown permission request: {0}")]
    UnknownRequest(String),

    /// Agent engine failed to start
    #[error("Agent startup error: {0}")]
    Startup(String),

    /// Agent engine failed at runtime
    #[error("Agent error: {0}")]
    Adapter(String),

    /// Malformed client command
    #[error("Invalid command: {0}")]
    Protocol(String),

    /// Persistence error
    #[error("Storage error: {0}")]
    Storage(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Validation errors are reported to the caller and never change session state
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::InvalidSessionId(_)
                | Error::InvalidOptions(_)
                | Error::InvalidRule(_)
                | Error::Protocol(_)
                | Error::DuplicateSession(_)
                | Error::SessionNotFound(_)
                | Error::SessionBusy(_)
                | Error::UnknownRequest(_)
        )
    }
}

/// Result type alias for agentdeck operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::DuplicateSession("s1".to_string());
        assert_eq!(err.to_string(), "Session already exists: s1");

        let err = Error::UnknownRequest("req-1".to_string());
        assert_eq!(err.to_string(), "Unknown permission request: req-1");

        let err = Error::Protocol("missing field `type`".to_string());
        assert_eq!(err.to_string(), "Invalid command: missing field `type`");
    }

    #[test]
    fn test_is_validation() {
        assert!(Error::SessionNotFound("x".to_string()).is_validation());
        assert!(Error::UnknownRequest("x".to_string()).is_validation());
        assert!(Error::Protocol("x".to_string()).is_validation());
        assert!(Error::InvalidRule("x".to_string()).is_validation());
        assert!(!Error::Startup("x".to_string()).is_validation());
        assert!(!Error::Storage("x".to_string()).is_validation());
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
