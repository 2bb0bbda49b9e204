use thiserror::Error;

/// A specialized `Result` type for Raft operations.
pub type RaftResult<T> = Result<T, RaftError>;

/// Structured error type used throughout the raft package.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RaftError {
    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Failed to decode persisted state: {0}")]
    Decode(String),

    #[error("Invalid argument in request: {0}")]
    InvalidArgument(String),

    #[error("Peer {peer} unreachable: {message}")]
    Unreachable { peer: String, message: String },

    #[error("Not the leader, last known leader: {leader:?}")]
    NotLeader { leader: Option<String> },

    #[error("Raft instance has been killed")]
    Killed,

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Non-contiguous log entries supplied. Expected index {expected}, got {actual}")]
    NonContiguousLog { expected: i64, actual: i64 },
}

impl RaftError {
    pub(crate) fn missing(field: &str) -> Self {
        Self::InvalidArgument(format!("Missing field {}", field))
    }

    pub(crate) fn unreachable(peer: &str, message: impl Into<String>) -> Self {
        Self::Unreachable {
            peer: peer.to_string(),
            message: message.into(),
        }
    }

    // Returns true for errors after which this member must not take part in the
    // cluster anymore.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RaftError::Persistence(_) | RaftError::Decode(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing() {
        let err = RaftError::missing("candidate");
        assert_eq!(err.to_string(), "Invalid argument in request: Missing field candidate");
    }

    #[test]
    fn test_is_fatal() {
        assert!(RaftError::Persistence("disk full".to_string()).is_fatal());
        assert!(RaftError::Decode("garbage".to_string()).is_fatal());
        assert!(!RaftError::unreachable("B", "dropped").is_fatal());
        assert!(!RaftError::Killed.is_fatal());
    }
}
