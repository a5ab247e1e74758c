use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BridgeError>;

/// Failure reported by a [`RemoteProtocolClient`](crate::mail::RemoteProtocolClient).
///
/// The variant decides what happens to the action that triggered the call:
/// transient failures are retried with backoff, permanent failures are
/// dead-lettered immediately.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Timeout, rate limiting, dropped connection, temporary server error.
    #[error("Transient remote failure: {message}")]
    Transient { message: String },

    /// Invalid target name, permission denied, conflicting folder.
    #[error("Permanent remote failure: {message}")]
    Permanent { message: String },

    /// The provider has no concept of the requested operation.
    #[error("Operation not supported by provider: {0}")]
    Unsupported(String),
}

impl RemoteError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
        }
    }

    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_error_classification() {
        assert!(RemoteError::transient("timeout").is_retryable());
        assert!(!RemoteError::permanent("exists").is_retryable());
        assert!(!RemoteError::Unsupported("NAMESPACE".to_string()).is_retryable());
    }

    #[test]
    fn test_remote_error_display() {
        let err = RemoteError::permanent("[ALREADYEXISTS] Mailbox exists");
        assert_eq!(
            err.to_string(),
            "Permanent remote failure: [ALREADYEXISTS] Mailbox exists"
        );
    }
}
