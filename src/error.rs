use thiserror::Error;

/// Errors surfaced by the relay core.
///
/// Transport failures leave the connection manager as [`RelayError::Config`] when retrying
/// cannot help, as [`RelayError::ConnectExhausted`] from `connect()`, and as
/// [`RelayError::TransientIo`] from a failed send.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Missing or malformed configuration. Never retried.
    #[error("configuration error: {0}")]
    Config(String),

    /// All connect attempts for one `connect()` call failed.
    #[error("could not connect after {attempts} attempts: {last_error}")]
    ConnectExhausted { attempts: u32, last_error: String },

    /// Recoverable I/O trouble on the mesh link.
    #[error("transient I/O error: {0}")]
    TransientIo(String),

    /// A plugin failed while handling an event.
    #[error("plugin {plugin} failed: {reason}")]
    Plugin { plugin: String, reason: String },

    /// No live transport handle to send through.
    #[error("not connected to the mesh radio")]
    NotConnected,

    /// The chat network rejected or failed a request.
    #[error("chat relay error: {0}")]
    Chat(String),
}

impl RelayError {
    /// True for failures the caller should not retry.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RelayError::Config(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausted_message_names_attempts() {
        let err = RelayError::ConnectExhausted {
            attempts: 3,
            last_error: "connection refused".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "could not connect after 3 attempts: connection refused"
        );
        assert!(!err.is_fatal());
        assert!(RelayError::Config("missing host".into()).is_fatal());
    }
}
