//! Emitter error taxonomy.

use std::time::Duration;

use crate::transport::TransportError;

/// Result type for emitter operations.
pub type Result<T> = std::result::Result<T, EmitterError>;

/// Boxed error returned by listeners.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors surfaced by the emitter, either as a return value or through the
/// `error` observable event.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EmitterError {
    /// Connect failure, channel failure or mid-session connection loss.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Request to '{event}' timed out after {timeout:?} without a response")]
    RequestTimeout { event: String, timeout: Duration },

    /// A message violated the request/response protocol and was discarded.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// The API was misused; the call was a no-op.
    #[error("Usage error: {0}")]
    Usage(String),

    #[error("Not connected: {0}")]
    NotConnected(String),

    #[error("Publish to '{target}' was nacked {attempts} times, giving up")]
    Nacked { target: String, attempts: usize },

    #[error("Too many pending outbound messages ({pending}), refusing to queue more")]
    Backpressure { pending: usize },

    #[error("Listener for '{event}' failed: {message}")]
    Listener { event: String, message: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A newer `connect()` call took over this attempt loop.
    #[error("Connect attempt superseded by a newer connect() call")]
    Superseded,

    #[error("Gave up connecting after {attempts} attempts")]
    GaveUp { attempts: u32 },

    /// The emitter was dropped while the operation was outstanding.
    #[error("Emitter shut down")]
    Shutdown,
}

impl From<serde_json::Error> for EmitterError {
    fn from(e: serde_json::Error) -> Self {
        EmitterError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message_names_event() {
        let err = EmitterError::RequestTimeout {
            event: "log.pub".to_string(),
            timeout: Duration::from_secs(3),
        };
        assert!(err.to_string().contains("log.pub"));
    }

    #[test]
    fn test_transport_error_converts() {
        let err: EmitterError = TransportError::Closed("bye".into()).into();
        assert!(matches!(err, EmitterError::Transport(TransportError::Closed(_))));
    }
}
