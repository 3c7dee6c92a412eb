//! Error types for the streaming engine.
//!
//! Errors fall into four groups with different handling policies:
//!
//! - **Transient** conditions (nothing queued, a negotiation candidate
//!   refusing) are never errors; the APIs return `None`/`false` instead.
//! - **Fatal transport errors** (broken pipe, peer gone) are scoped to one
//!   connection. The output port catches them per-connection during fanout
//!   so a broken peer does not abort delivery to its siblings.
//! - **Timeouts** are a distinct kind so cleanup paths can swallow them
//!   where a non-fatal treatment is valid (disconnect against an
//!   unresponsive peer).
//! - **Misuse errors** are contract violations by the caller (complex write
//!   on a real-valued stream, empty timestamp list) and propagate
//!   unconditionally.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for streaming operations.
pub type Result<T, E = StreamError> = std::result::Result<T, E>;

/// Main error type for streaming operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum StreamError {
    /// A connection-scoped transport failure. The connection is unusable
    /// until it is torn down and possibly renegotiated.
    #[error("transport failure on connection '{connection_id}': {reason}")]
    Transport {
        connection_id: String,
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A bounded wait on a remote call was exceeded.
    #[error("transport call timed out after {duration:?}")]
    Timeout { duration: Duration },

    /// Shared-memory heap operation failed (allocation, segment attach).
    /// Senders recover by falling back to the inline wire path.
    #[error("shared memory error: {context}")]
    Shm {
        context: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Pipe or filesystem I/O failure during handshake or message exchange.
    #[error("I/O error during {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// Transport negotiation could not produce any usable transport.
    #[error("transport negotiation failed for connection '{connection_id}': {reason}")]
    Negotiation { connection_id: String, reason: String },

    /// A contract violation by the calling component. Never caught
    /// internally.
    #[error("misuse: {details}")]
    Misuse { details: String },
}

impl StreamError {
    /// Returns whether this error is potentially recoverable through retry
    /// or fallback.
    pub fn is_retryable(&self) -> bool {
        match self {
            StreamError::Transport { .. } => false,
            StreamError::Timeout { .. } => true,
            StreamError::Shm { .. } => true,
            StreamError::Io { .. } => false,
            StreamError::Negotiation { .. } => false,
            StreamError::Misuse { .. } => false,
        }
    }

    /// Returns true for the timeout kind, which disconnect cleanup is
    /// allowed to swallow.
    pub fn is_timeout(&self) -> bool {
        matches!(self, StreamError::Timeout { .. })
    }

    /// Helper constructor for connection-scoped transport failures.
    pub fn transport(connection_id: impl Into<String>, reason: impl Into<String>) -> Self {
        StreamError::Transport {
            connection_id: connection_id.into(),
            reason: reason.into(),
            source: None,
        }
    }

    /// Helper constructor for transport failures with an underlying cause.
    pub fn transport_with_source(
        connection_id: impl Into<String>,
        reason: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        StreamError::Transport {
            connection_id: connection_id.into(),
            reason: reason.into(),
            source: Some(source),
        }
    }

    /// Helper constructor for shared-memory failures.
    pub fn shm(context: impl Into<String>) -> Self {
        StreamError::Shm { context: context.into(), source: None }
    }

    /// Helper constructor for shared-memory failures with an I/O cause.
    pub fn shm_with_source(context: impl Into<String>, source: std::io::Error) -> Self {
        StreamError::Shm { context: context.into(), source: Some(source) }
    }

    /// Helper constructor for pipe/filesystem I/O failures.
    pub fn io(operation: impl Into<String>, source: std::io::Error) -> Self {
        StreamError::Io { operation: operation.into(), source }
    }

    /// Helper constructor for misuse (programming) errors.
    pub fn misuse(details: impl Into<String>) -> Self {
        StreamError::Misuse { details: details.into() }
    }

    /// Helper constructor for negotiation failures.
    pub fn negotiation(connection_id: impl Into<String>, reason: impl Into<String>) -> Self {
        StreamError::Negotiation { connection_id: connection_id.into(), reason: reason.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn error_traits_validation() {
        // Compile-time check: StreamError must be Send + Sync + 'static
        fn assert_send_sync_static<T: Send + Sync + 'static>() {}
        assert_send_sync_static::<StreamError>();

        let error = StreamError::transport("conn-1", "pipe closed");
        let _: &dyn std::error::Error = &error;
    }

    #[test]
    fn retry_classification() {
        assert!(StreamError::Timeout { duration: Duration::from_secs(1) }.is_retryable());
        assert!(StreamError::shm("allocation failed").is_retryable());
        assert!(!StreamError::transport("c", "broken").is_retryable());
        assert!(!StreamError::misuse("empty timestamp list").is_retryable());
    }

    #[test]
    fn timeout_is_distinguishable() {
        let timeout = StreamError::Timeout { duration: Duration::from_millis(500) };
        assert!(timeout.is_timeout());
        assert!(!StreamError::transport("c", "broken").is_timeout());
    }

    #[test]
    fn source_chain_is_preserved() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe gone");
        let err = StreamError::transport_with_source("conn-2", "send failed", Box::new(io));
        let source = std::error::Error::source(&err).expect("source should be chained");
        assert!(source.to_string().contains("pipe gone"));
    }

    proptest! {
        #[test]
        fn messages_contain_their_context(
            conn in "[a-z0-9_-]{1,16}",
            reason in "[ -~]*",
        ) {
            let err = StreamError::transport(conn.clone(), reason.clone());
            let msg = err.to_string();
            prop_assert!(msg.contains(&conn));
            prop_assert!(msg.contains(&reason));

            let err = StreamError::misuse(reason.clone());
            prop_assert!(err.to_string().contains(&reason));
        }
    }
}
