//! Error types for espat.
//!
//! Protocol outcomes (timeouts, `ERROR` replies, unknown topics) are reported
//! by return value from the command engine. [`Error`] covers the faults that
//! sit underneath the protocol: a closed port, an I/O failure, or an IO task
//! that is no longer running.

/// The error type for all espat operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A transport-level error (serial port open or configuration failure).
    #[error("transport error: {0}")]
    Transport(String),

    /// A protocol-level error (unparseable response, scripted mismatch).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Timed out waiting for data from the co-processor.
    ///
    /// Returned by [`Transport::receive`](crate::transport::Transport::receive)
    /// when no byte arrives within the requested window. The command engine
    /// absorbs this and reports a failed wait instead.
    #[error("timeout waiting for response")]
    Timeout,

    /// An invalid parameter was passed to a command builder.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// No connection to the co-processor has been established, or the IO
    /// task has shut down.
    #[error("not connected")]
    NotConnected,

    /// The connection to the co-processor was lost unexpectedly.
    #[error("connection lost")]
    ConnectionLost,

    /// An underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_transport() {
        let e = Error::Transport("port busy".into());
        assert_eq!(e.to_string(), "transport error: port busy");
    }

    #[test]
    fn error_display_protocol() {
        let e = Error::Protocol("bad SNTP reply".into());
        assert_eq!(e.to_string(), "protocol error: bad SNTP reply");
    }

    #[test]
    fn error_display_timeout() {
        assert_eq!(Error::Timeout.to_string(), "timeout waiting for response");
    }

    #[test]
    fn error_display_invalid_parameter() {
        let e = Error::InvalidParameter("qos must be 0, 1 or 2".into());
        assert_eq!(e.to_string(), "invalid parameter: qos must be 0, 1 or 2");
    }

    #[test]
    fn error_display_not_connected() {
        assert_eq!(Error::NotConnected.to_string(), "not connected");
    }

    #[test]
    fn error_display_connection_lost() {
        assert_eq!(Error::ConnectionLost.to_string(), "connection lost");
    }

    #[test]
    fn error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broken");
        let e: Error = io_err.into();
        assert!(matches!(e, Error::Io(_)));
        assert!(e.to_string().contains("pipe broken"));
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}
        assert_send::<Error>();
        assert_sync::<Error>();
    }

    #[test]
    fn error_implements_std_error() {
        fn assert_std_error<T: std::error::Error>() {}
        assert_std_error::<Error>();
    }
}
