//! Transport trait for the serial link to the co-processor.
//!
//! The [`Transport`] trait abstracts over the physical link. The AT engine in
//! `espat-text-io` operates on a `Transport` rather than directly on a serial
//! port, enabling both real hardware control and deterministic unit testing
//! with `MockTransport` from the `espat-test-harness` crate.
//!
//! Time is not part of the trait: waits are measured with
//! `tokio::time::Instant`, which tests can pause and advance.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::{Error, Result};

/// The two-byte line terminator used by the AT command set.
pub const LINE_TERMINATOR: &[u8] = b"\r\n";

/// Asynchronous byte-level transport to an AT co-processor.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send raw bytes to the co-processor.
    ///
    /// Implementations should block until all bytes have been handed to the
    /// underlying port.
    async fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Receive bytes into the provided buffer.
    ///
    /// Returns the number of bytes actually read. Will wait up to `timeout`
    /// for data to arrive; returns [`Error::Timeout`] if nothing is received
    /// within the deadline.
    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Close the transport connection.
    ///
    /// After calling `close()`, subsequent `send()` and `receive()` calls
    /// should return [`Error::NotConnected`].
    async fn close(&mut self) -> Result<()>;

    /// Check whether the transport is currently connected.
    fn is_connected(&self) -> bool;

    /// Write `text` followed by the CR LF terminator.
    async fn write_line(&mut self, text: &str) -> Result<()> {
        let mut line = Vec::with_capacity(text.len() + LINE_TERMINATOR.len());
        line.extend_from_slice(text.as_bytes());
        line.extend_from_slice(LINE_TERMINATOR);
        self.send(&line).await
    }

    /// Read whatever is already available without waiting.
    ///
    /// Returns `Ok(0)` when nothing is pending.
    async fn read_available(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.receive(buf, Duration::ZERO).await {
            Ok(n) => Ok(n),
            Err(Error::Timeout) => Ok(0),
            Err(e) => Err(e),
        }
    }
}
