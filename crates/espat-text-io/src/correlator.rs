//! Command/response correlation.
//!
//! [`Correlator`] writes a command, then reads the stream line by line until
//! a line contains the expected text, an `ERROR` line cuts a command's wait
//! for `OK` short, or the deadline passes. Every line is inspected exactly
//! once and discarded if it does not decide the wait.
//!
//! The correlator keeps its accumulator between calls, so a
//! [`get_response`](Correlator::get_response) issued right after a
//! fire-and-forget [`send_command`](Correlator::send_command) sees the reply
//! lines that were already buffered. Sending a command always flushes it.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace, warn};

use espat_core::error::Result;
use espat_core::transport::Transport;

use crate::protocol::{self, LineBuffer};

/// Maximum buffered bytes before the accumulator is reset.
///
/// AT replies are short; a buffer this large without a terminator means the
/// link is producing garbage.
const MAX_BUF: usize = 8192;

/// Upper bound on reads spent discarding stale input before a command.
const MAX_FLUSH_READS: usize = 64;

/// How a single wait ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    /// A line containing the expected text arrived.
    Matched(String),
    /// An `ERROR` line arrived while waiting for `OK`.
    Failed(String),
    /// The deadline passed first.
    TimedOut,
}

/// Sends commands and correlates their replies.
#[derive(Debug)]
pub struct Correlator {
    rx: LineBuffer,
    poll_interval: Duration,
    command_gap: Duration,
}

impl Correlator {
    /// Create a correlator that pauses `poll_interval` between empty reads
    /// and waits `command_gap` before each command.
    pub fn new(poll_interval: Duration, command_gap: Duration) -> Self {
        Correlator {
            rx: LineBuffer::new(),
            poll_interval,
            command_gap,
        }
    }

    /// Send `command` and, if `expected` is given, wait for it.
    ///
    /// Returns `Ok(true)` when a line containing `expected` arrives within
    /// `timeout`, or immediately after writing when `expected` is `None`.
    /// Returns `Ok(false)` on timeout, or as soon as an `ERROR` line is seen
    /// while `expected` is `"OK"`. `Err` is reserved for transport faults.
    pub async fn send_command(
        &mut self,
        transport: &mut dyn Transport,
        command: &str,
        expected: Option<&str>,
        timeout: Duration,
    ) -> Result<bool> {
        self.send_command_routed(transport, command, expected, timeout, &mut |_: &str| {})
            .await
    }

    /// [`send_command`](Self::send_command) that hands every discarded line
    /// to `on_discard`.
    pub async fn send_command_routed(
        &mut self,
        transport: &mut dyn Transport,
        command: &str,
        expected: Option<&str>,
        timeout: Duration,
        on_discard: &mut (dyn FnMut(&str) + Send),
    ) -> Result<bool> {
        if !self.command_gap.is_zero() {
            tokio::time::sleep(self.command_gap).await;
        }
        self.flush(transport).await?;
        transport.write_line(command).await?;
        debug!(command, ?expected, "sent AT command");

        let Some(expected) = expected else {
            return Ok(true);
        };

        let short_circuit = expected == protocol::OK;
        let outcome = self
            .wait_for(transport, expected, short_circuit, timeout, on_discard)
            .await?;
        Ok(matches!(outcome, WaitOutcome::Matched(_)))
    }

    /// Wait for a line containing `expected` without sending anything.
    ///
    /// Unlike [`send_command`](Self::send_command), an `ERROR` line does not
    /// end the wait; it is discarded like any other non-matching line.
    ///
    /// Returns the whole matching line. If the deadline passes but the
    /// unterminated remainder of the buffer already contains `expected`,
    /// that raw text is returned instead and left buffered. Returns
    /// `Ok(None)` otherwise.
    pub async fn get_response(
        &mut self,
        transport: &mut dyn Transport,
        expected: &str,
        timeout: Duration,
    ) -> Result<Option<String>> {
        self.get_response_routed(transport, expected, timeout, &mut |_: &str| {})
            .await
    }

    /// [`get_response`](Self::get_response) that hands every discarded line
    /// to `on_discard`.
    pub async fn get_response_routed(
        &mut self,
        transport: &mut dyn Transport,
        expected: &str,
        timeout: Duration,
        on_discard: &mut (dyn FnMut(&str) + Send),
    ) -> Result<Option<String>> {
        match self
            .wait_for(transport, expected, false, timeout, on_discard)
            .await?
        {
            WaitOutcome::Matched(line) => Ok(Some(line)),
            WaitOutcome::Failed(_) => Ok(None),
            WaitOutcome::TimedOut => {
                if !self.rx.is_empty() && self.rx.contains(expected) {
                    debug!(expected, "using unterminated buffer after timeout");
                    Ok(Some(self.rx.text()))
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// Drive the line framer until the wait is decided.
    ///
    /// Check order on every pass: buffered lines are tested for a match,
    /// then (when `short_circuit` is set) for an `ERROR` line, and only when
    /// no line decides the wait is the deadline consulted.
    pub async fn wait_for(
        &mut self,
        transport: &mut dyn Transport,
        expected: &str,
        short_circuit: bool,
        timeout: Duration,
        on_discard: &mut (dyn FnMut(&str) + Send),
    ) -> Result<WaitOutcome> {
        let start = Instant::now();
        let mut chunk = [0u8; 256];

        loop {
            while let Some(line) = self.rx.next_line() {
                if line.contains(expected) {
                    debug!(expected, line = %line, "matched response line");
                    return Ok(WaitOutcome::Matched(line));
                }
                if short_circuit && line.contains(protocol::ERROR) {
                    debug!(line = %line, "error reply while waiting for OK");
                    return Ok(WaitOutcome::Failed(line));
                }
                trace!(line = %line, expected, "discarding unmatched line");
                on_discard(&line);
            }

            if start.elapsed() > timeout {
                debug!(
                    expected,
                    timeout_ms = timeout.as_millis() as u64,
                    "timed out waiting for response"
                );
                return Ok(WaitOutcome::TimedOut);
            }

            let n = transport.read_available(&mut chunk).await?;
            if n > 0 {
                self.rx.extend(&chunk[..n]);
                if self.rx.len() > MAX_BUF {
                    warn!(len = self.rx.len(), "response buffer overflow, clearing");
                    self.rx.clear();
                }
            } else {
                tokio::time::sleep(self.poll_interval).await;
            }
        }
    }

    /// Discard stale input: whatever the transport has pending and whatever
    /// is left in the accumulator.
    async fn flush(&mut self, transport: &mut dyn Transport) -> Result<()> {
        let mut chunk = [0u8; 256];
        let mut flushed = 0usize;
        for _ in 0..MAX_FLUSH_READS {
            let n = transport.read_available(&mut chunk).await?;
            if n == 0 {
                break;
            }
            flushed += n;
        }
        if flushed > 0 || !self.rx.is_empty() {
            trace!(
                flushed,
                buffered = self.rx.len(),
                "discarding stale input before command"
            );
        }
        self.rx.clear();
        Ok(())
    }
}
