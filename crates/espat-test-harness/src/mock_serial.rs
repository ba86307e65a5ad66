//! Mock transport for deterministic testing of the AT engine.
//!
//! [`MockTransport`] implements the [`Transport`] trait with pre-loaded
//! request/response pairs. Responses can be held back for a delay measured
//! on the Tokio clock, so tests running with a paused clock can exercise
//! deadlines without real waiting.
//!
//! # Example
//!
//! ```
//! use espat_test_harness::MockTransport;
//!
//! let mut mock = MockTransport::new();
//! // When the engine writes `ATE0\r\n`, answer with an echo and OK.
//! mock.expect_line("ATE0", b"ATE0\r\nOK\r\n");
//! ```

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

use espat_core::error::{Error, Result};
use espat_core::transport::{LINE_TERMINATOR, Transport};

/// A pre-loaded request/response pair for the mock transport.
#[derive(Debug, Clone)]
struct Expectation {
    /// The exact bytes we expect to be sent.
    request: Vec<u8>,
    /// The bytes to make available once the request is seen.
    response: Vec<u8>,
    /// How long after the request the response becomes readable.
    delay: Duration,
}

/// Inbound bytes scheduled to become readable at `ready_at`.
#[derive(Debug)]
struct Chunk {
    ready_at: Instant,
    data: Vec<u8>,
}

#[derive(Debug)]
struct MockState {
    /// Ordered queue of expected request/response pairs.
    expectations: VecDeque<Expectation>,
    /// Bytes waiting to be read, in arrival order.
    inbound: VecDeque<Chunk>,
    /// Upper bound on bytes returned from one `receive()` call.
    max_read: Option<usize>,
    /// Whether the transport is "connected".
    connected: bool,
    /// Log of all bytes sent through this transport.
    sent_log: Vec<Vec<u8>>,
}

impl MockState {
    fn schedule(&mut self, delay: Duration, data: Vec<u8>) {
        if data.is_empty() {
            return;
        }
        self.inbound.push_back(Chunk {
            ready_at: Instant::now() + delay,
            data,
        });
    }
}

/// A mock [`Transport`] for testing the AT engine without hardware.
///
/// Expectations are consumed in order. When `send()` is called, the sent
/// data is recorded and matched against the next expectation; its response
/// is queued for subsequent `receive()` calls after the expectation's delay.
///
/// If no expectation matches or the queue is exhausted, `send()` returns a
/// protocol error.
#[derive(Debug)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

/// A cloneable handle onto a [`MockTransport`]'s state.
///
/// Obtained with [`MockTransport::handle`] before the transport is boxed and
/// handed to an IO task.
#[derive(Debug, Clone)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

fn lock(state: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    // A panicking test thread must not hide the log from the others.
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockTransport {
    /// Create a new mock transport in the connected state.
    pub fn new() -> Self {
        MockTransport {
            state: Arc::new(Mutex::new(MockState {
                expectations: VecDeque::new(),
                inbound: VecDeque::new(),
                max_read: None,
                connected: true,
                sent_log: Vec::new(),
            })),
        }
    }

    /// Add an expected request/response pair.
    ///
    /// When `send()` is called with data matching `request`, `response`
    /// becomes readable immediately.
    pub fn expect(&mut self, request: &[u8], response: &[u8]) {
        self.expect_delayed(request, response, Duration::ZERO);
    }

    /// Add an expected request whose response becomes readable `delay`
    /// after the request is sent.
    pub fn expect_delayed(&mut self, request: &[u8], response: &[u8], delay: Duration) {
        lock(&self.state).expectations.push_back(Expectation {
            request: request.to_vec(),
            response: response.to_vec(),
            delay,
        });
    }

    /// Expect the command line `command` (CR LF appended) and answer with
    /// `response`.
    pub fn expect_line(&mut self, command: &str, response: &[u8]) {
        self.expect(&line_bytes(command), response);
    }

    /// Like [`expect_line`](Self::expect_line) with a delayed answer.
    pub fn expect_line_delayed(&mut self, command: &str, response: &[u8], delay: Duration) {
        self.expect_delayed(&line_bytes(command), response, delay);
    }

    /// Limit how many bytes a single `receive()` returns, to simulate a
    /// link that delivers data piecemeal.
    pub fn set_max_read(&mut self, max_read: usize) {
        lock(&self.state).max_read = Some(max_read.max(1));
    }

    /// Return a handle for injecting data and inspecting the send log after
    /// the transport has been moved.
    pub fn handle(&self) -> MockHandle {
        MockHandle {
            state: Arc::clone(&self.state),
        }
    }

    /// Return a copy of all data sent through this transport.
    ///
    /// Each element is the byte slice from one `send()` call.
    pub fn sent_data(&self) -> Vec<Vec<u8>> {
        lock(&self.state).sent_log.clone()
    }

    /// Return the number of expectations that have not yet been consumed.
    pub fn remaining_expectations(&self) -> usize {
        lock(&self.state).expectations.len()
    }

    /// Make `data` readable now without any request, as the co-processor
    /// does for unsolicited messages.
    pub fn push_unsolicited(&mut self, data: &[u8]) {
        lock(&self.state).schedule(Duration::ZERO, data.to_vec());
    }

    /// Set the connected state of the mock transport.
    ///
    /// When set to `false`, subsequent `send()` and `receive()` calls will
    /// return [`Error::NotConnected`].
    pub fn set_connected(&mut self, connected: bool) {
        lock(&self.state).connected = connected;
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockHandle {
    /// Make `data` readable now.
    pub fn push_unsolicited(&self, data: &[u8]) {
        lock(&self.state).schedule(Duration::ZERO, data.to_vec());
    }

    /// Make `data` readable after `delay`.
    pub fn push_unsolicited_after(&self, delay: Duration, data: &[u8]) {
        lock(&self.state).schedule(delay, data.to_vec());
    }

    /// Return a copy of all data sent through the transport.
    pub fn sent_data(&self) -> Vec<Vec<u8>> {
        lock(&self.state).sent_log.clone()
    }

    /// Return the sent data decoded as text lines with terminators removed.
    pub fn sent_lines(&self) -> Vec<String> {
        lock(&self.state)
            .sent_log
            .iter()
            .map(|bytes| {
                let bytes = bytes.strip_suffix(LINE_TERMINATOR).unwrap_or(bytes);
                String::from_utf8_lossy(bytes).into_owned()
            })
            .collect()
    }

    /// Return the number of expectations that have not yet been consumed.
    pub fn remaining_expectations(&self) -> usize {
        lock(&self.state).expectations.len()
    }
}

fn line_bytes(command: &str) -> Vec<u8> {
    let mut bytes = command.as_bytes().to_vec();
    bytes.extend_from_slice(LINE_TERMINATOR);
    bytes
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        let mut state = lock(&self.state);
        if !state.connected {
            return Err(Error::NotConnected);
        }

        // Record what was sent.
        state.sent_log.push(data.to_vec());

        // Match against the next expectation.
        if let Some(expectation) = state.expectations.pop_front() {
            if data != expectation.request.as_slice() {
                return Err(Error::Protocol(format!(
                    "unexpected send data: expected {:?}, got {:?}",
                    String::from_utf8_lossy(&expectation.request),
                    String::from_utf8_lossy(data)
                )));
            }
            state.schedule(expectation.delay, expectation.response);
            Ok(())
        } else {
            Err(Error::Protocol(
                "no more expectations in mock transport".into(),
            ))
        }
    }

    async fn receive(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
        let mut state = lock(&self.state);
        if !state.connected {
            return Err(Error::NotConnected);
        }

        let now = Instant::now();
        let limit = state.max_read.unwrap_or(usize::MAX).min(buf.len());
        let Some(chunk) = state.inbound.front_mut() else {
            return Err(Error::Timeout);
        };
        if chunk.ready_at > now {
            return Err(Error::Timeout);
        }

        let n = chunk.data.len().min(limit);
        buf[..n].copy_from_slice(&chunk.data[..n]);
        chunk.data.drain(..n);
        if chunk.data.is_empty() {
            state.inbound.pop_front();
        }
        Ok(n)
    }

    async fn close(&mut self) -> Result<()> {
        let mut state = lock(&self.state);
        state.connected = false;
        state.inbound.clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use espat_core::transport::Transport;

    #[tokio::test]
    async fn mock_transport_basic_send_receive() {
        let mut mock = MockTransport::new();
        mock.expect(b"ATE0\r\n", b"OK\r\n");

        mock.send(b"ATE0\r\n").await.unwrap();

        let mut buf = [0u8; 64];
        let n = mock
            .receive(&mut buf, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(&buf[..n], b"OK\r\n");
    }

    #[tokio::test]
    async fn mock_transport_expect_line_appends_terminator() {
        let mut mock = MockTransport::new();
        mock.expect_line("AT", b"OK\r\n");
        mock.write_line("AT").await.unwrap();
        assert_eq!(mock.sent_data(), vec![b"AT\r\n".to_vec()]);
    }

    #[tokio::test]
    async fn mock_transport_wrong_data_errors() {
        let mut mock = MockTransport::new();
        mock.expect(b"AT\r\n", b"OK\r\n");

        let result = mock.send(b"ATE0\r\n").await;
        assert!(matches!(result.unwrap_err(), Error::Protocol(_)));
    }

    #[tokio::test]
    async fn mock_transport_no_expectations_errors() {
        let mut mock = MockTransport::new();
        let result = mock.send(b"AT\r\n").await;
        assert!(matches!(result.unwrap_err(), Error::Protocol(_)));
    }

    #[tokio::test]
    async fn mock_transport_receive_without_data_times_out() {
        let mut mock = MockTransport::new();
        let mut buf = [0u8; 64];
        let result = mock.receive(&mut buf, Duration::from_millis(10)).await;
        assert!(matches!(result.unwrap_err(), Error::Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn mock_transport_delayed_response() {
        let mut mock = MockTransport::new();
        mock.expect_delayed(b"AT\r\n", b"OK\r\n", Duration::from_millis(300));
        mock.send(b"AT\r\n").await.unwrap();

        let mut buf = [0u8; 64];
        assert!(mock.read_available(&mut buf).await.unwrap() == 0);

        tokio::time::sleep(Duration::from_millis(300)).await;
        let n = mock.read_available(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"OK\r\n");
    }

    #[tokio::test]
    async fn mock_transport_max_read_splits_delivery() {
        let mut mock = MockTransport::new();
        mock.set_max_read(2);
        mock.push_unsolicited(b"OK\r\n");

        let mut buf = [0u8; 64];
        let n = mock.read_available(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"OK");
        let n = mock.read_available(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"\r\n");
        assert_eq!(mock.read_available(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn mock_handle_shares_state() {
        let mut mock = MockTransport::new();
        let handle = mock.handle();
        mock.expect_line("AT+CWMODE=1", b"");

        mock.write_line("AT+CWMODE=1").await.unwrap();
        assert_eq!(handle.sent_lines(), vec!["AT+CWMODE=1".to_string()]);
        assert_eq!(handle.remaining_expectations(), 0);

        handle.push_unsolicited(b"+MQTTSUBRECV:0,\"a\",\"b\"\r\n");
        let mut buf = [0u8; 64];
        let n = mock.read_available(&mut buf).await.unwrap();
        assert!(n > 0);
    }

    #[tokio::test]
    async fn mock_transport_disconnect() {
        let mut mock = MockTransport::new();
        assert!(mock.is_connected());

        mock.close().await.unwrap();
        assert!(!mock.is_connected());

        let result = mock.send(b"AT\r\n").await;
        assert!(matches!(result.unwrap_err(), Error::NotConnected));
    }

    #[tokio::test]
    async fn mock_transport_set_connected() {
        let mut mock = MockTransport::new();
        mock.set_connected(false);

        let mut buf = [0u8; 8];
        let result = mock.receive(&mut buf, Duration::from_millis(10)).await;
        assert!(matches!(result.unwrap_err(), Error::NotConnected));
    }

    #[tokio::test]
    async fn mock_transport_remaining_expectations() {
        let mut mock = MockTransport::new();
        mock.expect_line("AT", b"OK\r\n");
        mock.expect_line("ATE0", b"OK\r\n");
        assert_eq!(mock.remaining_expectations(), 2);

        mock.write_line("AT").await.unwrap();
        assert_eq!(mock.remaining_expectations(), 1);
    }
}
