//! IO task types and implementation for AT links.
//!
//! One tokio task owns the transport exclusively. Requests arrive over an
//! mpsc channel and are served one at a time by the [`AtEngine`]; between
//! requests the task reads the idle stream and feeds the dispatcher, which
//! invokes subscription handlers and emits [`AtEvent`]s.

use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use espat_core::error::{Error, Result};
use espat_core::events::AtEvent;
use espat_core::transport::Transport;

use crate::dispatcher::{MessageHandler, SubscriptionRegistry};
use crate::engine::AtEngine;
use crate::protocol;
use crate::watch::{DEFAULT_WINDOW_KEEP, DEFAULT_WINDOW_LIMIT, TokenWatch, WatchOutcome};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Slack added to a request's own timeout before the caller gives up on the
/// IO task.
const REPLY_MARGIN: Duration = Duration::from_millis(500);

/// Configuration for the AT IO task.
#[derive(Debug, Clone)]
pub struct IoConfig {
    /// Pause between empty reads while a wait is in progress.
    pub poll_interval: Duration,
    /// Pause before each correlated command.
    pub command_gap: Duration,
    /// How long one idle read may block before the loop rechecks requests.
    pub idle_read_timeout: Duration,
    /// Unsolicited message marker.
    pub marker: &'static str,
    /// Characters between the marker and the first field.
    pub prefix_len: usize,
    /// Dispatcher accumulator bound.
    pub overflow_limit: usize,
    /// Suffix kept when the dispatcher accumulator is cut back.
    pub overflow_keep: usize,
    /// Hand marker lines discarded by a command wait to the dispatcher.
    ///
    /// Off by default: messages that arrive while a command is waiting are
    /// lost.
    pub route_unsolicited_during_wait: bool,
}

impl Default for IoConfig {
    fn default() -> Self {
        IoConfig {
            poll_interval: Duration::from_millis(10),
            command_gap: Duration::from_millis(10),
            idle_read_timeout: Duration::from_millis(100),
            marker: protocol::UNSOLICITED_MARKER,
            prefix_len: protocol::MARKER_PREFIX_LEN,
            overflow_limit: DEFAULT_WINDOW_LIMIT,
            overflow_keep: DEFAULT_WINDOW_KEEP,
            route_unsolicited_during_wait: false,
        }
    }
}

/// A request sent from the device layer to the IO task.
pub enum Request {
    /// Send a command, optionally waiting for a line containing `expected`.
    Command {
        command: String,
        expected: Option<String>,
        timeout: Duration,
        reply: oneshot::Sender<Result<bool>>,
    },
    /// Wait for a line containing `expected` without sending.
    Response {
        expected: String,
        timeout: Duration,
        reply: oneshot::Sender<Result<Option<String>>>,
    },
    /// Fire-and-forget `command`, then wait for `expected`.
    Query {
        command: String,
        expected: String,
        timeout: Duration,
        reply: oneshot::Sender<Result<Option<String>>>,
    },
    /// Write a raw line.
    Write {
        text: String,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Optionally write `command`, then watch the raw stream for tokens.
    Watch {
        command: Option<String>,
        watch: TokenWatch,
        timeout: Duration,
        reply: oneshot::Sender<Result<WatchOutcome>>,
    },
    /// Graceful shutdown; returns the transport for recovery.
    Shutdown {
        reply: oneshot::Sender<Box<dyn Transport>>,
    },
}

/// Handle to the IO task.
pub struct AtIo {
    pub tx: mpsc::Sender<Request>,
    pub cancel: CancellationToken,
    pub task: JoinHandle<()>,
    registry: SubscriptionRegistry,
    event_tx: broadcast::Sender<AtEvent>,
}

impl AtIo {
    /// Send a command; see [`Correlator::send_command`](crate::Correlator::send_command).
    pub async fn send_command(
        &self,
        command: &str,
        expected: Option<&str>,
        timeout: Duration,
    ) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.request(
            Request::Command {
                command: command.to_string(),
                expected: expected.map(str::to_string),
                timeout,
                reply,
            },
            rx,
            Some(timeout),
        )
        .await
    }

    /// Wait for a response line; see
    /// [`Correlator::get_response`](crate::Correlator::get_response).
    pub async fn get_response(&self, expected: &str, timeout: Duration) -> Result<Option<String>> {
        let (reply, rx) = oneshot::channel();
        self.request(
            Request::Response {
                expected: expected.to_string(),
                timeout,
                reply,
            },
            rx,
            Some(timeout),
        )
        .await
    }

    /// Send `command` without waiting, then wait for a line containing
    /// `expected`, as one request.
    pub async fn query(
        &self,
        command: &str,
        expected: &str,
        timeout: Duration,
    ) -> Result<Option<String>> {
        let (reply, rx) = oneshot::channel();
        self.request(
            Request::Query {
                command: command.to_string(),
                expected: expected.to_string(),
                timeout,
                reply,
            },
            rx,
            Some(timeout),
        )
        .await
    }

    /// Write a raw line without flushing or waiting.
    pub async fn write_line(&self, text: &str) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.request(
            Request::Write {
                text: text.to_string(),
                reply,
            },
            rx,
            None,
        )
        .await
    }

    /// Optionally write `command`, then watch for tokens for up to `timeout`.
    pub async fn watch(
        &self,
        command: Option<&str>,
        watch: TokenWatch,
        timeout: Duration,
    ) -> Result<WatchOutcome> {
        let (reply, rx) = oneshot::channel();
        self.request(
            Request::Watch {
                command: command.map(str::to_string),
                watch,
                timeout,
                reply,
            },
            rx,
            Some(timeout),
        )
        .await
    }

    /// Register `handler` for messages on `topic`, replacing any previous
    /// handler.
    pub fn register_handler(&self, topic: impl Into<String>, handler: impl MessageHandler) {
        self.registry.register(topic, handler);
    }

    /// The registry shared with the IO task.
    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    /// Subscribe to link events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<AtEvent> {
        self.event_tx.subscribe()
    }

    /// Shut down the IO task and recover the transport.
    pub async fn shutdown(self) -> Result<Box<dyn Transport>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self.tx.send(Request::Shutdown { reply: reply_tx }).await;
        let transport = reply_rx.await.map_err(|_| Error::NotConnected)?;
        let _ = self.task.await;
        Ok(transport)
    }

    async fn request<T>(
        &self,
        req: Request,
        reply_rx: oneshot::Receiver<Result<T>>,
        timeout: Option<Duration>,
    ) -> Result<T> {
        self.tx.send(req).await.map_err(|_| Error::NotConnected)?;

        let Some(timeout) = timeout else {
            return reply_rx.await.unwrap_or(Err(Error::NotConnected));
        };
        match tokio::time::timeout(timeout + REPLY_MARGIN, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::NotConnected),
            Err(_) => Err(Error::Timeout),
        }
    }
}

// ---------------------------------------------------------------------------
// Spawn
// ---------------------------------------------------------------------------

/// Spawn the IO task. Returns the handle for sending requests.
///
/// Handlers registered in `registry`, before or after spawning, receive
/// messages read from the idle stream. Every decoded message is also
/// broadcast on `event_tx`.
pub fn spawn_io_task(
    transport: Box<dyn Transport>,
    config: IoConfig,
    registry: SubscriptionRegistry,
    event_tx: broadcast::Sender<AtEvent>,
) -> AtIo {
    let (tx, rx) = mpsc::channel::<Request>(32);
    let cancel = CancellationToken::new();

    let engine = AtEngine::new(transport, &config, registry.clone(), Some(event_tx.clone()));
    let task = tokio::spawn(io_loop(engine, config, rx, cancel.clone()));

    AtIo {
        tx,
        cancel,
        task,
        registry,
        event_tx,
    }
}

// ---------------------------------------------------------------------------
// IO Loop
// ---------------------------------------------------------------------------

/// The main IO loop. Runs as a spawned Tokio task.
///
/// Uses `tokio::select! { biased; }` to prioritize:
/// 1. Cancellation
/// 2. Requests
/// 3. Idle unsolicited reads
async fn io_loop(
    mut engine: AtEngine,
    config: IoConfig,
    mut rx: mpsc::Receiver<Request>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!("AT IO task cancelled");
                break;
            }

            req = rx.recv() => {
                match req {
                    Some(Request::Shutdown { reply }) => {
                        debug!("AT IO task shutdown requested");
                        let _ = reply.send(engine.into_transport());
                        return;
                    }
                    Some(req) => handle_request(req, &mut engine).await,
                    None => {
                        debug!("request channel closed, exiting AT IO task");
                        break;
                    }
                }
            }

            _ = async {
                match engine.poll_unsolicited(config.idle_read_timeout).await {
                    Ok(Some(outcome)) => trace!(?outcome, "idle dispatch pass"),
                    Ok(None) => tokio::time::sleep(config.poll_interval).await,
                    Err(e) => {
                        trace!(error = %e, "idle read failed");
                        tokio::time::sleep(config.poll_interval).await;
                    }
                }
            } => {}
        }
    }

    if let Err(e) = engine.close().await {
        debug!(error = %e, "error closing transport");
    }
}

/// Serve a single request on the engine.
async fn handle_request(req: Request, engine: &mut AtEngine) {
    match req {
        Request::Command {
            command,
            expected,
            timeout,
            reply,
        } => {
            let result = engine
                .send_command(&command, expected.as_deref(), timeout)
                .await;
            let _ = reply.send(result);
        }
        Request::Response {
            expected,
            timeout,
            reply,
        } => {
            let result = engine.get_response(&expected, timeout).await;
            let _ = reply.send(result);
        }
        Request::Query {
            command,
            expected,
            timeout,
            reply,
        } => {
            let result = engine.query(&command, &expected, timeout).await;
            let _ = reply.send(result);
        }
        Request::Write { text, reply } => {
            let result = engine.write_line(&text).await;
            let _ = reply.send(result);
        }
        Request::Watch {
            command,
            watch,
            timeout,
            reply,
        } => {
            let result = engine.watch(command.as_deref(), &watch, timeout).await;
            let _ = reply.send(result);
        }
        Request::Shutdown { .. } => unreachable!("Shutdown handled in io_loop"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use espat_test_harness::MockTransport;

    fn spawn(mock: MockTransport) -> AtIo {
        let (event_tx, _) = broadcast::channel(16);
        spawn_io_task(
            Box::new(mock),
            IoConfig::default(),
            SubscriptionRegistry::new(),
            event_tx,
        )
    }

    #[test]
    fn io_config_defaults() {
        let config = IoConfig::default();
        assert_eq!(config.poll_interval, Duration::from_millis(10));
        assert_eq!(config.command_gap, Duration::from_millis(10));
        assert_eq!(config.marker, "MQTTSUBRECV");
        assert_eq!(config.prefix_len, 3);
        assert_eq!(config.overflow_limit, 30);
        assert_eq!(config.overflow_keep, 15);
        assert!(!config.route_unsolicited_during_wait);
    }

    #[tokio::test]
    async fn at_io_not_connected_when_task_gone() {
        let (tx, rx) = mpsc::channel(32);
        drop(rx);
        let (event_tx, _) = broadcast::channel(16);

        let io = AtIo {
            tx,
            cancel: CancellationToken::new(),
            task: tokio::spawn(async {}),
            registry: SubscriptionRegistry::new(),
            event_tx,
        };
        let result = io
            .send_command("AT", Some("OK"), Duration::from_millis(100))
            .await;
        assert!(matches!(result, Err(Error::NotConnected)));
    }

    #[tokio::test(start_paused = true)]
    async fn io_task_command_ok() {
        let mut mock = MockTransport::new();
        mock.expect_line("ATE0", b"ATE0\r\nOK\r\n");
        let io = spawn(mock);

        let ok = io
            .send_command("ATE0", Some("OK"), Duration::from_millis(500))
            .await
            .unwrap();
        assert!(ok);

        let _ = io.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn io_task_command_error_short_circuits() {
        let mut mock = MockTransport::new();
        mock.expect_line("AT+CWMODE=9", b"ERROR\r\n");
        let io = spawn(mock);

        let start = tokio::time::Instant::now();
        let ok = io
            .send_command("AT+CWMODE=9", Some("OK"), Duration::from_millis(500))
            .await
            .unwrap();
        assert!(!ok);
        assert!(start.elapsed() < Duration::from_millis(500));

        let _ = io.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn io_task_query_returns_line() {
        let mut mock = MockTransport::new();
        mock.expect_line_delayed(
            "AT+CIPSNTPTIME?",
            b"+CIPSNTPTIME:Mon Jan 02 03:04:05 2024\r\nOK\r\n",
            Duration::from_millis(150),
        );
        let io = spawn(mock);

        let line = io
            .query("AT+CIPSNTPTIME?", "+CIPSNTPTIME:", Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(
            line.as_deref(),
            Some("+CIPSNTPTIME:Mon Jan 02 03:04:05 2024")
        );
        let ok = io.get_response("OK", Duration::from_secs(2)).await.unwrap();
        assert_eq!(ok.as_deref(), Some("OK"));

        let _ = io.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn io_task_dispatches_idle_message() {
        let mock = MockTransport::new();
        let handle = mock.handle();
        let io = spawn(mock);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        io.register_handler("sensors/temp", move |payload: &str| {
            sink.lock().unwrap().push(payload.to_string())
        });
        let mut events = io.subscribe_events();

        handle.push_unsolicited(b"+MQTTSUBRECV:0,\"sensors/temp\",\"21.5\"\r\n");

        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            AtEvent::MessageReceived {
                topic: "sensors/temp".into(),
                payload: "21.5".into(),
            }
        );
        assert_eq!(*seen.lock().unwrap(), vec!["21.5".to_string()]);

        let _ = io.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn io_task_write_and_watch() {
        let mut mock = MockTransport::new();
        mock.expect_line("AT+CIPSEND=12", b"OK\r\n> ");
        mock.expect_line_delayed(
            "GET /update",
            b"\r\nRecv 12 bytes\r\n\r\nSEND OK\r\n",
            Duration::from_millis(400),
        );
        let handle = mock.handle();
        let io = spawn(mock);

        io.write_line("AT+CIPSEND=12").await.unwrap();
        let outcome = io
            .watch(
                Some("GET /update"),
                TokenWatch::new("SEND OK").fail_on("ERROR"),
                Duration::from_secs(4),
            )
            .await
            .unwrap();
        assert!(outcome.is_success());
        assert_eq!(handle.sent_lines(), vec!["AT+CIPSEND=12", "GET /update"]);

        let _ = io.shutdown().await;
    }

    #[tokio::test]
    async fn io_task_shutdown_recovers_transport() {
        let io = spawn(MockTransport::new());
        let transport = io.shutdown().await.unwrap();
        assert!(transport.is_connected());
    }

    #[tokio::test]
    async fn io_task_cancel_stops_loop() {
        let io = spawn(MockTransport::new());
        io.cancel.cancel();
        let AtIo { task, .. } = io;
        task.await.unwrap();
    }
}
