//! The AT engine: one transport, one correlator, one dispatcher.
//!
//! [`AtEngine`] is the piece the IO task drives. It owns the transport, so
//! the correlator and the dispatcher never race for bytes: the correlator
//! reads only while a request is being served, and the dispatcher reads only
//! between requests.

use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, trace};

use espat_core::error::{Error, Result};
use espat_core::events::AtEvent;
use espat_core::transport::Transport;

use crate::correlator::Correlator;
use crate::dispatcher::{DispatchOutcome, Dispatcher, SubscriptionRegistry};
use crate::io::IoConfig;
use crate::watch::{TokenWatch, WatchOutcome};

/// Reads spent handing pending bytes to the dispatcher before a command.
const MAX_PENDING_READS: usize = 16;

pub struct AtEngine {
    transport: Box<dyn Transport>,
    correlator: Correlator,
    dispatcher: Dispatcher,
    event_tx: Option<broadcast::Sender<AtEvent>>,
    route_during_wait: bool,
    poll_interval: Duration,
    marker: &'static str,
}

impl AtEngine {
    /// Build an engine around `transport`.
    ///
    /// Decoded unsolicited messages are reported on `event_tx` when given.
    pub fn new(
        transport: Box<dyn Transport>,
        config: &IoConfig,
        registry: SubscriptionRegistry,
        event_tx: Option<broadcast::Sender<AtEvent>>,
    ) -> Self {
        AtEngine {
            transport,
            correlator: Correlator::new(config.poll_interval, config.command_gap),
            dispatcher: Dispatcher::with_marker(
                registry,
                config.marker,
                config.prefix_len,
                config.overflow_limit,
                config.overflow_keep,
            ),
            event_tx,
            route_during_wait: config.route_unsolicited_during_wait,
            poll_interval: config.poll_interval,
            marker: config.marker,
        }
    }

    /// Handlers consulted by the dispatcher.
    pub fn registry(&self) -> &SubscriptionRegistry {
        self.dispatcher.registry()
    }

    /// Send a command and optionally wait for a line containing `expected`.
    pub async fn send_command(
        &mut self,
        command: &str,
        expected: Option<&str>,
        timeout: Duration,
    ) -> Result<bool> {
        self.dispatch_pending().await?;
        let route = self.route_during_wait;
        let marker = self.marker;
        let AtEngine {
            transport,
            correlator,
            dispatcher,
            event_tx,
            ..
        } = self;
        correlator
            .send_command_routed(
                &mut **transport,
                command,
                expected,
                timeout,
                &mut |line: &str| {
                    if route && line.contains(marker) {
                        route_line(dispatcher, event_tx.as_ref(), line);
                    }
                },
            )
            .await
    }

    /// Wait for a line containing `expected` without sending anything.
    pub async fn get_response(
        &mut self,
        expected: &str,
        timeout: Duration,
    ) -> Result<Option<String>> {
        let route = self.route_during_wait;
        let marker = self.marker;
        let AtEngine {
            transport,
            correlator,
            dispatcher,
            event_tx,
            ..
        } = self;
        correlator
            .get_response_routed(
                &mut **transport,
                expected,
                timeout,
                &mut |line: &str| {
                    if route && line.contains(marker) {
                        route_line(dispatcher, event_tx.as_ref(), line);
                    }
                },
            )
            .await
    }

    /// Send `command` without waiting, then wait for a line containing
    /// `expected`. No idle read can run in between.
    pub async fn query(
        &mut self,
        command: &str,
        expected: &str,
        timeout: Duration,
    ) -> Result<Option<String>> {
        self.send_command(command, None, timeout).await?;
        self.get_response(expected, timeout).await
    }

    /// Write a raw line. Nothing is flushed and nothing is awaited.
    pub async fn write_line(&mut self, text: &str) -> Result<()> {
        self.transport.write_line(text).await?;
        debug!(text, "wrote line");
        Ok(())
    }

    /// Optionally write `command`, then watch the raw stream for tokens.
    pub async fn watch(
        &mut self,
        command: Option<&str>,
        watch: &TokenWatch,
        timeout: Duration,
    ) -> Result<WatchOutcome> {
        if let Some(command) = command {
            self.write_line(command).await?;
        }
        watch
            .run(&mut *self.transport, timeout, self.poll_interval)
            .await
    }

    /// Read once from the idle stream and run one dispatcher pass.
    ///
    /// Returns `Ok(None)` when nothing arrived within `idle_timeout`.
    pub async fn poll_unsolicited(
        &mut self,
        idle_timeout: Duration,
    ) -> Result<Option<DispatchOutcome>> {
        let mut chunk = [0u8; 256];
        match self.transport.receive(&mut chunk, idle_timeout).await {
            Ok(0) | Err(Error::Timeout) => Ok(None),
            Ok(n) => {
                trace!(n, "idle read");
                let outcome = self.dispatcher.feed(&chunk[..n]);
                emit(self.event_tx.as_ref(), &outcome);
                Ok(Some(outcome))
            }
            Err(e) => Err(e),
        }
    }

    /// Close the transport.
    pub async fn close(&mut self) -> Result<()> {
        self.transport.close().await
    }

    /// Give the transport back.
    pub fn into_transport(self) -> Box<dyn Transport> {
        self.transport
    }

    /// Hand bytes that arrived since the last idle read to the dispatcher,
    /// so a command's flush does not eat them.
    async fn dispatch_pending(&mut self) -> Result<()> {
        let mut chunk = [0u8; 256];
        for _ in 0..MAX_PENDING_READS {
            let n = self.transport.read_available(&mut chunk).await?;
            if n == 0 {
                break;
            }
            let outcome = self.dispatcher.feed(&chunk[..n]);
            emit(self.event_tx.as_ref(), &outcome);
        }
        Ok(())
    }
}

fn route_line(
    dispatcher: &mut Dispatcher,
    event_tx: Option<&broadcast::Sender<AtEvent>>,
    line: &str,
) {
    trace!(line, "routing unsolicited line seen during wait");
    let mut bytes = Vec::with_capacity(line.len() + 2);
    bytes.extend_from_slice(line.as_bytes());
    bytes.extend_from_slice(b"\r\n");
    let outcome = dispatcher.feed(&bytes);
    emit(event_tx, &outcome);
}

fn emit(event_tx: Option<&broadcast::Sender<AtEvent>>, outcome: &DispatchOutcome) {
    let Some(tx) = event_tx else {
        return;
    };
    let event = match outcome {
        DispatchOutcome::Dispatched { topic, payload }
        | DispatchOutcome::Unhandled { topic, payload } => AtEvent::MessageReceived {
            topic: topic.clone(),
            payload: payload.clone(),
        },
        DispatchOutcome::Truncated { dropped } => AtEvent::BufferTruncated { dropped: *dropped },
        DispatchOutcome::Pending | DispatchOutcome::Malformed => return,
    };
    let _ = tx.send(event);
}
