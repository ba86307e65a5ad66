//! Unsolicited message dispatch.
//!
//! The co-processor pushes `+MQTTSUBRECV` lines for every message on a
//! subscribed topic. [`Dispatcher`] watches its own accumulator for the
//! marker, decodes `(topic, payload)` and calls the handler registered for
//! that exact topic in the [`SubscriptionRegistry`].
//!
//! One pass handles at most one message: after a dispatch the accumulator is
//! cleared, discarding anything else it held. Without a marker, the
//! accumulator is cut back to a short suffix once it passes a small bound, so
//! a noisy link cannot grow it. The suffix is longer than the marker, so a
//! marker split across two reads survives the cut.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, trace, warn};

use crate::protocol::{self, LineBuffer};

/// Bytes allowed to pile up after a marker while waiting for the end of its
/// line.
const MAX_PENDING: usize = 1024;

/// Callback for messages on one topic.
///
/// Implemented for any `Fn(&str) + Send + Sync` closure.
pub trait MessageHandler: Send + Sync + 'static {
    fn handle(&self, payload: &str);
}

impl<F> MessageHandler for F
where
    F: Fn(&str) + Send + Sync + 'static,
{
    fn handle(&self, payload: &str) {
        self(payload)
    }
}

/// Topic to handler map shared between subscribers and the dispatcher.
///
/// Cloning yields another handle onto the same map. Registering a topic a
/// second time replaces the earlier handler; entries are never removed.
#[derive(Clone, Default)]
pub struct SubscriptionRegistry {
    handlers: Arc<RwLock<HashMap<String, Arc<dyn MessageHandler>>>>,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `topic`, replacing any previous handler.
    pub fn register(&self, topic: impl Into<String>, handler: impl MessageHandler) {
        let topic = topic.into();
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if handlers.insert(topic.clone(), Arc::new(handler)).is_some() {
            debug!(topic = %topic, "replaced message handler");
        } else {
            debug!(topic = %topic, "registered message handler");
        }
    }

    /// Look up the handler for `topic`.
    pub fn handler(&self, topic: &str) -> Option<Arc<dyn MessageHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .cloned()
    }

    /// Whether a handler is registered for `topic`.
    pub fn contains(&self, topic: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(topic)
    }

    /// Number of registered topics.
    pub fn len(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no topic has a handler.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("SubscriptionRegistry")
            .field("topics", &handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Result of one dispatcher pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Nothing to do yet; bytes were kept for the next pass.
    Pending,
    /// A message was decoded and its handler invoked.
    Dispatched { topic: String, payload: String },
    /// A message was decoded but no handler is registered for its topic.
    Unhandled { topic: String, payload: String },
    /// The marker was present but the fields could not be decoded.
    Malformed,
    /// The accumulator passed its bound and was cut back.
    Truncated { dropped: usize },
}

/// Routes unsolicited messages to registered handlers.
#[derive(Debug)]
pub struct Dispatcher {
    rx: LineBuffer,
    registry: SubscriptionRegistry,
    marker: &'static str,
    prefix_len: usize,
    overflow_limit: usize,
    overflow_keep: usize,
}

impl Dispatcher {
    /// Create a dispatcher for the standard `MQTTSUBRECV` marker.
    ///
    /// Without a marker the accumulator is cut to `overflow_keep` trailing
    /// bytes whenever it exceeds `overflow_limit`.
    pub fn new(registry: SubscriptionRegistry, overflow_limit: usize, overflow_keep: usize) -> Self {
        Self::with_marker(
            registry,
            protocol::UNSOLICITED_MARKER,
            protocol::MARKER_PREFIX_LEN,
            overflow_limit,
            overflow_keep,
        )
    }

    /// Create a dispatcher for a custom marker and prefix width.
    pub fn with_marker(
        registry: SubscriptionRegistry,
        marker: &'static str,
        prefix_len: usize,
        overflow_limit: usize,
        overflow_keep: usize,
    ) -> Self {
        Dispatcher {
            rx: LineBuffer::new(),
            registry,
            marker,
            prefix_len,
            overflow_limit,
            overflow_keep: overflow_keep.min(overflow_limit),
        }
    }

    /// The registry this dispatcher reads from.
    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    /// Number of bytes currently accumulated.
    pub fn buffered(&self) -> usize {
        self.rx.len()
    }

    /// Append newly received bytes and run one pass.
    pub fn feed(&mut self, data: &[u8]) -> DispatchOutcome {
        self.rx.extend(data);
        self.scan()
    }

    fn scan(&mut self) -> DispatchOutcome {
        if !self.rx.contains(self.marker) {
            if self.rx.len() > self.overflow_limit {
                let dropped = self.rx.truncate_to_suffix(self.overflow_keep);
                trace!(dropped, "idle buffer over bound, keeping suffix");
                return DispatchOutcome::Truncated { dropped };
            }
            return DispatchOutcome::Pending;
        }

        let text = self.rx.text();
        let line_complete = text
            .find(self.marker)
            .is_some_and(|pos| text[pos..].contains("\r\n"));
        if !line_complete {
            if self.rx.len() > MAX_PENDING {
                let dropped = self.rx.len();
                warn!(dropped, "unterminated unsolicited message, discarding");
                self.rx.clear();
                return DispatchOutcome::Truncated { dropped };
            }
            return DispatchOutcome::Pending;
        }

        self.rx.clear();
        let Some((topic, payload)) =
            protocol::decode_unsolicited(&text, self.marker, self.prefix_len)
        else {
            debug!(text = %text.trim_end(), "malformed unsolicited message");
            return DispatchOutcome::Malformed;
        };

        match self.registry.handler(&topic) {
            Some(handler) => {
                debug!(topic = %topic, payload = %payload, "dispatching message");
                handler.handle(&payload);
                DispatchOutcome::Dispatched { topic, payload }
            }
            None => {
                debug!(topic = %topic, "no handler for topic, dropping message");
                DispatchOutcome::Unhandled { topic, payload }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn dispatcher(registry: &SubscriptionRegistry) -> Dispatcher {
        Dispatcher::new(registry.clone(), 30, 15)
    }

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl MessageHandler) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |payload: &str| {
            sink.lock().unwrap().push(payload.to_string())
        })
    }

    #[test]
    fn dispatches_to_registered_topic() {
        let registry = SubscriptionRegistry::new();
        let (seen, handler) = recorder();
        registry.register("sensors/temp", handler);

        let mut d = dispatcher(&registry);
        let outcome = d.feed(b"+MQTTSUBRECV:0,\"sensors/temp\",\"21.5\"\r\n");

        assert_eq!(
            outcome,
            DispatchOutcome::Dispatched {
                topic: "sensors/temp".into(),
                payload: "21.5".into(),
            }
        );
        assert_eq!(*seen.lock().unwrap(), vec!["21.5".to_string()]);
        assert_eq!(d.buffered(), 0);
    }

    #[test]
    fn reregistering_replaces_handler() {
        let registry = SubscriptionRegistry::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&first);
        registry.register("led", move |_: &str| {
            f.fetch_add(1, Ordering::SeqCst);
        });
        let s = Arc::clone(&second);
        registry.register("led", move |_: &str| {
            s.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(registry.len(), 1);

        let mut d = dispatcher(&registry);
        d.feed(b"+MQTTSUBRECV:0,\"led\",\"on\"\r\n");

        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unknown_topic_is_dropped() {
        let registry = SubscriptionRegistry::new();
        let (seen, handler) = recorder();
        registry.register("a", handler);

        let mut d = dispatcher(&registry);
        let outcome = d.feed(b"+MQTTSUBRECV:0,\"b\",\"1\"\r\n");
        assert!(matches!(outcome, DispatchOutcome::Unhandled { .. }));
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(d.buffered(), 0);
    }

    #[test]
    fn waits_for_end_of_marker_line() {
        let registry = SubscriptionRegistry::new();
        let (seen, handler) = recorder();
        registry.register("sensors/temp", handler);

        let mut d = dispatcher(&registry);
        assert_eq!(
            d.feed(b"+MQTTSUBRECV:0,\"sensors/te"),
            DispatchOutcome::Pending
        );
        assert_eq!(d.feed(b"mp\",\"2"), DispatchOutcome::Pending);
        assert!(matches!(
            d.feed(b"2.0\"\r\n"),
            DispatchOutcome::Dispatched { .. }
        ));
        assert_eq!(*seen.lock().unwrap(), vec!["22.0".to_string()]);
    }

    #[test]
    fn one_message_per_pass() {
        let registry = SubscriptionRegistry::new();
        let (seen, handler) = recorder();
        registry.register("t", handler);

        let mut d = dispatcher(&registry);
        d.feed(b"+MQTTSUBRECV:0,\"t\",\"1\"\r\n+MQTTSUBRECV:0,\"t\",\"2\"\r\n");

        assert_eq!(*seen.lock().unwrap(), vec!["1".to_string()]);
        assert_eq!(d.buffered(), 0);
    }

    #[test]
    fn noise_is_truncated_to_suffix() {
        let registry = SubscriptionRegistry::new();
        let mut d = dispatcher(&registry);

        assert_eq!(d.feed(b"WIFI GOT IP\r\n"), DispatchOutcome::Pending);
        let outcome = d.feed(b"busy p...\r\nbusy p...\r\nbusy p...\r\n");
        assert!(matches!(outcome, DispatchOutcome::Truncated { .. }));
        assert_eq!(d.buffered(), 15);
    }

    #[test]
    fn accumulator_stays_bounded_under_noise() {
        let registry = SubscriptionRegistry::new();
        let mut d = dispatcher(&registry);
        for _ in 0..1000 {
            d.feed(b"garbage without terminator ");
            assert!(d.buffered() <= 30 + 27);
        }
    }

    #[test]
    fn split_marker_survives_truncation() {
        let registry = SubscriptionRegistry::new();
        let (seen, handler) = recorder();
        registry.register("t", handler);

        let mut d = dispatcher(&registry);
        let outcome = d.feed(b"0123456789012345678901234567890+MQTTS");
        assert!(matches!(outcome, DispatchOutcome::Truncated { .. }));
        d.feed(b"UBRECV:0,\"t\",\"1\"\r\n");
        assert_eq!(*seen.lock().unwrap(), vec!["1".to_string()]);
    }

    #[test]
    fn malformed_message_clears_buffer() {
        let registry = SubscriptionRegistry::new();
        let mut d = dispatcher(&registry);
        assert_eq!(
            d.feed(b"+MQTTSUBRECV:0,\"only-topic\"\r\n"),
            DispatchOutcome::Malformed
        );
        assert_eq!(d.buffered(), 0);
    }

    #[test]
    fn registry_debug_lists_topics() {
        let registry = SubscriptionRegistry::new();
        registry.register("x", |_: &str| {});
        assert!(format!("{registry:?}").contains("\"x\""));
        assert!(registry.contains("x"));
        assert!(!registry.is_empty());
    }
}
