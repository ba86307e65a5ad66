//! Asynchronous AT link event types.
//!
//! Events are emitted by the IO task through a `tokio::sync::broadcast`
//! channel. They mirror what the dispatcher sees on the idle stream and are
//! delivered on a best-effort basis: slow consumers may miss events, and an
//! unsolicited message that arrives while a command wait owns the stream is
//! not reported at all.

/// An event emitted by the IO task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AtEvent {
    /// An unsolicited subscription message was decoded.
    ///
    /// Emitted whether or not a handler is registered for `topic`.
    MessageReceived {
        /// Topic name, quotes stripped.
        topic: String,
        /// Message payload, quotes stripped.
        payload: String,
    },

    /// The idle accumulator grew past its bound and was cut back.
    BufferTruncated {
        /// Number of leading bytes that were dropped.
        dropped: usize,
    },
}
