//! AT command protocol engine.
//!
//! This crate turns a byte-oriented [`Transport`](espat_core::Transport) into
//! an AT command link: CR LF line framing, command/response correlation with
//! deadlines, raw token watches, and dispatch of unsolicited subscription
//! messages to per-topic handlers. One tokio task owns the transport and
//! serves all of it.
//!
//! # Architecture
//!
//! - [`protocol`]: line framing, unsolicited message decoding, tokens
//! - [`correlator`]: send a command and wait for a matching line
//! - [`dispatcher`]: subscription registry and unsolicited message routing
//! - [`watch`]: raw-window token watching for multi-stage replies
//! - [`engine`]: one transport shared by correlator and dispatcher
//! - [`io`]: IO task types, spawn, and the select loop

pub mod correlator;
pub mod dispatcher;
pub mod engine;
pub mod io;
pub mod protocol;
pub mod watch;

pub use correlator::{Correlator, WaitOutcome};
pub use dispatcher::{DispatchOutcome, Dispatcher, MessageHandler, SubscriptionRegistry};
pub use engine::AtEngine;
pub use io::{AtIo, IoConfig, Request, spawn_io_task};
pub use watch::{TokenWatch, WatchOutcome};
