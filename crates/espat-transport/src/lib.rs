//! Transport implementations for espat.
//!
//! [`SerialTransport`] implements the [`Transport`](espat_core::Transport)
//! trait over a UART or USB virtual COM port, the way ESP8266 AT modules are
//! attached.

pub mod serial;

pub use serial::{
    DEFAULT_BAUD_RATE, DataBits, FlowControl, Parity, SerialConfig, SerialTransport, StopBits,
};
