//! espat-test-harness: Test utilities and mock transports for espat.
//!
//! This crate provides [`MockTransport`] for deterministic unit testing of
//! the AT protocol engine and the device drivers without a real
//! co-processor, and [`MockHandle`] for injecting unsolicited traffic after
//! the transport has been moved into an IO task.

pub mod mock_serial;

pub use mock_serial::{MockHandle, MockTransport};
