//! espat-core: Core traits, types, and error definitions for espat.
//!
//! This crate defines the device-agnostic abstractions shared by the AT
//! protocol engine and the feature drivers built on top of it. Applications
//! can depend on these types without pulling in a serial port stack.
//!
//! # Key types
//!
//! - [`Transport`] -- byte-level communication channel to the co-processor
//! - [`SessionState`] -- outcome flags recorded by the feature drivers
//! - [`AtEvent`] -- asynchronous notifications from the IO task
//! - [`Error`] / [`Result`] -- error handling

pub mod error;
pub mod events;
pub mod session;
pub mod transport;

// Re-export key types at crate root for ergonomic `use espat_core::*`.
pub use error::{Error, Result};
pub use events::AtEvent;
pub use session::{SessionFlag, SessionState};
pub use transport::Transport;
