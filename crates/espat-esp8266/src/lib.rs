//! ESP8266 AT firmware driver for espat.
//!
//! This crate layers the feature commands of the ESP8266 AT firmware on top
//! of the protocol engine in `espat-text-io`:
//!
//! - **Command builders** ([`commands`]) -- format AT command lines for WiFi,
//!   TCP, ThingSpeak, MQTT and SNTP, and parse the SNTP time reply.
//! - **Device driver** ([`device`]) -- [`Esp8266`] runs each operation over
//!   the IO task and records the outcome in a
//!   [`SessionState`](espat_core::SessionState).
//! - **Builder** ([`builder`]) -- fluent [`Esp8266Builder`] with defaults for
//!   the stock firmware.
//!
//! # Example
//!
//! ```
//! use espat_esp8266::commands::{cmd_join_ap, parse_sntp_time};
//!
//! assert_eq!(cmd_join_ap("home", "secret"), r#"AT+CWJAP="home","secret""#);
//!
//! let time = parse_sntp_time("+CIPSNTPTIME:Mon Jan 02 03:04:05 2024").unwrap();
//! assert_eq!(time.year, 2024);
//! assert!(time.is_synchronized());
//! ```

pub mod builder;
pub mod commands;
pub mod device;

pub use builder::Esp8266Builder;
pub use commands::NetworkTime;
pub use device::Esp8266;
