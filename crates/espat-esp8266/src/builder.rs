//! Esp8266Builder -- fluent builder for constructing [`Esp8266`] instances.
//!
//! Separates configuration from construction so that callers can set up
//! serial port parameters, engine timing and the SNTP server before the IO
//! task takes ownership of the transport.
//!
//! # Example
//!
//! ```no_run
//! use espat_esp8266::builder::Esp8266Builder;
//! use std::time::Duration;
//!
//! # async fn example() -> espat_core::Result<()> {
//! let mut esp = Esp8266Builder::new()
//!     .serial_port("/dev/ttyUSB0")
//!     .baud_rate(115_200)
//!     .command_timeout(Duration::from_millis(800))
//!     .build()
//!     .await?;
//! esp.init().await?;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use tokio::sync::broadcast;

use espat_core::error::{Error, Result};
use espat_core::transport::Transport;
use espat_text_io::{IoConfig, SubscriptionRegistry, spawn_io_task};
use espat_transport::DEFAULT_BAUD_RATE;

use crate::commands::DEFAULT_NTP_SERVER;
use crate::device::Esp8266;

/// Capacity of the event broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Fluent builder for [`Esp8266`].
pub struct Esp8266Builder {
    serial_port: Option<String>,
    baud_rate: u32,
    command_timeout: Duration,
    io_config: IoConfig,
    ntp_server: String,
}

impl Esp8266Builder {
    pub fn new() -> Self {
        Esp8266Builder {
            serial_port: None,
            baud_rate: DEFAULT_BAUD_RATE,
            command_timeout: Duration::from_millis(500),
            io_config: IoConfig::default(),
            ntp_server: DEFAULT_NTP_SERVER.to_string(),
        }
    }

    /// Set the serial port path (e.g. `/dev/ttyUSB0` or `COM3`).
    pub fn serial_port(mut self, port: &str) -> Self {
        self.serial_port = Some(port.to_string());
        self
    }

    /// Override the baud rate (default: 115200).
    pub fn baud_rate(mut self, baud: u32) -> Self {
        self.baud_rate = baud;
        self
    }

    /// Set the wait for `OK` after the TCP and SNTP setup commands
    /// (default: 500ms).
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Replace the engine configuration.
    pub fn io_config(mut self, config: IoConfig) -> Self {
        self.io_config = config;
        self
    }

    /// Set the SNTP server (default: `pool.ntp.org`).
    pub fn ntp_server(mut self, server: &str) -> Self {
        self.ntp_server = server.to_string();
        self
    }

    /// Build an [`Esp8266`] with a caller-provided transport.
    ///
    /// This is the entry point for testing (pass a `MockTransport` from
    /// `espat-test-harness`). Spawns the IO task, so it must run inside a
    /// tokio runtime.
    pub async fn build_with_transport(self, transport: Box<dyn Transport>) -> Result<Esp8266> {
        if self.io_config.overflow_keep > self.io_config.overflow_limit {
            return Err(Error::InvalidParameter(
                "overflow_keep cannot exceed overflow_limit".into(),
            ));
        }
        if self.ntp_server.is_empty() {
            return Err(Error::InvalidParameter("ntp_server cannot be empty".into()));
        }

        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let io = spawn_io_task(
            transport,
            self.io_config,
            SubscriptionRegistry::new(),
            event_tx,
        );
        Ok(Esp8266::new(io, self.command_timeout, self.ntp_server))
    }

    /// Build an [`Esp8266`] over a serial port.
    ///
    /// Requires that [`serial_port()`](Self::serial_port) has been called.
    pub async fn build(self) -> Result<Esp8266> {
        let port = self
            .serial_port
            .as_ref()
            .ok_or_else(|| Error::InvalidParameter("serial_port is required for build()".into()))?;

        let transport = espat_transport::SerialTransport::open(port, self.baud_rate).await?;
        self.build_with_transport(Box::new(transport)).await
    }
}

impl Default for Esp8266Builder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use espat_test_harness::MockTransport;

    #[tokio::test]
    async fn builder_defaults() {
        let esp = Esp8266Builder::new()
            .build_with_transport(Box::new(MockTransport::new()))
            .await
            .unwrap();

        assert_eq!(esp.command_timeout(), Duration::from_millis(500));
        assert_eq!(esp.ntp_server(), "pool.ntp.org");
        assert!(!esp.wifi_connected());
    }

    #[tokio::test]
    async fn builder_custom_settings() {
        let esp = Esp8266Builder::new()
            .serial_port("/dev/ttyUSB0")
            .baud_rate(9600)
            .command_timeout(Duration::from_millis(800))
            .ntp_server("time.google.com")
            .io_config(IoConfig {
                route_unsolicited_during_wait: true,
                ..IoConfig::default()
            })
            .build_with_transport(Box::new(MockTransport::new()))
            .await
            .unwrap();

        assert_eq!(esp.command_timeout(), Duration::from_millis(800));
        assert_eq!(esp.ntp_server(), "time.google.com");
    }

    #[tokio::test]
    async fn builder_rejects_inverted_overflow_policy() {
        let result = Esp8266Builder::new()
            .io_config(IoConfig {
                overflow_limit: 10,
                overflow_keep: 20,
                ..IoConfig::default()
            })
            .build_with_transport(Box::new(MockTransport::new()))
            .await;
        assert!(matches!(result, Err(Error::InvalidParameter(_))));
    }

    #[tokio::test]
    async fn builder_serial_port_required_for_build() {
        let result = Esp8266Builder::new().build().await;
        assert!(matches!(result, Err(Error::InvalidParameter(_))));
    }
}
