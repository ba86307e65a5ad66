//! # espat -- AT command engine for ESP8266 WiFi co-processors
//!
//! `espat` is an asynchronous Rust library for driving an ESP8266 (or any
//! module speaking the same AT dialect) over a serial link. It turns the
//! noisy, fragmented byte stream into synchronous command/response pairs with
//! bounded waits and an asynchronous channel for messages the module sends
//! unprompted.
//!
//! ## Quick Start
//!
//! ```no_run
//! use espat::esp8266::Esp8266Builder;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut esp = Esp8266Builder::new()
//!         .serial_port("/dev/ttyUSB0")
//!         .build()
//!         .await?;
//!
//!     esp.init().await?;
//!     if esp.connect_wifi("my_ssid", "my_password").await? {
//!         esp.init_internet_time(1).await?;
//!         esp.update_internet_time().await?;
//!         println!("{:?}", esp.network_time());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! | Crate                 | Purpose                                           |
//! |-----------------------|---------------------------------------------------|
//! | `espat-core`          | [`Transport`] trait, [`SessionState`], [`AtEvent`], errors |
//! | `espat-text-io`       | Line framer, correlator, dispatcher, IO task      |
//! | `espat-transport`     | Serial port transport                             |
//! | `espat-esp8266`       | WiFi, ThingSpeak, MQTT and SNTP driver            |
//! | **`espat`**           | This facade crate -- re-exports everything        |
//!
//! ## Unsolicited messages
//!
//! Handlers registered per topic run on the IO task whenever a
//! `+MQTTSUBRECV` line arrives between commands. Every decoded message is also
//! broadcast as an [`AtEvent`]:
//!
//! ```no_run
//! # async fn example(esp: &espat::esp8266::Esp8266) {
//! esp.on_mqtt_message("sensors/temp", |payload: &str| println!("temp {payload}"));
//! let mut events = esp.subscribe_events();
//! while let Ok(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! # }
//! ```

pub use espat_core::*;

/// The AT protocol engine.
///
/// Use this directly to drive AT firmware features that the
/// [`esp8266`] driver does not wrap.
pub mod engine {
    pub use espat_text_io::*;
}

/// Serial port transport.
pub mod serial {
    pub use espat_transport::*;
}

/// ESP8266 feature driver.
pub mod esp8266 {
    pub use espat_esp8266::*;
}
