//! Monitor MQTT messages delivered by an ESP8266.
//!
//! Joins a WiFi network, connects to a public broker, subscribes to one topic
//! and prints every event from the AT link for 60 seconds.
//!
//! # Requirements
//!
//! - An ESP8266 running the ESP-AT firmware with MQTT support
//! - Serial port path, WiFi credentials and topic adjusted for your setup
//!
//! # Usage
//!
//! ```sh
//! cargo run -p espat --example monitor_messages
//! ```

use std::time::Duration;

use espat::AtEvent;
use espat::esp8266::Esp8266Builder;
use tokio::sync::broadcast::error::RecvError;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let serial_port = "/dev/ttyUSB0";
    let topic = "espat/demo";

    println!("Connecting to ESP8266 on {serial_port}...");
    let mut esp = Esp8266Builder::new()
        .serial_port(serial_port)
        .build()
        .await?;
    esp.init().await?;

    if !esp.connect_wifi("your_ssid", "your_password").await? {
        anyhow::bail!("could not join the access point");
    }

    esp.mqtt_user_config(1, "espat-demo", "", "", "").await?;
    esp.mqtt_connect("broker.hivemq.com", 1883, false).await?;
    esp.on_mqtt_message(topic, |payload: &str| {
        println!("handler: {payload}");
    });
    esp.mqtt_subscribe(topic, 1).await?;

    let mut events = esp.subscribe_events();
    println!("Subscribed to {topic}. Monitoring for 60 seconds...\n");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(60);
    let start = tokio::time::Instant::now();

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }

        match tokio::time::timeout(remaining, events.recv()).await {
            Ok(Ok(event)) => {
                let elapsed = start.elapsed();
                let timestamp = format!("{:>6}.{:03}s", elapsed.as_secs(), elapsed.subsec_millis());
                match event {
                    AtEvent::MessageReceived { topic, payload } => {
                        println!("{timestamp} MessageReceived {topic} -> {payload}");
                    }
                    AtEvent::BufferTruncated { dropped } => {
                        println!("{timestamp} BufferTruncated {dropped} bytes");
                    }
                }
            }
            Ok(Err(RecvError::Lagged(n))) => println!("(missed {n} events due to lag)"),
            Ok(Err(RecvError::Closed)) => {
                println!("Event channel closed.");
                break;
            }
            Err(_) => break,
        }
    }

    esp.shutdown().await?;
    println!("\nMonitoring complete.");
    Ok(())
}
