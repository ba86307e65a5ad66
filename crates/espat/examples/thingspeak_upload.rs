//! Upload a reading to ThingSpeak through an ESP8266.
//!
//! # Usage
//!
//! ```sh
//! cargo run -p espat --example thingspeak_upload
//! ```

use espat::esp8266::Esp8266Builder;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut esp = Esp8266Builder::new()
        .serial_port("/dev/ttyUSB0")
        .build()
        .await?;
    esp.init().await?;

    if !esp.connect_wifi("your_ssid", "your_password").await? {
        anyhow::bail!("could not join the access point");
    }
    if !esp.connect_thingspeak().await? {
        anyhow::bail!("could not open the ThingSpeak session");
    }

    esp.set_data("YOUR_WRITE_API_KEY", &[21.5, 48.0])?;
    let uploaded = esp.upload_data().await?;
    println!("upload {}", if uploaded { "acknowledged" } else { "failed" });

    esp.shutdown().await?;
    Ok(())
}
