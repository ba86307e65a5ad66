// espat test application -- CLI tool for exercising an ESP8266 running the
// AT firmware over a serial port.
//
// Usage:
//   espat-test-app --port /dev/ttyUSB0 init
//   espat-test-app --port /dev/ttyUSB0 join --ssid home --password secret
//   espat-test-app --port /dev/ttyUSB0 time --ssid home --password secret --timezone 1
//   espat-test-app --port /dev/ttyUSB0 upload --ssid home --password secret \
//       --api-key ABC123 --field 21.5 --field 48
//   espat-test-app --port /dev/ttyUSB0 mqtt --ssid home --password secret \
//       --host broker.hivemq.com --topic sensors/temp --duration 60
//   espat-test-app --port /dev/ttyUSB0 raw AT+GMR --expect OK
//
// Set RUST_LOG=espat_text_io=trace to see every line on the wire.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tracing_subscriber::EnvFilter;

use espat::{AtEvent, SessionFlag};
use espat::esp8266::{Esp8266, Esp8266Builder};

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// espat test application -- exercises an ESP8266 from the command line.
#[derive(Parser)]
#[command(name = "espat-test-app", version, about)]
struct Cli {
    /// Serial port path (e.g. /dev/ttyUSB0, COM3).
    #[arg(long)]
    port: String,

    /// Baud rate.
    #[arg(long, default_value_t = 115_200)]
    baud: u32,

    /// Timeout for commands that wait for OK, in milliseconds.
    #[arg(long, default_value_t = 500)]
    command_timeout_ms: u64,

    /// Hand subscription messages seen during a command wait to their
    /// handlers instead of dropping them.
    #[arg(long)]
    route_during_wait: bool,

    #[command(subcommand)]
    command: Command,
}

/// Access point credentials.
#[derive(Args)]
struct WifiArgs {
    /// Network name.
    #[arg(long)]
    ssid: String,

    /// Network password.
    #[arg(long, default_value = "")]
    password: String,
}

#[derive(Subcommand)]
enum Command {
    /// Restore factory settings, disable echo and select station mode.
    Init,

    /// Join an access point.
    Join {
        #[command(flatten)]
        wifi: WifiArgs,
    },

    /// Read the network time over SNTP.
    Time {
        #[command(flatten)]
        wifi: WifiArgs,

        /// Hours from UTC (-11..=13).
        #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
        timezone: i8,
    },

    /// Upload field values to a ThingSpeak channel.
    Upload {
        #[command(flatten)]
        wifi: WifiArgs,

        /// Channel write API key.
        #[arg(long)]
        api_key: String,

        /// Field value; repeat for field1..field8.
        #[arg(long = "field")]
        fields: Vec<f64>,
    },

    /// Subscribe to an MQTT topic and print incoming messages.
    Mqtt {
        #[command(flatten)]
        wifi: WifiArgs,

        /// Broker host name.
        #[arg(long, default_value = "broker.hivemq.com")]
        host: String,

        /// Broker port.
        #[arg(long = "broker-port", default_value_t = 1883)]
        broker_port: u16,

        /// Topic to subscribe to.
        #[arg(long)]
        topic: String,

        /// Client identifier.
        #[arg(long, default_value = "espat-test-app")]
        client_id: String,

        /// Subscription QoS (0-2).
        #[arg(long, default_value_t = 0)]
        qos: u8,

        /// Duration in seconds (0 = run until Ctrl-C).
        #[arg(long, default_value_t = 0)]
        duration: u64,
    },

    /// Send one AT command line and print the reply.
    Raw {
        /// Command line, without the CR LF terminator.
        command: String,

        /// Print the first reply line containing this text.
        #[arg(long)]
        expect: Option<String>,

        /// How long to wait for the reply, in milliseconds.
        #[arg(long, default_value_t = 1000)]
        timeout_ms: u64,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let mut esp = connect(&cli).await?;

    let result = match &cli.command {
        Command::Init => cmd_init(&mut esp).await,
        Command::Join { wifi } => join(&mut esp, wifi).await,
        Command::Time { wifi, timezone } => cmd_time(&mut esp, wifi, *timezone).await,
        Command::Upload {
            wifi,
            api_key,
            fields,
        } => cmd_upload(&mut esp, wifi, api_key, fields).await,
        Command::Mqtt {
            wifi,
            host,
            broker_port,
            topic,
            client_id,
            qos,
            duration,
        } => {
            cmd_mqtt(
                &mut esp,
                wifi,
                host,
                *broker_port,
                topic,
                client_id,
                *qos,
                *duration,
            )
            .await
        }
        Command::Raw {
            command,
            expect,
            timeout_ms,
        } => cmd_raw(&esp, command, expect.as_deref(), *timeout_ms).await,
    };

    log_session(&esp);
    esp.shutdown().await.ok();
    result
}

fn log_session(esp: &Esp8266) {
    let session = esp.session();
    for flag in SessionFlag::ALL {
        tracing::debug!(?flag, set = session.get(flag), "session flag");
    }
}

async fn connect(cli: &Cli) -> Result<Esp8266> {
    let io_config = espat::engine::IoConfig {
        route_unsolicited_during_wait: cli.route_during_wait,
        ..Default::default()
    };
    Esp8266Builder::new()
        .serial_port(&cli.port)
        .baud_rate(cli.baud)
        .command_timeout(Duration::from_millis(cli.command_timeout_ms))
        .io_config(io_config)
        .build()
        .await
        .with_context(|| format!("failed to open {} at {} baud", cli.port, cli.baud))
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn cmd_init(esp: &mut Esp8266) -> Result<()> {
    esp.init().await.context("init failed")?;
    println!("Module restored and in station mode.");
    Ok(())
}

async fn join(esp: &mut Esp8266, wifi: &WifiArgs) -> Result<()> {
    let started = Instant::now();
    if !esp.connect_wifi(&wifi.ssid, &wifi.password).await? {
        bail!("could not join {}", wifi.ssid);
    }
    println!(
        "Joined {} in {:.1}s",
        wifi.ssid,
        started.elapsed().as_secs_f64()
    );
    Ok(())
}

async fn cmd_time(esp: &mut Esp8266, wifi: &WifiArgs, timezone: i8) -> Result<()> {
    join(esp, wifi).await?;
    if !esp.init_internet_time(timezone).await? {
        bail!("SNTP configuration was rejected");
    }
    if !esp.update_internet_time().await? {
        bail!("no valid network time within 20s");
    }

    let t = esp.network_time();
    println!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02} (weekday {})",
        t.year, t.month, t.day, t.hour, t.minute, t.second, t.weekday
    );
    Ok(())
}

async fn cmd_upload(
    esp: &mut Esp8266,
    wifi: &WifiArgs,
    api_key: &str,
    fields: &[f64],
) -> Result<()> {
    esp.set_data(api_key, fields)?;
    join(esp, wifi).await?;
    if !esp.connect_thingspeak().await? {
        bail!("could not open the ThingSpeak session");
    }
    if !esp.upload_data().await? {
        bail!("upload was not acknowledged");
    }
    println!("Uploaded {} field(s).", fields.len());
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn cmd_mqtt(
    esp: &mut Esp8266,
    wifi: &WifiArgs,
    host: &str,
    broker_port: u16,
    topic: &str,
    client_id: &str,
    qos: u8,
    duration_secs: u64,
) -> Result<()> {
    join(esp, wifi).await?;

    esp.mqtt_user_config(1, client_id, "", "", "").await?;
    esp.mqtt_connect(host, broker_port, false).await?;
    let mut event_rx = esp.subscribe_events();

    let wanted = topic.to_string();
    esp.on_mqtt_message(topic, move |payload: &str| {
        println!("[{wanted}] {payload}");
    });
    esp.mqtt_subscribe(topic, qos).await?;

    println!("Listening on {topic} (Ctrl-C to stop)...");

    let deadline = (duration_secs > 0).then(|| Instant::now() + Duration::from_secs(duration_secs));
    loop {
        let timeout = match deadline {
            Some(dl) => {
                let remaining = dl.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    println!("Listen duration elapsed.");
                    break;
                }
                remaining
            }
            None => Duration::from_secs(3600),
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("Interrupted.");
                break;
            }
            event = tokio::time::timeout(timeout, event_rx.recv()) => match event {
                Ok(Ok(AtEvent::MessageReceived { topic, payload })) if !esp.io().registry().contains(&topic) => {
                    println!("[unhandled {topic}] {payload}");
                }
                Ok(Ok(event)) => tracing::debug!(?event, "link event"),
                Ok(Err(RecvError::Lagged(n))) => {
                    println!("[warning] missed {n} events (consumer too slow)");
                }
                Ok(Err(RecvError::Closed)) => {
                    println!("Event channel closed.");
                    break;
                }
                Err(_) => {
                    if deadline.is_some() {
                        println!("Listen duration elapsed.");
                    }
                    break;
                }
            },
        }
    }

    Ok(())
}

async fn cmd_raw(esp: &Esp8266, command: &str, expect: Option<&str>, timeout_ms: u64) -> Result<()> {
    let timeout = Duration::from_millis(timeout_ms);
    match expect {
        Some(token) => match esp.io().query(command, token, timeout).await? {
            Some(line) => println!("{line}"),
            None => bail!("no line containing {token:?} within {timeout_ms}ms"),
        },
        None => {
            esp.io().send_command(command, None, timeout).await?;
            println!("sent {command}");
        }
    }
    Ok(())
}
