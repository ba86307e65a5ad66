//! Esp8266 -- WiFi, ThingSpeak, MQTT and SNTP on top of the AT engine.
//!
//! Every operation clears its [`SessionState`] flag on entry and sets it only
//! on full success. Protocol-level failures (timeout, `ERROR`, `FAIL`) are
//! reported as `Ok(false)` and a cleared flag; `Err` means the transport or
//! the IO task failed, or a parameter was rejected before anything was sent.
//!
//! Plain writes such as `AT+RESTORE` or the MQTT commands are followed by a
//! fixed settle pause. The IO task keeps reading during the pause, so
//! subscription messages that arrive meanwhile still reach their handlers.

use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use espat_core::error::{Error, Result};
use espat_core::events::AtEvent;
use espat_core::session::{SessionFlag, SessionState};
use espat_core::transport::Transport;
use espat_text_io::protocol::{ERROR, FAIL, OK, SEND_OK, WIFI_CONNECTED};
use espat_text_io::{AtIo, MessageHandler, TokenWatch};

use crate::commands::{self, NetworkTime};

/// Window for the access point to report `WIFI CONNECTED` or `FAIL`.
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);
/// Window for `SEND OK` after the telemetry request.
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(4);
/// Wait for each `+CIPSNTPTIME:` reply.
const SNTP_REPLY_TIMEOUT: Duration = Duration::from_secs(2);
/// Overall budget for the SNTP client to report a real date.
const SNTP_SYNC_BUDGET: Duration = Duration::from_secs(20);
/// Pause between SNTP polls while the year still reads 1970.
const SNTP_POLL_PAUSE: Duration = Duration::from_millis(100);
/// Wait for the `OK` trailing a reply that was already matched.
const TRAILING_OK_TIMEOUT: Duration = Duration::from_millis(100);

const RESTORE_SETTLE: Duration = Duration::from_millis(1000);
const ECHO_OFF_SETTLE: Duration = Duration::from_millis(500);
const MODE_SETTLE: Duration = Duration::from_millis(1000);
const SEND_LENGTH_SETTLE: Duration = Duration::from_millis(300);
const MQTT_CONFIG_SETTLE: Duration = Duration::from_millis(200);
const MQTT_CONNECT_SETTLE: Duration = Duration::from_millis(1000);
const MQTT_PUBLISH_SETTLE: Duration = Duration::from_millis(200);
const MQTT_SUBSCRIBE_SETTLE: Duration = Duration::from_millis(500);

/// A connected ESP8266 running the AT firmware.
///
/// Constructed via [`Esp8266Builder`](crate::builder::Esp8266Builder).
pub struct Esp8266 {
    io: AtIo,
    state: SessionState,
    command_timeout: Duration,
    ntp_server: String,
    pending_request: Option<String>,
    time: NetworkTime,
}

impl Esp8266 {
    pub(crate) fn new(io: AtIo, command_timeout: Duration, ntp_server: String) -> Self {
        Esp8266 {
            io,
            state: SessionState::default(),
            command_timeout,
            ntp_server,
            pending_request: None,
            time: NetworkTime::default(),
        }
    }

    async fn write_and_settle(&self, command: &str, settle: Duration) -> Result<()> {
        self.io.write_line(command).await?;
        tokio::time::sleep(settle).await;
        Ok(())
    }

    // ---------------------------------------------------------------
    // Module setup
    // ---------------------------------------------------------------

    /// Restore factory settings, disable echo and select station mode.
    pub async fn init(&mut self) -> Result<()> {
        self.write_and_settle(&commands::cmd_restore(), RESTORE_SETTLE)
            .await?;
        self.write_and_settle(&commands::cmd_echo_off(), ECHO_OFF_SETTLE)
            .await?;
        self.write_and_settle(&commands::cmd_station_mode(), MODE_SETTLE)
            .await?;
        info!("ESP8266 initialised in station mode");
        Ok(())
    }

    // ---------------------------------------------------------------
    // WiFi
    // ---------------------------------------------------------------

    /// Join an access point. Clears the link and cloud session flags.
    ///
    /// The `OK` that acknowledges the command itself is not success: the
    /// watch waits for `WIFI CONNECTED` or `FAIL`.
    pub async fn connect_wifi(&mut self, ssid: &str, password: &str) -> Result<bool> {
        self.state.link_up = false;
        self.state.cloud_session_up = false;

        let watch = TokenWatch::new(WIFI_CONNECTED)
            .fail_on(FAIL)
            .reset_on(OK);
        let outcome = self
            .io
            .watch(Some(&commands::cmd_join_ap(ssid, password)), watch, JOIN_TIMEOUT)
            .await?;

        self.state.link_up = outcome.is_success();
        if self.state.link_up {
            info!(ssid, "joined access point");
        } else {
            warn!(ssid, ?outcome, "failed to join access point");
        }
        Ok(self.state.link_up)
    }

    // ---------------------------------------------------------------
    // ThingSpeak
    // ---------------------------------------------------------------

    /// Open the TCP session to ThingSpeak. Requires the link.
    pub async fn connect_thingspeak(&mut self) -> Result<bool> {
        self.state.cloud_session_up = false;
        if !self.state.link_up {
            debug!("not joined to an access point, skipping ThingSpeak connect");
            return Ok(false);
        }

        let command = commands::cmd_tcp_start(commands::THINGSPEAK_HOST, commands::THINGSPEAK_PORT);
        self.state.cloud_session_up = self
            .io
            .send_command(&command, Some(OK), self.command_timeout)
            .await?;
        debug!(connected = self.state.cloud_session_up, "ThingSpeak TCP session");
        Ok(self.state.cloud_session_up)
    }

    /// Prepare the telemetry request sent by [`upload_data`](Self::upload_data).
    ///
    /// Up to eight field values; missing fields are sent as `0`.
    pub fn set_data(&mut self, api_key: &str, fields: &[f64]) -> Result<()> {
        self.pending_request = Some(commands::thingspeak_update_request(api_key, fields)?);
        Ok(())
    }

    /// Send the request prepared by [`set_data`](Self::set_data). Requires
    /// the cloud session.
    pub async fn upload_data(&mut self) -> Result<bool> {
        self.state.last_upload_ok = false;
        if !self.state.cloud_session_up {
            debug!("no ThingSpeak session, skipping upload");
            return Ok(false);
        }
        let request = self
            .pending_request
            .clone()
            .ok_or_else(|| Error::InvalidParameter("set_data must be called before upload_data".into()))?;

        // Announced length covers the CR LF the engine appends.
        self.write_and_settle(&commands::cmd_send_length(request.len() + 2), SEND_LENGTH_SETTLE)
            .await?;
        let watch = TokenWatch::new(SEND_OK).fail_on(ERROR);
        let outcome = self.io.watch(Some(&request), watch, UPLOAD_TIMEOUT).await?;

        self.state.last_upload_ok = outcome.is_success();
        debug!(?outcome, "ThingSpeak upload");
        Ok(self.state.last_upload_ok)
    }

    // ---------------------------------------------------------------
    // MQTT
    // ---------------------------------------------------------------

    /// Configure the MQTT client. Empty `username`/`password` are omitted.
    pub async fn mqtt_user_config(
        &self,
        scheme: u8,
        client_id: &str,
        username: &str,
        password: &str,
        path: &str,
    ) -> Result<()> {
        let command = commands::cmd_mqtt_user_config(scheme, client_id, username, password, path)?;
        self.write_and_settle(&command, MQTT_CONFIG_SETTLE).await
    }

    /// Drop any previous MQTT connection, then connect to `host:port`.
    pub async fn mqtt_connect(&self, host: &str, port: u16, reconnect: bool) -> Result<()> {
        self.write_and_settle(&commands::cmd_mqtt_clean(), MQTT_CONNECT_SETTLE)
            .await?;
        self.write_and_settle(
            &commands::cmd_mqtt_connect(host, port, reconnect),
            MQTT_CONNECT_SETTLE,
        )
        .await?;
        info!(host, port, "MQTT connect requested");
        Ok(())
    }

    /// Publish `data` on `topic`.
    pub async fn mqtt_publish(&self, topic: &str, data: &str, qos: u8) -> Result<()> {
        let command = commands::cmd_mqtt_publish(topic, data, qos)?;
        self.write_and_settle(&command, MQTT_PUBLISH_SETTLE).await
    }

    /// Subscribe to `topic`. Register a handler with
    /// [`on_mqtt_message`](Self::on_mqtt_message) to receive its messages.
    pub async fn mqtt_subscribe(&self, topic: &str, qos: u8) -> Result<()> {
        let command = commands::cmd_mqtt_subscribe(topic, qos)?;
        self.write_and_settle(&command, MQTT_SUBSCRIBE_SETTLE).await
    }

    /// Call `handler` with the payload of every message on `topic`.
    ///
    /// Replaces any handler registered earlier for the same topic.
    pub fn on_mqtt_message(&self, topic: &str, handler: impl MessageHandler) {
        self.io.register_handler(topic, handler);
    }

    // ---------------------------------------------------------------
    // SNTP
    // ---------------------------------------------------------------

    /// Enable SNTP for `timezone` (hours from UTC, -11..=13). Requires the
    /// link. Clears both time flags.
    pub async fn init_internet_time(&mut self, timezone: i8) -> Result<bool> {
        self.state.time_sync_initialized = false;
        self.state.time_sync_updated = false;
        let command = commands::cmd_sntp_config(timezone, &self.ntp_server)?;
        if !self.state.link_up {
            debug!("not joined to an access point, skipping SNTP setup");
            return Ok(false);
        }

        self.state.time_sync_initialized = self
            .io
            .send_command(&command, Some(OK), self.command_timeout)
            .await?;
        Ok(self.state.time_sync_initialized)
    }

    /// Read the network time, polling until the SNTP client has synchronised.
    /// Requires the link and [`init_internet_time`](Self::init_internet_time).
    pub async fn update_internet_time(&mut self) -> Result<bool> {
        self.state.time_sync_updated = false;
        if !self.state.link_up || !self.state.time_sync_initialized {
            debug!("SNTP not available, skipping time update");
            return Ok(false);
        }

        let start = tokio::time::Instant::now();
        let time = loop {
            if start.elapsed() > SNTP_SYNC_BUDGET {
                warn!("SNTP did not synchronise in time");
                return Ok(false);
            }

            let Some(line) = self
                .io
                .query(&commands::cmd_sntp_time(), "+CIPSNTPTIME:", SNTP_REPLY_TIMEOUT)
                .await?
            else {
                debug!("no SNTP time reply");
                return Ok(false);
            };
            let time = match commands::parse_sntp_time(&line) {
                Ok(time) => time,
                Err(e) => {
                    warn!(error = %e, "unreadable SNTP time");
                    return Ok(false);
                }
            };
            if time.is_synchronized() {
                break time;
            }
            tokio::time::sleep(SNTP_POLL_PAUSE).await;
        };

        self.time = time;
        if self.io.get_response(OK, TRAILING_OK_TIMEOUT).await?.is_none() {
            return Ok(false);
        }
        self.state.time_sync_updated = true;
        debug!(?time, "network time updated");
        Ok(true)
    }

    // ---------------------------------------------------------------
    // Accessors
    // ---------------------------------------------------------------

    /// All session flags.
    pub fn session(&self) -> &SessionState {
        &self.state
    }

    pub fn wifi_connected(&self) -> bool {
        self.state.get(SessionFlag::LinkUp)
    }

    pub fn thingspeak_connected(&self) -> bool {
        self.state.get(SessionFlag::CloudSessionUp)
    }

    pub fn upload_succeeded(&self) -> bool {
        self.state.get(SessionFlag::LastUploadOk)
    }

    pub fn internet_time_initialized(&self) -> bool {
        self.state.get(SessionFlag::TimeSyncInitialized)
    }

    pub fn internet_time_updated(&self) -> bool {
        self.state.get(SessionFlag::TimeSyncUpdated)
    }

    /// The last time read by [`update_internet_time`](Self::update_internet_time).
    ///
    /// All fields are zero until the first successful read.
    pub fn network_time(&self) -> NetworkTime {
        self.time
    }

    /// Wait applied to the TCP and SNTP setup commands.
    pub fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    /// SNTP server passed to `AT+CIPSNTPCFG`.
    pub fn ntp_server(&self) -> &str {
        &self.ntp_server
    }

    /// The underlying AT link, for commands this driver does not wrap.
    pub fn io(&self) -> &AtIo {
        &self.io
    }

    /// Subscribe to link events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<AtEvent> {
        self.io.subscribe_events()
    }

    /// Stop the IO task and recover the transport.
    pub async fn shutdown(self) -> Result<Box<dyn Transport>> {
        self.io.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use espat_test_harness::{MockHandle, MockTransport};
    use tokio::time::Instant;

    use super::*;
    use crate::builder::Esp8266Builder;

    const JOIN_REPLY: &[u8] = b"WIFI CONNECTED\r\nWIFI GOT IP\r\n\r\nOK\r\n";

    async fn device(mock: MockTransport) -> (Esp8266, MockHandle) {
        let handle = mock.handle();
        let esp = Esp8266Builder::new()
            .build_with_transport(Box::new(mock))
            .await
            .unwrap();
        (esp, handle)
    }

    fn join_line() -> String {
        commands::cmd_join_ap("home", "secret")
    }

    fn expect_join(mock: &mut MockTransport) {
        mock.expect_line(&join_line(), JOIN_REPLY);
    }

    #[tokio::test(start_paused = true)]
    async fn init_sends_setup_sequence() {
        let mut mock = MockTransport::new();
        mock.expect_line("AT+RESTORE", b"\r\nOK\r\n");
        mock.expect_line("ATE0", b"ATE0\r\n\r\nOK\r\n");
        mock.expect_line("AT+CWMODE=1", b"\r\nOK\r\n");
        let (mut esp, handle) = device(mock).await;

        let start = Instant::now();
        esp.init().await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(2500));
        assert_eq!(handle.sent_lines(), vec!["AT+RESTORE", "ATE0", "AT+CWMODE=1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_wifi_succeeds_on_wifi_connected() {
        let mut mock = MockTransport::new();
        mock.expect_line_delayed(&join_line(), JOIN_REPLY, Duration::from_secs(3));
        let (mut esp, _) = device(mock).await;

        assert!(esp.connect_wifi("home", "secret").await.unwrap());
        assert!(esp.wifi_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn connect_wifi_fails_on_fail() {
        let mut mock = MockTransport::new();
        mock.expect_line(&join_line(), b"+CWJAP:3\r\n\r\nFAIL\r\n");
        let (mut esp, _) = device(mock).await;

        assert!(!esp.connect_wifi("home", "secret").await.unwrap());
        assert!(!esp.wifi_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn connect_wifi_times_out_after_window() {
        let mut mock = MockTransport::new();
        mock.expect_line(&join_line(), b"OK\r\n");
        let (mut esp, _) = device(mock).await;

        let start = Instant::now();
        assert!(!esp.connect_wifi("home", "secret").await.unwrap());
        assert!(start.elapsed() >= JOIN_TIMEOUT);
    }

    #[tokio::test(start_paused = true)]
    async fn thingspeak_requires_link() {
        let (mut esp, handle) = device(MockTransport::new()).await;
        assert!(!esp.connect_thingspeak().await.unwrap());
        assert!(handle.sent_lines().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn thingspeak_connect_and_upload() {
        let request = commands::thingspeak_update_request("KEY", &[21.5]).unwrap();
        let mut mock = MockTransport::new();
        expect_join(&mut mock);
        mock.expect_line(
            r#"AT+CIPSTART="TCP","api.thingspeak.com",80"#,
            b"CONNECT\r\n\r\nOK\r\n",
        );
        mock.expect_line(
            &commands::cmd_send_length(request.len() + 2),
            b"\r\nOK\r\n> ",
        );
        mock.expect_line_delayed(
            &request,
            b"\r\nRecv 120 bytes\r\n\r\nSEND OK\r\n",
            Duration::from_millis(200),
        );
        let (mut esp, _) = device(mock).await;

        assert!(esp.connect_wifi("home", "secret").await.unwrap());
        assert!(esp.connect_thingspeak().await.unwrap());
        esp.set_data("KEY", &[21.5]).unwrap();
        assert!(esp.upload_data().await.unwrap());

        let session = esp.session();
        assert!(session.link_up && session.cloud_session_up && session.last_upload_ok);
    }

    #[tokio::test(start_paused = true)]
    async fn upload_error_clears_flag() {
        let request = commands::thingspeak_update_request("KEY", &[]).unwrap();
        let mut mock = MockTransport::new();
        expect_join(&mut mock);
        mock.expect_line(
            r#"AT+CIPSTART="TCP","api.thingspeak.com",80"#,
            b"CONNECT\r\n\r\nOK\r\n",
        );
        mock.expect_line(&commands::cmd_send_length(request.len() + 2), b"\r\nOK\r\n> ");
        mock.expect_line(&request, b"\r\nERROR\r\n");
        let (mut esp, _) = device(mock).await;

        esp.connect_wifi("home", "secret").await.unwrap();
        esp.connect_thingspeak().await.unwrap();
        esp.set_data("KEY", &[]).unwrap();
        assert!(!esp.upload_data().await.unwrap());
        assert!(!esp.upload_succeeded());
    }

    #[tokio::test(start_paused = true)]
    async fn thingspeak_connect_error_is_false() {
        let mut mock = MockTransport::new();
        expect_join(&mut mock);
        mock.expect_line(
            r#"AT+CIPSTART="TCP","api.thingspeak.com",80"#,
            b"ERROR\r\nCLOSED\r\n",
        );
        let (mut esp, _) = device(mock).await;

        esp.connect_wifi("home", "secret").await.unwrap();
        let start = Instant::now();
        assert!(!esp.connect_thingspeak().await.unwrap());
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn upload_without_session_is_false() {
        let (mut esp, _) = device(MockTransport::new()).await;
        esp.set_data("KEY", &[1.0]).unwrap();
        assert!(!esp.upload_data().await.unwrap());
        assert!(!esp.upload_succeeded());
    }

    #[tokio::test(start_paused = true)]
    async fn set_data_rejects_too_many_fields() {
        let (mut esp, _) = device(MockTransport::new()).await;
        assert!(matches!(
            esp.set_data("KEY", &[0.0; 9]),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn mqtt_session_delivers_messages() {
        let mut mock = MockTransport::new();
        mock.expect_line(r#"AT+MQTTUSERCFG=0,1,"espat",,,0,0,"""#, b"OK\r\n");
        mock.expect_line("AT+MQTTCLEAN=0", b"ERROR\r\n");
        mock.expect_line(r#"AT+MQTTCONN=0,"broker.hivemq.com",1883,0"#, b"OK\r\n");
        mock.expect_line(r#"AT+MQTTSUB=0,"sensors/temp",1"#, b"OK\r\n");
        mock.expect_line(r#"AT+MQTTPUB=0,"led","on",0,0"#, b"OK\r\n");
        let (esp, handle) = device(mock).await;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        esp.on_mqtt_message("sensors/temp", move |payload: &str| {
            sink.lock().unwrap().push(payload.to_string())
        });

        esp.mqtt_user_config(1, "espat", "", "", "").await.unwrap();
        esp.mqtt_connect("broker.hivemq.com", 1883, false).await.unwrap();
        esp.mqtt_subscribe("sensors/temp", 1).await.unwrap();

        handle.push_unsolicited(b"+MQTTSUBRECV:0,\"sensors/temp\",\"21.5\"\r\n");
        esp.mqtt_publish("led", "on", 0).await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["21.5".to_string()]);
        assert_eq!(handle.remaining_expectations(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn mqtt_rejects_bad_qos_before_sending() {
        let (esp, handle) = device(MockTransport::new()).await;
        assert!(esp.mqtt_publish("t", "d", 3).await.is_err());
        assert!(esp.mqtt_subscribe("t", 5).await.is_err());
        assert!(handle.sent_lines().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn internet_time_requires_link() {
        let (mut esp, handle) = device(MockTransport::new()).await;
        assert!(!esp.init_internet_time(8).await.unwrap());
        assert!(!esp.update_internet_time().await.unwrap());
        assert!(handle.sent_lines().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn internet_time_rejects_timezone() {
        let (mut esp, _) = device(MockTransport::new()).await;
        assert!(matches!(
            esp.init_internet_time(14).await,
            Err(Error::InvalidParameter(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn internet_time_polls_until_synchronised() {
        let mut mock = MockTransport::new();
        expect_join(&mut mock);
        mock.expect_line(r#"AT+CIPSNTPCFG=1,8,"pool.ntp.org""#, b"OK\r\n");
        mock.expect_line(
            "AT+CIPSNTPTIME?",
            b"+CIPSNTPTIME:Thu Jan  1 00:00:08 1970\r\nOK\r\n",
        );
        mock.expect_line_delayed(
            "AT+CIPSNTPTIME?",
            b"+CIPSNTPTIME:Mon Jan 02 03:04:05 2024\r\nOK\r\n",
            Duration::from_millis(50),
        );
        let (mut esp, _) = device(mock).await;

        esp.connect_wifi("home", "secret").await.unwrap();
        assert!(esp.init_internet_time(8).await.unwrap());
        assert!(esp.update_internet_time().await.unwrap());
        assert!(esp.internet_time_updated());

        let time = esp.network_time();
        assert_eq!((time.year, time.month, time.day), (2024, 1, 2));
        assert_eq!((time.hour, time.minute, time.second), (3, 4, 5));
        assert_eq!(time.weekday, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn internet_time_ignores_error_before_trailing_ok() {
        let mut mock = MockTransport::new();
        expect_join(&mut mock);
        mock.expect_line(r#"AT+CIPSNTPCFG=1,8,"pool.ntp.org""#, b"OK\r\n");
        mock.expect_line(
            "AT+CIPSNTPTIME?",
            b"+CIPSNTPTIME:Mon Jan 02 03:04:05 2024\r\nERROR\r\nOK\r\n",
        );
        let (mut esp, _) = device(mock).await;

        esp.connect_wifi("home", "secret").await.unwrap();
        assert!(esp.init_internet_time(8).await.unwrap());
        assert!(esp.update_internet_time().await.unwrap());
        assert!(esp.internet_time_updated());
        assert_eq!(esp.network_time().year, 2024);
    }

    #[tokio::test(start_paused = true)]
    async fn internet_time_without_reply_is_false() {
        let mut mock = MockTransport::new();
        expect_join(&mut mock);
        mock.expect_line(r#"AT+CIPSNTPCFG=1,0,"pool.ntp.org""#, b"OK\r\n");
        mock.expect_line("AT+CIPSNTPTIME?", b"");
        let (mut esp, _) = device(mock).await;

        esp.connect_wifi("home", "secret").await.unwrap();
        assert!(esp.init_internet_time(0).await.unwrap());
        assert!(!esp.update_internet_time().await.unwrap());
        assert!(!esp.internet_time_updated());
    }

    #[tokio::test]
    async fn shutdown_recovers_transport() {
        let (esp, _) = device(MockTransport::new()).await;
        let transport = esp.shutdown().await.unwrap();
        assert!(transport.is_connected());
    }
}
