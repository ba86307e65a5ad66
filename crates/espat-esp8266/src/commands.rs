//! ESP8266 AT command builders and response parsers.
//!
//! All functions are pure: they produce command lines (without the CR LF
//! terminator, which the engine appends) or parse reply lines, and perform
//! no I/O.
//!
//! # Command reference
//!
//! Based on the ESP8266 AT instruction set (ESP-AT 2.x) as shipped on common
//! ESP-01 and ESP-12 modules. String parameters are double-quoted; the
//! firmware expects `"`, `,` and `\` inside them to be escaped with `\`.

use espat_core::{Error, Result};

/// Host of the ThingSpeak update API.
pub const THINGSPEAK_HOST: &str = "api.thingspeak.com";

/// Port of the ThingSpeak update API.
pub const THINGSPEAK_PORT: u16 = 80;

/// Default SNTP server.
pub const DEFAULT_NTP_SERVER: &str = "pool.ntp.org";

/// Number of ThingSpeak channel fields.
pub const MAX_FIELDS: usize = 8;

/// Year reported by the SNTP client before the first synchronisation.
pub const UNSYNCED_YEAR: u16 = 1970;

/// Accepted `AT+CIPSNTPCFG` timezone range.
pub const TIMEZONE_RANGE: std::ops::RangeInclusive<i8> = -11..=13;

/// Accepted `AT+MQTTUSERCFG` scheme range (1 = TCP ... 10 = WSS with both
/// certificates).
pub const MQTT_SCHEME_RANGE: std::ops::RangeInclusive<u8> = 1..=10;

/// Escape a string parameter for use inside double quotes.
fn quote(param: &str) -> String {
    let mut out = String::with_capacity(param.len() + 2);
    out.push('"');
    for c in param.chars() {
        if matches!(c, '"' | ',' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

fn check_qos(qos: u8) -> Result<()> {
    if qos > 2 {
        return Err(Error::InvalidParameter(format!(
            "MQTT QoS must be 0, 1 or 2, got {qos}"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------
// Basic
// ---------------------------------------------------------------

/// Restore factory settings (`AT+RESTORE`). The module reboots.
pub fn cmd_restore() -> String {
    "AT+RESTORE".to_string()
}

/// Disable command echo (`ATE0`).
pub fn cmd_echo_off() -> String {
    "ATE0".to_string()
}

/// Select station mode (`AT+CWMODE=1`).
pub fn cmd_station_mode() -> String {
    "AT+CWMODE=1".to_string()
}

// ---------------------------------------------------------------
// WiFi and TCP
// ---------------------------------------------------------------

/// Join an access point (`AT+CWJAP="<ssid>","<password>"`).
pub fn cmd_join_ap(ssid: &str, password: &str) -> String {
    format!("AT+CWJAP={},{}", quote(ssid), quote(password))
}

/// Open a TCP connection (`AT+CIPSTART="TCP","<host>",<port>`).
pub fn cmd_tcp_start(host: &str, port: u16) -> String {
    format!("AT+CIPSTART=\"TCP\",{},{port}", quote(host))
}

/// Announce `len` bytes of payload (`AT+CIPSEND=<len>`).
pub fn cmd_send_length(len: usize) -> String {
    format!("AT+CIPSEND={len}")
}

/// Build the ThingSpeak update request line.
///
/// All eight fields are always present; fields not given are sent as `0`.
pub fn thingspeak_update_request(api_key: &str, fields: &[f64]) -> Result<String> {
    if fields.len() > MAX_FIELDS {
        return Err(Error::InvalidParameter(format!(
            "ThingSpeak channels have {MAX_FIELDS} fields, got {}",
            fields.len()
        )));
    }
    let mut request = format!("GET /update?api_key={api_key}");
    for i in 0..MAX_FIELDS {
        let value = fields.get(i).copied().unwrap_or(0.0);
        request.push_str(&format!("&field{}={value}", i + 1));
    }
    Ok(request)
}

// ---------------------------------------------------------------
// MQTT
// ---------------------------------------------------------------

/// Configure the MQTT client
/// (`AT+MQTTUSERCFG=0,<scheme>,"<client>","<user>","<pass>",0,0,"<path>"`).
///
/// Empty username or password are sent as empty parameters.
pub fn cmd_mqtt_user_config(
    scheme: u8,
    client_id: &str,
    username: &str,
    password: &str,
    path: &str,
) -> Result<String> {
    if !MQTT_SCHEME_RANGE.contains(&scheme) {
        return Err(Error::InvalidParameter(format!(
            "MQTT scheme must be in 1..=10, got {scheme}"
        )));
    }
    let optional = |s: &str| if s.is_empty() { String::new() } else { quote(s) };
    Ok(format!(
        "AT+MQTTUSERCFG=0,{scheme},{},{},{},0,0,{}",
        quote(client_id),
        optional(username),
        optional(password),
        quote(path)
    ))
}

/// Drop any previous MQTT connection (`AT+MQTTCLEAN=0`).
pub fn cmd_mqtt_clean() -> String {
    "AT+MQTTCLEAN=0".to_string()
}

/// Connect to a broker (`AT+MQTTCONN=0,"<host>",<port>,<reconnect>`).
pub fn cmd_mqtt_connect(host: &str, port: u16, reconnect: bool) -> String {
    format!(
        "AT+MQTTCONN=0,{},{port},{}",
        quote(host),
        u8::from(reconnect)
    )
}

/// Publish a message (`AT+MQTTPUB=0,"<topic>","<data>",<qos>,0`).
pub fn cmd_mqtt_publish(topic: &str, data: &str, qos: u8) -> Result<String> {
    check_qos(qos)?;
    Ok(format!(
        "AT+MQTTPUB=0,{},{},{qos},0",
        quote(topic),
        quote(data)
    ))
}

/// Subscribe to a topic (`AT+MQTTSUB=0,"<topic>",<qos>`).
pub fn cmd_mqtt_subscribe(topic: &str, qos: u8) -> Result<String> {
    check_qos(qos)?;
    Ok(format!("AT+MQTTSUB=0,{},{qos}", quote(topic)))
}

// ---------------------------------------------------------------
// SNTP
// ---------------------------------------------------------------

/// Enable SNTP for `timezone` (`AT+CIPSNTPCFG=1,<tz>,"<server>"`).
pub fn cmd_sntp_config(timezone: i8, server: &str) -> Result<String> {
    if !TIMEZONE_RANGE.contains(&timezone) {
        return Err(Error::InvalidParameter(format!(
            "timezone must be in -11..=13, got {timezone}"
        )));
    }
    Ok(format!("AT+CIPSNTPCFG=1,{timezone},{}", quote(server)))
}

/// Query the SNTP time (`AT+CIPSNTPTIME?`).
pub fn cmd_sntp_time() -> String {
    "AT+CIPSNTPTIME?".to_string()
}

/// Wall-clock time reported by the module's SNTP client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkTime {
    pub year: u16,
    /// 1 = January.
    pub month: u8,
    pub day: u8,
    /// 1 = Monday ... 7 = Sunday.
    pub weekday: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl NetworkTime {
    /// Whether the SNTP client has synchronised at least once.
    pub fn is_synchronized(&self) -> bool {
        self.year != UNSYNCED_YEAR
    }
}

fn weekday_number(name: &str) -> Option<u8> {
    let n = match name {
        "Mon" => 1,
        "Tue" => 2,
        "Wed" => 3,
        "Thu" => 4,
        "Fri" => 5,
        "Sat" => 6,
        "Sun" => 7,
        _ => return None,
    };
    Some(n)
}

fn month_number(name: &str) -> Option<u8> {
    const MONTHS: [&str; 12] = [
        "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
    ];
    MONTHS
        .iter()
        .position(|m| *m == name)
        .map(|i| i as u8 + 1)
}

/// Parse a `+CIPSNTPTIME:` reply line.
///
/// The firmware prints the date in C `asctime` layout, padding single-digit
/// days with a space: `+CIPSNTPTIME:Thu Jan  1 00:00:08 1970`.
pub fn parse_sntp_time(line: &str) -> Result<NetworkTime> {
    let malformed = || Error::Protocol(format!("malformed SNTP time: {line:?}"));

    let (_, rest) = line.split_once(':').ok_or_else(malformed)?;
    let parts: Vec<&str> = rest.split_whitespace().collect();
    let [weekday, month, day, time, year] = parts[..] else {
        return Err(malformed());
    };

    let mut hms = time.split(':').map(|s| s.parse::<u8>());
    let (Some(Ok(hour)), Some(Ok(minute)), Some(Ok(second)), None) =
        (hms.next(), hms.next(), hms.next(), hms.next())
    else {
        return Err(malformed());
    };

    Ok(NetworkTime {
        year: year.parse().map_err(|_| malformed())?,
        month: month_number(month).ok_or_else(malformed)?,
        day: day.parse().map_err(|_| malformed())?,
        weekday: weekday_number(weekday).ok_or_else(malformed)?,
        hour,
        minute,
        second,
    })
}
