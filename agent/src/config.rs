use clap::{ArgAction, Parser};
use std::str::FromStr;
use std::time::Duration;

use crate::errors::{Error, Result};

#[derive(Debug, Clone, Parser)]
#[command(name = "device-agent", about = "Sensor telemetry and direct-method agent")]
pub struct Args {
    /// HostName=...;DeviceId=...;SharedAccessKey=...
    #[arg(long, env = "CONNECTION_STRING")]
    pub connection_string: String,

    #[arg(long, env = "MQTT_PORT", default_value_t = 8883)]
    pub mqtt_port: u16,

    #[arg(long, env = "MQTT_TLS", default_value_t = true, action = ArgAction::Set)]
    pub tls: bool,

    /// Pre-issued SAS token used as the MQTT password
    #[arg(long, env = "SAS_TOKEN")]
    pub sas_token: Option<String>,

    /// Initial telemetry interval in seconds
    #[arg(long, env = "TELEMETRY_INTERVAL", default_value_t = 1)]
    pub telemetry_interval: u64,

    #[arg(long, env = "KEEP_ALIVE_SECS", default_value_t = 30)]
    pub keep_alive_secs: u64,

    /// Consecutive connection failures tolerated before the session is torn down
    #[arg(long, env = "MAX_TRANSPORT_ERRORS", default_value_t = 3)]
    pub max_transport_errors: u32,

    #[arg(long, env = "TWIN_TIMEOUT_SECS", default_value_t = 10)]
    pub twin_timeout_secs: u64,

    /// Serve /metrics and /api/v1/twin on this address
    #[arg(long, env = "HTTP_ADDR")]
    pub http_addr: Option<String>,

    /// End the session when a reported-state update fails
    #[arg(long, env = "FATAL_REPORT_ERRORS")]
    pub fatal_report_errors: bool,

    /// Firmware version reported by the simulated board
    #[arg(long, env = "FIRMWARE_VERSION", default_value = "1.0.0")]
    pub firmware_version: String,
}

/// Settings derived from [`Args`] once validated
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub connection: ConnectionString,
    pub mqtt_port: u16,
    pub tls: bool,
    pub sas_token: Option<String>,
    pub telemetry_interval: u64,
    pub keep_alive: Duration,
    pub max_transport_errors: u32,
    pub twin_timeout: Duration,
    pub fatal_report_errors: bool,
}

impl TryFrom<&Args> for AgentConfig {
    type Error = Error;

    fn try_from(args: &Args) -> Result<Self> {
        if args.telemetry_interval == 0 {
            return Err(Error::Config("telemetry interval must be positive".to_string()));
        }

        Ok(Self {
            connection: args.connection_string.parse()?,
            mqtt_port: args.mqtt_port,
            tls: args.tls,
            sas_token: args.sas_token.clone(),
            telemetry_interval: args.telemetry_interval,
            keep_alive: Duration::from_secs(args.keep_alive_secs),
            max_transport_errors: args.max_transport_errors.max(1),
            twin_timeout: Duration::from_secs(args.twin_timeout_secs.max(1)),
            fatal_report_errors: args.fatal_report_errors,
        })
    }
}

impl AgentConfig {
    /// The agent never derives a SAS token from the key, so a key without an
    /// explicit token means the hub will see an empty password.
    pub fn ignores_shared_access_key(&self) -> bool {
        self.connection.shared_access_key.is_some() && self.sas_token.is_none()
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionString {
    pub host_name: String,
    pub device_id: String,
    pub shared_access_key: Option<String>,
}

impl std::fmt::Debug for ConnectionString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionString")
            .field("host_name", &self.host_name)
            .field("device_id", &self.device_id)
            .field("shared_access_key", &self.shared_access_key.as_ref().map(|_| "***"))
            .finish()
    }
}

impl FromStr for ConnectionString {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut host_name = None;
        let mut device_id = None;
        let mut shared_access_key = None;

        for part in s.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            // keys can hold '=' padding, so split on the first one only
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| Error::Config(format!("malformed connection string segment '{}'", part)))?;
            match key {
                "HostName" => host_name = Some(value.to_string()),
                "DeviceId" => device_id = Some(value.to_string()),
                "SharedAccessKey" => shared_access_key = Some(value.to_string()),
                _ => {}
            }
        }

        let host_name = host_name
            .filter(|v| !v.is_empty())
            .ok_or_else(|| Error::Config("connection string is missing HostName".to_string()))?;
        let device_id = device_id
            .filter(|v| !v.is_empty())
            .ok_or_else(|| Error::Config("connection string is missing DeviceId".to_string()))?;

        Ok(Self {
            host_name,
            device_id,
            shared_access_key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_connection_string() {
        let parsed: ConnectionString = "HostName=hub.example.net;DeviceId=pi-1;SharedAccessKey=abc=="
            .parse()
            .unwrap();

        assert_eq!(parsed.host_name, "hub.example.net");
        assert_eq!(parsed.device_id, "pi-1");
        assert_eq!(parsed.shared_access_key.as_deref(), Some("abc=="));
    }

    #[test]
    fn test_missing_device_id() {
        assert!("HostName=hub.example.net".parse::<ConnectionString>().is_err());
        assert!("HostName=hub;DeviceId=".parse::<ConnectionString>().is_err());
    }

    #[test]
    fn test_malformed_segment() {
        assert!("HostName=hub;DeviceId".parse::<ConnectionString>().is_err());
    }

    #[test]
    fn test_debug_hides_key() {
        let parsed: ConnectionString = "HostName=h;DeviceId=d;SharedAccessKey=secret".parse().unwrap();
        assert!(!format!("{:?}", parsed).contains("secret"));
    }

    #[test]
    fn test_args_into_config() {
        let args = Args::parse_from([
            "device-agent",
            "--connection-string",
            "HostName=hub;DeviceId=pi-1",
            "--telemetry-interval",
            "5",
            "--tls",
            "false",
        ]);
        let config = AgentConfig::try_from(&args).unwrap();

        assert_eq!(config.connection.device_id, "pi-1");
        assert_eq!(config.telemetry_interval, 5);
        assert_eq!(config.mqtt_port, 8883);
        assert!(!config.tls);
        assert!(!config.fatal_report_errors);
    }

    #[test]
    fn test_key_without_token_is_flagged() {
        let with_key = "HostName=hub;DeviceId=pi-1;SharedAccessKey=abc==";

        let args = Args::parse_from(["device-agent", "--connection-string", with_key]);
        assert!(AgentConfig::try_from(&args).unwrap().ignores_shared_access_key());

        let args = Args::parse_from([
            "device-agent",
            "--connection-string",
            with_key,
            "--sas-token",
            "SharedAccessSignature sr=hub",
        ]);
        assert!(!AgentConfig::try_from(&args).unwrap().ignores_shared_access_key());

        let args = Args::parse_from(["device-agent", "--connection-string", "HostName=hub;DeviceId=pi-1"]);
        assert!(!AgentConfig::try_from(&args).unwrap().ignores_shared_access_key());
    }

    #[test]
    fn test_zero_interval_rejected() {
        let args = Args::parse_from([
            "device-agent",
            "--connection-string",
            "HostName=hub;DeviceId=pi-1",
            "--telemetry-interval",
            "0",
        ]);
        assert!(AgentConfig::try_from(&args).is_err());
    }
}
