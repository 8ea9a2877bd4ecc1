use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// One sensor reading as sent on every telemetry tick
#[derive(Debug, Clone, Serialize)]
pub struct TelemetrySample {
    #[serde(rename = "DeviceID")]
    pub device_id: String,
    #[serde(rename = "Temperature")]
    pub temperature: f64,
    #[serde(rename = "Humidity")]
    pub humidity: f64,
    #[serde(skip)]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeviceMetadata {
    pub object_type: String,
    pub is_simulated_device: u8,
    pub version: String,
    pub device_properties: DeviceProperties,
    pub telemetry: Vec<TelemetryField>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceProperties {
    #[serde(rename = "DeviceID")]
    pub device_id: String,
    #[serde(rename = "TelemetryInterval")]
    pub telemetry_interval: u64,
    #[serde(rename = "HubEnabledState")]
    pub hub_enabled_state: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct TelemetryField {
    pub name: String,
    pub display_name: String,
    #[serde(rename = "Type")]
    pub kind: String,
}

impl TelemetryField {
    fn double(name: &str) -> Self {
        Self {
            name: name.to_string(),
            display_name: name.to_string(),
            kind: "double".to_string(),
        }
    }
}

impl DeviceMetadata {
    pub fn new(device_id: &str, telemetry_interval: u64) -> Self {
        Self {
            object_type: "DeviceInfo".to_string(),
            is_simulated_device: 0,
            version: "1.0".to_string(),
            device_properties: DeviceProperties {
                device_id: device_id.to_string(),
                telemetry_interval,
                hub_enabled_state: true,
            },
            telemetry: vec![
                TelemetryField::double("Temperature"),
                TelemetryField::double("Humidity"),
            ],
        }
    }
}

/// Device-side half of the twin
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReportedProperties {
    pub config: ReportedConfig,
    pub system: SystemInfo,
    pub supported_methods: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReportedConfig {
    pub temperature_mean_value: f64,
    pub telemetry_interval: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemInfo {
    #[serde(rename = "Manufacturer")]
    pub manufacturer: String,
    #[serde(rename = "FirmwareVersion")]
    pub firmware_version: String,
    #[serde(rename = "InstalledRAM")]
    pub installed_ram: String,
    #[serde(rename = "ModelNumber")]
    pub model_number: String,
    #[serde(rename = "Platform")]
    pub platform: String,
    #[serde(rename = "Processor")]
    pub processor: String,
    #[serde(rename = "SerialNumber")]
    pub serial_number: String,
}

impl SystemInfo {
    pub fn new(firmware_version: String) -> Self {
        Self {
            manufacturer: "Rust device agent".to_string(),
            firmware_version,
            installed_ram: "8 MB".to_string(),
            model_number: "DB-14".to_string(),
            platform: "Plat 9.75".to_string(),
            processor: "ArmV7".to_string(),
            serial_number: "SER99".to_string(),
        }
    }
}

pub const TEMPERATURE_MEAN_VALUE: f64 = 56.7;

impl ReportedProperties {
    pub fn new(
        telemetry_interval: u64,
        system: SystemInfo,
        supported_methods: BTreeMap<String, String>,
    ) -> Self {
        Self {
            config: ReportedConfig {
                temperature_mean_value: TEMPERATURE_MEAN_VALUE,
                telemetry_interval,
            },
            system,
            supported_methods,
        }
    }
}

/// A direct method call delivered by the cloud
#[derive(Debug, Clone)]
pub struct MethodInvocation {
    pub method_name: String,
    pub payload: Map<String, Value>,
}

impl MethodInvocation {
    pub fn new(method_name: impl Into<String>, payload: Value) -> Self {
        let payload = match payload {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            method_name: method_name.into(),
            payload,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodResult {
    pub status_code: u16,
    pub message: String,
}

impl MethodResult {
    pub fn new(status_code: u16, message: impl Into<String>) -> Self {
        Self {
            status_code,
            message: message.into(),
        }
    }

    /// Body published on the method response topic; the status travels in the topic
    pub fn body(&self) -> Value {
        serde_json::json!({ "message": self.message })
    }
}

/// Loose integer parsing for remote values. Numbers are truncated toward
/// zero. Strings yield their leading integer, so `"30s"` is 30 and `"7.9"`
/// is 7; a string with no leading digits is absent.
pub fn parse_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64)),
        Value::String(s) => leading_int(s),
        _ => None,
    }
}

fn leading_int(s: &str) -> Option<i64> {
    let s = s.trim_start();
    let (negative, rest) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    let end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    if end == 0 {
        return None;
    }

    // too many digits saturates; callers range-check anyway
    let magnitude = rest[..end].parse::<i64>().unwrap_or(i64::MAX);
    Some(if negative { -magnitude } else { magnitude })
}
