//! # Telemetry Encoding Module
//!
//! One record is built per cycle and handed to an encoder chosen by
//! configuration. Two wire formats exist:
//! - InfluxDB line protocol: `ecg_001,device=device1 ecg=1234`, no timestamp,
//!   the consumer stamps the point at ingestion
//! - JSON object with `measurement_time`, `measurement_id`, `measurement`
//!   and `heart_rate`; `measurement_time` is left out while the clock is
//!   unresolved
//!
//! Consumers deduplicate by `measurement_id`, which is what makes
//! at-least-once delivery safe.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TelemetryRecord {
    #[serde(rename = "measurement_time", skip_serializing_if = "Option::is_none")]
    pub timestamp_millis: Option<u64>,
    pub measurement_id: u32,
    #[serde(rename = "measurement")]
    pub measurement_value: u16,
    pub heart_rate: u16,
}

pub trait TelemetryEncoder: Send {
    fn encode(&self, record: &TelemetryRecord) -> Vec<u8>;
}

pub struct LineProtocolEncoder {
    measurement: String,
    device: String,
}

impl LineProtocolEncoder {
    pub fn new(measurement: impl Into<String>, device: impl Into<String>) -> Self {
        Self {
            measurement: measurement.into(),
            device: device.into(),
        }
    }
}

impl TelemetryEncoder for LineProtocolEncoder {
    fn encode(&self, record: &TelemetryRecord) -> Vec<u8> {
        format!(
            "{},device={} ecg={}",
            escape_line_protocol(&self.measurement),
            escape_line_protocol(&self.device),
            record.measurement_value
        )
        .into_bytes()
    }
}

/// Escapes commas, spaces and equals signs, which delimit line protocol fields
fn escape_line_protocol(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, ',' | ' ' | '=') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

pub struct JsonEncoder;

impl TelemetryEncoder for JsonEncoder {
    fn encode(&self, record: &TelemetryRecord) -> Vec<u8> {
        // Serializing a struct of integers cannot fail
        serde_json::to_vec(record).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadFormat {
    LineProtocol,
    Json,
}

impl PayloadFormat {
    pub fn encoder(&self, measurement: &str, device: &str) -> Box<dyn TelemetryEncoder> {
        match self {
            PayloadFormat::LineProtocol => Box::new(LineProtocolEncoder::new(measurement, device)),
            PayloadFormat::Json => Box::new(JsonEncoder),
        }
    }
}
