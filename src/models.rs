//! Data models for BPM telemetry records and related structures
//!
//! Defines the records that flow through the fog pipeline: raw device
//! input, the processed record, and the compact message sent to the cloud.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

fn unknown() -> String {
    "unknown".to_string()
}

/// One newline-delimited JSON record as sent by a device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRecord {
    #[serde(default = "unknown")]
    pub user_id: String,

    #[serde(default = "unknown")]
    pub device_id: String,

    /// Device-side timestamp, passed through verbatim
    #[serde(default)]
    pub timestamp: Option<String>,

    /// Kept as raw JSON so a non-numeric value is a validation failure,
    /// not a parse failure
    #[serde(default)]
    pub bpm: Option<serde_json::Value>,

    /// Signal quality reported by the sensor, nominally 0-100
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal_quality: Option<f64>,
}

/// Risk tier of a single BPM reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    CriticalLow,
    WarningLow,
    Normal,
    WarningHigh,
    CriticalHigh,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::CriticalLow => "critical_low",
            RiskLevel::WarningLow => "warning_low",
            RiskLevel::Normal => "normal",
            RiskLevel::WarningHigh => "warning_high",
            RiskLevel::CriticalHigh => "critical_high",
        }
    }

    /// 10 for critical tiers, 5 for warnings, 0 for normal
    pub fn score(&self) -> u8 {
        match self {
            RiskLevel::CriticalLow | RiskLevel::CriticalHigh => 10,
            RiskLevel::WarningLow | RiskLevel::WarningHigh => 5,
            RiskLevel::Normal => 0,
        }
    }

    pub fn is_critical(&self) -> bool {
        matches!(self, RiskLevel::CriticalLow | RiskLevel::CriticalHigh)
    }

    pub fn is_warning(&self) -> bool {
        matches!(self, RiskLevel::WarningLow | RiskLevel::WarningHigh)
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated and classified record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedRecord {
    pub user_id: String,
    pub device_id: String,
    pub timestamp: Option<String>,
    pub bpm: f64,
    pub signal_quality: Option<f64>,
    pub risk_level: RiskLevel,
    pub risk_score: u8,
    pub processed_at: DateTime<Utc>,
    /// Signal quality clamped to [0, 100] and scaled to [0, 1]
    pub signal_quality_normalized: f64,
}

impl ProcessedRecord {
    /// MQTT topic this record is published on
    pub fn topic(&self) -> String {
        format!("bpm/{}/{}/measurements", self.user_id, self.device_id)
    }
}

/// A record rejected by the preprocessor
#[derive(Debug, Clone, PartialEq)]
pub struct InvalidRecord {
    pub user_id: String,
    pub device_id: String,
    pub reason: String,
}

/// Windowed statistics attached to every cloud message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedStats {
    pub avg_bpm: Option<f64>,
    pub min_bpm: Option<f64>,
    pub max_bpm: Option<f64>,
    pub samples_received: u64,
}

/// Compact payload published to the cloud broker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudMessage {
    pub user_id: String,
    pub device_id: String,
    pub timestamp: Option<String>,
    pub bpm: f64,
    pub risk_level: RiskLevel,
    pub risk_score: u8,
    pub fog_processed: bool,
    pub processed_at: DateTime<Utc>,
    pub signal_quality: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregated_stats: Option<AggregatedStats>,
}

impl CloudMessage {
    pub fn new(record: &ProcessedRecord, aggregated_stats: Option<AggregatedStats>) -> Self {
        Self {
            user_id: record.user_id.clone(),
            device_id: record.device_id.clone(),
            timestamp: record.timestamp.clone(),
            bpm: record.bpm,
            risk_level: record.risk_level,
            risk_score: record.risk_score,
            fog_processed: true,
            processed_at: record.processed_at,
            signal_quality: record.signal_quality_normalized,
            aggregated_stats,
        }
    }
}

/// Per-device totals reported on shutdown and by the status API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSummary {
    pub received: u64,
    pub sent_to_cloud: u64,
    pub filtered: u64,
    pub avg_bpm: Option<f64>,
}

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthCheck {
    pub status: String,
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub forwarding_mode: String,
    pub cloud: String,
    pub devices: usize,
}

/// Round to one decimal place, as reported in summaries and cloud messages
pub fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
