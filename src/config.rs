//! Configuration management module
//!
//! Loads and validates environment-based configuration for the fog node.
//! Every value has a default so the node starts with no environment at all.

use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use thiserror::Error;
use validator::Validate;

use crate::aggregator::DEFAULT_HISTORY_CAPACITY;
use crate::classifier::Thresholds;
use crate::policy::{
    ForwardingMode, DEFAULT_AGGREGATION_WINDOW_SECS, DEFAULT_MIN_SAMPLES_FOR_AGGREGATION,
};

/// Configuration errors
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Invalid value for {key}: {value}")]
    ParseError { key: &'static str, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Ingestion listener settings
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

/// Cloud broker connection settings
#[derive(Debug, Clone, Deserialize)]
pub struct CloudSettings {
    /// Skip the cloud connector entirely and filter locally only
    pub offline: bool,
    pub endpoint: String,
    pub port: u16,
    /// MQTT client identity (IoT thing name)
    pub client_id: String,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub root_ca_path: PathBuf,
}

/// Filtering and aggregation settings
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ProcessingSettings {
    pub thresholds: Thresholds,
    pub mode: ForwardingMode,
    /// Minimum seconds between two periodic forwards for one device
    #[validate(range(min = 1, max = 86400))]
    pub aggregation_window_secs: u64,
    #[validate(range(min = 1, max = 10000))]
    pub min_samples_for_aggregation: usize,
    #[validate(range(min = 1, max = 100000))]
    pub history_capacity: usize,
}

/// Operational status API settings
#[derive(Debug, Clone, Deserialize)]
pub struct StatusSettings {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server: ServerSettings,
    pub cloud: CloudSettings,
    pub processing: ProcessingSettings,
    pub status: StatusSettings,
}

impl Settings {
    /// Load settings from environment variables
    pub fn from_env() -> Result<Self, SettingsError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load settings from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let mode: ForwardingMode = get("FORWARDING_MODE", "default")
            .parse()
            .map_err(|e: crate::error::FogError| SettingsError::Invalid(e.to_string()))?;

        let settings = Self {
            server: ServerSettings {
                host: get("FOG_HOST", "0.0.0.0"),
                port: parse(&lookup, "FOG_PORT", 25000)?,
            },
            cloud: CloudSettings {
                offline: parse(&lookup, "OFFLINE", false)?,
                endpoint: get("CLOUD_ENDPOINT", "localhost"),
                port: parse(&lookup, "CLOUD_PORT", 8883)?,
                client_id: get("CLOUD_CLIENT_ID", "bpm-fog-node"),
                cert_path: get("CLOUD_CERT_PATH", "certs/device.pem.crt").into(),
                key_path: get("CLOUD_KEY_PATH", "certs/private.pem.key").into(),
                root_ca_path: get("CLOUD_ROOT_CA_PATH", "certs/AmazonRootCA1.pem").into(),
            },
            processing: ProcessingSettings {
                thresholds: Thresholds {
                    critical_low: parse(
                        &lookup,
                        "BPM_CRITICAL_LOW",
                        Thresholds::DEFAULT_CRITICAL_LOW,
                    )?,
                    warning_low: parse(
                        &lookup,
                        "BPM_WARNING_LOW",
                        Thresholds::DEFAULT_WARNING_LOW,
                    )?,
                    warning_high: parse(
                        &lookup,
                        "BPM_WARNING_HIGH",
                        Thresholds::DEFAULT_WARNING_HIGH,
                    )?,
                    critical_high: parse(
                        &lookup,
                        "BPM_CRITICAL_HIGH",
                        Thresholds::DEFAULT_CRITICAL_HIGH,
                    )?,
                },
                mode,
                aggregation_window_secs: parse(
                    &lookup,
                    "AGGREGATION_WINDOW_SECS",
                    DEFAULT_AGGREGATION_WINDOW_SECS,
                )?,
                min_samples_for_aggregation: parse(
                    &lookup,
                    "MIN_SAMPLES_FOR_AGGREGATION",
                    DEFAULT_MIN_SAMPLES_FOR_AGGREGATION,
                )?,
                history_capacity: parse(&lookup, "HISTORY_CAPACITY", DEFAULT_HISTORY_CAPACITY)?,
            },
            status: StatusSettings {
                enabled: parse(&lookup, "STATUS_API_ENABLED", false)?,
                host: get("STATUS_HOST", "127.0.0.1"),
                port: parse(&lookup, "STATUS_PORT", 8081)?,
            },
        };

        settings.validate()?;
        Ok(settings)
    }

    /// Check ranges and threshold ordering
    pub fn validate(&self) -> Result<(), SettingsError> {
        self.processing
            .validate()
            .map_err(|e| SettingsError::Invalid(e.to_string()))?;

        if !self.processing.thresholds.is_ordered() {
            return Err(SettingsError::Invalid(
                "BPM thresholds must satisfy critical_low < warning_low < warning_high < critical_high"
                    .to_string(),
            ));
        }

        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn status_address(&self) -> String {
        format!("{}:{}", self.status.host, self.status.port)
    }
}

fn parse<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, SettingsError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| SettingsError::ParseError { key, value }),
        None => Ok(default),
    }
}
