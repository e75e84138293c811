//! Record preprocessing
//!
//! Validates one raw device record and enriches it with its risk
//! classification, processing timestamp and normalized signal quality.

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::classifier::{classify, Thresholds};
use crate::error::{FogError, FogResult};
use crate::models::{InvalidRecord, ProcessedRecord, RawRecord};

/// Accepted BPM range (inclusive)
pub struct BpmConstraints;

impl BpmConstraints {
    pub const MIN: f64 = 0.0;
    pub const MAX: f64 = 300.0;
}

/// Signal quality assumed when a device does not report one
const DEFAULT_SIGNAL_QUALITY: f64 = 100.0;

/// Stateless record preprocessor
#[derive(Debug, Clone, Default)]
pub struct Preprocessor {
    thresholds: Thresholds,
}

impl Preprocessor {
    pub fn new(thresholds: Thresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    /// Validate and classify a record, stamping it with the current time
    pub fn process(&self, raw: RawRecord) -> Result<ProcessedRecord, InvalidRecord> {
        self.process_at(raw, Utc::now())
    }

    /// Same as [`Preprocessor::process`] with an explicit processing time
    pub fn process_at(
        &self,
        raw: RawRecord,
        now: DateTime<Utc>,
    ) -> Result<ProcessedRecord, InvalidRecord> {
        let bpm = match validate_bpm(raw.bpm.as_ref()) {
            Ok(bpm) => bpm,
            Err(err) => {
                warn!(device_id = %raw.device_id, error = %err, "Record rejected");
                return Err(InvalidRecord {
                    user_id: raw.user_id,
                    device_id: raw.device_id,
                    reason: err.to_string(),
                });
            }
        };

        let risk_level = classify(bpm, &self.thresholds);
        let signal_quality_normalized = normalize_signal_quality(raw.signal_quality);

        debug!(
            device_id = %raw.device_id,
            bpm,
            risk_level = %risk_level,
            "Record preprocessed"
        );

        Ok(ProcessedRecord {
            user_id: raw.user_id,
            device_id: raw.device_id,
            timestamp: raw.timestamp,
            bpm,
            signal_quality: raw.signal_quality,
            risk_level,
            risk_score: risk_level.score(),
            processed_at: now,
            signal_quality_normalized,
        })
    }
}

/// BPM must be present, numeric, finite and within [0, 300]
fn validate_bpm(value: Option<&serde_json::Value>) -> FogResult<f64> {
    let value = value.ok_or_else(|| FogError::Validation("BPM is missing".to_string()))?;

    let bpm = value
        .as_f64()
        .ok_or_else(|| FogError::Validation(format!("BPM is not numeric: {}", value)))?;

    if !bpm.is_finite() {
        return Err(FogError::Validation(
            "BPM must be a finite number".to_string(),
        ));
    }

    if !(BpmConstraints::MIN..=BpmConstraints::MAX).contains(&bpm) {
        return Err(FogError::Validation(format!(
            "BPM {} out of valid range [{}, {}]",
            bpm,
            BpmConstraints::MIN,
            BpmConstraints::MAX
        )));
    }

    Ok(bpm)
}

/// Clamp to [0, 100] then scale to [0, 1]
fn normalize_signal_quality(signal_quality: Option<f64>) -> f64 {
    let quality = signal_quality
        .filter(|q| q.is_finite())
        .unwrap_or(DEFAULT_SIGNAL_QUALITY);
    quality.clamp(0.0, 100.0) / 100.0
}
