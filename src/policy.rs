//! Cloud forwarding policy
//!
//! Decides, per processed record, whether it is forwarded immediately,
//! forwarded as a periodic aggregate, or kept at the edge.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::aggregator::{DeviceAggregator, DeviceSnapshot};
use crate::error::FogError;
use crate::models::ProcessedRecord;

/// Default aggregation window for normal records (seconds)
pub const DEFAULT_AGGREGATION_WINDOW_SECS: u64 = 5;

/// Default number of buffered samples before a periodic forward
pub const DEFAULT_MIN_SAMPLES_FOR_AGGREGATION: usize = 3;

/// Forwarding mode, fixed at service start
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForwardingMode {
    /// Critical and warning records immediately, normal records periodically
    #[default]
    Default,
    /// Every valid record
    SendAll,
    /// Critical records only
    CriticalOnly,
}

impl ForwardingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ForwardingMode::Default => "default",
            ForwardingMode::SendAll => "send_all",
            ForwardingMode::CriticalOnly => "critical_only",
        }
    }
}

impl fmt::Display for ForwardingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ForwardingMode {
    type Err = FogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "default" | "hybrid" => Ok(ForwardingMode::Default),
            "send_all" | "all" => Ok(ForwardingMode::SendAll),
            "critical_only" | "critical" => Ok(ForwardingMode::CriticalOnly),
            other => Err(FogError::Config(format!(
                "Unknown forwarding mode: {}. Valid modes: default, send_all, critical_only",
                other
            ))),
        }
    }
}

/// How a forwarding decision was reached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionKind {
    /// Forward this record now
    Immediate,
    /// Forward this record as the periodic aggregate for its device
    Aggregate,
    /// Keep the record at the edge
    Suppressed,
}

/// Outcome of the policy for one record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub kind: DecisionKind,
    pub reason: String,
}

impl Decision {
    fn immediate(reason: impl Into<String>) -> Self {
        Self {
            kind: DecisionKind::Immediate,
            reason: reason.into(),
        }
    }

    fn aggregate(reason: impl Into<String>) -> Self {
        Self {
            kind: DecisionKind::Aggregate,
            reason: reason.into(),
        }
    }

    fn suppressed(reason: impl Into<String>) -> Self {
        Self {
            kind: DecisionKind::Suppressed,
            reason: reason.into(),
        }
    }

    /// Rejected by the preprocessor
    pub fn invalid() -> Self {
        Self::suppressed("invalid record")
    }

    pub fn should_send(&self) -> bool {
        self.kind != DecisionKind::Suppressed
    }
}

/// Forwarding policy configuration and evaluation
#[derive(Debug, Clone)]
pub struct ForwardingPolicy {
    mode: ForwardingMode,
    aggregation_window: Duration,
    min_samples: usize,
}

impl ForwardingPolicy {
    pub fn new(mode: ForwardingMode, aggregation_window_secs: u64, min_samples: usize) -> Self {
        Self {
            mode,
            aggregation_window: Duration::seconds(aggregation_window_secs as i64),
            min_samples,
        }
    }

    pub fn mode(&self) -> ForwardingMode {
        self.mode
    }

    /// Pure evaluation against a device snapshot.
    ///
    /// Does not reserve the aggregation window; [`ForwardingPolicy::decide`]
    /// does that atomically through the aggregator.
    pub fn evaluate(
        &self,
        record: &ProcessedRecord,
        snapshot: &DeviceSnapshot,
        now: DateTime<Utc>,
    ) -> Decision {
        if self.mode == ForwardingMode::SendAll {
            return Decision::immediate("send_all mode");
        }

        let level = record.risk_level;
        if level.is_critical() {
            return Decision::immediate(format!("critical event: {}", level));
        }

        if self.mode == ForwardingMode::CriticalOnly {
            return Decision::suppressed("critical_only mode, non-critical event");
        }

        if level.is_warning() {
            return Decision::immediate(format!("warning event: {}", level));
        }

        let window_elapsed = snapshot
            .last_sent_at
            .map_or(true, |last| now - last >= self.aggregation_window);

        if window_elapsed && snapshot.history_len >= self.min_samples {
            Decision::aggregate(format!(
                "periodic aggregate ({} samples)",
                snapshot.history_len
            ))
        } else {
            Decision::suppressed("aggregating normal readings")
        }
    }

    /// Decide for a record that has already been recorded in `aggregator`.
    ///
    /// A positive normal-record decision claims the device's aggregation
    /// window, so it moves `last_sent_at` even if the publish later fails.
    pub async fn decide(
        &self,
        aggregator: &DeviceAggregator,
        record: &ProcessedRecord,
        now: DateTime<Utc>,
    ) -> Decision {
        let snapshot = aggregator
            .snapshot(&record.device_id)
            .await
            .unwrap_or_else(DeviceSnapshot::empty);

        let decision = self.evaluate(record, &snapshot, now);
        if decision.kind != DecisionKind::Aggregate {
            return decision;
        }

        // Another connection may have claimed the window in the meantime
        let claimed = aggregator
            .claim_aggregation_window(
                &record.device_id,
                now,
                self.aggregation_window,
                self.min_samples,
            )
            .await;

        if claimed {
            decision
        } else {
            Decision::suppressed("aggregating normal readings")
        }
    }
}

impl Default for ForwardingPolicy {
    fn default() -> Self {
        Self::new(
            ForwardingMode::Default,
            DEFAULT_AGGREGATION_WINDOW_SECS,
            DEFAULT_MIN_SAMPLES_FOR_AGGREGATION,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RiskLevel;

    const ALL_LEVELS: [RiskLevel; 5] = [
        RiskLevel::CriticalLow,
        RiskLevel::WarningLow,
        RiskLevel::Normal,
        RiskLevel::WarningHigh,
        RiskLevel::CriticalHigh,
    ];

    fn record(device_id: &str, level: RiskLevel) -> ProcessedRecord {
        ProcessedRecord {
            user_id: "user-1".into(),
            device_id: device_id.into(),
            timestamp: None,
            bpm: 72.0,
            signal_quality: None,
            risk_level: level,
            risk_score: level.score(),
            processed_at: Utc::now(),
            signal_quality_normalized: 1.0,
        }
    }

    fn policy(mode: ForwardingMode) -> ForwardingPolicy {
        ForwardingPolicy::new(mode, 5, 3)
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("send_all".parse::<ForwardingMode>().unwrap(), ForwardingMode::SendAll);
        assert_eq!(
            "critical-only".parse::<ForwardingMode>().unwrap(),
            ForwardingMode::CriticalOnly
        );
        assert_eq!("DEFAULT".parse::<ForwardingMode>().unwrap(), ForwardingMode::Default);
        assert!("everything".parse::<ForwardingMode>().is_err());
    }

    #[test]
    fn test_invalid_decision_never_sends() {
        assert!(!Decision::invalid().should_send());
    }

    #[test]
    fn test_send_all_sends_every_level() {
        let policy = policy(ForwardingMode::SendAll);
        let snapshot = DeviceSnapshot::empty();

        for level in ALL_LEVELS {
            let decision = policy.evaluate(&record("d1", level), &snapshot, Utc::now());
            assert!(decision.should_send(), "{level} should be sent");
        }
    }

    #[test]
    fn test_critical_only_mode() {
        let policy = policy(ForwardingMode::CriticalOnly);
        // Even a device ready for aggregation stays suppressed
        let snapshot = DeviceSnapshot {
            history_len: 10,
            ..DeviceSnapshot::empty()
        };
        let now = Utc::now();

        for level in ALL_LEVELS {
            let decision = policy.evaluate(&record("d1", level), &snapshot, now);
            assert_eq!(decision.should_send(), level.is_critical(), "{level}");
        }
    }

    #[test]
    fn test_default_mode_warnings_are_immediate() {
        let policy = policy(ForwardingMode::Default);
        let snapshot = DeviceSnapshot::empty();

        let decision = policy.evaluate(&record("d1", RiskLevel::WarningLow), &snapshot, Utc::now());
        assert_eq!(decision.kind, DecisionKind::Immediate);
        assert!(decision.reason.contains("warning_low"));
    }

    #[test]
    fn test_default_mode_normal_waits_for_window() {
        let policy = policy(ForwardingMode::Default);
        let now = Utc::now();
        let snapshot = DeviceSnapshot {
            history_len: 5,
            last_sent_at: Some(now - Duration::seconds(2)),
            ..DeviceSnapshot::empty()
        };

        let decision = policy.evaluate(&record("d1", RiskLevel::Normal), &snapshot, now);
        assert!(!decision.should_send());

        let later = now + Duration::seconds(3);
        let decision = policy.evaluate(&record("d1", RiskLevel::Normal), &snapshot, later);
        assert_eq!(decision.kind, DecisionKind::Aggregate);
    }

    #[tokio::test]
    async fn test_normal_records_aggregate_on_third_sample() {
        let aggregator = DeviceAggregator::default();
        let policy = policy(ForwardingMode::Default);
        let start = Utc::now();

        let mut sends = Vec::new();
        for i in 0..3 {
            let now = start + Duration::milliseconds(300 * i);
            let r = record("fresh", RiskLevel::Normal);
            aggregator.record("fresh", r.clone()).await;
            sends.push(policy.decide(&aggregator, &r, now).await.should_send());
        }
        assert_eq!(sends, vec![false, false, true]);

        // Everything inside the next window is held back
        for i in 1..5 {
            let now = start + Duration::milliseconds(600) + Duration::seconds(i);
            let r = record("fresh", RiskLevel::Normal);
            aggregator.record("fresh", r.clone()).await;
            assert!(!policy.decide(&aggregator, &r, now).await.should_send());
        }

        let now = start + Duration::milliseconds(600) + Duration::seconds(5);
        let r = record("fresh", RiskLevel::Normal);
        aggregator.record("fresh", r.clone()).await;
        assert!(policy.decide(&aggregator, &r, now).await.should_send());
    }

    #[tokio::test]
    async fn test_positive_aggregate_decision_moves_last_sent() {
        let aggregator = DeviceAggregator::default();
        let policy = policy(ForwardingMode::Default);
        let now = Utc::now();

        for _ in 0..3 {
            aggregator.record("d1", record("d1", RiskLevel::Normal)).await;
        }
        let decision = policy
            .decide(&aggregator, &record("d1", RiskLevel::Normal), now)
            .await;
        assert_eq!(decision.kind, DecisionKind::Aggregate);

        let snapshot = aggregator.snapshot("d1").await.unwrap();
        assert_eq!(snapshot.last_sent_at, Some(now));
        assert_eq!(snapshot.sent_count, 0);
    }

    #[tokio::test]
    async fn test_critical_bypasses_aggregation_window() {
        let aggregator = DeviceAggregator::default();
        let policy = policy(ForwardingMode::Default);
        let now = Utc::now();

        aggregator.record("d1", record("d1", RiskLevel::CriticalHigh)).await;
        aggregator.mark_sent_at("d1", now).await;

        let decision = policy
            .decide(&aggregator, &record("d1", RiskLevel::CriticalHigh), now)
            .await;
        assert_eq!(decision.kind, DecisionKind::Immediate);
    }
}
