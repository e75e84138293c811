//! Per-message fog pipeline
//!
//! preprocess → record → decide → build message → publish → mark_sent.
//! Every failure is contained to the message that caused it.

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::aggregator::DeviceAggregator;
use crate::connector::{CloudPublisher, ConnectionState};
use crate::error::FogError;
use crate::models::{CloudMessage, RawRecord};
use crate::policy::{Decision, ForwardingPolicy};
use crate::preprocessor::Preprocessor;

/// What happened to one input line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Blank line
    Skipped,
    /// Not a JSON record
    Malformed,
    /// Parsed but failed validation
    Invalid,
    /// Kept at the edge by the forwarding policy
    Filtered,
    /// Forward was attempted and failed, or no cloud is configured
    NotSent,
    /// Published to the cloud
    Sent,
}

/// Shared processing pipeline used by every device connection
pub struct FogPipeline {
    preprocessor: Preprocessor,
    aggregator: Arc<DeviceAggregator>,
    policy: ForwardingPolicy,
    cloud: Option<Arc<dyn CloudPublisher>>,
}

impl FogPipeline {
    pub fn new(
        preprocessor: Preprocessor,
        aggregator: Arc<DeviceAggregator>,
        policy: ForwardingPolicy,
        cloud: Option<Arc<dyn CloudPublisher>>,
    ) -> Self {
        Self {
            preprocessor,
            aggregator,
            policy,
            cloud,
        }
    }

    pub fn aggregator(&self) -> &Arc<DeviceAggregator> {
        &self.aggregator
    }

    pub fn policy(&self) -> &ForwardingPolicy {
        &self.policy
    }

    /// Cloud link state, `None` when running offline
    pub fn cloud_state(&self) -> Option<ConnectionState> {
        self.cloud.as_ref().map(|cloud| cloud.state())
    }

    /// Handle one line received from a device
    pub async fn handle_line(&self, line: &str) -> Outcome {
        let line = line.trim();
        if line.is_empty() {
            return Outcome::Skipped;
        }

        let raw: RawRecord = match serde_json::from_str(line) {
            Ok(raw) => raw,
            Err(e) => {
                let err = FogError::from(e);
                warn!(error = %err, "Dropping unparsable line");
                return Outcome::Malformed;
            }
        };

        self.handle_record(raw).await
    }

    /// Run a parsed record through the pipeline
    pub async fn handle_record(&self, raw: RawRecord) -> Outcome {
        let record = match self.preprocessor.process(raw) {
            Ok(record) => record,
            Err(invalid) => {
                let decision = Decision::invalid();
                info!(
                    device_id = %invalid.device_id,
                    reason = %invalid.reason,
                    decision = %decision.reason,
                    "Invalid record dropped"
                );
                return Outcome::Invalid;
            }
        };

        let device_id = record.device_id.clone();
        let snapshot = self.aggregator.record(&device_id, record.clone()).await;

        let decision = self.policy.decide(&self.aggregator, &record, Utc::now()).await;

        info!(
            device_id = %device_id,
            bpm = record.bpm,
            risk_level = %record.risk_level,
            send = decision.should_send(),
            reason = %decision.reason,
            "Record processed"
        );

        if !decision.should_send() {
            return Outcome::Filtered;
        }

        let Some(cloud) = &self.cloud else {
            debug!(device_id = %device_id, "Offline, forward skipped");
            return Outcome::NotSent;
        };

        let message = CloudMessage::new(&record, Some(snapshot.aggregated_stats()));
        match cloud.publish(&record.topic(), &message) {
            Ok(()) => {
                self.aggregator.mark_sent(&device_id).await;
                debug!(device_id = %device_id, topic = %record.topic(), "Forwarded to cloud");
                Outcome::Sent
            }
            Err(FogError::QueueFull) => {
                warn!(device_id = %device_id, "Cloud publish queue full, forward dropped");
                Outcome::NotSent
            }
            Err(e) => {
                warn!(device_id = %device_id, error = %e, "Cloud forward dropped");
                Outcome::NotSent
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::models::CloudMessage;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// In-memory publisher recording every accepted message
    #[derive(Default)]
    pub struct RecordingPublisher {
        pub connected: AtomicBool,
        pub published: Mutex<Vec<(String, CloudMessage)>>,
    }

    impl RecordingPublisher {
        pub fn connected() -> Self {
            let publisher = Self::default();
            publisher.connected.store(true, Ordering::SeqCst);
            publisher
        }

        pub fn count(&self) -> usize {
            self.published.lock().unwrap().len()
        }
    }

    impl CloudPublisher for RecordingPublisher {
        fn publish(&self, topic: &str, message: &CloudMessage) -> crate::error::FogResult<()> {
            if !self.connected.load(Ordering::SeqCst) {
                return Err(FogError::NotConnected);
            }
            self.published
                .lock()
                .unwrap()
                .push((topic.to_string(), message.clone()));
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        fn state(&self) -> ConnectionState {
            if self.is_connected() {
                ConnectionState::Connected
            } else {
                ConnectionState::Interrupted
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::RecordingPublisher;
    use super::*;
    use crate::policy::ForwardingMode;
    use std::sync::atomic::Ordering;

    fn pipeline(
        mode: ForwardingMode,
        cloud: Option<Arc<dyn CloudPublisher>>,
    ) -> FogPipeline {
        FogPipeline::new(
            Preprocessor::default(),
            Arc::new(DeviceAggregator::default()),
            ForwardingPolicy::new(mode, 5, 3),
            cloud,
        )
    }

    fn line(device_id: &str, bpm: u32) -> String {
        format!(
            r#"{{"user_id":"user-1","device_id":"{}","timestamp":"2024-05-01T10:00:00Z","bpm":{}}}"#,
            device_id, bpm
        )
    }

    #[tokio::test]
    async fn test_blank_and_malformed_lines() {
        let pipeline = pipeline(ForwardingMode::Default, None);

        assert_eq!(pipeline.handle_line("   ").await, Outcome::Skipped);
        assert_eq!(pipeline.handle_line("{bpm: 72").await, Outcome::Malformed);
        assert_eq!(pipeline.aggregator().device_count().await, 0);
    }

    #[tokio::test]
    async fn test_invalid_records_are_not_aggregated() {
        let pipeline = pipeline(ForwardingMode::SendAll, None);

        assert_eq!(pipeline.handle_line(&line("d1", 301)).await, Outcome::Invalid);
        assert_eq!(
            pipeline
                .handle_line(r#"{"device_id":"d1","bpm":"high"}"#)
                .await,
            Outcome::Invalid
        );
        assert!(pipeline.aggregator().snapshot("d1").await.is_none());
    }

    #[tokio::test]
    async fn test_successful_publish_marks_sent() {
        let publisher = Arc::new(RecordingPublisher::connected());
        let pipeline = pipeline(ForwardingMode::Default, Some(publisher.clone()));

        assert_eq!(pipeline.handle_line(&line("d1", 160)).await, Outcome::Sent);
        assert_eq!(pipeline.handle_line(&line("d1", 45)).await, Outcome::Sent);

        let snapshot = pipeline.aggregator().snapshot("d1").await.unwrap();
        assert_eq!(snapshot.sent_count, 2);
        assert_eq!(snapshot.received_count, 2);

        let published = publisher.published.lock().unwrap();
        assert_eq!(published[0].0, "bpm/user-1/d1/measurements");
        assert_eq!(published[0].1.risk_score, 10);
        let stats = published[1].1.aggregated_stats.as_ref().unwrap();
        assert_eq!(stats.samples_received, 2);
        assert_eq!(stats.min_bpm, Some(45.0));
        assert_eq!(stats.max_bpm, Some(160.0));
    }

    #[tokio::test]
    async fn test_failed_publish_is_not_counted() {
        let publisher = Arc::new(RecordingPublisher::default());
        let pipeline = pipeline(ForwardingMode::SendAll, Some(publisher.clone()));

        assert_eq!(pipeline.handle_line(&line("d1", 72)).await, Outcome::NotSent);
        assert_eq!(pipeline.aggregator().snapshot("d1").await.unwrap().sent_count, 0);

        // A later record goes through once the link is back
        publisher.connected.store(true, Ordering::SeqCst);
        assert_eq!(pipeline.handle_line(&line("d1", 73)).await, Outcome::Sent);
        assert_eq!(pipeline.aggregator().snapshot("d1").await.unwrap().sent_count, 1);
    }

    #[tokio::test]
    async fn test_offline_mode_still_filters() {
        let pipeline = pipeline(ForwardingMode::Default, None);

        assert_eq!(pipeline.handle_line(&line("d1", 72)).await, Outcome::Filtered);
        assert_eq!(pipeline.handle_line(&line("d1", 160)).await, Outcome::NotSent);

        let snapshot = pipeline.aggregator().snapshot("d1").await.unwrap();
        assert_eq!(snapshot.received_count, 2);
        assert_eq!(snapshot.sent_count, 0);
        assert!(pipeline.cloud_state().is_none());
    }

    #[tokio::test]
    async fn test_normal_stream_is_reduced() {
        let publisher = Arc::new(RecordingPublisher::connected());
        let pipeline = pipeline(ForwardingMode::Default, Some(publisher.clone()));

        let mut outcomes = Vec::new();
        for bpm in [70, 72, 74, 75, 73, 71] {
            outcomes.push(pipeline.handle_line(&line("d1", bpm)).await);
        }

        assert_eq!(
            outcomes,
            vec![
                Outcome::Filtered,
                Outcome::Filtered,
                Outcome::Sent,
                Outcome::Filtered,
                Outcome::Filtered,
                Outcome::Filtered,
            ]
        );
        assert_eq!(publisher.count(), 1);

        let summary = pipeline.aggregator().summary().await;
        assert_eq!(summary["d1"].received, 6);
        assert_eq!(summary["d1"].sent_to_cloud, 1);
        assert_eq!(summary["d1"].filtered, 5);
    }
}
