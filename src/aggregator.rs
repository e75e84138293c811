//! Per-device aggregation state
//!
//! Holds a bounded history and running statistics for every device seen by
//! the fog node. Each device entry sits behind its own mutex so concurrent
//! connections only contend when they report for the same device.

use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::models::{round1, AggregatedStats, DeviceSummary, ProcessedRecord};

/// Default number of records kept per device
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

/// State for one device
#[derive(Debug)]
pub struct DeviceState {
    /// Circular buffer of the most recent records
    history: VecDeque<ProcessedRecord>,
    capacity: usize,
    received_count: u64,
    sent_count: u64,
    last_sent_at: Option<DateTime<Utc>>,
    min_bpm: Option<f64>,
    max_bpm: Option<f64>,
    avg_bpm: Option<f64>,
}

impl DeviceState {
    fn new(capacity: usize) -> Self {
        Self {
            history: VecDeque::with_capacity(capacity),
            capacity,
            received_count: 0,
            sent_count: 0,
            last_sent_at: None,
            min_bpm: None,
            max_bpm: None,
            avg_bpm: None,
        }
    }

    fn push(&mut self, record: ProcessedRecord) {
        self.received_count += 1;

        // Remove oldest record if at capacity
        if self.history.len() >= self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(record);

        self.recompute_stats();
    }

    /// min/max/avg are windowed over `history`, counters are lifetime
    fn recompute_stats(&mut self) {
        if self.history.is_empty() {
            self.min_bpm = None;
            self.max_bpm = None;
            self.avg_bpm = None;
            return;
        }

        let (sum, min, max) = self.history.iter().fold(
            (0.0, f64::MAX, f64::MIN),
            |(sum, min, max), r| (sum + r.bpm, min.min(r.bpm), max.max(r.bpm)),
        );

        self.min_bpm = Some(min);
        self.max_bpm = Some(max);
        self.avg_bpm = Some(sum / self.history.len() as f64);
    }

    fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            avg_bpm: self.avg_bpm,
            min_bpm: self.min_bpm,
            max_bpm: self.max_bpm,
            received_count: self.received_count,
            sent_count: self.sent_count,
            last_sent_at: self.last_sent_at,
            history_len: self.history.len(),
        }
    }

    fn window_elapsed(&self, now: DateTime<Utc>, window: Duration) -> bool {
        match self.last_sent_at {
            Some(last) => now - last >= window,
            None => true,
        }
    }
}

/// Read-only view of one device's state
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct DeviceSnapshot {
    pub avg_bpm: Option<f64>,
    pub min_bpm: Option<f64>,
    pub max_bpm: Option<f64>,
    pub received_count: u64,
    pub sent_count: u64,
    pub last_sent_at: Option<DateTime<Utc>>,
    pub history_len: usize,
}

impl DeviceSnapshot {
    /// View of a device that has not reported yet
    pub fn empty() -> Self {
        Self {
            avg_bpm: None,
            min_bpm: None,
            max_bpm: None,
            received_count: 0,
            sent_count: 0,
            last_sent_at: None,
            history_len: 0,
        }
    }

    /// Statistics block attached to outgoing cloud messages
    pub fn aggregated_stats(&self) -> AggregatedStats {
        AggregatedStats {
            avg_bpm: self.avg_bpm.map(round1),
            min_bpm: self.min_bpm,
            max_bpm: self.max_bpm,
            samples_received: self.received_count,
        }
    }

    pub fn summary(&self) -> DeviceSummary {
        DeviceSummary {
            received: self.received_count,
            sent_to_cloud: self.sent_count,
            filtered: self.received_count.saturating_sub(self.sent_count),
            avg_bpm: self.avg_bpm.map(round1),
        }
    }
}

/// Shared per-device aggregation state
#[derive(Debug)]
pub struct DeviceAggregator {
    devices: RwLock<HashMap<String, Arc<Mutex<DeviceState>>>>,
    capacity: usize,
}

impl DeviceAggregator {
    pub fn new(capacity: usize) -> Self {
        info!(history_capacity = capacity, "Initializing device aggregator");
        Self {
            devices: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Fetch the entry for a device, creating it on first reference
    async fn entry(&self, device_id: &str) -> Arc<Mutex<DeviceState>> {
        if let Some(entry) = self.devices.read().await.get(device_id) {
            return Arc::clone(entry);
        }

        let mut devices = self.devices.write().await;
        let entry = devices.entry(device_id.to_string()).or_insert_with(|| {
            info!(device_id = %device_id, "New device registered");
            Arc::new(Mutex::new(DeviceState::new(self.capacity)))
        });
        Arc::clone(entry)
    }

    async fn existing(&self, device_id: &str) -> Option<Arc<Mutex<DeviceState>>> {
        self.devices.read().await.get(device_id).cloned()
    }

    /// Append a processed record to the device history
    pub async fn record(&self, device_id: &str, record: ProcessedRecord) -> DeviceSnapshot {
        let entry = self.entry(device_id).await;
        let mut state = entry.lock().await;
        state.push(record);

        debug!(
            device_id = %device_id,
            received = state.received_count,
            history = state.history.len(),
            "Record aggregated"
        );

        state.snapshot()
    }

    /// Read-only view of a device, `None` if it has never reported
    pub async fn snapshot(&self, device_id: &str) -> Option<DeviceSnapshot> {
        let entry = self.existing(device_id).await?;
        let state = entry.lock().await;
        Some(state.snapshot())
    }

    /// Count a successful forward for the device
    pub async fn mark_sent(&self, device_id: &str) {
        self.mark_sent_at(device_id, Utc::now()).await;
    }

    pub async fn mark_sent_at(&self, device_id: &str, now: DateTime<Utc>) {
        let entry = self.entry(device_id).await;
        let mut state = entry.lock().await;
        // A device can never have sent more than it received
        if state.sent_count < state.received_count {
            state.sent_count += 1;
        }
        state.last_sent_at = Some(now);
    }

    /// Claim the periodic aggregation slot for a device.
    ///
    /// Succeeds when the aggregation window has elapsed since the last
    /// forward and enough samples are buffered; on success `last_sent_at`
    /// moves to `now` so concurrent callers cannot claim the same window.
    pub async fn claim_aggregation_window(
        &self,
        device_id: &str,
        now: DateTime<Utc>,
        window: Duration,
        min_samples: usize,
    ) -> bool {
        let Some(entry) = self.existing(device_id).await else {
            return false;
        };
        let mut state = entry.lock().await;

        if state.window_elapsed(now, window) && state.history.len() >= min_samples {
            state.last_sent_at = Some(now);
            true
        } else {
            false
        }
    }

    /// Number of devices seen so far
    pub async fn device_count(&self) -> usize {
        self.devices.read().await.len()
    }

    /// Per-device totals, ordered by device id
    pub async fn summary(&self) -> BTreeMap<String, DeviceSummary> {
        let entries: Vec<(String, Arc<Mutex<DeviceState>>)> = self
            .devices
            .read()
            .await
            .iter()
            .map(|(id, entry)| (id.clone(), Arc::clone(entry)))
            .collect();

        let mut summary = BTreeMap::new();
        for (device_id, entry) in entries {
            let state = entry.lock().await;
            summary.insert(device_id, state.snapshot().summary());
        }
        summary
    }
}

impl Default for DeviceAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}
