//! Simulated BPM devices
//!
//! Streams realistic heart-rate records to a fog node over TCP, one
//! connection per simulated device. Used for local demos and load tests;
//! real deployments feed the node from device relays instead.
//!
//! The generated signal follows a slow circadian-style drift around a
//! resting rate with Gaussian noise, plus occasional brady/tachycardia
//! episodes so every risk tier shows up. Rare sensor glitches produce
//! out-of-range readings that the node must reject.

use chrono::Utc;
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde_json::json;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Probability that a tick starts an abnormal episode
const EPISODE_PROBABILITY: f64 = 0.02;
/// Ticks an abnormal episode lasts
const EPISODE_TICKS: u32 = 5;
/// Probability that a tick emits an out-of-range glitch reading
const GLITCH_PROBABILITY: f64 = 0.005;

/// One simulated wearable
pub struct SimulatedDevice {
    pub user_id: String,
    pub device_id: String,
    /// Resting heart rate the signal drifts around
    base_bpm: f64,
    drift_factor: f64,
    /// Remaining ticks and target offset of an ongoing episode
    episode: Option<(u32, f64)>,
}

impl SimulatedDevice {
    pub fn new(user_id: impl Into<String>, device_id: impl Into<String>, base_bpm: f64) -> Self {
        Self {
            user_id: user_id.into(),
            device_id: device_id.into(),
            base_bpm,
            drift_factor: 0.0,
            episode: None,
        }
    }

    /// Produce the next BPM sample
    pub fn next_bpm<R: Rng>(&mut self, rng: &mut R, noise: &Normal<f64>) -> u32 {
        self.drift_factor += 0.05;
        if self.drift_factor > std::f64::consts::PI * 2.0 {
            self.drift_factor = 0.0;
        }

        if rng.gen::<f64>() < GLITCH_PROBABILITY {
            return rng.gen_range(301..=400);
        }

        if self.episode.is_none() && rng.gen::<f64>() < EPISODE_PROBABILITY {
            // Tachycardia twice as often as bradycardia
            let offset = if rng.gen_bool(2.0 / 3.0) {
                rng.gen_range(40.0..110.0)
            } else {
                -rng.gen_range(25.0..45.0)
            };
            self.episode = Some((EPISODE_TICKS, offset));
        }

        let episode_offset = match self.episode.as_mut() {
            Some((remaining, offset)) => {
                *remaining -= 1;
                let value = *offset;
                if *remaining == 0 {
                    self.episode = None;
                }
                value
            }
            None => 0.0,
        };

        let circadian = self.drift_factor.sin() * 8.0;
        let bpm = self.base_bpm + circadian + noise.sample(rng) + episode_offset;
        bpm.round().clamp(25.0, 230.0) as u32
    }

    /// Produce the next newline-terminated JSON record
    pub fn next_line<R: Rng>(&mut self, rng: &mut R, noise: &Normal<f64>) -> String {
        let bpm = self.next_bpm(rng, noise);
        let signal_quality: u32 = rng.gen_range(70..=100);

        let record = json!({
            "user_id": self.user_id,
            "device_id": self.device_id,
            "timestamp": Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            "bpm": bpm,
            "signal_quality": signal_quality,
        });
        format!("{}\n", record)
    }
}

/// Stream records for one device until cancelled or the node goes away
pub async fn run_device(
    mut device: SimulatedDevice,
    address: String,
    interval_ms: u64,
    cancel: CancellationToken,
) -> std::io::Result<u64> {
    let mut stream = TcpStream::connect(&address).await?;
    info!(device_id = %device.device_id, address = %address, "Simulated device connected");

    let mut tick_interval = interval(Duration::from_millis(interval_ms.max(1)));
    let noise = Normal::new(0.0, 3.0).map_err(|e| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string())
    })?;
    let mut sent: u64 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick_interval.tick() => {}
        }

        // ThreadRng is not Send, keep it out of the await below
        let line = {
            let mut rng = rand::thread_rng();
            device.next_line(&mut rng, &noise)
        };

        if let Err(e) = stream.write_all(line.as_bytes()).await {
            warn!(device_id = %device.device_id, error = %e, "Fog node connection lost");
            return Err(e);
        }
        sent += 1;
        debug!(device_id = %device.device_id, sent, "Record sent");
    }

    let _ = stream.shutdown().await;
    info!(device_id = %device.device_id, sent, "Simulated device stopped");
    Ok(sent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tokio::io::AsyncBufReadExt;
    use tokio::net::TcpListener;

    #[test]
    fn test_bpm_stays_in_bounds_except_glitches() {
        let mut rng = StdRng::seed_from_u64(7);
        let noise = Normal::new(0.0, 3.0).unwrap();
        let mut device = SimulatedDevice::new("u1", "d1", 70.0);
        let mut glitches = 0;

        for _ in 0..5_000 {
            let bpm = device.next_bpm(&mut rng, &noise);
            if bpm > 300 {
                assert!(bpm <= 400);
                glitches += 1;
            } else {
                assert!((25..=230).contains(&bpm));
            }
        }
        assert!(glitches > 0);
        assert!(glitches < 100);
    }

    #[test]
    fn test_line_is_a_device_record() {
        let mut rng = StdRng::seed_from_u64(1);
        let noise = Normal::new(0.0, 3.0).unwrap();
        let mut device = SimulatedDevice::new("user-1", "bpm-device-001", 70.0);

        let line = device.next_line(&mut rng, &noise);
        assert!(line.ends_with('\n'));

        let value: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(value["device_id"], "bpm-device-001");
        assert_eq!(value["user_id"], "user-1");
        assert!(value["bpm"].is_u64());
        assert!(value["signal_quality"].as_u64().unwrap() <= 100);
    }

    #[tokio::test]
    async fn test_run_device_streams_lines() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let cancel = CancellationToken::new();

        let device = SimulatedDevice::new("u1", "d1", 70.0);
        let handle = tokio::spawn(run_device(device, address, 10, cancel.clone()));

        let (socket, _) = listener.accept().await.unwrap();
        let mut lines = tokio::io::BufReader::new(socket).lines();
        for _ in 0..3 {
            let line = lines.next_line().await.unwrap().unwrap();
            assert!(line.contains("\"device_id\":\"d1\""));
        }

        cancel.cancel();
        let sent = handle.await.unwrap().unwrap();
        assert!(sent >= 3);
    }
}
