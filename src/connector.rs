//! Cloud connector
//!
//! Owns the MQTT connection to the cloud broker. The transport event loop
//! runs in its own task and flips an atomic connection state on connect,
//! interrupt and resume; `publish` only reads that state, so device
//! handlers never wait on connectivity.
//!
//! Delivery is at-most-once: a failed publish is reported to the caller
//! and dropped, never retried here.

use rumqttc::{
    AsyncClient, ClientError, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    TlsConfiguration, Transport,
};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::CloudSettings;
use crate::error::{FogError, FogResult};
use crate::models::CloudMessage;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const KEEP_ALIVE: Duration = Duration::from_secs(60);
/// Pause between transport reconnect attempts after an interruption
const RECONNECT_DELAY: Duration = Duration::from_secs(1);
/// Outgoing publishes buffered ahead of the transport before drops start
const REQUEST_CHANNEL_CAPACITY: usize = 1024;

/// Anything the pipeline can forward cloud messages to
pub trait CloudPublisher: Send + Sync {
    /// Publish one message. Fails immediately when not connected.
    fn publish(&self, topic: &str, message: &CloudMessage) -> FogResult<()>;

    fn is_connected(&self) -> bool;

    fn state(&self) -> ConnectionState;
}

/// Connector lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Interrupted = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Interrupted,
            _ => ConnectionState::Disconnected,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Interrupted => "interrupted",
        }
    }
}

/// Atomic connection state shared by publishers and the transport task
#[derive(Debug)]
pub struct ConnectionStatus(AtomicU8);

impl ConnectionStatus {
    pub fn new() -> Self {
        Self(AtomicU8::new(ConnectionState::Disconnected as u8))
    }

    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn is_connected(&self) -> bool {
        self.get() == ConnectionState::Connected
    }

    fn set(&self, state: ConnectionState) {
        self.0.store(state as u8, Ordering::Release);
    }

    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Connected → Interrupted, driven by the transport
    pub fn on_interrupted(&self) -> bool {
        self.transition(ConnectionState::Connected, ConnectionState::Interrupted)
    }

    /// Interrupted → Connected, driven by the transport
    pub fn on_resumed(&self) -> bool {
        self.transition(ConnectionState::Interrupted, ConnectionState::Connected)
    }
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// MQTT connector for the cloud broker (mutual TLS, QoS 0)
pub struct CloudConnector {
    settings: CloudSettings,
    status: Arc<ConnectionStatus>,
    client: OnceLock<AsyncClient>,
    cancel: CancellationToken,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl CloudConnector {
    pub fn new(settings: CloudSettings) -> Self {
        Self {
            settings,
            status: Arc::new(ConnectionStatus::new()),
            client: OnceLock::new(),
            cancel: CancellationToken::new(),
            event_loop: Mutex::new(None),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.settings.endpoint
    }

    /// Single connection attempt bounded by a 10 second timeout.
    ///
    /// A failed attempt leaves the connector disconnected and may be retried.
    pub async fn connect(&self) -> FogResult<()> {
        if self.client.get().is_some() {
            return Err(FogError::Connect("connector already started".to_string()));
        }

        info!(
            endpoint = %self.settings.endpoint,
            client_id = %self.settings.client_id,
            "Connecting to cloud broker"
        );
        self.status.set(ConnectionState::Connecting);

        let options = match self.mqtt_options().await {
            Ok(options) => options,
            Err(e) => {
                self.status.set(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);
        let (ready_tx, ready_rx) = oneshot::channel();

        // Per-attempt token: a failed attempt stops only its own transport
        let attempt = self.cancel.child_token();
        let handle = tokio::spawn(run_event_loop(
            eventloop,
            Arc::clone(&self.status),
            attempt.clone(),
            ready_tx,
        ));

        let outcome = match tokio::time::timeout(CONNECT_TIMEOUT, ready_rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(reason))) => Err(FogError::Connect(reason)),
            Ok(Err(_)) => Err(FogError::Connect("transport task ended".to_string())),
            Err(_) => Err(FogError::Connect(format!(
                "timed out after {}s",
                CONNECT_TIMEOUT.as_secs()
            ))),
        };

        match outcome {
            Ok(()) => {
                // Connected was already published by the event loop
                let _ = self.client.set(client);
                self.store_handle(handle);
                info!(endpoint = %self.settings.endpoint, "Connected to cloud broker");
                Ok(())
            }
            Err(e) => {
                attempt.cancel();
                handle.abort();
                self.status.set(ConnectionState::Disconnected);
                error!(error = %e, "Cloud connection failed");
                Err(e)
            }
        }
    }

    async fn mqtt_options(&self) -> FogResult<MqttOptions> {
        let read = |path: std::path::PathBuf| async move {
            tokio::fs::read(&path).await.map_err(|e| {
                FogError::Connect(format!("cannot read {}: {}", path.display(), e))
            })
        };

        let ca = read(self.settings.root_ca_path.clone()).await?;
        let cert = read(self.settings.cert_path.clone()).await?;
        let key = read(self.settings.key_path.clone()).await?;

        let mut options = MqttOptions::new(
            self.settings.client_id.clone(),
            self.settings.endpoint.clone(),
            self.settings.port,
        );
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_session(true);
        options.set_transport(Transport::tls_with_config(TlsConfiguration::Simple {
            ca,
            alpn: None,
            client_auth: Some((cert, key)),
        }));

        Ok(options)
    }

    fn store_handle(&self, handle: JoinHandle<()>) {
        match self.event_loop.lock() {
            Ok(mut slot) => *slot = Some(handle),
            Err(poisoned) => *poisoned.into_inner() = Some(handle),
        }
    }

    fn take_handle(&self) -> Option<JoinHandle<()>> {
        match self.event_loop.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    /// Close the connection, bounded by a 5 second timeout
    pub async fn disconnect(&self) {
        let was = self.status.get();
        self.status.set(ConnectionState::Disconnected);

        if let Some(client) = self.client.get() {
            match tokio::time::timeout(DISCONNECT_TIMEOUT, client.disconnect()).await {
                Ok(Ok(())) => debug!("Disconnect requested"),
                Ok(Err(e)) => warn!(error = %e, "Cloud disconnect request failed"),
                Err(_) => warn!("Cloud disconnect request timed out"),
            }
        }

        if let Some(mut handle) = self.take_handle() {
            if tokio::time::timeout(DISCONNECT_TIMEOUT, &mut handle).await.is_err() {
                handle.abort();
            }
        }
        self.cancel.cancel();

        if was != ConnectionState::Disconnected {
            info!(endpoint = %self.settings.endpoint, "Disconnected from cloud broker");
        }
    }
}

impl CloudPublisher for CloudConnector {
    fn publish(&self, topic: &str, message: &CloudMessage) -> FogResult<()> {
        if !self.status.is_connected() {
            return Err(FogError::NotConnected);
        }
        let client = self.client.get().ok_or(FogError::NotConnected)?;

        let payload =
            serde_json::to_vec(message).map_err(|e| FogError::Publish(e.to_string()))?;

        client
            .try_publish(topic, QoS::AtMostOnce, false, payload)
            .map_err(|e| match e {
                ClientError::TryRequest(_) => FogError::QueueFull,
                other => FogError::Publish(other.to_string()),
            })
    }

    fn is_connected(&self) -> bool {
        self.status.is_connected()
    }

    fn state(&self) -> ConnectionState {
        self.status.get()
    }
}

/// Drive the MQTT transport until cancelled or cleanly disconnected.
///
/// The first CONNACK (or first error) answers `ready`; afterwards errors
/// mark the connection interrupted and the next successful CONNACK
/// resumes it.
async fn run_event_loop(
    mut eventloop: EventLoop,
    status: Arc<ConnectionStatus>,
    cancel: CancellationToken,
    ready: oneshot::Sender<Result<(), String>>,
) {
    let mut ready = Some(ready);

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code != ConnectReturnCode::Success {
                    let reason = format!("broker refused connection: {:?}", ack.code);
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(Err(reason));
                        break;
                    }
                    warn!(reason = %reason, "Cloud reconnect refused");
                    continue;
                }

                if let Some(tx) = ready.take() {
                    status.set(ConnectionState::Connected);
                    let _ = tx.send(Ok(()));
                } else if status.on_resumed() {
                    info!(session_present = ack.session_present, "Cloud connection resumed");
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("Disconnect sent to cloud broker");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                if let Some(tx) = ready.take() {
                    let _ = tx.send(Err(e.to_string()));
                    break;
                }

                if status.on_interrupted() {
                    warn!(error = %e, "Cloud connection interrupted");
                }
                if status.get() == ConnectionState::Disconnected {
                    break;
                }

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                }
            }
        }
    }

    debug!("Cloud transport task stopped");
}
