//! BPM Fog Node
//!
//! Edge server that receives heart-rate telemetry from IoT devices,
//! filters and aggregates it locally, and forwards selected records to
//! the cloud broker.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use bpm_fog::aggregator::DeviceAggregator;
use bpm_fog::config::Settings;
use bpm_fog::connector::{CloudConnector, CloudPublisher};
use bpm_fog::handlers;
use bpm_fog::pipeline::FogPipeline;
use bpm_fog::policy::{ForwardingMode, ForwardingPolicy};
use bpm_fog::preprocessor::Preprocessor;
use bpm_fog::server::IngestionServer;

/// Command-line overrides on top of environment configuration
#[derive(Debug, Parser)]
#[command(name = "bpm-fog", version, about = "Fog node for BPM telemetry")]
struct Args {
    /// Port for incoming device connections
    #[arg(long)]
    port: Option<u16>,

    /// Cloud broker endpoint
    #[arg(long)]
    endpoint: Option<String>,

    /// Device certificate (PEM)
    #[arg(long)]
    cert: Option<PathBuf>,

    /// Device private key (PEM)
    #[arg(long)]
    key: Option<PathBuf>,

    /// Trusted root CA (PEM)
    #[arg(long)]
    root_ca: Option<PathBuf>,

    /// MQTT client identity
    #[arg(long)]
    thing_name: Option<String>,

    /// Process locally only, never connect to the cloud
    #[arg(long)]
    no_cloud: bool,

    /// Forward every valid record
    #[arg(long, conflicts_with = "critical_only")]
    send_all: bool,

    /// Forward critical records only
    #[arg(long)]
    critical_only: bool,
}

impl Args {
    fn apply(self, settings: &mut Settings) {
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(endpoint) = self.endpoint {
            settings.cloud.endpoint = endpoint;
        }
        if let Some(cert) = self.cert {
            settings.cloud.cert_path = cert;
        }
        if let Some(key) = self.key {
            settings.cloud.key_path = key;
        }
        if let Some(root_ca) = self.root_ca {
            settings.cloud.root_ca_path = root_ca;
        }
        if let Some(thing_name) = self.thing_name {
            settings.cloud.client_id = thing_name;
        }
        if self.no_cloud {
            settings.cloud.offline = true;
        }
        if self.send_all {
            settings.processing.mode = ForwardingMode::SendAll;
        } else if self.critical_only {
            settings.processing.mode = ForwardingMode::CriticalOnly;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env
    dotenv::dotenv().ok();

    // Logging
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,bpm_fog=debug"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();

    // Load configuration
    let mut settings = Settings::from_env().context("Failed to load configuration")?;
    Args::parse().apply(&mut settings);

    info!(
        port = settings.server.port,
        cloud = if settings.cloud.offline { "disabled" } else { "enabled" },
        mode = %settings.processing.mode,
        "Starting BPM fog node"
    );

    // Cloud uplink is optional: local filtering runs without it
    let connector = if settings.cloud.offline {
        None
    } else {
        let connector = Arc::new(CloudConnector::new(settings.cloud.clone()));
        match connector.connect().await {
            Ok(()) => Some(connector),
            Err(e) => {
                warn!(error = %e, "Continuing without cloud connection");
                None
            }
        }
    };

    let processing = &settings.processing;
    let aggregator = Arc::new(DeviceAggregator::new(processing.history_capacity));
    let pipeline = Arc::new(FogPipeline::new(
        Preprocessor::new(processing.thresholds),
        Arc::clone(&aggregator),
        ForwardingPolicy::new(
            processing.mode,
            processing.aggregation_window_secs,
            processing.min_samples_for_aggregation,
        ),
        connector
            .clone()
            .map(|c| c as Arc<dyn CloudPublisher>),
    ));

    // Binding the ingestion socket is the only fatal startup failure
    let server = IngestionServer::bind(&settings.bind_address(), Arc::clone(&pipeline))
        .await
        .context("Failed to start ingestion server")?;

    let status_server = if settings.status.enabled {
        let server = handlers::start(&settings.status_address(), Arc::clone(&pipeline))
            .context("Failed to start status API")?;
        let handle = server.handle();
        tokio::spawn(server);
        Some(handle)
    } else {
        None
    };

    let shutdown = CancellationToken::new();
    let server_task = tokio::spawn(server.run(shutdown.clone()));

    shutdown_signal().await;
    shutdown.cancel();

    if let Err(e) = server_task.await {
        warn!(error = %e, "Ingestion server task failed");
    }
    if let Some(handle) = status_server {
        handle.stop(true).await;
    }

    // Final per-device report
    let summary = aggregator.summary().await;
    info!(devices = summary.len(), "Final statistics");
    for (device_id, stats) in &summary {
        info!(
            device_id = %device_id,
            received = stats.received,
            sent_to_cloud = stats.sent_to_cloud,
            filtered = stats.filtered,
            avg_bpm = ?stats.avg_bpm,
            "Device summary"
        );
    }

    // Cloud goes last
    if let Some(connector) = connector {
        connector.disconnect().await;
    }

    info!("Fog node stopped");
    Ok(())
}

/// Wait for SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received SIGINT, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
    }
}
