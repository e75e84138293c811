//! Simulated device fleet for a BPM fog node.

use clap::Parser;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use bpm_fog::simulator::{run_device, SimulatedDevice};

#[derive(Debug, Parser)]
#[command(name = "device-simulator", version, about = "Stream synthetic BPM records to a fog node")]
struct Args {
    /// Fog node host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Fog node ingestion port
    #[arg(long, default_value_t = 25000)]
    port: u16,

    /// Number of simulated devices (one connection each)
    #[arg(long, default_value_t = 3)]
    devices: usize,

    /// Milliseconds between records per device
    #[arg(long, default_value_t = 1000)]
    interval_ms: u64,

    /// User id attached to every record
    #[arg(long, default_value = "sim-user")]
    user_id: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer())
        .init();

    let args = Args::parse();
    let address = format!("{}:{}", args.host, args.port);
    let cancel = CancellationToken::new();

    info!(devices = args.devices, address = %address, "Starting device simulator");

    let mut tasks = JoinSet::new();
    for n in 0..args.devices {
        // Spread resting rates so devices do not move in lockstep
        let base_bpm = 62.0 + (n % 5) as f64 * 4.0;
        let device = SimulatedDevice::new(
            args.user_id.clone(),
            format!("bpm-sim-{:03}", n + 1),
            base_bpm,
        );
        tasks.spawn(run_device(device, address.clone(), args.interval_ms, cancel.clone()));
    }

    let mut total = 0;
    let mut interrupted = std::pin::pin!(tokio::signal::ctrl_c());
    loop {
        tokio::select! {
            _ = &mut interrupted, if !cancel.is_cancelled() => {
                info!("Stopping simulated devices");
                cancel.cancel();
            }
            result = tasks.join_next() => match result {
                Some(Ok(Ok(sent))) => total += sent,
                Some(Ok(Err(e))) => warn!(error = %e, "Simulated device failed"),
                Some(Err(e)) => warn!(error = %e, "Simulated device task panicked"),
                None => break,
            },
        }
    }

    info!(total_records = total, "Device simulator finished");
    Ok(())
}
