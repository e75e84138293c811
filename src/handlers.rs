//! Operational status API
//!
//! Read-only HTTP endpoints exposing node health and live per-device
//! counters. Off by default; enabled with `STATUS_API_ENABLED=true`.

use actix_web::{web, HttpResponse};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::info;

use crate::error::FogError;
use crate::models::HealthCheck;
use crate::pipeline::FogPipeline;

/// State shared with every status request
pub struct StatusState {
    pub pipeline: Arc<FogPipeline>,
    pub started_at: DateTime<Utc>,
}

impl StatusState {
    pub fn new(pipeline: Arc<FogPipeline>) -> Self {
        Self {
            pipeline,
            started_at: Utc::now(),
        }
    }
}

/// Configure all status routes
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api")
            .route("/health", web::get().to(health_check))
            .route("/devices", web::get().to(list_devices))
            .route("/devices/{device_id}", web::get().to(get_device)),
    );
}

/// Health check endpoint
///
/// GET /api/health
pub async fn health_check(state: web::Data<StatusState>) -> Result<HttpResponse, FogError> {
    let pipeline = &state.pipeline;

    let cloud = pipeline
        .cloud_state()
        .map(|s| s.as_str())
        .unwrap_or("offline");

    let health = HealthCheck {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now(),
        uptime_seconds: (Utc::now() - state.started_at).num_seconds().max(0) as u64,
        forwarding_mode: pipeline.policy().mode().to_string(),
        cloud: cloud.to_string(),
        devices: pipeline.aggregator().device_count().await,
    };

    Ok(HttpResponse::Ok().json(health))
}

/// Per-device summary
///
/// GET /api/devices
pub async fn list_devices(state: web::Data<StatusState>) -> Result<HttpResponse, FogError> {
    let summary = state.pipeline.aggregator().summary().await;
    Ok(HttpResponse::Ok().json(summary))
}

/// Snapshot of one device
///
/// GET /api/devices/{device_id}
pub async fn get_device(
    state: web::Data<StatusState>,
    path: web::Path<String>,
) -> Result<HttpResponse, FogError> {
    let device_id = path.into_inner();

    let snapshot = state
        .pipeline
        .aggregator()
        .snapshot(&device_id)
        .await
        .ok_or_else(|| FogError::NotFound(format!("Unknown device: {}", device_id)))?;

    Ok(HttpResponse::Ok().json(snapshot))
}

/// Run the status API until the returned server handle is stopped
pub fn start(
    address: &str,
    pipeline: Arc<FogPipeline>,
) -> std::io::Result<actix_web::dev::Server> {
    let state = web::Data::new(StatusState::new(pipeline));

    info!(address = %address, "Starting status API");

    let server = actix_web::HttpServer::new(move || {
        actix_web::App::new()
            .app_data(state.clone())
            .wrap(tracing_actix_web::TracingLogger::default())
            .configure(configure_routes)
    })
    .workers(1)
    .disable_signals()
    .bind(address)?
    .run();

    Ok(server)
}
