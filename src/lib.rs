//! BPM Fog Node
//!
//! Edge service for heart-rate telemetry. Devices stream newline-delimited
//! JSON records over TCP; the node validates and classifies each reading,
//! keeps bounded per-device statistics, and forwards only what the cloud
//! needs: critical and warning events immediately, normal readings as
//! periodic aggregates.

pub mod aggregator;
pub mod classifier;
pub mod config;
pub mod connector;
pub mod error;
pub mod handlers;
pub mod models;
pub mod pipeline;
pub mod policy;
pub mod preprocessor;
pub mod server;
pub mod simulator;
