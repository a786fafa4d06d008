//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Chain connection status and head heights
//! - Commit ticks, coordinator state and submissions
//! - Integrity failures

use crate::error::{BridgeError, BridgeResult};

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

lazy_static! {
    // Chain metrics
    pub static ref CHAIN_CONNECTED: GaugeVec = register_gauge_vec!(
        "bridge_validator_chain_connected",
        "Chain connection status (1=connected, 0=disconnected)",
        &["chain_id"]
    ).unwrap();

    pub static ref CHAIN_BLOCK_HEIGHT: GaugeVec = register_gauge_vec!(
        "bridge_validator_chain_block_height",
        "Current head block per chain",
        &["chain_id"]
    ).unwrap();

    // Coordinator metrics
    pub static ref TICKS: CounterVec = register_counter_vec!(
        "bridge_validator_ticks_total",
        "Commit ticks by outcome",
        &["outcome"]
    ).unwrap();

    pub static ref TICK_LATENCY: HistogramVec = register_histogram_vec!(
        "bridge_validator_tick_latency_seconds",
        "Wall-clock duration of one commit tick",
        &["outcome"],
        vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]
    ).unwrap();

    pub static ref COORDINATOR_STATE: GaugeVec = register_gauge_vec!(
        "bridge_validator_state",
        "Current commit state (1 for the active state)",
        &["state"]
    ).unwrap();

    pub static ref SUBMISSIONS: CounterVec = register_counter_vec!(
        "bridge_validator_submissions_total",
        "Transactions submitted by chain and action",
        &["chain_id", "action"]
    ).unwrap();

    pub static ref INTEGRITY_FAILURES: CounterVec = register_counter_vec!(
        "bridge_validator_integrity_failures_total",
        "Cycles aborted on data-integrity errors",
        &["kind"]
    ).unwrap();

    pub static ref SNAPSHOTS_PERSISTED: CounterVec = register_counter_vec!(
        "bridge_validator_snapshots_persisted_total",
        "Snapshots persisted after both chains confirmed the new root",
        &[]
    ).unwrap();
}

/// Liveness data served on `/health`
#[derive(Debug, Default)]
pub struct HealthState {
    chains: DashMap<u64, bool>,
    last_tick: RwLock<Option<(DateTime<Utc>, String)>>,
}

#[derive(Debug, Serialize)]
struct HealthReport {
    healthy: bool,
    chains: Vec<ChainHealth>,
    last_tick_at: Option<DateTime<Utc>>,
    last_tick_outcome: Option<String>,
}

#[derive(Debug, Serialize)]
struct ChainHealth {
    chain_id: u64,
    healthy: bool,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_chain(&self, chain_id: u64, healthy: bool) {
        self.chains.insert(chain_id, healthy);
    }

    pub async fn set_tick(&self, outcome: &str) {
        *self.last_tick.write().await = Some((Utc::now(), outcome.to_string()));
    }

    async fn report(&self) -> HealthReport {
        let mut chains: Vec<ChainHealth> = self
            .chains
            .iter()
            .map(|e| ChainHealth {
                chain_id: *e.key(),
                healthy: *e.value(),
            })
            .collect();
        chains.sort_by_key(|c| c.chain_id);

        let last_tick = self.last_tick.read().await.clone();
        HealthReport {
            healthy: chains.iter().all(|c| c.healthy),
            chains,
            last_tick_at: last_tick.as_ref().map(|(at, _)| *at),
            last_tick_outcome: last_tick.map(|(_, outcome)| outcome),
        }
    }
}

/// Prometheus metrics and health server
pub struct MetricsServer {
    port: u16,
    health: Arc<HealthState>,
}

impl MetricsServer {
    pub fn new(port: u16, health: Arc<HealthState>) -> Self {
        Self { port, health }
    }

    pub async fn run(&self) -> BridgeResult<()> {
        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/health", get(health_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(self.health.clone());

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| BridgeError::Internal(format!("cannot bind {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| BridgeError::Internal(format!("metrics server failed: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> (StatusCode, String) {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return (StatusCode::INTERNAL_SERVER_ERROR, String::new());
    }
    (
        StatusCode::OK,
        String::from_utf8_lossy(&buffer).into_owned(),
    )
}

async fn health_handler(State(health): State<Arc<HealthState>>) -> (StatusCode, Json<HealthReport>) {
    let report = health.report().await;
    let status = if report.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

// Helper functions to record metrics

pub fn record_chain_health(chain_id: u64, healthy: bool) {
    CHAIN_CONNECTED
        .with_label_values(&[&chain_id.to_string()])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_chain_head(chain_id: u64, block_number: u64) {
    CHAIN_BLOCK_HEIGHT
        .with_label_values(&[&chain_id.to_string()])
        .set(block_number as f64);
}

pub fn record_tick(outcome: &str, latency_secs: f64) {
    TICKS.with_label_values(&[outcome]).inc();
    TICK_LATENCY
        .with_label_values(&[outcome])
        .observe(latency_secs);
}

/// Flip the state gauge to `state`
pub fn record_state(previous: &str, state: &str) {
    COORDINATOR_STATE.with_label_values(&[previous]).set(0.0);
    COORDINATOR_STATE.with_label_values(&[state]).set(1.0);
}

pub fn record_submission(chain_id: u64, action: &str) {
    SUBMISSIONS
        .with_label_values(&[&chain_id.to_string(), action])
        .inc();
}

pub fn record_integrity_failure(kind: &str) {
    INTEGRITY_FAILURES.with_label_values(&[kind]).inc();
}

pub fn record_snapshot_persisted() {
    SNAPSHOTS_PERSISTED.with_label_values(&[]).inc();
}
