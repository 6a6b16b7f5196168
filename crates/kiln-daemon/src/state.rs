//! Shared runtime state for kiln-daemon.
//!
//! Handlers receive `State<Arc<AppState>>` from Axum. Background tasks
//! (heartbeat, resync tick) hold their own `Arc` clone.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kiln_engine::{
    MappingStore, OrderStore, ReconcileError, ReconciliationEngine, RetryPolicy,
};
use kiln_schemas::ReconciliationResult;
use serde::Serialize;
use sqlx::PgPool;
use tokio::sync::{broadcast, RwLock};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// BusMsg: SSE event bus payload
// ---------------------------------------------------------------------------

/// Messages broadcast over the internal event bus and surfaced as SSE events.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusMsg {
    Heartbeat { ts_millis: i64 },
    ReconcileCompleted(ReconciliationResult),
    ReconcileFailed(ReconcileError),
}

impl BusMsg {
    pub fn event_name(&self) -> &'static str {
        match self {
            BusMsg::Heartbeat { .. } => "heartbeat",
            BusMsg::ReconcileCompleted(_) => "reconcile_completed",
            BusMsg::ReconcileFailed(_) => "reconcile_failed",
        }
    }
}

// ---------------------------------------------------------------------------
// BuildInfo
// ---------------------------------------------------------------------------

/// Static build metadata included in health / status responses.
#[derive(Clone, Debug, Serialize)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

// ---------------------------------------------------------------------------
// StatusSnapshot
// ---------------------------------------------------------------------------

/// Counters since process start, returned by GET /v1/status.
#[derive(Clone, Debug, Default, Serialize)]
pub struct StatusSnapshot {
    pub daemon_uptime_secs: u64,
    pub reconciles_ok: u64,
    pub reconciles_failed: u64,
    pub last_resync_utc: Option<DateTime<Utc>>,
}

/// Outcome counts of one resync pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ResyncSummary {
    pub orders: usize,
    pub failed: usize,
}

// ---------------------------------------------------------------------------
// AppState
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    /// Broadcast bus for SSE.
    pub bus: broadcast::Sender<BusMsg>,
    pub build: BuildInfo,
    pub engine: ReconciliationEngine,
    /// Applied to resync passes. Manual reconciles make a single attempt.
    pub retry: RetryPolicy,
    /// Read side for the tracking endpoint; the engine owns the write side.
    pub orders: Arc<dyn OrderStore>,
    pub mappings: Arc<dyn MappingStore>,
    /// When set, every outcome is appended to `reconcile_runs`.
    pub run_log: Option<PgPool>,
    pub status: Arc<RwLock<StatusSnapshot>>,
}

impl AppState {
    pub fn new(
        engine: ReconciliationEngine,
        orders: Arc<dyn OrderStore>,
        mappings: Arc<dyn MappingStore>,
        retry: RetryPolicy,
    ) -> Self {
        let (bus, _rx) = broadcast::channel::<BusMsg>(1024);
        Self {
            bus,
            build: BuildInfo {
                service: "kiln-daemon",
                version: env!("CARGO_PKG_VERSION"),
            },
            engine,
            retry,
            orders,
            mappings,
            run_log: None,
            status: Arc::new(RwLock::new(StatusSnapshot::default())),
        }
    }

    pub fn with_run_log(mut self, pool: PgPool) -> Self {
        self.run_log = Some(pool);
        self
    }

    /// Count, log to the run table, and broadcast one outcome.
    pub async fn publish_outcome(
        &self,
        order_id: &str,
        outcome: &Result<ReconciliationResult, ReconcileError>,
    ) {
        {
            let mut s = self.status.write().await;
            match outcome {
                Ok(_) => s.reconciles_ok += 1,
                Err(_) => s.reconciles_failed += 1,
            }
        }

        if let Some(pool) = &self.run_log {
            let rec = kiln_db::ReconcileRunRecord::from_outcome(order_id, outcome);
            if let Err(e) = kiln_db::record_reconcile_run(pool, &rec).await {
                warn!(order_id, error = %format!("{e:#}"), "runs/record_failed");
            }
        }

        let msg = match outcome {
            Ok(r) => BusMsg::ReconcileCompleted(r.clone()),
            Err(e) => BusMsg::ReconcileFailed(e.clone()),
        };
        // No subscribers is fine.
        let _ = self.bus.send(msg);
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Monotonically increasing uptime since first call (process lifetime).
pub fn uptime_secs() -> u64 {
    static START: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();
    START
        .get_or_init(std::time::Instant::now)
        .elapsed()
        .as_secs()
}

/// Spawn a background task that emits a heartbeat SSE every `interval`.
pub fn spawn_heartbeat(bus: broadcast::Sender<BusMsg>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let ts = Utc::now().timestamp_millis();
            let _ = bus.send(BusMsg::Heartbeat { ts_millis: ts });
        }
    });
}

/// Reconcile `order_ids` as one batch and publish every outcome.
pub async fn resync_once(state: &AppState, order_ids: &[String]) -> ResyncSummary {
    let outcomes = state.engine.reconcile_many(order_ids, &state.retry).await;

    let mut summary = ResyncSummary {
        orders: outcomes.len(),
        failed: 0,
    };
    for o in &outcomes {
        if o.result.is_err() {
            summary.failed += 1;
        }
        state.publish_outcome(&o.order_id, &o.result).await;
    }

    state.status.write().await.last_resync_utc = Some(Utc::now());
    info!(orders = summary.orders, failed = summary.failed, "resync/completed");
    summary
}

/// Spawn the periodic resync. `list_fn` yields the order ids to reconcile on
/// each tick; a listing failure skips that tick.
pub fn spawn_resync_tick<F, Fut>(state: Arc<AppState>, list_fn: F, interval: Duration)
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<Vec<String>>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately; resync starts one interval in.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match list_fn().await {
                Ok(ids) => {
                    resync_once(&state, &ids).await;
                }
                Err(e) => warn!(error = %format!("{e:#}"), "resync/list_failed"),
            }
        }
    });
}
