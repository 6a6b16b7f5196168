//! Axum router and all HTTP handlers for kiln-daemon.
//!
//! `build_router` is the single entry point; `main.rs` calls it and attaches
//! middleware layers. All handlers are `pub(crate)` so the scenario tests in
//! `tests/` can compose the router directly.

use std::{convert::Infallible, sync::Arc};

use axum::{
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::{Stream, StreamExt};
use kiln_engine::{ReconcileErrorKind, StoreError};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::info;

use crate::{
    api_types::{ErrorResponse, HealthResponse, ReconcileFailedResponse, TrackingResponse},
    state::{uptime_secs, AppState, BusMsg},
};

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the complete application router wired to the given shared state.
///
/// Middleware layers (CORS, tracing) are **not** applied here; `main.rs`
/// attaches them after this call so tests can use the bare router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/status", get(status_handler))
        .route("/v1/stream", get(stream))
        .route("/v1/orders/:order_id/reconcile", post(reconcile_order))
        .route("/v1/orders/:order_id/tracking", get(tracking))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// GET /v1/health
// ---------------------------------------------------------------------------

pub(crate) async fn health(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            service: st.build.service,
            version: st.build.version,
        }),
    )
}

// ---------------------------------------------------------------------------
// GET /v1/status
// ---------------------------------------------------------------------------

pub(crate) async fn status_handler(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    let mut snap = st.status.read().await.clone();
    snap.daemon_uptime_secs = uptime_secs();
    (StatusCode::OK, Json(snap))
}

// ---------------------------------------------------------------------------
// POST /v1/orders/:order_id/reconcile
// ---------------------------------------------------------------------------

/// Manual resync / webhook trigger. One attempt; the caller decides whether
/// to redeliver based on `retryable`.
pub(crate) async fn reconcile_order(
    State(st): State<Arc<AppState>>,
    Path(order_id): Path<String>,
) -> Response {
    info!(order_id = %order_id, "http/reconcile_requested");
    let outcome = st.engine.reconcile(&order_id).await;
    st.publish_outcome(&order_id, &outcome).await;

    match outcome {
        Ok(result) => (StatusCode::OK, Json(result)).into_response(),
        Err(e) => {
            let code = status_for(&e.kind);
            (
                code,
                Json(ReconcileFailedResponse {
                    retryable: e.is_retryable(),
                    message: e.to_string(),
                    error: e,
                }),
            )
                .into_response()
        }
    }
}

fn status_for(kind: &ReconcileErrorKind) -> StatusCode {
    match kind {
        ReconcileErrorKind::LocalOrderNotFound | ReconcileErrorKind::UpstreamOrderNotFound => {
            StatusCode::NOT_FOUND
        }
        ReconcileErrorKind::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
        ReconcileErrorKind::LockUnavailable(_) => StatusCode::CONFLICT,
        ReconcileErrorKind::StoreReadFailed(_) | ReconcileErrorKind::StoreWriteFailed(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        ReconcileErrorKind::InvariantViolation(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

// ---------------------------------------------------------------------------
// GET /v1/orders/:order_id/tracking
// ---------------------------------------------------------------------------

/// Read-only view of an order's suffixes, mappings and local items. Takes no
/// lock; a concurrent run may be mid-apply.
pub(crate) async fn tracking(
    State(st): State<Arc<AppState>>,
    Path(order_id): Path<String>,
) -> Response {
    let order = match st.orders.get_order(&order_id).await {
        Ok(Some(o)) => o,
        Ok(None) => {
            return error_response(StatusCode::NOT_FOUND, format!("unknown order_id={order_id}"))
        }
        Err(e) => return store_error_response(e),
    };
    let state = match st.mappings.load(&order_id).await {
        Ok(s) => s,
        Err(e) => return store_error_response(e),
    };
    let items = match st.orders.get_order_items(&order_id).await {
        Ok(i) => i,
        Err(e) => return store_error_response(e),
    };

    (
        StatusCode::OK,
        Json(TrackingResponse {
            order_id: order.order_id,
            order_number: order.order_number,
            upstream_order_id: order.upstream_order_id,
            used_suffixes: state.used_suffixes.into_iter().collect(),
            mappings: state.mappings,
            items,
        }),
    )
        .into_response()
}

fn store_error_response(e: StoreError) -> Response {
    let code = match e {
        StoreError::InvariantViolation(_) => StatusCode::INTERNAL_SERVER_ERROR,
        StoreError::ReadFailed(_) | StoreError::WriteFailed(_) => StatusCode::SERVICE_UNAVAILABLE,
    };
    error_response(code, e.to_string())
}

fn error_response(code: StatusCode, error: String) -> Response {
    (code, Json(ErrorResponse { error })).into_response()
}

// ---------------------------------------------------------------------------
// GET /v1/stream  (SSE)
// ---------------------------------------------------------------------------

pub(crate) async fn stream(State(st): State<Arc<AppState>>) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert("Cache-Control", HeaderValue::from_static("no-cache"));
    headers.insert("Connection", HeaderValue::from_static("keep-alive"));

    let rx = st.bus.subscribe();
    let events = broadcast_to_sse(rx);

    (headers, Sse::new(events).keep_alive(KeepAlive::new())).into_response()
}

fn broadcast_to_sse(
    rx: broadcast::Receiver<BusMsg>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    BroadcastStream::new(rx).filter_map(|msg| async move {
        match msg {
            Ok(m) => {
                let data = serde_json::to_string(&m).ok()?;
                Some(Ok(Event::default().event(m.event_name()).data(data)))
            }
            Err(_) => None, // lagged / closed
        }
    })
}
