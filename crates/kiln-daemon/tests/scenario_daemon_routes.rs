//! In-process scenario tests for kiln-daemon HTTP endpoints.
//!
//! These tests spin up the Axum router **without** binding a TCP socket,
//! over in-memory collaborators, and drive it via
//! `tower::ServiceExt::oneshot`.
//!
//! # Invariants under test
//!
//! 1. `POST /v1/orders/:id/reconcile` runs one reconciliation and returns
//!    its counts; a second call on an unchanged order creates nothing.
//! 2. Failures map to HTTP status by kind and carry `retryable`.
//! 3. `GET /v1/orders/:id/tracking` exposes suffixes, mappings and items.
//! 4. Every outcome is broadcast on the SSE bus and counted in `/v1/status`.

use std::sync::Arc;

use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use kiln_daemon::{routes, state};
use kiln_engine::{CommerceError, RetryPolicy};
use kiln_testkit::{line, Harness};
use tower::ServiceExt; // oneshot

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn make_state(h: &Harness) -> Arc<state::AppState> {
    Arc::new(state::AppState::new(
        h.engine.clone(),
        h.orders.clone(),
        h.mappings.clone(),
        RetryPolicy::no_retry(),
    ))
}

async fn call(
    st: &Arc<state::AppState>,
    method: &str,
    uri: &str,
) -> (StatusCode, serde_json::Value) {
    let req = Request::builder()
        .method(method)
        .uri(uri)
        .body(axum::body::Body::empty())
        .unwrap();
    let resp = routes::build_router(Arc::clone(st))
        .oneshot(req)
        .await
        .expect("oneshot failed");
    let status = resp.status();
    let body = resp
        .into_body()
        .collect()
        .await
        .expect("body collect failed")
        .to_bytes();
    let json = serde_json::from_slice(&body).expect("body is not valid JSON");
    (status, json)
}

fn seeded() -> Harness {
    let h = Harness::new();
    h.seed_order(
        "o-1",
        "K-1001",
        vec![line("li-1", "Native Flute - A minor", 2), line("li-2", "Drum", 1)],
    );
    h
}

// ---------------------------------------------------------------------------
// GET /v1/health
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_returns_200_ok_true() {
    let h = Harness::new();
    let (status, json) = call(&make_state(&h), "GET", "/v1/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["ok"], true);
    assert_eq!(json["service"], "kiln-daemon");
}

// ---------------------------------------------------------------------------
// POST /v1/orders/:order_id/reconcile
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reconcile_creates_items_then_is_idempotent() {
    let h = seeded();
    let st = make_state(&h);

    let (status, json) = call(&st, "POST", "/v1/orders/o-1/reconcile").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["order_id"], "o-1");
    assert_eq!(json["mappings_created"], 3);
    assert_eq!(json["items_created"], 3);

    let (status, json) = call(&st, "POST", "/v1/orders/o-1/reconcile").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["mappings_created"], 0);
    assert_eq!(json["items_created"], 0);
    assert_eq!(json["items_unchanged"], 3);
}

#[tokio::test]
async fn unknown_order_is_404_and_not_retryable() {
    let h = Harness::new();
    let (status, json) = call(&make_state(&h), "POST", "/v1/orders/nope/reconcile").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["retryable"], false);
    assert_eq!(json["error"]["kind"], "local_order_not_found");
    assert_eq!(json["error"]["step"], "load_order");
}

#[tokio::test]
async fn upstream_outage_is_502_and_retryable() {
    let h = seeded();
    h.commerce
        .fail_next(CommerceError::Unavailable("connection reset".to_string()));

    let (status, json) = call(&make_state(&h), "POST", "/v1/orders/o-1/reconcile").await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(json["retryable"], true);
    assert_eq!(json["error"]["kind"], "upstream_unavailable");
    assert!(h.orders.items().is_empty());
}

// ---------------------------------------------------------------------------
// GET /v1/orders/:order_id/tracking
// ---------------------------------------------------------------------------

#[tokio::test]
async fn tracking_reflects_reconciled_state() {
    let h = seeded();
    let st = make_state(&h);
    call(&st, "POST", "/v1/orders/o-1/reconcile").await;

    let (status, json) = call(&st, "GET", "/v1/orders/o-1/tracking").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["order_number"], "K-1001");
    assert_eq!(json["used_suffixes"], serde_json::json!([1, 2, 3]));
    assert_eq!(json["mappings"].as_array().map(Vec::len), Some(3));

    let mut serials: Vec<String> = json["items"]
        .as_array()
        .unwrap()
        .iter()
        .map(|i| i["serial_number"].as_str().unwrap().to_string())
        .collect();
    serials.sort();
    assert_eq!(serials, vec!["K-1001-1", "K-1001-2", "K-1001-3"]);
}

#[tokio::test]
async fn tracking_unknown_order_is_404() {
    let h = Harness::new();
    let (status, json) = call(&make_state(&h), "GET", "/v1/orders/nope/tracking").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(json["error"].as_str().unwrap().contains("nope"));
}

// ---------------------------------------------------------------------------
// Bus + status
// ---------------------------------------------------------------------------

#[tokio::test]
async fn outcomes_are_broadcast_and_counted() {
    let h = seeded();
    let st = make_state(&h);
    let mut rx = st.bus.subscribe();

    call(&st, "POST", "/v1/orders/o-1/reconcile").await;
    call(&st, "POST", "/v1/orders/missing/reconcile").await;

    let first = rx.try_recv().expect("completed event");
    assert_eq!(first.event_name(), "reconcile_completed");
    let second = rx.try_recv().expect("failed event");
    assert_eq!(second.event_name(), "reconcile_failed");

    let (status, json) = call(&st, "GET", "/v1/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["reconciles_ok"], 1);
    assert_eq!(json["reconciles_failed"], 1);
}
