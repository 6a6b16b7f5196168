//! Request and response types for all kiln-daemon HTTP endpoints.
//!
//! No business logic lives here.

use kiln_engine::ReconcileError;
use kiln_schemas::{ItemMapping, LocalItem};
use serde::Serialize;

// ---------------------------------------------------------------------------
// /v1/health
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: &'static str,
    pub version: &'static str,
}

// ---------------------------------------------------------------------------
// /v1/orders/:order_id/reconcile
// ---------------------------------------------------------------------------

/// Body of a failed reconcile. `retryable` tells a webhook sender whether
/// redelivery can help.
#[derive(Debug, Clone, Serialize)]
pub struct ReconcileFailedResponse {
    pub retryable: bool,
    pub error: ReconcileError,
    pub message: String,
}

// ---------------------------------------------------------------------------
// /v1/orders/:order_id/tracking
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct TrackingResponse {
    pub order_id: String,
    pub order_number: String,
    pub upstream_order_id: Option<String>,
    pub used_suffixes: Vec<u32>,
    pub mappings: Vec<ItemMapping>,
    pub items: Vec<LocalItem>,
}

/// Generic error body for non-reconcile failures.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}
