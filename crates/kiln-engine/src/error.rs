use std::fmt;

use kiln_schemas::MonotonicityViolation;
use serde::Serialize;

use crate::collaborators::{CommerceError, StoreError};
use crate::lock::LockError;

/// Where in a run an error surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileStep {
    Lock,
    LoadOrder,
    FetchUpstream,
    LoadState,
    Allocate,
    PersistMappings,
    LoadItems,
    ApplyItems,
}

impl ReconcileStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileStep::Lock => "lock",
            ReconcileStep::LoadOrder => "load_order",
            ReconcileStep::FetchUpstream => "fetch_upstream",
            ReconcileStep::LoadState => "load_state",
            ReconcileStep::Allocate => "allocate",
            ReconcileStep::PersistMappings => "persist_mappings",
            ReconcileStep::LoadItems => "load_items",
            ReconcileStep::ApplyItems => "apply_items",
        }
    }

    /// `true` once mappings may have been written.
    pub fn is_after_persist(&self) -> bool {
        matches!(self, ReconcileStep::LoadItems | ReconcileStep::ApplyItems)
    }
}

impl fmt::Display for ReconcileStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ReconcileErrorKind {
    /// Transient. Retry with backoff.
    UpstreamUnavailable(String),
    /// Permanent for this order. Alert, do not retry.
    UpstreamOrderNotFound,
    /// The local order id is unknown. Permanent.
    LocalOrderNotFound,
    StoreReadFailed(String),
    StoreWriteFailed(String),
    /// A write was refused because it would un-issue or rebind a suffix.
    InvariantViolation(String),
    /// The per-order lock was not acquired in time.
    LockUnavailable(String),
}

impl fmt::Display for ReconcileErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconcileErrorKind::UpstreamUnavailable(m) => write!(f, "UPSTREAM_UNAVAILABLE: {m}"),
            ReconcileErrorKind::UpstreamOrderNotFound => write!(f, "UPSTREAM_ORDER_NOT_FOUND"),
            ReconcileErrorKind::LocalOrderNotFound => write!(f, "LOCAL_ORDER_NOT_FOUND"),
            ReconcileErrorKind::StoreReadFailed(m) => write!(f, "STORE_READ_FAILED: {m}"),
            ReconcileErrorKind::StoreWriteFailed(m) => write!(f, "STORE_WRITE_FAILED: {m}"),
            ReconcileErrorKind::InvariantViolation(m) => write!(f, "INVARIANT_VIOLATION: {m}"),
            ReconcileErrorKind::LockUnavailable(m) => write!(f, "LOCK_UNAVAILABLE: {m}"),
        }
    }
}

/// A failed run, tagged with the order and the step that failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileError {
    pub order_id: String,
    pub step: ReconcileStep,
    #[serde(flatten)]
    pub kind: ReconcileErrorKind,
}

impl ReconcileError {
    pub fn new(order_id: impl Into<String>, step: ReconcileStep, kind: ReconcileErrorKind) -> Self {
        Self {
            order_id: order_id.into(),
            step,
            kind,
        }
    }

    /// `true` for failures a later identical run may not hit.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            ReconcileErrorKind::UpstreamUnavailable(_)
                | ReconcileErrorKind::StoreReadFailed(_)
                | ReconcileErrorKind::StoreWriteFailed(_)
                | ReconcileErrorKind::LockUnavailable(_)
        )
    }

    pub(crate) fn commerce(order_id: &str, err: CommerceError) -> Self {
        let kind = match err {
            CommerceError::NotFound => ReconcileErrorKind::UpstreamOrderNotFound,
            CommerceError::Unavailable(m) => ReconcileErrorKind::UpstreamUnavailable(m),
        };
        Self::new(order_id, ReconcileStep::FetchUpstream, kind)
    }

    pub(crate) fn store(order_id: &str, step: ReconcileStep, err: StoreError) -> Self {
        let kind = match err {
            StoreError::ReadFailed(m) => ReconcileErrorKind::StoreReadFailed(m),
            StoreError::WriteFailed(m) => ReconcileErrorKind::StoreWriteFailed(m),
            StoreError::InvariantViolation(m) => ReconcileErrorKind::InvariantViolation(m),
        };
        Self::new(order_id, step, kind)
    }

    pub(crate) fn lock(order_id: &str, err: LockError) -> Self {
        Self::new(
            order_id,
            ReconcileStep::Lock,
            ReconcileErrorKind::LockUnavailable(err.to_string()),
        )
    }

    pub(crate) fn invariant(order_id: &str, step: ReconcileStep, v: MonotonicityViolation) -> Self {
        Self::new(order_id, step, ReconcileErrorKind::InvariantViolation(v.to_string()))
    }
}

impl fmt::Display for ReconcileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "reconcile order_id={} step={}: {}",
            self.order_id, self.step, self.kind
        )
    }
}

impl std::error::Error for ReconcileError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        let e = |k| ReconcileError::new("o", ReconcileStep::FetchUpstream, k);
        assert!(e(ReconcileErrorKind::UpstreamUnavailable("502".into())).is_retryable());
        assert!(e(ReconcileErrorKind::StoreWriteFailed("io".into())).is_retryable());
        assert!(e(ReconcileErrorKind::LockUnavailable("t".into())).is_retryable());
        assert!(!e(ReconcileErrorKind::UpstreamOrderNotFound).is_retryable());
        assert!(!e(ReconcileErrorKind::LocalOrderNotFound).is_retryable());
        assert!(!e(ReconcileErrorKind::InvariantViolation("x".into())).is_retryable());
    }

    #[test]
    fn display_carries_order_and_step() {
        let err = ReconcileError::commerce("ord-9", CommerceError::Unavailable("timeout".into()));
        assert_eq!(
            err.to_string(),
            "reconcile order_id=ord-9 step=fetch_upstream: UPSTREAM_UNAVAILABLE: timeout"
        );
    }

    #[test]
    fn serializes_flat_for_event_payloads() {
        let err = ReconcileError::store(
            "ord-1",
            ReconcileStep::PersistMappings,
            StoreError::WriteFailed("disk".into()),
        );
        let v = serde_json::to_value(&err).unwrap();
        assert_eq!(v["order_id"], "ord-1");
        assert_eq!(v["step"], "persist_mappings");
        assert_eq!(v["kind"], "store_write_failed");
        assert_eq!(v["detail"], "disk");
    }
}
