//! Collaborator boundaries consumed by the engine.
//!
//! Implementations map their own failures onto [`CommerceError`] /
//! [`StoreError`]; the engine never sees transport or driver types.

use std::fmt;

use async_trait::async_trait;
use kiln_schemas::{ItemPatch, LocalItem, Order, OrderTrackingState, UpstreamOrder};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommerceError {
    /// The upstream platform has no order with this id.
    NotFound,
    /// Network, auth, rate-limit, timeout or decode failure.
    Unavailable(String),
}

impl fmt::Display for CommerceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommerceError::NotFound => write!(f, "upstream order not found"),
            CommerceError::Unavailable(msg) => write!(f, "upstream unavailable: {msg}"),
        }
    }
}

impl std::error::Error for CommerceError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    ReadFailed(String),
    WriteFailed(String),
    /// The store refused a write that would break an identity invariant
    /// (non-monotonic save, duplicate serial number).
    InvariantViolation(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::ReadFailed(msg) => write!(f, "store read failed: {msg}"),
            StoreError::WriteFailed(msg) => write!(f, "store write failed: {msg}"),
            StoreError::InvariantViolation(msg) => write!(f, "store invariant violation: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Read-only view of the upstream commerce platform.
///
/// Implementations enforce their own request timeout and surface it as
/// [`CommerceError::Unavailable`].
#[async_trait]
pub trait CommerceSource: Send + Sync {
    async fn fetch_order(&self, upstream_order_id: &str) -> Result<UpstreamOrder, CommerceError>;
}

/// Local order and item records.
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// `Ok(None)` when the order is unknown.
    async fn get_order(&self, order_id: &str) -> Result<Option<Order>, StoreError>;

    async fn get_order_items(&self, order_id: &str) -> Result<Vec<LocalItem>, StoreError>;

    async fn create_item(&self, item: &LocalItem) -> Result<(), StoreError>;

    async fn update_item(&self, serial_number: &str, patch: &ItemPatch) -> Result<(), StoreError>;
}

/// Durable per-order suffix identity.
#[async_trait]
pub trait MappingStore: Send + Sync {
    /// An order with no record yields an empty state, never an error.
    async fn load(&self, order_id: &str) -> Result<OrderTrackingState, StoreError>;

    /// Persist `state` atomically. Must reject, with
    /// [`StoreError::InvariantViolation`], any state that is not a superset of
    /// what is currently stored.
    async fn save(&self, order_id: &str, state: &OrderTrackingState) -> Result<(), StoreError>;
}
