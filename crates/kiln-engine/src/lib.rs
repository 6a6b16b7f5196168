//! kiln-engine
//!
//! The reconciliation engine: one entry point, `ReconciliationEngine::reconcile`,
//! orchestrating the collaborators in a fixed order.
//!
//! ```text
//! lock ─► load_order ─► fetch_upstream ─► load_state ─► allocate
//!      ─► persist_mappings ─► load_items ─► apply_items ─► result
//! ```
//!
//! - Persist-before-apply: new mappings are durable before any local item is
//!   touched. A crash after `persist_mappings` is repaired by the next run.
//! - The per-order lock is taken by the engine itself and held for the whole
//!   run. Callers cannot reconcile an order without it.
//! - Collaborators are traits (`CommerceSource`, `OrderStore`, `MappingStore`,
//!   `OrderLocker`). Concrete Postgres / HTTP implementations live in
//!   `kiln-db` and `kiln-commerce`; in-memory fakes in `kiln-testkit`.

mod collaborators;
mod engine;
mod error;
mod lock;
mod retry;

pub use collaborators::{CommerceError, CommerceSource, MappingStore, OrderStore, StoreError};
pub use engine::{
    batch_concurrency_from_config_json, BatchOutcome, ReconciliationEngine,
    DEFAULT_BATCH_CONCURRENCY,
};
pub use error::{ReconcileError, ReconcileErrorKind, ReconcileStep};
pub use lock::{
    lock_timeout_from_config_json, InProcessOrderLocks, LockError, OrderLockGuard, OrderLocker,
    DEFAULT_LOCK_TIMEOUT,
};
pub use retry::RetryPolicy;

// Re-exported so binaries can build a policy without a direct dependency.
pub use kiln_reconcile::{ReconcilePolicy, RulePolicy};
