//! Per-order mutual exclusion.
//!
//! Two runs for the same order must never interleave: both would read the
//! same `used_suffixes` and hand out the same suffix. Every run goes through
//! an [`OrderLocker`]; the guard it returns is held until the run ends.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_millis(30_000);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    Timeout { order_id: String, waited: Duration },
    Backend(String),
}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockError::Timeout { order_id, waited } => write!(
                f,
                "order lock for order_id={order_id} not acquired within {}ms",
                waited.as_millis()
            ),
            LockError::Backend(msg) => write!(f, "order lock backend error: {msg}"),
        }
    }
}

impl std::error::Error for LockError {}

/// Held for the duration of one run. Dropping it releases the lock.
///
/// The payload is whatever the backend needs to keep alive (a mutex guard, a
/// database transaction).
pub struct OrderLockGuard {
    _held: Box<dyn Any + Send>,
}

impl OrderLockGuard {
    pub fn new<T: Any + Send>(held: T) -> Self {
        Self {
            _held: Box::new(held),
        }
    }
}

impl fmt::Debug for OrderLockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("OrderLockGuard")
    }
}

#[async_trait]
pub trait OrderLocker: Send + Sync {
    async fn lock(&self, order_id: &str) -> Result<OrderLockGuard, LockError>;
}

// ---------------------------------------------------------------------------
// In-process registry
// ---------------------------------------------------------------------------

/// Keyed async mutexes for a single process.
///
/// Sufficient when exactly one process reconciles. Use the Postgres advisory
/// locker when several processes share a database.
pub struct InProcessOrderLocks {
    slots: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    timeout: Duration,
}

impl Default for InProcessOrderLocks {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TIMEOUT)
    }
}

impl InProcessOrderLocks {
    pub fn new(timeout: Duration) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Timeout from `/lock/timeout_ms`, default 30s.
    pub fn from_config_json(config: &Value) -> Self {
        Self::new(lock_timeout_from_config_json(config))
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn slot(&self, order_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
        // Drop slots nobody holds or waits on.
        slots.retain(|k, v| k == order_id || Arc::strong_count(v) > 1);
        slots
            .entry(order_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

#[async_trait]
impl OrderLocker for InProcessOrderLocks {
    async fn lock(&self, order_id: &str) -> Result<OrderLockGuard, LockError> {
        let slot = self.slot(order_id);
        match tokio::time::timeout(self.timeout, slot.lock_owned()).await {
            Ok(guard) => Ok(OrderLockGuard::new(guard)),
            Err(_) => Err(LockError::Timeout {
                order_id: order_id.to_string(),
                waited: self.timeout,
            }),
        }
    }
}

/// `/lock/timeout_ms` as a [`Duration`].
pub fn lock_timeout_from_config_json(config: &Value) -> Duration {
    config
        .pointer("/lock/timeout_ms")
        .and_then(Value::as_u64)
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_LOCK_TIMEOUT)
}
