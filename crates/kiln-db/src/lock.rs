use std::time::Duration;

use async_trait::async_trait;
use kiln_engine::{lock_timeout_from_config_json, LockError, OrderLockGuard, OrderLocker};
use serde_json::Value;
use sqlx::PgPool;

const SQLSTATE_LOCK_NOT_AVAILABLE: &str = "55P03";

/// Per-order lock shared by every process using the same database.
///
/// Takes `pg_advisory_xact_lock(hashtext(order_id))` inside a transaction
/// that the returned guard keeps open. Dropping the guard rolls the
/// transaction back, which releases the lock. Hash collisions only cause
/// unrelated orders to serialize.
#[derive(Clone)]
pub struct PgAdvisoryLocker {
    pool: PgPool,
    timeout: Duration,
}

impl PgAdvisoryLocker {
    pub fn new(pool: PgPool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }

    pub fn from_config_json(pool: PgPool, config: &Value) -> Self {
        Self::new(pool, lock_timeout_from_config_json(config))
    }
}

#[async_trait]
impl OrderLocker for PgAdvisoryLocker {
    async fn lock(&self, order_id: &str) -> Result<OrderLockGuard, LockError> {
        let backend = |e: sqlx::Error| LockError::Backend(e.to_string());

        let mut tx = self.pool.begin().await.map_err(backend)?;

        sqlx::query("select set_config('lock_timeout', $1, true)")
            .bind(format!("{}ms", self.timeout.as_millis().max(1)))
            .execute(&mut *tx)
            .await
            .map_err(backend)?;

        let taken = sqlx::query("select pg_advisory_xact_lock(hashtext($1))")
            .bind(order_id)
            .execute(&mut *tx)
            .await;

        match taken {
            Ok(_) => Ok(OrderLockGuard::new(tx)),
            Err(sqlx::Error::Database(db)) if db.code().as_deref() == Some(SQLSTATE_LOCK_NOT_AVAILABLE) => {
                Err(LockError::Timeout {
                    order_id: order_id.to_string(),
                    waited: self.timeout,
                })
            }
            Err(e) => Err(backend(e)),
        }
    }
}
