use async_trait::async_trait;
use kiln_engine::{MappingStore, StoreError};
use kiln_schemas::{ItemMapping, OrderTrackingState};
use sqlx::{PgConnection, PgPool};
use tracing::error;

use crate::is_invariant_error;

/// `OrderTrackingState` persisted as two insert-only tables.
#[derive(Clone)]
pub struct PgMappingStore {
    pool: PgPool,
}

impl PgMappingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn suffix_from_db(order_id: &str, raw: i32) -> Result<u32, StoreError> {
    u32::try_from(raw)
        .ok()
        .filter(|s| *s > 0)
        .ok_or_else(|| StoreError::ReadFailed(format!("order_id={order_id} has invalid suffix {raw}")))
}

async fn load_state(conn: &mut PgConnection, order_id: &str) -> Result<OrderTrackingState, StoreError> {
    let used: Vec<(i32,)> =
        sqlx::query_as("select suffix from order_used_suffixes where order_id = $1 order by suffix")
            .bind(order_id)
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| StoreError::ReadFailed(format!("load used suffixes: {e}")))?;

    let rows: Vec<(i32, String, String)> = sqlx::query_as(
        r#"
        select suffix, upstream_line_item_id, title
        from item_mappings
        where order_id = $1
        order by suffix
        "#,
    )
    .bind(order_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| StoreError::ReadFailed(format!("load mappings: {e}")))?;

    let mut state = OrderTrackingState::empty(order_id);
    for (raw,) in used {
        state.used_suffixes.insert(suffix_from_db(order_id, raw)?);
    }
    for (raw, line_item, title) in rows {
        state
            .mappings
            .push(ItemMapping::new(line_item, suffix_from_db(order_id, raw)?, title));
    }
    Ok(state)
}

#[async_trait]
impl MappingStore for PgMappingStore {
    async fn load(&self, order_id: &str) -> Result<OrderTrackingState, StoreError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| StoreError::ReadFailed(format!("acquire: {e}")))?;
        load_state(&mut conn, order_id).await
    }

    async fn save(&self, order_id: &str, state: &OrderTrackingState) -> Result<(), StoreError> {
        let write = |e: sqlx::Error| {
            if is_invariant_error(&e) {
                StoreError::InvariantViolation(e.to_string())
            } else {
                StoreError::WriteFailed(e.to_string())
            }
        };

        let mut tx = self.pool.begin().await.map_err(write)?;

        // Serializes concurrent saves for one order even without the
        // engine-level lock.
        let locked: Option<(String,)> =
            sqlx::query_as("select order_id from orders where order_id = $1 for update")
                .bind(order_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(write)?;
        if locked.is_none() {
            return Err(StoreError::WriteFailed(format!("unknown order_id={order_id}")));
        }

        let previous = load_state(&mut tx, order_id).await?;
        if let Err(v) = state.check_superset_of(&previous) {
            error!(order_id, violation = %v, "mapping_store/rejected_non_monotonic_save");
            return Err(StoreError::InvariantViolation(v.to_string()));
        }

        let (new_mappings, new_suffixes) = state.additions_since(&previous);

        for suffix in &new_suffixes {
            sqlx::query("insert into order_used_suffixes (order_id, suffix) values ($1, $2)")
                .bind(order_id)
                .bind(*suffix as i32)
                .execute(&mut *tx)
                .await
                .map_err(write)?;
        }
        for m in &new_mappings {
            sqlx::query(
                r#"
                insert into item_mappings (order_id, suffix, upstream_line_item_id, title)
                values ($1, $2, $3, $4)
                "#,
            )
            .bind(order_id)
            .bind(m.suffix as i32)
            .bind(&m.upstream_line_item_id)
            .bind(&m.title)
            .execute(&mut *tx)
            .await
            .map_err(write)?;
        }

        tx.commit().await.map_err(write)?;
        Ok(())
    }
}
