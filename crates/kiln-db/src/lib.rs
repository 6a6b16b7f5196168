//! kiln-db
//!
//! PostgreSQL persistence for the reconciliation engine.
//!
//! - `PgMappingStore`: atomic, monotonic suffix identity (one transaction per
//!   save, order row locked `FOR UPDATE`, superset check, insert-only).
//! - `PgOrderStore`: orders and local items.
//! - `PgAdvisoryLocker`: cross-process per-order lock.
//! - `record_reconcile_run`: run log for observability.
//!
//! Admin helpers (connect, migrate, status, order registration) return
//! `anyhow::Result`; trait implementations map onto `StoreError`.

use anyhow::{Context, Result};
use kiln_schemas::Order;
use sqlx::{postgres::PgPoolOptions, PgPool};

mod items;
mod lock;
mod mappings;
mod runs;

pub use items::PgOrderStore;
pub use lock::PgAdvisoryLocker;
pub use mappings::PgMappingStore;
pub use runs::{recent_runs, record_reconcile_run, ReconcileRunRecord};

pub const ENV_DB_URL: &str = "KILN_DATABASE_URL";

/// SQLSTATE raised by the immutability triggers.
const SQLSTATE_RAISE_EXCEPTION: &str = "P0001";
const SQLSTATE_UNIQUE_VIOLATION: &str = "23505";

/// Connect to Postgres using KILN_DATABASE_URL.
pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .context("failed to connect to Postgres")?;

    Ok(pool)
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_item_mappings_table: bool,
}

/// Connectivity + schema presence.
pub async fn status(pool: &PgPool) -> Result<DbStatus> {
    let (one,): (i32,) = sqlx::query_as::<_, (i32,)>("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;

    let (exists,): (bool,) = sqlx::query_as::<_, (bool,)>(
        r#"
        select exists (
            select 1
            from information_schema.tables
            where table_schema = 'public' and table_name = 'item_mappings'
        )
        "#,
    )
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")?;

    Ok(DbStatus {
        ok: one == 1,
        has_item_mappings_table: exists,
    })
}

// ---------------------------------------------------------------------------
// Orders (admin surface)
// ---------------------------------------------------------------------------

/// Register an order, or update its upstream reference. `order_number` is
/// fixed after the first insert; changing it is rejected by the database.
pub async fn upsert_order(pool: &PgPool, order: &Order) -> Result<()> {
    sqlx::query(
        r#"
        insert into orders (order_id, order_number, upstream_order_id)
        values ($1, $2, $3)
        on conflict (order_id) do update
          set order_number = excluded.order_number,
              upstream_order_id = excluded.upstream_order_id
        "#,
    )
    .bind(&order.order_id)
    .bind(&order.order_number)
    .bind(order.upstream_order_id.as_deref())
    .execute(pool)
    .await
    .with_context(|| format!("upsert_order failed for order_id={}", order.order_id))?;
    Ok(())
}

/// Orders that can be reconciled (have an upstream reference), by id.
pub async fn list_orders_with_upstream(pool: &PgPool) -> Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "select order_id from orders where upstream_order_id is not null order by order_id",
    )
    .fetch_all(pool)
    .await
    .context("list_orders_with_upstream failed")?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

fn sqlstate(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db) => db.code().map(|c| c.into_owned()),
        _ => None,
    }
}

/// `true` for errors meaning "this write would break an identity rule".
fn is_invariant_error(err: &sqlx::Error) -> bool {
    matches!(
        sqlstate(err).as_deref(),
        Some(SQLSTATE_RAISE_EXCEPTION) | Some(SQLSTATE_UNIQUE_VIOLATION)
    )
}
