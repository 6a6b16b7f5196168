use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use kiln_engine::ReconcileError;
use kiln_schemas::ReconciliationResult;
use serde::Serialize;
use sqlx::{FromRow, PgPool};

/// One row of `reconcile_runs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct ReconcileRunRecord {
    pub order_id: String,
    /// `OK` | `FAILED`
    pub outcome: String,
    pub failed_step: Option<String>,
    pub error: Option<String>,
    pub mappings_created: i32,
    pub items_created: i32,
    pub items_reactivated: i32,
    pub items_archived: i32,
    pub items_refreshed: i32,
    pub items_unchanged: i32,
    pub reactivations_suppressed: i32,
    pub finished_at_utc: DateTime<Utc>,
}

impl ReconcileRunRecord {
    pub fn from_outcome(order_id: &str, outcome: &Result<ReconciliationResult, ReconcileError>) -> Self {
        let n = |v: u32| i32::try_from(v).unwrap_or(i32::MAX);
        match outcome {
            Ok(r) => Self {
                order_id: order_id.to_string(),
                outcome: "OK".to_string(),
                failed_step: None,
                error: None,
                mappings_created: n(r.mappings_created),
                items_created: n(r.items_created),
                items_reactivated: n(r.items_reactivated),
                items_archived: n(r.items_archived),
                items_refreshed: n(r.items_refreshed),
                items_unchanged: n(r.items_unchanged),
                reactivations_suppressed: n(r.reactivations_suppressed),
                finished_at_utc: r.finished_at_utc,
            },
            Err(e) => Self {
                order_id: order_id.to_string(),
                outcome: "FAILED".to_string(),
                failed_step: Some(e.step.as_str().to_string()),
                error: Some(e.kind.to_string()),
                mappings_created: 0,
                items_created: 0,
                items_reactivated: 0,
                items_archived: 0,
                items_refreshed: 0,
                items_unchanged: 0,
                reactivations_suppressed: 0,
                finished_at_utc: Utc::now(),
            },
        }
    }
}

pub async fn record_reconcile_run(pool: &PgPool, rec: &ReconcileRunRecord) -> Result<()> {
    sqlx::query(
        r#"
        insert into reconcile_runs (
          order_id, outcome, failed_step, error,
          mappings_created, items_created, items_reactivated, items_archived,
          items_refreshed, items_unchanged, reactivations_suppressed, finished_at_utc
        ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        "#,
    )
    .bind(&rec.order_id)
    .bind(&rec.outcome)
    .bind(rec.failed_step.as_deref())
    .bind(rec.error.as_deref())
    .bind(rec.mappings_created)
    .bind(rec.items_created)
    .bind(rec.items_reactivated)
    .bind(rec.items_archived)
    .bind(rec.items_refreshed)
    .bind(rec.items_unchanged)
    .bind(rec.reactivations_suppressed)
    .bind(rec.finished_at_utc)
    .execute(pool)
    .await
    .with_context(|| format!("record_reconcile_run failed for order_id={}", rec.order_id))?;
    Ok(())
}

/// Most recent runs for one order, newest first.
pub async fn recent_runs(pool: &PgPool, order_id: &str, limit: i64) -> Result<Vec<ReconcileRunRecord>> {
    let rows = sqlx::query_as::<_, ReconcileRunRecord>(
        r#"
        select order_id, outcome, failed_step, error,
               mappings_created, items_created, items_reactivated, items_archived,
               items_refreshed, items_unchanged, reactivations_suppressed, finished_at_utc
        from reconcile_runs
        where order_id = $1
        order by finished_at_utc desc, run_id desc
        limit $2
        "#,
    )
    .bind(order_id)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("recent_runs failed")?;
    Ok(rows)
}
