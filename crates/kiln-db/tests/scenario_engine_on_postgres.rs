//! Scenario: Engine On Postgres
//!
//! # Invariants under test
//!
//! 1. The full grow / remove / re-add cycle behaves the same on Postgres as
//!    in memory: suffixes 1..5, archive all, reactivate the same five.
//! 2. A second run with unchanged upstream writes nothing.
//! 3. The advisory lock excludes a second holder for the same order and
//!    reports `Timeout`; a different order is unaffected.
//! 4. Completed and failed runs land in `reconcile_runs`.
//!
//! DB-backed; skipped if KILN_DATABASE_URL is not set.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use kiln_db::{PgAdvisoryLocker, PgMappingStore, PgOrderStore, ReconcileRunRecord};
use kiln_engine::{
    CommerceError, CommerceSource, LockError, OrderLocker, ReconciliationEngine, RulePolicy,
};
use kiln_schemas::{Order, UpstreamLineItem, UpstreamOrder};
use sqlx::PgPool;

#[derive(Default)]
struct ScriptedCommerce(Mutex<HashMap<String, Vec<UpstreamLineItem>>>);

impl ScriptedCommerce {
    fn set(&self, upstream_id: &str, lines: Vec<UpstreamLineItem>) {
        self.0
            .lock()
            .unwrap()
            .insert(upstream_id.to_string(), lines);
    }
}

#[async_trait]
impl CommerceSource for ScriptedCommerce {
    async fn fetch_order(&self, upstream_order_id: &str) -> Result<UpstreamOrder, CommerceError> {
        let lines = self
            .0
            .lock()
            .unwrap()
            .get(upstream_order_id)
            .cloned()
            .ok_or(CommerceError::NotFound)?;
        Ok(UpstreamOrder {
            upstream_order_id: upstream_order_id.to_string(),
            line_items: lines,
        })
    }
}

async fn pool_or_skip() -> anyhow::Result<Option<PgPool>> {
    let url = match std::env::var(kiln_db::ENV_DB_URL) {
        Ok(v) => v,
        Err(_) => {
            eprintln!("SKIP: KILN_DATABASE_URL not set");
            return Ok(None);
        }
    };
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(6)
        .connect(&url)
        .await?;
    kiln_db::migrate(&pool).await?;
    Ok(Some(pool))
}

fn unique(tag: &str) -> String {
    format!("{tag}-{}", Utc::now().timestamp_nanos_opt().unwrap_or_default())
}

#[tokio::test]
async fn lifecycle_on_postgres() -> anyhow::Result<()> {
    let Some(pool) = pool_or_skip().await? else {
        return Ok(());
    };
    let order_id = unique("eng");
    let order_number = unique("SW");
    let upstream_id = unique("up");
    kiln_db::upsert_order(
        &pool,
        &Order::new(order_id.clone(), order_number.clone(), Some(upstream_id.clone())),
    )
    .await?;

    let commerce = Arc::new(ScriptedCommerce::default());
    let engine = ReconciliationEngine::new(
        commerce.clone(),
        Arc::new(PgOrderStore::new(pool.clone())),
        Arc::new(PgMappingStore::new(pool.clone())),
        Arc::new(PgAdvisoryLocker::new(pool.clone(), Duration::from_secs(5))),
        Arc::new(RulePolicy::default()),
    );

    commerce.set(&upstream_id, vec![UpstreamLineItem::new("L1", "Flute", 3)]);
    let r = engine.reconcile(&order_id).await?;
    assert_eq!((r.mappings_created, r.items_created), (3, 3));

    commerce.set(&upstream_id, vec![UpstreamLineItem::new("L1", "Flute", 5)]);
    let r = engine.reconcile(&order_id).await?;
    assert_eq!((r.mappings_created, r.items_created), (2, 2));

    let again = engine.reconcile(&order_id).await?;
    assert!(!again.has_lifecycle_changes());
    assert_eq!(again.items_refreshed, 0);

    commerce.set(&upstream_id, vec![]);
    assert_eq!(engine.reconcile(&order_id).await?.items_archived, 5);

    commerce.set(&upstream_id, vec![UpstreamLineItem::new("L1", "Flute", 5)]);
    let r = engine.reconcile(&order_id).await?;
    assert_eq!(r.items_reactivated, 5);
    assert_eq!(r.mappings_created, 0);

    let ok = ReconcileRunRecord::from_outcome(&order_id, &Ok(r));
    kiln_db::record_reconcile_run(&pool, &ok).await?;
    commerce.set(&upstream_id, vec![]);
    let missing = engine.reconcile(&unique("nope")).await;
    kiln_db::record_reconcile_run(&pool, &ReconcileRunRecord::from_outcome(&order_id, &missing))
        .await?;

    let runs = kiln_db::recent_runs(&pool, &order_id, 10).await?;
    assert_eq!(runs.len(), 2);
    assert!(runs.iter().any(|r| r.outcome == "FAILED"));
    assert!(runs.iter().any(|r| r.outcome == "OK" && r.items_reactivated == 5));
    Ok(())
}

#[tokio::test]
async fn advisory_lock_excludes_second_holder() -> anyhow::Result<()> {
    let Some(pool) = pool_or_skip().await? else {
        return Ok(());
    };
    let locker = PgAdvisoryLocker::new(pool.clone(), Duration::from_millis(100));
    let order_id = unique("lock");

    let held = locker.lock(&order_id).await?;
    let err = locker.lock(&order_id).await.unwrap_err();
    assert!(matches!(err, LockError::Timeout { .. }), "{err}");

    assert!(locker.lock(&unique("other")).await.is_ok());

    drop(held);
    // Rollback is flushed when the connection returns to the pool.
    let mut reacquired = false;
    for _ in 0..20 {
        if locker.lock(&order_id).await.is_ok() {
            reacquired = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(reacquired);
    Ok(())
}
