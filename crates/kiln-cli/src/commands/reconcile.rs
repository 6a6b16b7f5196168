//! `kiln reconcile`, `kiln reconcile-all`, `kiln tracking`.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use kiln_commerce::{CommerceConfig, HttpCommerceSource};
use kiln_config::secrets::resolve_commerce_secrets;
use kiln_db::{PgAdvisoryLocker, PgMappingStore, PgOrderStore, ReconcileRunRecord};
use kiln_engine::{
    batch_concurrency_from_config_json, MappingStore, OrderStore, ReconciliationEngine, RetryPolicy,
    RulePolicy,
};
use serde_json::{json, Value};
use sqlx::PgPool;
use tracing::warn;

use super::load_config;

/// Wire the Postgres stores, the advisory locker and the HTTP source.
fn build_engine(pool: &PgPool, config_json: &Value) -> Result<ReconciliationEngine> {
    let commerce_cfg = CommerceConfig::from_config_json(config_json)?;
    let secrets = resolve_commerce_secrets(config_json)?;
    let commerce = HttpCommerceSource::new(commerce_cfg, secrets.access_token)?;
    let policy = RulePolicy::from_config_json(config_json).context("invalid /reconcile section")?;

    Ok(ReconciliationEngine::new(
        Arc::new(commerce),
        Arc::new(PgOrderStore::new(pool.clone())),
        Arc::new(PgMappingStore::new(pool.clone())),
        Arc::new(PgAdvisoryLocker::from_config_json(pool.clone(), config_json)),
        Arc::new(policy),
    )
    .with_batch_concurrency(batch_concurrency_from_config_json(config_json)))
}

/// The run log is best-effort; a failed insert never masks the outcome.
async fn log_run(pool: &PgPool, rec: &ReconcileRunRecord) {
    if let Err(e) = kiln_db::record_reconcile_run(pool, rec).await {
        warn!(order_id = %rec.order_id, error = %format!("{e:#}"), "runs/record_failed");
    }
}

pub async fn run_one(order_id: &str, config_paths: &[String], no_retry: bool) -> Result<()> {
    let loaded = load_config(config_paths)?;
    let pool = kiln_db::connect_from_env().await?;
    let engine = build_engine(&pool, &loaded.config_json)?;
    let retry = if no_retry {
        RetryPolicy::no_retry()
    } else {
        RetryPolicy::from_config_json(&loaded.config_json)
    };

    let outcome = engine.reconcile_with_retry(order_id, &retry).await;
    log_run(&pool, &ReconcileRunRecord::from_outcome(order_id, &outcome)).await;

    match outcome {
        Ok(r) => {
            println!("{}", serde_json::to_string_pretty(&r)?);
            Ok(())
        }
        Err(e) => {
            println!("{}", serde_json::to_string_pretty(&e)?);
            bail!("{e}")
        }
    }
}

pub async fn run_all(config_paths: &[String]) -> Result<()> {
    let loaded = load_config(config_paths)?;
    let pool = kiln_db::connect_from_env().await?;
    let engine = build_engine(&pool, &loaded.config_json)?;
    let retry = RetryPolicy::from_config_json(&loaded.config_json);

    let order_ids = kiln_db::list_orders_with_upstream(&pool).await?;
    let outcomes = engine.reconcile_many(&order_ids, &retry).await;

    let mut failed = 0usize;
    for o in &outcomes {
        log_run(&pool, &ReconcileRunRecord::from_outcome(&o.order_id, &o.result)).await;
        match &o.result {
            Ok(r) => println!(
                "order_id={} ok=true mappings_created={} items_created={} items_reactivated={} items_archived={} items_refreshed={}",
                o.order_id,
                r.mappings_created,
                r.items_created,
                r.items_reactivated,
                r.items_archived,
                r.items_refreshed
            ),
            Err(e) => {
                failed += 1;
                println!("order_id={} ok=false error={}", o.order_id, e.kind);
            }
        }
    }
    println!("orders={} failed={}", outcomes.len(), failed);

    if failed > 0 {
        bail!("{failed} of {} order(s) failed to reconcile", outcomes.len());
    }
    Ok(())
}

pub async fn tracking(order_id: &str) -> Result<()> {
    let pool = kiln_db::connect_from_env().await?;
    let state = PgMappingStore::new(pool.clone())
        .load(order_id)
        .await
        .map_err(|e| anyhow::anyhow!("load tracking state: {e}"))?;
    let items = PgOrderStore::new(pool)
        .get_order_items(order_id)
        .await
        .map_err(|e| anyhow::anyhow!("load local items: {e}"))?;

    let out = json!({
        "state": state,
        "items": items,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}
