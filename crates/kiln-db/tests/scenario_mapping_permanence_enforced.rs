//! Scenario: Mapping Permanence Enforced By The Database
//!
//! # Invariants under test
//!
//! 1. Loading an order with no record yields an empty state.
//! 2. A saved state round-trips exactly.
//! 3. A save that drops or rebinds a mapping is refused as
//!    `InvariantViolation` and nothing is written.
//! 4. Raw UPDATE / DELETE on `item_mappings` and `order_used_suffixes` are
//!    rejected by triggers, whoever issues them.
//! 5. `order_number` cannot change after registration.
//!
//! DB-backed; skipped if KILN_DATABASE_URL is not set.

use chrono::Utc;
use kiln_engine::{MappingStore, StoreError};
use kiln_schemas::{ItemMapping, Order, OrderTrackingState};
use sqlx::PgPool;

async fn pool_or_skip() -> anyhow::Result<Option<PgPool>> {
    let url = match std::env::var(kiln_db::ENV_DB_URL) {
        Ok(v) => v,
        Err(_) => {
            eprintln!("SKIP: KILN_DATABASE_URL not set");
            return Ok(None);
        }
    };
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(4)
        .connect(&url)
        .await?;
    kiln_db::migrate(&pool).await?;
    Ok(Some(pool))
}

async fn fresh_order(pool: &PgPool, tag: &str) -> anyhow::Result<Order> {
    let n = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let order = Order::new(
        format!("perm-{tag}-{n}"),
        format!("SW-{tag}-{n}"),
        Some(format!("up-{n}")),
    );
    kiln_db::upsert_order(pool, &order).await?;
    Ok(order)
}

fn state(order_id: &str, mappings: &[(&str, u32)]) -> OrderTrackingState {
    let mut st = OrderTrackingState::empty(order_id);
    for (id, suffix) in mappings {
        st.push_mapping(ItemMapping::new(*id, *suffix, "Flute")).unwrap();
    }
    st
}

#[tokio::test]
async fn save_and_load_round_trip() -> anyhow::Result<()> {
    let Some(pool) = pool_or_skip().await? else {
        return Ok(());
    };
    let order = fresh_order(&pool, "rt").await?;
    let store = kiln_db::PgMappingStore::new(pool.clone());

    assert!(store.load(&order.order_id).await?.is_empty());

    let st = state(&order.order_id, &[("L1", 1), ("L1", 2), ("L2", 3)]);
    store.save(&order.order_id, &st).await?;
    assert_eq!(store.load(&order.order_id).await?, st);

    // Saving the same state again is a no-op.
    store.save(&order.order_id, &st).await?;
    assert_eq!(store.load(&order.order_id).await?, st);
    Ok(())
}

#[tokio::test]
async fn non_monotonic_save_is_refused() -> anyhow::Result<()> {
    let Some(pool) = pool_or_skip().await? else {
        return Ok(());
    };
    let order = fresh_order(&pool, "mono").await?;
    let store = kiln_db::PgMappingStore::new(pool.clone());
    let st = state(&order.order_id, &[("L1", 1), ("L1", 2)]);
    store.save(&order.order_id, &st).await?;

    let dropped = state(&order.order_id, &[("L1", 1)]);
    let err = store.save(&order.order_id, &dropped).await.unwrap_err();
    assert!(matches!(err, StoreError::InvariantViolation(_)), "{err}");

    let mut rebound = st.clone();
    rebound.mappings[1].upstream_line_item_id = "L9".to_string();
    rebound.push_mapping(ItemMapping::new("L3", 3, "Drum")).unwrap();
    let err = store.save(&order.order_id, &rebound).await.unwrap_err();
    assert!(matches!(err, StoreError::InvariantViolation(_)), "{err}");

    assert_eq!(store.load(&order.order_id).await?, st, "nothing written");
    Ok(())
}

#[tokio::test]
async fn triggers_block_update_and_delete() -> anyhow::Result<()> {
    let Some(pool) = pool_or_skip().await? else {
        return Ok(());
    };
    let order = fresh_order(&pool, "trg").await?;
    let store = kiln_db::PgMappingStore::new(pool.clone());
    store
        .save(&order.order_id, &state(&order.order_id, &[("L1", 1)]))
        .await?;

    let upd = sqlx::query("update item_mappings set upstream_line_item_id = 'L9' where order_id = $1")
        .bind(&order.order_id)
        .execute(&pool)
        .await;
    assert!(upd.is_err(), "update must be rejected");

    let del = sqlx::query("delete from order_used_suffixes where order_id = $1")
        .bind(&order.order_id)
        .execute(&pool)
        .await;
    assert!(del.is_err(), "delete must be rejected");

    let renumber = kiln_db::upsert_order(
        &pool,
        &Order::new(order.order_id.clone(), "SW-RENUMBERED", order.upstream_order_id.clone()),
    )
    .await;
    assert!(renumber.is_err(), "order_number must be fixed");

    assert_eq!(store.load(&order.order_id).await?.mappings.len(), 1);
    Ok(())
}
