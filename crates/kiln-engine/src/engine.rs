use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use kiln_reconcile::{plan_allocations, plan_item_actions, ItemAction, ReconcilePolicy};
use kiln_schemas::{LocalItem, ReconciliationResult};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::collaborators::{CommerceSource, MappingStore, OrderStore};
use crate::error::{ReconcileError, ReconcileErrorKind, ReconcileStep};
use crate::lock::OrderLocker;
use crate::retry::RetryPolicy;

/// Orders reconciled at once by [`ReconciliationEngine::reconcile_many`].
pub const DEFAULT_BATCH_CONCURRENCY: usize = 4;

/// `/reconcile/batch_concurrency`, at least 1.
///
/// A Postgres-backed run holds one pooled connection for its lock and needs
/// another for each store call, so this must stay below half the pool size.
pub fn batch_concurrency_from_config_json(config: &Value) -> usize {
    config
        .pointer("/reconcile/batch_concurrency")
        .and_then(Value::as_u64)
        .map(|n| n.clamp(1, 1024) as usize)
        .unwrap_or(DEFAULT_BATCH_CONCURRENCY)
}

/// One order's outcome inside [`ReconciliationEngine::reconcile_many`].
#[derive(Debug)]
pub struct BatchOutcome {
    pub order_id: String,
    pub result: Result<ReconciliationResult, ReconcileError>,
}

/// Single entry point for reconciling one order against its upstream
/// counterpart.
#[derive(Clone)]
pub struct ReconciliationEngine {
    commerce: Arc<dyn CommerceSource>,
    orders: Arc<dyn OrderStore>,
    mappings: Arc<dyn MappingStore>,
    locker: Arc<dyn OrderLocker>,
    policy: Arc<dyn ReconcilePolicy>,
    batch_concurrency: usize,
}

impl ReconciliationEngine {
    pub fn new(
        commerce: Arc<dyn CommerceSource>,
        orders: Arc<dyn OrderStore>,
        mappings: Arc<dyn MappingStore>,
        locker: Arc<dyn OrderLocker>,
        policy: Arc<dyn ReconcilePolicy>,
    ) -> Self {
        Self {
            commerce,
            orders,
            mappings,
            locker,
            policy,
            batch_concurrency: DEFAULT_BATCH_CONCURRENCY,
        }
    }

    /// Cap on orders in flight inside [`reconcile_many`](Self::reconcile_many).
    pub fn with_batch_concurrency(mut self, n: usize) -> Self {
        self.batch_concurrency = n.max(1);
        self
    }

    pub fn batch_concurrency(&self) -> usize {
        self.batch_concurrency
    }

    /// Run one reconciliation pass for `order_id` under its per-order lock.
    ///
    /// Fails with no side effects up to and including `allocate`. A failure
    /// at `persist_mappings` leaves the stored state untouched. A failure
    /// after it leaves durable mappings with some item mutations pending;
    /// the next run completes them.
    pub async fn reconcile(&self, order_id: &str) -> Result<ReconciliationResult, ReconcileError> {
        let outcome = self.reconcile_locked(order_id).await;
        match &outcome {
            Ok(r) => info!(
                order_id,
                mappings_created = r.mappings_created,
                items_created = r.items_created,
                items_reactivated = r.items_reactivated,
                items_archived = r.items_archived,
                items_refreshed = r.items_refreshed,
                items_unchanged = r.items_unchanged,
                reactivations_suppressed = r.reactivations_suppressed,
                "reconcile/completed"
            ),
            Err(e) if matches!(e.kind, ReconcileErrorKind::InvariantViolation(_)) => {
                error!(order_id, step = %e.step, error = %e.kind, "reconcile/invariant_violation")
            }
            Err(e) => warn!(order_id, step = %e.step, error = %e.kind, "reconcile/failed"),
        }
        outcome
    }

    async fn reconcile_locked(&self, order_id: &str) -> Result<ReconciliationResult, ReconcileError> {
        let _guard = self
            .locker
            .lock(order_id)
            .await
            .map_err(|e| ReconcileError::lock(order_id, e))?;

        // 1. Fetch
        let order = self
            .orders
            .get_order(order_id)
            .await
            .map_err(|e| ReconcileError::store(order_id, ReconcileStep::LoadOrder, e))?
            .ok_or_else(|| {
                ReconcileError::new(
                    order_id,
                    ReconcileStep::LoadOrder,
                    ReconcileErrorKind::LocalOrderNotFound,
                )
            })?;

        let upstream_id = order.upstream_order_id.as_deref().ok_or_else(|| {
            ReconcileError::new(
                order_id,
                ReconcileStep::FetchUpstream,
                ReconcileErrorKind::UpstreamOrderNotFound,
            )
        })?;
        let upstream = self
            .commerce
            .fetch_order(upstream_id)
            .await
            .map_err(|e| ReconcileError::commerce(order_id, e))?;

        // 2. Load state
        let state = self
            .mappings
            .load(order_id)
            .await
            .map_err(|e| ReconcileError::store(order_id, ReconcileStep::LoadState, e))?;
        state
            .validate()
            .map_err(|v| ReconcileError::invariant(order_id, ReconcileStep::LoadState, v))?;

        // 3. Allocate
        let alloc = plan_allocations(&state, &upstream.line_items)
            .map_err(|v| ReconcileError::invariant(order_id, ReconcileStep::Allocate, v))?;

        // 4. Persist before any item mutation.
        if !alloc.is_noop() {
            alloc
                .next_state
                .check_superset_of(&state)
                .map_err(|v| ReconcileError::invariant(order_id, ReconcileStep::PersistMappings, v))?;
            self.mappings
                .save(order_id, &alloc.next_state)
                .await
                .map_err(|e| ReconcileError::store(order_id, ReconcileStep::PersistMappings, e))?;
            for m in &alloc.new_mappings {
                debug!(order_id, suffix = m.suffix, line_item = %m.upstream_line_item_id, "mapping/allocated");
            }
        }

        // 5. Local items
        let existing: BTreeMap<String, LocalItem> = self
            .orders
            .get_order_items(order_id)
            .await
            .map_err(|e| ReconcileError::store(order_id, ReconcileStep::LoadItems, e))?
            .into_iter()
            .map(|i| (i.serial_number.clone(), i))
            .collect();

        let plan = plan_item_actions(
            &order,
            &alloc.next_state,
            &upstream.line_items,
            &existing,
            self.policy.as_ref(),
        );

        let mut result = ReconciliationResult::empty(order_id);
        result.mappings_created = alloc.new_mappings.len() as u32;
        result.items_unchanged = plan.unchanged;
        result.reactivations_suppressed = plan.suppressed.len() as u32;
        for serial in &plan.suppressed {
            info!(order_id, serial_number = %serial, "item/reactivation_suppressed");
        }

        for action in &plan.actions {
            let applied = match action {
                ItemAction::Create(item) => {
                    result.items_created += 1;
                    self.orders.create_item(item).await
                }
                ItemAction::Archive { serial_number, patch } => {
                    result.items_archived += 1;
                    self.orders.update_item(serial_number, patch).await
                }
                ItemAction::Reactivate { serial_number, patch } => {
                    result.items_reactivated += 1;
                    self.orders.update_item(serial_number, patch).await
                }
                ItemAction::Refresh { serial_number, patch } => {
                    result.items_refreshed += 1;
                    self.orders.update_item(serial_number, patch).await
                }
            };
            applied.map_err(|e| ReconcileError::store(order_id, ReconcileStep::ApplyItems, e))?;
            debug!(order_id, serial_number = action.serial_number(), "item/applied");
        }

        // 6. Return
        result.finished_at_utc = Utc::now();
        Ok(result)
    }

    /// [`reconcile`](Self::reconcile), retrying retryable failures with
    /// exponential backoff. Permanent failures return at once.
    pub async fn reconcile_with_retry(
        &self,
        order_id: &str,
        retry: &RetryPolicy,
    ) -> Result<ReconciliationResult, ReconcileError> {
        let max = retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.reconcile(order_id).await {
                Ok(r) => return Ok(r),
                Err(e) if e.is_retryable() && attempt < max => {
                    let delay = retry.backoff_for(attempt);
                    warn!(
                        order_id,
                        attempt,
                        max_attempts = max,
                        delay_ms = delay.as_millis() as u64,
                        "reconcile/retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Reconcile several orders, at most `batch_concurrency` at a time. Each
    /// order takes its own lock; one failure does not stop the others.
    /// Outcomes keep input order.
    pub async fn reconcile_many(&self, order_ids: &[String], retry: &RetryPolicy) -> Vec<BatchOutcome> {
        let futs: Vec<_> = order_ids
            .iter()
            .map(|id| async move {
                BatchOutcome {
                    order_id: id.clone(),
                    result: self.reconcile_with_retry(id, retry).await,
                }
            })
            .collect();
        stream::iter(futs)
            .buffered(self.batch_concurrency)
            .collect()
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn batch_concurrency_reads_config_and_clamps() {
        let cfg = json!({ "reconcile": { "batch_concurrency": 2 } });
        assert_eq!(batch_concurrency_from_config_json(&cfg), 2);

        let zero = json!({ "reconcile": { "batch_concurrency": 0 } });
        assert_eq!(batch_concurrency_from_config_json(&zero), 1);

        assert_eq!(batch_concurrency_from_config_json(&json!({})), DEFAULT_BATCH_CONCURRENCY);
    }
}
