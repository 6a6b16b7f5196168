use std::sync::Arc;
use std::time::Duration;

use kiln_engine::{
    InProcessOrderLocks, OrderLocker, ReconcileError, ReconcilePolicy, ReconciliationEngine,
    RulePolicy,
};
use kiln_schemas::{Order, ReconciliationResult, UpstreamLineItem};

use crate::fakes::{FakeCommerce, Journal, MemoryMappingStore, MemoryOrderStore};

/// Shorthand for a fully fulfillable upstream line.
pub fn line(id: &str, title: &str, quantity: u32) -> UpstreamLineItem {
    UpstreamLineItem::new(id, title, quantity)
}

/// A real engine over in-memory collaborators.
pub struct Harness {
    pub commerce: Arc<FakeCommerce>,
    pub orders: Arc<MemoryOrderStore>,
    pub mappings: Arc<MemoryMappingStore>,
    pub locks: Arc<InProcessOrderLocks>,
    pub journal: Journal,
    pub engine: ReconciliationEngine,
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::with_policy(RulePolicy::default())
    }

    pub fn with_policy(policy: impl ReconcilePolicy + 'static) -> Self {
        Self::build(Arc::new(policy), Duration::from_secs(5))
    }

    pub fn with_lock_timeout(timeout: Duration) -> Self {
        Self::build(Arc::new(RulePolicy::default()), timeout)
    }

    fn build(policy: Arc<dyn ReconcilePolicy>, lock_timeout: Duration) -> Self {
        let journal = Journal::default();
        let commerce = Arc::new(FakeCommerce::default());
        let orders = Arc::new(MemoryOrderStore::new(journal.clone()));
        let mappings = Arc::new(MemoryMappingStore::new(journal.clone()));
        let locks = Arc::new(InProcessOrderLocks::new(lock_timeout));
        let engine = ReconciliationEngine::new(
            commerce.clone(),
            orders.clone(),
            mappings.clone(),
            locks.clone() as Arc<dyn OrderLocker>,
            policy,
        );
        Self {
            commerce,
            orders,
            mappings,
            locks,
            journal,
            engine,
        }
    }

    /// Register a local order `order_id` / `order_number` linked to
    /// upstream order `up-{order_id}`, with the given upstream lines.
    pub fn seed_order(&self, order_id: &str, order_number: &str, lines: Vec<UpstreamLineItem>) {
        let upstream_id = format!("up-{order_id}");
        self.orders
            .insert_order(Order::new(order_id, order_number, Some(upstream_id.clone())));
        self.commerce.set_line_items(&upstream_id, lines);
    }

    /// Replace the upstream lines of an order seeded with [`seed_order`](Self::seed_order).
    pub fn set_upstream(&self, order_id: &str, lines: Vec<UpstreamLineItem>) {
        self.commerce.set_line_items(&format!("up-{order_id}"), lines);
    }

    pub async fn reconcile(&self, order_id: &str) -> Result<ReconciliationResult, ReconcileError> {
        self.engine.reconcile(order_id).await
    }

    /// Serial numbers of the order's items, sorted by suffix.
    pub fn serials(&self, order_id: &str) -> Vec<String> {
        let mut state: Vec<(u32, String)> = self
            .orders
            .items()
            .into_iter()
            .filter(|i| i.order_id == order_id)
            .filter_map(|i| {
                let suffix = i.serial_number.rsplit('-').next()?.parse().ok()?;
                Some((suffix, i.serial_number))
            })
            .collect();
        state.sort();
        state.into_iter().map(|(_, s)| s).collect()
    }
}
