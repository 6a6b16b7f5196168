use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use kiln_engine::{CommerceError, CommerceSource, MappingStore, OrderStore, StoreError};
use kiln_schemas::{
    ItemPatch, LocalItem, Order, OrderTrackingState, UpstreamLineItem, UpstreamOrder,
};

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

// ---------------------------------------------------------------------------
// Journal
// ---------------------------------------------------------------------------

/// Ordered log of durable effects shared by all fakes in one harness.
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn record(&self, entry: impl Into<String>) {
        locked(&self.0).push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        locked(&self.0).clone()
    }

    pub fn clear(&self) {
        locked(&self.0).clear();
    }

    pub fn position(&self, prefix: &str) -> Option<usize> {
        locked(&self.0).iter().position(|e| e.starts_with(prefix))
    }
}

// ---------------------------------------------------------------------------
// Commerce
// ---------------------------------------------------------------------------

/// Upstream platform double keyed by upstream order id.
#[derive(Default)]
pub struct FakeCommerce {
    orders: Mutex<HashMap<String, UpstreamOrder>>,
    fail_next: Mutex<VecDeque<CommerceError>>,
    delay: Mutex<Option<Duration>>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeCommerce {
    pub fn set_line_items(&self, upstream_order_id: &str, line_items: Vec<UpstreamLineItem>) {
        locked(&self.orders).insert(
            upstream_order_id.to_string(),
            UpstreamOrder {
                upstream_order_id: upstream_order_id.to_string(),
                line_items,
            },
        );
    }

    pub fn remove_order(&self, upstream_order_id: &str) {
        locked(&self.orders).remove(upstream_order_id);
    }

    /// Queue one error per future call, consumed front to back.
    pub fn fail_next(&self, err: CommerceError) {
        locked(&self.fail_next).push_back(err);
    }

    /// Every fetch sleeps this long before answering.
    pub fn set_delay(&self, delay: Duration) {
        *locked(&self.delay) = Some(delay);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of fetches observed in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CommerceSource for FakeCommerce {
    async fn fetch_order(&self, upstream_order_id: &str) -> Result<UpstreamOrder, CommerceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = *locked(&self.delay);
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }

        let out = match locked(&self.fail_next).pop_front() {
            Some(err) => Err(err),
            None => locked(&self.orders)
                .get(upstream_order_id)
                .cloned()
                .ok_or(CommerceError::NotFound),
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        out
    }
}

// ---------------------------------------------------------------------------
// Order store
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryOrderStore {
    orders: Mutex<HashMap<String, Order>>,
    items: Mutex<BTreeMap<String, LocalItem>>,
    fail_reads: Mutex<VecDeque<StoreError>>,
    /// Remaining successful writes before every write fails.
    writes_left: Mutex<Option<usize>>,
    journal: Journal,
}

impl MemoryOrderStore {
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            ..Self::default()
        }
    }

    pub fn insert_order(&self, order: Order) {
        locked(&self.orders).insert(order.order_id.clone(), order);
    }

    pub fn item(&self, serial_number: &str) -> Option<LocalItem> {
        locked(&self.items).get(serial_number).cloned()
    }

    pub fn items(&self) -> Vec<LocalItem> {
        locked(&self.items).values().cloned().collect()
    }

    /// Overwrite an item directly, bypassing the engine (operator edits).
    pub fn put_item(&self, item: LocalItem) {
        locked(&self.items).insert(item.serial_number.clone(), item);
    }

    pub fn fail_next_read(&self, err: StoreError) {
        locked(&self.fail_reads).push_back(err);
    }

    /// Allow `n` more item writes, then fail every write until cleared.
    pub fn fail_writes_after(&self, n: usize) {
        *locked(&self.writes_left) = Some(n);
    }

    pub fn clear_write_faults(&self) {
        *locked(&self.writes_left) = None;
    }

    fn check_read(&self) -> Result<(), StoreError> {
        match locked(&self.fail_reads).pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn check_write(&self) -> Result<(), StoreError> {
        let mut left = locked(&self.writes_left);
        match left.as_mut() {
            Some(0) => Err(StoreError::WriteFailed("injected item write failure".to_string())),
            Some(n) => {
                *n -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
impl OrderStore for MemoryOrderStore {
    async fn get_order(&self, order_id: &str) -> Result<Option<Order>, StoreError> {
        self.check_read()?;
        Ok(locked(&self.orders).get(order_id).cloned())
    }

    async fn get_order_items(&self, order_id: &str) -> Result<Vec<LocalItem>, StoreError> {
        self.check_read()?;
        Ok(locked(&self.items)
            .values()
            .filter(|i| i.order_id == order_id)
            .cloned()
            .collect())
    }

    async fn create_item(&self, item: &LocalItem) -> Result<(), StoreError> {
        self.check_write()?;
        let mut items = locked(&self.items);
        if items.contains_key(&item.serial_number) {
            return Err(StoreError::InvariantViolation(format!(
                "serial number {} already exists",
                item.serial_number
            )));
        }
        items.insert(item.serial_number.clone(), item.clone());
        self.journal.record(format!("create {}", item.serial_number));
        Ok(())
    }

    async fn update_item(&self, serial_number: &str, patch: &ItemPatch) -> Result<(), StoreError> {
        self.check_write()?;
        let mut items = locked(&self.items);
        let item = items
            .get_mut(serial_number)
            .ok_or_else(|| StoreError::WriteFailed(format!("no item {serial_number}")))?;
        patch.apply_to(item);
        self.journal.record(format!("update {serial_number}"));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Mapping store
// ---------------------------------------------------------------------------

/// Enforces monotonic saves the same way the Postgres store does.
#[derive(Default)]
pub struct MemoryMappingStore {
    states: Mutex<HashMap<String, OrderTrackingState>>,
    fail_saves: Mutex<VecDeque<StoreError>>,
    saves: AtomicUsize,
    journal: Journal,
}

impl MemoryMappingStore {
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            ..Self::default()
        }
    }

    pub fn state(&self, order_id: &str) -> OrderTrackingState {
        locked(&self.states)
            .get(order_id)
            .cloned()
            .unwrap_or_else(|| OrderTrackingState::empty(order_id))
    }

    /// Replace the stored state without any check (seed or corrupt data).
    pub fn put_state(&self, state: OrderTrackingState) {
        locked(&self.states).insert(state.order_id.clone(), state);
    }

    pub fn fail_next_save(&self, err: StoreError) {
        locked(&self.fail_saves).push_back(err);
    }

    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MappingStore for MemoryMappingStore {
    async fn load(&self, order_id: &str) -> Result<OrderTrackingState, StoreError> {
        Ok(self.state(order_id))
    }

    async fn save(&self, order_id: &str, state: &OrderTrackingState) -> Result<(), StoreError> {
        if let Some(err) = locked(&self.fail_saves).pop_front() {
            return Err(err);
        }
        let mut states = locked(&self.states);
        let previous = states
            .get(order_id)
            .cloned()
            .unwrap_or_else(|| OrderTrackingState::empty(order_id));
        state
            .check_superset_of(&previous)
            .map_err(|v| StoreError::InvariantViolation(v.to_string()))?;
        states.insert(order_id.to_string(), state.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.journal
            .record(format!("save {order_id} suffixes={}", state.used_suffixes.len()));
        Ok(())
    }
}
