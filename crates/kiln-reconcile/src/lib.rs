//! kiln-reconcile
//!
//! Line-item reconciliation: the pure half of the engine.
//!
//! - Suffix allocation: smallest positive integer not yet used by the order.
//! - Shortfall: purchased quantity minus already-mapped units, per line item.
//! - Allocation plan: new mappings appended against a growing used-suffix set.
//! - Item plan: create / archive / reactivate / refresh decisions per mapping.
//!
//! Deterministic, pure logic. No IO. No store or commerce calls.

mod matcher;
mod plan;
mod policy;
mod specs;
mod suffix;

pub use matcher::compute_shortfall;
pub use plan::{plan_allocations, plan_item_actions, AllocationPlan, ItemAction, ItemPlan};
pub use policy::{ReconcilePolicy, RulePolicy, SuppressionRule};
pub use specs::{
    derive_item_type, derive_metadata, derive_specifications, merge_specifications,
    strip_namespace, ItemMetadata,
};
pub use suffix::next_free_suffix;
