use std::collections::{BTreeMap, BTreeSet};

use kiln_schemas::{
    serial_number, ItemMapping, ItemPatch, LocalItem, MonotonicityViolation, Order,
    OrderTrackingState, UpstreamLineItem, ARCHIVED_REASON_ABSENT_UPSTREAM, STATUS_ARCHIVED,
};

use crate::matcher::compute_shortfall;
use crate::policy::ReconcilePolicy;
use crate::specs::{derive_metadata, merge_specifications};
use crate::suffix::next_free_suffix;

// ---------------------------------------------------------------------------
// Allocation
// ---------------------------------------------------------------------------

/// Result of allocating suffixes for every unit that lacks one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AllocationPlan {
    /// Previous state plus `new_mappings`.
    pub next_state: OrderTrackingState,
    /// Mappings added by this plan, in allocation order.
    pub new_mappings: Vec<ItemMapping>,
}

impl AllocationPlan {
    pub fn is_noop(&self) -> bool {
        self.new_mappings.is_empty()
    }
}

/// Allocate suffixes for every upstream unit that has no mapping yet.
///
/// Line items are visited in upstream order. Each allocation is recorded in
/// the working state before the next suffix is computed, so one plan never
/// hands out the same suffix twice.
pub fn plan_allocations(
    state: &OrderTrackingState,
    line_items: &[UpstreamLineItem],
) -> Result<AllocationPlan, MonotonicityViolation> {
    let shortfall = compute_shortfall(line_items, &state.mappings);

    let mut next_state = state.clone();
    let mut new_mappings = Vec::new();
    let mut visited: BTreeSet<&str> = BTreeSet::new();

    for li in line_items {
        let id = li.upstream_line_item_id.as_str();
        if !visited.insert(id) {
            continue;
        }
        let needed = shortfall.get(id).copied().unwrap_or(0);
        for _ in 0..needed {
            let suffix = next_free_suffix(&next_state.used_suffixes);
            let mapping = ItemMapping::new(id, suffix, li.title.clone());
            next_state.push_mapping(mapping.clone())?;
            new_mappings.push(mapping);
        }
    }

    Ok(AllocationPlan {
        next_state,
        new_mappings,
    })
}

// ---------------------------------------------------------------------------
// Item lifecycle
// ---------------------------------------------------------------------------

/// One mutation against the local item store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ItemAction {
    Create(LocalItem),
    Archive { serial_number: String, patch: ItemPatch },
    Reactivate { serial_number: String, patch: ItemPatch },
    Refresh { serial_number: String, patch: ItemPatch },
}

impl ItemAction {
    pub fn serial_number(&self) -> &str {
        match self {
            ItemAction::Create(item) => &item.serial_number,
            ItemAction::Archive { serial_number, .. }
            | ItemAction::Reactivate { serial_number, .. }
            | ItemAction::Refresh { serial_number, .. } => serial_number,
        }
    }
}

/// Every action for one run, in suffix order, plus the no-op tallies.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ItemPlan {
    pub actions: Vec<ItemAction>,
    pub unchanged: u32,
    /// Serial numbers whose reactivation the policy suppressed.
    pub suppressed: Vec<String>,
}

impl ItemPlan {
    pub fn count(&self, pred: impl Fn(&ItemAction) -> bool) -> u32 {
        self.actions.iter().filter(|a| pred(a)).count() as u32
    }
}

/// Decide the fate of the local item behind every mapping.
///
/// `existing` is keyed by serial number. Mappings are visited in suffix order.
///
/// | upstream line | local item            | action                         |
/// |---------------|-----------------------|--------------------------------|
/// | absent        | active                | archive ("absent upstream")    |
/// | absent        | archived / none       | nothing                        |
/// | present       | none                  | create                         |
/// | present       | archived, fulfillable | reactivate (unless suppressed) |
/// | present       | archived, not fulf.   | nothing                        |
/// | present       | active                | refresh metadata if changed    |
pub fn plan_item_actions(
    order: &Order,
    state: &OrderTrackingState,
    line_items: &[UpstreamLineItem],
    existing: &BTreeMap<String, LocalItem>,
    policy: &dyn ReconcilePolicy,
) -> ItemPlan {
    // First occurrence wins for repeated ids; quantities were summed upstream
    // of this point, metadata comes from the first line.
    let mut by_id: BTreeMap<&str, &UpstreamLineItem> = BTreeMap::new();
    for li in line_items {
        by_id.entry(li.upstream_line_item_id.as_str()).or_insert(li);
    }

    let mut mappings: Vec<&ItemMapping> = state.mappings.iter().collect();
    mappings.sort_by_key(|m| m.suffix);

    let mut plan = ItemPlan::default();
    let namespace = policy.property_namespace();

    for m in mappings {
        let serial = serial_number(&order.order_number, m.suffix);
        let upstream = by_id.get(m.upstream_line_item_id.as_str()).copied();
        let local = existing.get(&serial);

        match (upstream, local) {
            (None, Some(item)) if !item.is_archived => {
                plan.actions.push(ItemAction::Archive {
                    serial_number: serial,
                    patch: ItemPatch {
                        is_archived: Some(true),
                        archived_reason: Some(Some(ARCHIVED_REASON_ABSENT_UPSTREAM.to_string())),
                        status: Some(STATUS_ARCHIVED.to_string()),
                        ..ItemPatch::default()
                    },
                });
            }
            (None, _) => plan.unchanged += 1,

            (Some(li), None) => {
                let meta = derive_metadata(li, namespace);
                plan.actions.push(ItemAction::Create(LocalItem {
                    serial_number: serial,
                    order_id: order.order_id.clone(),
                    upstream_line_item_id: m.upstream_line_item_id.clone(),
                    title: meta.title,
                    item_type: meta.item_type,
                    specifications: meta.specifications,
                    is_archived: false,
                    archived_reason: None,
                    status: policy.initial_status(order, li),
                }));
            }

            (Some(li), Some(item)) if item.is_archived => {
                if !li.is_fulfillable() {
                    plan.unchanged += 1;
                } else if policy.should_suppress_reactivation(order, li) {
                    plan.suppressed.push(serial);
                } else {
                    let mut patch = metadata_patch(item, li, namespace);
                    patch.is_archived = Some(false);
                    patch.archived_reason = Some(None);
                    patch.status = Some(policy.active_status());
                    plan.actions.push(ItemAction::Reactivate {
                        serial_number: serial,
                        patch,
                    });
                }
            }

            (Some(li), Some(item)) => {
                let patch = metadata_patch(item, li, namespace);
                if patch.is_empty() {
                    plan.unchanged += 1;
                } else {
                    plan.actions.push(ItemAction::Refresh {
                        serial_number: serial,
                        patch,
                    });
                }
            }
        }
    }

    plan
}

/// Metadata fields that differ after merging the latest snapshot. Lifecycle
/// fields (`is_archived`, `status`, `archived_reason`) are never touched here.
fn metadata_patch(item: &LocalItem, li: &UpstreamLineItem, namespace: &str) -> ItemPatch {
    let meta = derive_metadata(li, namespace);
    let merged = merge_specifications(&item.specifications, &meta.specifications);

    let mut patch = ItemPatch::default();
    if item.title != meta.title {
        patch.title = Some(meta.title);
    }
    if item.item_type != meta.item_type {
        patch.item_type = Some(meta.item_type);
    }
    if item.specifications != merged {
        patch.specifications = Some(merged);
    }
    patch
}
