//! kiln-schemas
//!
//! Shared data model for the line-item reconciliation engine. Every other
//! crate in the workspace speaks these types; nothing here performs I/O.
//!
//! Identity model:
//!
//! ```text
//! Order (order_number "SW-1000")
//!   └── OrderTrackingState
//!         ├── used_suffixes {1, 2, 3}
//!         └── mappings [ {L1, 1}, {L1, 2}, {L1, 3} ]
//!                          │
//!                          └── LocalItem "SW-1000-1" ...
//! ```

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status written onto a local item when it is archived by reconciliation.
pub const STATUS_ARCHIVED: &str = "archived";

/// `archived_reason` written when a mapping's upstream line item disappears.
pub const ARCHIVED_REASON_ABSENT_UPSTREAM: &str = "absent upstream";

/// Build the externally visible serial number for one physical unit.
pub fn serial_number(order_number: &str, suffix: u32) -> String {
    format!("{order_number}-{suffix}")
}

// ---------------------------------------------------------------------------
// Order (local aggregate root)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    /// Human-facing number, used as the serial-number prefix. Never changes.
    pub order_number: String,
    /// Reference to the order on the commerce platform, if any.
    pub upstream_order_id: Option<String>,
}

impl Order {
    pub fn new(
        order_id: impl Into<String>,
        order_number: impl Into<String>,
        upstream_order_id: Option<String>,
    ) -> Self {
        Self {
            order_id: order_id.into(),
            order_number: order_number.into(),
            upstream_order_id,
        }
    }
}

// ---------------------------------------------------------------------------
// Upstream projection (read-only, fetched fresh per run)
// ---------------------------------------------------------------------------

/// One `name → value` line-item property, in upstream order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItemProperty {
    pub name: String,
    pub value: String,
}

impl LineItemProperty {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamLineItem {
    /// Opaque, stable per line across upstream edits.
    pub upstream_line_item_id: String,
    pub title: String,
    /// Total purchased quantity (>= 1).
    pub quantity: u32,
    /// Units still fulfillable (0..=quantity).
    pub fulfillable_quantity: u32,
    pub properties: Vec<LineItemProperty>,
}

impl UpstreamLineItem {
    /// Convenience constructor: fully fulfillable, no properties.
    pub fn new(id: impl Into<String>, title: impl Into<String>, quantity: u32) -> Self {
        Self {
            upstream_line_item_id: id.into(),
            title: title.into(),
            quantity,
            fulfillable_quantity: quantity,
            properties: Vec::new(),
        }
    }

    pub fn with_fulfillable(mut self, fulfillable_quantity: u32) -> Self {
        self.fulfillable_quantity = fulfillable_quantity;
        self
    }

    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.push(LineItemProperty::new(name, value));
        self
    }

    pub fn is_fulfillable(&self) -> bool {
        self.fulfillable_quantity > 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamOrder {
    pub upstream_order_id: String,
    pub line_items: Vec<UpstreamLineItem>,
}

// ---------------------------------------------------------------------------
// Identity records
// ---------------------------------------------------------------------------

/// Permanent binding between one physical unit and one suffix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemMapping {
    pub upstream_line_item_id: String,
    pub suffix: u32,
    /// Snapshot at allocation time, for diagnostics only.
    pub title: String,
}

impl ItemMapping {
    pub fn new(upstream_line_item_id: impl Into<String>, suffix: u32, title: impl Into<String>) -> Self {
        Self {
            upstream_line_item_id: upstream_line_item_id.into(),
            suffix,
            title: title.into(),
        }
    }
}

/// Why a proposed [`OrderTrackingState`] was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonotonicityViolation {
    /// A previously used suffix is missing from the new state.
    SuffixDropped { suffix: u32 },
    /// A previously persisted mapping is missing from the new state.
    MappingDropped { suffix: u32, upstream_line_item_id: String },
    /// A suffix that was already bound is bound to a different line item.
    SuffixRebound {
        suffix: u32,
        was: String,
        now: String,
    },
    /// Two mappings in the same state share one suffix.
    DuplicateSuffix { suffix: u32 },
    /// A mapping's suffix is absent from `used_suffixes`.
    UnrecordedSuffix { suffix: u32 },
    /// Suffix 0 is never valid.
    NonPositiveSuffix,
    /// Appending a mapping whose suffix is already marked used.
    SuffixAlreadyUsed { suffix: u32 },
}

impl std::fmt::Display for MonotonicityViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MonotonicityViolation::SuffixDropped { suffix } => {
                write!(f, "used suffix {suffix} dropped")
            }
            MonotonicityViolation::MappingDropped {
                suffix,
                upstream_line_item_id,
            } => write!(
                f,
                "mapping suffix={suffix} line_item={upstream_line_item_id} dropped"
            ),
            MonotonicityViolation::SuffixRebound { suffix, was, now } => write!(
                f,
                "suffix {suffix} rebound from line_item={was} to line_item={now}"
            ),
            MonotonicityViolation::DuplicateSuffix { suffix } => {
                write!(f, "suffix {suffix} mapped more than once")
            }
            MonotonicityViolation::UnrecordedSuffix { suffix } => {
                write!(f, "mapping suffix {suffix} missing from used_suffixes")
            }
            MonotonicityViolation::NonPositiveSuffix => write!(f, "suffix must be >= 1"),
            MonotonicityViolation::SuffixAlreadyUsed { suffix } => {
                write!(f, "suffix {suffix} already used")
            }
        }
    }
}

impl std::error::Error for MonotonicityViolation {}

/// Durable per-order record: the single source of truth for suffix identity.
///
/// `used_suffixes` only grows and `mappings` is append-only. Use
/// [`OrderTrackingState::push_mapping`] so a mapping and its suffix are always
/// recorded together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderTrackingState {
    pub order_id: String,
    pub used_suffixes: BTreeSet<u32>,
    pub mappings: Vec<ItemMapping>,
}

impl OrderTrackingState {
    pub fn empty(order_id: impl Into<String>) -> Self {
        Self {
            order_id: order_id.into(),
            used_suffixes: BTreeSet::new(),
            mappings: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.used_suffixes.is_empty() && self.mappings.is_empty()
    }

    pub fn mapping_for_suffix(&self, suffix: u32) -> Option<&ItemMapping> {
        self.mappings.iter().find(|m| m.suffix == suffix)
    }

    pub fn mapped_count(&self, upstream_line_item_id: &str) -> usize {
        self.mappings
            .iter()
            .filter(|m| m.upstream_line_item_id == upstream_line_item_id)
            .count()
    }

    /// Append one mapping and mark its suffix used in the same step.
    pub fn push_mapping(&mut self, mapping: ItemMapping) -> Result<(), MonotonicityViolation> {
        if mapping.suffix == 0 {
            return Err(MonotonicityViolation::NonPositiveSuffix);
        }
        if self.used_suffixes.contains(&mapping.suffix) {
            return Err(MonotonicityViolation::SuffixAlreadyUsed {
                suffix: mapping.suffix,
            });
        }
        self.used_suffixes.insert(mapping.suffix);
        self.mappings.push(mapping);
        Ok(())
    }

    /// Internal consistency: positive, unique suffixes all recorded as used.
    pub fn validate(&self) -> Result<(), MonotonicityViolation> {
        if self.used_suffixes.contains(&0) {
            return Err(MonotonicityViolation::NonPositiveSuffix);
        }
        let mut seen = BTreeSet::new();
        for m in &self.mappings {
            if m.suffix == 0 {
                return Err(MonotonicityViolation::NonPositiveSuffix);
            }
            if !seen.insert(m.suffix) {
                return Err(MonotonicityViolation::DuplicateSuffix { suffix: m.suffix });
            }
            if !self.used_suffixes.contains(&m.suffix) {
                return Err(MonotonicityViolation::UnrecordedSuffix { suffix: m.suffix });
            }
        }
        Ok(())
    }

    /// Check that `self` only adds to `previous`: no suffix dropped, no
    /// mapping dropped, no suffix rebound to another line item.
    pub fn check_superset_of(&self, previous: &OrderTrackingState) -> Result<(), MonotonicityViolation> {
        self.validate()?;

        for suffix in &previous.used_suffixes {
            if !self.used_suffixes.contains(suffix) {
                return Err(MonotonicityViolation::SuffixDropped { suffix: *suffix });
            }
        }

        for prev in &previous.mappings {
            match self.mapping_for_suffix(prev.suffix) {
                None => {
                    return Err(MonotonicityViolation::MappingDropped {
                        suffix: prev.suffix,
                        upstream_line_item_id: prev.upstream_line_item_id.clone(),
                    })
                }
                Some(cur) if cur.upstream_line_item_id != prev.upstream_line_item_id => {
                    return Err(MonotonicityViolation::SuffixRebound {
                        suffix: prev.suffix,
                        was: prev.upstream_line_item_id.clone(),
                        now: cur.upstream_line_item_id.clone(),
                    })
                }
                Some(_) => {}
            }
        }

        // A previously used-but-unmapped suffix must not be claimed later.
        for cur in &self.mappings {
            let newly_mapped = previous.mapping_for_suffix(cur.suffix).is_none();
            if newly_mapped && previous.used_suffixes.contains(&cur.suffix) {
                return Err(MonotonicityViolation::SuffixAlreadyUsed { suffix: cur.suffix });
            }
        }

        Ok(())
    }

    /// Mappings and used suffixes present in `self` but not in `previous`.
    pub fn additions_since(&self, previous: &OrderTrackingState) -> (Vec<ItemMapping>, Vec<u32>) {
        let mappings = self
            .mappings
            .iter()
            .filter(|m| previous.mapping_for_suffix(m.suffix).is_none())
            .cloned()
            .collect();
        let suffixes = self
            .used_suffixes
            .difference(&previous.used_suffixes)
            .copied()
            .collect();
        (mappings, suffixes)
    }
}

// ---------------------------------------------------------------------------
// Local production-tracking record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalItem {
    /// `order_number-suffix`.
    pub serial_number: String,
    pub order_id: String,
    pub upstream_line_item_id: String,
    pub title: String,
    pub item_type: String,
    pub specifications: BTreeMap<String, String>,
    pub is_archived: bool,
    pub archived_reason: Option<String>,
    pub status: String,
}

/// Partial update for [`LocalItem`]. `None` leaves a field untouched.
///
/// `archived_reason` is doubly optional: `Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemPatch {
    pub title: Option<String>,
    pub item_type: Option<String>,
    pub specifications: Option<BTreeMap<String, String>>,
    pub is_archived: Option<bool>,
    pub archived_reason: Option<Option<String>>,
    pub status: Option<String>,
}

impl ItemPatch {
    pub fn is_empty(&self) -> bool {
        self == &ItemPatch::default()
    }

    /// Apply this patch to an in-memory item.
    pub fn apply_to(&self, item: &mut LocalItem) {
        if let Some(t) = &self.title {
            item.title = t.clone();
        }
        if let Some(t) = &self.item_type {
            item.item_type = t.clone();
        }
        if let Some(s) = &self.specifications {
            item.specifications = s.clone();
        }
        if let Some(a) = self.is_archived {
            item.is_archived = a;
        }
        if let Some(r) = &self.archived_reason {
            item.archived_reason = r.clone();
        }
        if let Some(s) = &self.status {
            item.status = s.clone();
        }
    }
}

// ---------------------------------------------------------------------------
// Run summary
// ---------------------------------------------------------------------------

/// Counts produced by one reconciliation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationResult {
    pub order_id: String,
    pub mappings_created: u32,
    pub items_created: u32,
    pub items_reactivated: u32,
    pub items_archived: u32,
    pub items_refreshed: u32,
    pub items_unchanged: u32,
    pub reactivations_suppressed: u32,
    pub finished_at_utc: DateTime<Utc>,
}

impl ReconciliationResult {
    pub fn empty(order_id: impl Into<String>) -> Self {
        Self {
            order_id: order_id.into(),
            mappings_created: 0,
            items_created: 0,
            items_reactivated: 0,
            items_archived: 0,
            items_refreshed: 0,
            items_unchanged: 0,
            reactivations_suppressed: 0,
            finished_at_utc: Utc::now(),
        }
    }

    /// `true` when the run changed identity or lifecycle state.
    /// Metadata refreshes do not count.
    pub fn has_lifecycle_changes(&self) -> bool {
        self.mappings_created > 0
            || self.items_created > 0
            || self.items_reactivated > 0
            || self.items_archived > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with(mappings: &[(&str, u32)]) -> OrderTrackingState {
        let mut st = OrderTrackingState::empty("ord-1");
        for (id, suffix) in mappings {
            st.push_mapping(ItemMapping::new(*id, *suffix, "Flute")).unwrap();
        }
        st
    }

    #[test]
    fn serial_number_joins_with_dash() {
        assert_eq!(serial_number("SW-1000", 3), "SW-1000-3");
    }

    #[test]
    fn push_mapping_records_suffix_and_rejects_reuse() {
        let mut st = state_with(&[("L1", 1)]);
        assert!(st.used_suffixes.contains(&1));

        let err = st.push_mapping(ItemMapping::new("L2", 1, "Drum")).unwrap_err();
        assert_eq!(err, MonotonicityViolation::SuffixAlreadyUsed { suffix: 1 });
        assert_eq!(st.mappings.len(), 1);
    }

    #[test]
    fn push_mapping_rejects_zero() {
        let mut st = OrderTrackingState::empty("ord-1");
        assert_eq!(
            st.push_mapping(ItemMapping::new("L1", 0, "Flute")),
            Err(MonotonicityViolation::NonPositiveSuffix)
        );
    }

    #[test]
    fn superset_accepts_pure_growth() {
        let prev = state_with(&[("L1", 1), ("L1", 2)]);
        let mut next = prev.clone();
        next.push_mapping(ItemMapping::new("L2", 3, "Drum")).unwrap();
        assert!(next.check_superset_of(&prev).is_ok());

        let (added, suffixes) = next.additions_since(&prev);
        assert_eq!(added, vec![ItemMapping::new("L2", 3, "Drum")]);
        assert_eq!(suffixes, vec![3]);
    }

    #[test]
    fn superset_rejects_dropped_mapping() {
        let prev = state_with(&[("L1", 1), ("L1", 2)]);
        let mut next = prev.clone();
        next.mappings.pop();
        assert!(matches!(
            next.check_superset_of(&prev),
            Err(MonotonicityViolation::MappingDropped { suffix: 2, .. })
        ));
    }

    #[test]
    fn superset_rejects_rebinding() {
        let prev = state_with(&[("L1", 1)]);
        let mut next = prev.clone();
        next.mappings[0].upstream_line_item_id = "L9".to_string();
        assert!(matches!(
            next.check_superset_of(&prev),
            Err(MonotonicityViolation::SuffixRebound { suffix: 1, .. })
        ));
    }

    #[test]
    fn superset_rejects_claiming_retired_unmapped_suffix() {
        let mut prev = state_with(&[("L1", 1)]);
        prev.used_suffixes.insert(2);
        let mut next = prev.clone();
        next.mappings.push(ItemMapping::new("L2", 2, "Drum"));
        assert_eq!(
            next.check_superset_of(&prev),
            Err(MonotonicityViolation::SuffixAlreadyUsed { suffix: 2 })
        );
    }

    #[test]
    fn validate_flags_unrecorded_suffix() {
        let mut st = state_with(&[("L1", 1)]);
        st.mappings.push(ItemMapping::new("L1", 5, "Flute"));
        assert_eq!(
            st.validate(),
            Err(MonotonicityViolation::UnrecordedSuffix { suffix: 5 })
        );
    }

    #[test]
    fn patch_clears_archived_reason_with_some_none() {
        let mut item = LocalItem {
            serial_number: "SW-1-1".to_string(),
            order_id: "ord-1".to_string(),
            upstream_line_item_id: "L1".to_string(),
            title: "Flute".to_string(),
            item_type: "Flute".to_string(),
            specifications: BTreeMap::new(),
            is_archived: true,
            archived_reason: Some(ARCHIVED_REASON_ABSENT_UPSTREAM.to_string()),
            status: STATUS_ARCHIVED.to_string(),
        };
        let patch = ItemPatch {
            is_archived: Some(false),
            archived_reason: Some(None),
            status: Some("pending".to_string()),
            ..ItemPatch::default()
        };
        patch.apply_to(&mut item);
        assert!(!item.is_archived);
        assert_eq!(item.archived_reason, None);
        assert_eq!(item.status, "pending");
    }

    #[test]
    fn tracking_state_serde_shape_is_stable() {
        let st = state_with(&[("L1", 1)]);
        let json = serde_json::to_value(&st).unwrap();
        assert_eq!(json["order_id"], "ord-1");
        assert_eq!(json["used_suffixes"], serde_json::json!([1]));
        assert_eq!(json["mappings"][0]["suffix"], 1);
    }
}
