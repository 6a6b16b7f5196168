//! Configurable business rules for item lifecycle decisions.
//!
//! Order- or product-specific exceptions live in configuration
//! (`/reconcile/suppress_reactivation`), not in the decision code.

use kiln_schemas::{Order, UpstreamLineItem};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Injected decisions the item planner cannot make on its own.
pub trait ReconcilePolicy: Send + Sync {
    /// Status for a newly created local item.
    fn initial_status(&self, order: &Order, line_item: &UpstreamLineItem) -> String;

    /// Status an archived item returns to when reactivated.
    fn active_status(&self) -> String;

    /// `true` keeps an archived item archived even though its line item is
    /// back and fulfillable.
    fn should_suppress_reactivation(&self, order: &Order, line_item: &UpstreamLineItem) -> bool;

    /// Namespace prefix stripped from line-item property keys.
    fn property_namespace(&self) -> &str;
}

/// One reactivation-suppression rule. Every present field must match; a rule
/// with no fields never matches.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SuppressionRule {
    pub order_id: Option<String>,
    pub order_number: Option<String>,
    /// Case-insensitive substring of the line-item title.
    pub title_contains: Option<String>,
}

impl SuppressionRule {
    /// Blank and whitespace-only fields count as absent.
    pub fn matches(&self, order: &Order, line_item: &UpstreamLineItem) -> bool {
        let order_id = present(&self.order_id);
        let order_number = present(&self.order_number);
        let needle = present(&self.title_contains);
        if order_id.is_none() && order_number.is_none() && needle.is_none() {
            return false;
        }
        if order_id.is_some_and(|id| id != order.order_id) {
            return false;
        }
        if order_number.is_some_and(|n| n != order.order_number) {
            return false;
        }
        if let Some(needle) = needle {
            let title = line_item.title.to_lowercase();
            if !title.contains(&needle.to_lowercase()) {
                return false;
            }
        }
        true
    }
}

fn present(field: &Option<String>) -> Option<&str> {
    field.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InitialStatus {
    pub fulfillable: String,
    pub unfulfillable: String,
}

impl Default for InitialStatus {
    fn default() -> Self {
        Self {
            fulfillable: "pending".to_string(),
            unfulfillable: "on_hold".to_string(),
        }
    }
}

/// Rule-driven [`ReconcilePolicy`], read from the `/reconcile` config section.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RulePolicy {
    pub initial_status: InitialStatus,
    pub active_status: String,
    pub property_namespace: String,
    pub suppress_reactivation: Vec<SuppressionRule>,
}

impl Default for RulePolicy {
    fn default() -> Self {
        Self {
            initial_status: InitialStatus::default(),
            active_status: "pending".to_string(),
            property_namespace: "_kiln_".to_string(),
            suppress_reactivation: Vec::new(),
        }
    }
}

impl RulePolicy {
    /// Read `/reconcile` from a merged config document. Missing section or
    /// missing keys fall back to defaults.
    pub fn from_config_json(config: &Value) -> Result<Self, serde_json::Error> {
        match config.pointer("/reconcile") {
            Some(v) => serde_json::from_value(v.clone()),
            None => Ok(Self::default()),
        }
    }
}

impl ReconcilePolicy for RulePolicy {
    fn initial_status(&self, _order: &Order, line_item: &UpstreamLineItem) -> String {
        if line_item.is_fulfillable() {
            self.initial_status.fulfillable.clone()
        } else {
            self.initial_status.unfulfillable.clone()
        }
    }

    fn active_status(&self) -> String {
        self.active_status.clone()
    }

    fn should_suppress_reactivation(&self, order: &Order, line_item: &UpstreamLineItem) -> bool {
        self.suppress_reactivation
            .iter()
            .any(|r| r.matches(order, line_item))
    }

    fn property_namespace(&self) -> &str {
        &self.property_namespace
    }
}
