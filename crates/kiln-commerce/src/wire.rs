//! Response shapes of the Admin REST order endpoint.
//!
//! Ids arrive as JSON numbers on REST and as strings on some proxies;
//! property values can be strings, numbers or null. Both are normalized to
//! strings here so the engine only sees opaque text.

use anyhow::{bail, Result};
use kiln_schemas::{LineItemProperty, UpstreamLineItem, UpstreamOrder};
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Deserialize)]
pub(crate) struct OrderEnvelope {
    order: WireOrder,
}

#[derive(Debug, Deserialize)]
struct WireOrder {
    id: Value,
    #[serde(default)]
    line_items: Vec<WireLineItem>,
}

#[derive(Debug, Deserialize)]
struct WireLineItem {
    id: Value,
    #[serde(default)]
    title: String,
    #[serde(default)]
    variant_title: Option<String>,
    quantity: u32,
    /// Quantity after order edits; absent on older API versions.
    #[serde(default)]
    current_quantity: Option<u32>,
    #[serde(default)]
    fulfillable_quantity: Option<u32>,
    #[serde(default)]
    properties: Vec<WireProperty>,
}

#[derive(Debug, Deserialize)]
struct WireProperty {
    name: String,
    #[serde(default)]
    value: Value,
}

fn id_text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn value_text(v: &Value) -> String {
    match v {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl OrderEnvelope {
    /// Lines whose effective quantity is 0 (edited out upstream) are dropped,
    /// so their mappings see them as absent.
    pub(crate) fn into_upstream(self, requested_id: &str) -> Result<UpstreamOrder> {
        let upstream_order_id = id_text(&self.order.id).unwrap_or_else(|| requested_id.to_string());

        let mut line_items = Vec::with_capacity(self.order.line_items.len());
        for li in self.order.line_items {
            let Some(id) = id_text(&li.id) else {
                bail!("line item without usable id in order {upstream_order_id}");
            };
            let quantity = li.current_quantity.unwrap_or(li.quantity);
            if quantity == 0 {
                continue;
            }
            let title = match li.variant_title.as_deref().map(str::trim) {
                Some(v) if !v.is_empty() && !li.title.contains(v) => format!("{} - {}", li.title.trim(), v),
                _ => li.title.trim().to_string(),
            };
            line_items.push(UpstreamLineItem {
                upstream_line_item_id: id,
                title,
                quantity,
                fulfillable_quantity: li.fulfillable_quantity.unwrap_or(quantity).min(quantity),
                properties: li
                    .properties
                    .iter()
                    .map(|p| LineItemProperty::new(p.name.clone(), value_text(&p.value)))
                    .collect(),
            });
        }

        Ok(UpstreamOrder {
            upstream_order_id,
            line_items,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(v: Value) -> Result<UpstreamOrder> {
        serde_json::from_value::<OrderEnvelope>(v)?.into_upstream("fallback")
    }

    #[test]
    fn numeric_ids_and_property_values_become_text() {
        let o = parse(json!({
            "order": {
                "id": 5001,
                "line_items": [{
                    "id": 9007199254740993u64,
                    "title": "Native Flute",
                    "variant_title": "A minor",
                    "quantity": 2,
                    "fulfillable_quantity": 1,
                    "properties": [
                        {"name": "_kiln_Bore", "value": 19},
                        {"name": "Engraving", "value": null}
                    ]
                }]
            }
        }))
        .unwrap();
        assert_eq!(o.upstream_order_id, "5001");
        let li = &o.line_items[0];
        assert_eq!(li.upstream_line_item_id, "9007199254740993");
        assert_eq!(li.title, "Native Flute - A minor");
        assert_eq!(li.fulfillable_quantity, 1);
        assert_eq!(li.properties[0].value, "19");
        assert_eq!(li.properties[1].value, "");
    }

    #[test]
    fn edited_out_lines_are_dropped_and_fulfillable_is_clamped() {
        let o = parse(json!({
            "order": {
                "id": "gid-1",
                "line_items": [
                    {"id": 1, "title": "Drum", "quantity": 2, "current_quantity": 0},
                    {"id": 2, "title": "Ocarina", "quantity": 1, "fulfillable_quantity": 4}
                ]
            }
        }))
        .unwrap();
        assert_eq!(o.line_items.len(), 1);
        assert_eq!(o.line_items[0].upstream_line_item_id, "2");
        assert_eq!(o.line_items[0].fulfillable_quantity, 1);
    }

    #[test]
    fn line_item_without_id_is_rejected() {
        assert!(parse(json!({
            "order": {"id": 1, "line_items": [{"id": null, "title": "x", "quantity": 1}]}
        }))
        .is_err());
    }
}
