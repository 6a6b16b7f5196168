use std::collections::BTreeMap;

use kiln_schemas::{ItemMapping, UpstreamLineItem};

/// How many new suffixes each upstream line item still needs.
///
/// shortfall = quantity - existing mappings for that id, clamped at 0.
/// `fulfillable_quantity` is deliberately ignored: every purchased unit gets a
/// permanent identity, even one that is later cancelled.
///
/// If the same line-item id appears on several upstream lines their
/// quantities are summed. Every upstream id appears in the result, including
/// those with shortfall 0.
pub fn compute_shortfall(
    line_items: &[UpstreamLineItem],
    mappings: &[ItemMapping],
) -> BTreeMap<String, u32> {
    let mut purchased: BTreeMap<String, u32> = BTreeMap::new();
    for li in line_items {
        let q = purchased.entry(li.upstream_line_item_id.clone()).or_insert(0);
        *q = q.saturating_add(li.quantity);
    }

    let mut existing: BTreeMap<&str, u32> = BTreeMap::new();
    for m in mappings {
        *existing.entry(m.upstream_line_item_id.as_str()).or_insert(0) += 1;
    }

    purchased
        .into_iter()
        .map(|(id, qty)| {
            let have = existing.get(id.as_str()).copied().unwrap_or(0);
            (id, qty.saturating_sub(have))
        })
        .collect()
}
