use std::collections::BTreeMap;

use kiln_schemas::UpstreamLineItem;

/// Separator between a product name and its variant in upstream titles,
/// e.g. `"Native Flute - A minor"`.
const VARIANT_SEPARATOR: &str = " - ";

/// Local metadata derived from one upstream line-item snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ItemMetadata {
    pub title: String,
    pub item_type: String,
    pub specifications: BTreeMap<String, String>,
}

/// Strip every leading repetition of `namespace` from a property key.
///
/// Upstream sometimes nests the prefix (`"_kiln__kiln_Key"`), so stripping
/// repeats until the key no longer starts with it. An empty namespace strips
/// nothing.
pub fn strip_namespace<'a>(key: &'a str, namespace: &str) -> &'a str {
    let mut rest = key.trim();
    if namespace.is_empty() {
        return rest;
    }
    while let Some(stripped) = rest.strip_prefix(namespace) {
        rest = stripped.trim_start();
    }
    rest.trim_end()
}

/// Product name before the variant separator; the whole title otherwise.
pub fn derive_item_type(title: &str) -> String {
    let t = title.trim();
    match t.split_once(VARIANT_SEPARATOR) {
        Some((head, _)) if !head.trim().is_empty() => head.trim().to_string(),
        _ => t.to_string(),
    }
}

/// Properties as a key → value map, keys normalized.
///
/// Blank keys are dropped. A later duplicate key overwrites an earlier one.
pub fn derive_specifications(li: &UpstreamLineItem, namespace: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for p in &li.properties {
        let key = strip_namespace(&p.name, namespace);
        if key.is_empty() {
            continue;
        }
        out.insert(key.to_string(), p.value.trim().to_string());
    }
    out
}

pub fn derive_metadata(li: &UpstreamLineItem, namespace: &str) -> ItemMetadata {
    ItemMetadata {
        title: li.title.trim().to_string(),
        item_type: derive_item_type(&li.title),
        specifications: derive_specifications(li, namespace),
    }
}

/// Additive merge: keys absent from `incoming` are kept, `incoming` wins on
/// conflict. Merging the same snapshot twice is a no-op.
pub fn merge_specifications(
    existing: &BTreeMap<String, String>,
    incoming: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut merged = existing.clone();
    for (k, v) in incoming {
        merged.insert(k.clone(), v.clone());
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn strips_repeated_namespace() {
        assert_eq!(strip_namespace("_kiln_Key", "_kiln_"), "Key");
        assert_eq!(strip_namespace("_kiln__kiln_Key", "_kiln_"), "Key");
        assert_eq!(strip_namespace("  _kiln_ Glaze ", "_kiln_"), "Glaze");
        assert_eq!(strip_namespace("Key", "_kiln_"), "Key");
    }

    #[test]
    fn empty_namespace_strips_nothing() {
        assert_eq!(strip_namespace("_kiln_Key", ""), "_kiln_Key");
    }

    #[test]
    fn item_type_drops_variant() {
        assert_eq!(derive_item_type("Native Flute - A minor"), "Native Flute");
        assert_eq!(derive_item_type("Ocarina"), "Ocarina");
        assert_eq!(derive_item_type(" - odd"), "- odd");
    }

    #[test]
    fn specifications_normalize_keys_and_last_wins() {
        let li = UpstreamLineItem::new("L1", "Flute", 1)
            .with_property("_kiln_Key", "A")
            .with_property("Glaze", "celadon")
            .with_property("_kiln__kiln_Key", "G")
            .with_property("_kiln_", "dropped");
        let specs = derive_specifications(&li, "_kiln_");
        assert_eq!(specs, map(&[("Key", "G"), ("Glaze", "celadon")]));
    }

    #[test]
    fn merge_is_additive_and_idempotent() {
        let existing = map(&[("Key", "A"), ("Maker note", "hand-tuned")]);
        let incoming = map(&[("Key", "G"), ("Glaze", "celadon")]);

        let once = merge_specifications(&existing, &incoming);
        assert_eq!(
            once,
            map(&[("Key", "G"), ("Glaze", "celadon"), ("Maker note", "hand-tuned")])
        );

        let twice = merge_specifications(&once, &incoming);
        assert_eq!(once, twice);
    }
}
