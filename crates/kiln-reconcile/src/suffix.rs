use std::collections::BTreeSet;

/// Smallest positive suffix not present in `used`.
///
/// `used` is ordered, so a single forward scan finds the first gap. Per-order
/// suffix counts are bounded by the units in one order, so O(k) is fine.
pub fn next_free_suffix(used: &BTreeSet<u32>) -> u32 {
    let mut candidate: u32 = 1;
    for &s in used.range(1..) {
        if s == candidate {
            candidate += 1;
        } else {
            break;
        }
    }
    candidate
}
