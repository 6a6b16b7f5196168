//! Command handler modules for kiln-cli.
//!
//! Shared utilities used by multiple command paths live here.
//! Command-specific logic lives in the submodules.

pub mod reconcile;

use anyhow::{bail, Result};
use kiln_config::{report_unused_keys, ConfigSurface, LoadedConfig, UnusedKeyPolicy};
use kiln_schemas::Order;
use tracing::warn;

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Load layered YAML and warn (never fail) about leaves nothing reads.
pub fn load_config(paths: &[String]) -> Result<LoadedConfig> {
    let path_refs: Vec<&str> = paths.iter().map(|s| s.as_str()).collect();
    let loaded = kiln_config::load_layered_yaml(&path_refs)?;

    let report = report_unused_keys(ConfigSurface::Cli, &loaded.config_json, UnusedKeyPolicy::Warn)?;
    if !report.is_clean() {
        warn!(
            surface = %report.surface,
            unused = ?report.unused_leaf_pointers,
            "config/unused_keys"
        );
    }
    Ok(loaded)
}

/// Serial numbers are `{order_number}-{suffix}`; blank identifiers would
/// produce unusable serials.
pub fn validate_order(order: &Order) -> Result<()> {
    if order.order_id.trim().is_empty() {
        bail!("--order-id must not be blank");
    }
    if order.order_number.trim().is_empty() {
        bail!("--order-number must not be blank");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_order_number_is_rejected() {
        assert!(validate_order(&Order::new("o-1", " ", None)).is_err());
        assert!(validate_order(&Order::new("", "K-1", None)).is_err());
        assert!(validate_order(&Order::new("o-1", "K-1", Some("55".into()))).is_ok());
    }
}
