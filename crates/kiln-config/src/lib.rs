//! kiln-config
//!
//! Layered YAML configuration:
//! - later files override earlier ones (deep merge of mappings)
//! - canonical JSON + SHA-256 `config_hash`, so a run can be tied to the
//!   exact configuration it used
//! - literal secrets are refused; YAML carries env var NAMES only
//! - unused-key guard against the registry of pointers code actually reads
//!
//! Each consumer reads its own section from `LoadedConfig::config_json`
//! (`RulePolicy::from_config_json`, `RetryPolicy::from_config_json`, ...).

use std::collections::BTreeSet;
use std::fs;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

pub mod secrets;

/// Leaf string values starting with any of these abort the load with
/// CONFIG_SECRET_DETECTED.
const SECRET_PREFIXES: &[&str] = &[
    "shpat_",     // Shopify admin API access token
    "shpca_",     // Shopify custom app token
    "shppa_",     // Shopify private app token
    "shpss_",     // Shopify shared secret
    "sk_live",    // Stripe live
    "sk_test",    // Stripe test
    "AKIA",       // AWS access key ID
    "-----BEGIN", // PEM private keys
    "ghp_",       // GitHub PAT
    "glpat-",     // GitLab PAT
    "xoxb-",      // Slack bot token
];

// ---------------------------------------------------------------------------
// Consumption registry + unused-key guard
// ---------------------------------------------------------------------------

/// Which binary surface is loading the config. The daemon reads everything
/// the CLI reads plus its own section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSurface {
    Cli,
    Daemon,
}

impl ConfigSurface {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigSurface::Cli => "CLI",
            ConfigSurface::Daemon => "DAEMON",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnusedKeyPolicy {
    Warn,
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnusedKeyReport {
    pub surface: String,
    /// Consumed JSON-pointer prefixes used for this analysis (sorted, unique).
    pub consumed_prefixes: Vec<String>,
    /// Unused leaf pointers (sorted).
    pub unused_leaf_pointers: Vec<String>,
}

impl UnusedKeyReport {
    pub fn is_clean(&self) -> bool {
        self.unused_leaf_pointers.is_empty()
    }
}

/// Pointer prefixes read by code on each surface. A leaf under any prefix
/// counts as consumed.
///
/// Must match the actual reads:
/// - kiln-commerce `CommerceConfig::from_config_json`: /upstream/*
/// - kiln-reconcile `RulePolicy::from_config_json`: whole /reconcile section
/// - kiln-engine `InProcessOrderLocks` / kiln-db `PgAdvisoryLocker`: /lock/timeout_ms
/// - kiln-engine `RetryPolicy::from_config_json`: /retry/*
/// - kiln-daemon `DaemonConfig::from_config_json`: /daemon/resync_interval_secs
pub fn consumed_pointers(surface: ConfigSurface) -> &'static [&'static str] {
    match surface {
        ConfigSurface::Cli => CLI,
        ConfigSurface::Daemon => DAEMON,
    }
}

static CLI: &[&str] = &[
    "/upstream/base_url",
    "/upstream/api_version",
    "/upstream/access_token_env",
    "/upstream/timeout_ms",
    "/reconcile",
    "/lock/timeout_ms",
    "/retry/max_attempts",
    "/retry/initial_backoff_ms",
    "/retry/max_backoff_ms",
];

static DAEMON: &[&str] = &[
    "/upstream/base_url",
    "/upstream/api_version",
    "/upstream/access_token_env",
    "/upstream/timeout_ms",
    "/reconcile",
    "/lock/timeout_ms",
    "/retry/max_attempts",
    "/retry/initial_backoff_ms",
    "/retry/max_backoff_ms",
    "/daemon/resync_interval_secs",
];

/// Report leaves not covered by the surface's registry. `Fail` turns a
/// non-empty report into an error; `Warn` always returns the report.
pub fn report_unused_keys(
    surface: ConfigSurface,
    config_json: &Value,
    policy: UnusedKeyPolicy,
) -> Result<UnusedKeyReport> {
    let consumed_prefixes: Vec<String> = consumed_pointers(surface)
        .iter()
        .map(|p| normalize_pointer(p))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let unused_leaf_pointers: Vec<String> = leaves(config_json)
        .into_iter()
        .map(|(ptr, _)| ptr)
        .filter(|leaf| !consumed_prefixes.iter().any(|c| is_prefix_pointer(c, leaf)))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let report = UnusedKeyReport {
        surface: surface.as_str().to_string(),
        consumed_prefixes,
        unused_leaf_pointers,
    };

    match policy {
        UnusedKeyPolicy::Fail if !report.is_clean() => {
            let first: Vec<&str> = report
                .unused_leaf_pointers
                .iter()
                .take(12)
                .map(String::as_str)
                .collect();
            bail!(
                "CONFIG_UNUSED_KEYS (surface={}): {} config leaf key(s) are read by nothing; first: {}",
                report.surface,
                report.unused_leaf_pointers.len(),
                first.join(", ")
            )
        }
        _ => Ok(report),
    }
}

/// One leading "/", no trailing "/". Blank means the root.
fn normalize_pointer(p: &str) -> String {
    format!("/{}", p.trim().trim_matches('/'))
}

/// "/a/b" covers "/a/b" and "/a/b/c" but not "/a/bc". "/" covers everything.
fn is_prefix_pointer(prefix: &str, leaf: &str) -> bool {
    prefix == "/"
        || leaf == prefix
        || (leaf.starts_with(prefix) && leaf.as_bytes().get(prefix.len()) == Some(&b'/'))
}

/// Every scalar (null included) in `v` with its RFC 6901 pointer. A scalar
/// document is the single leaf "/".
fn leaves(v: &Value) -> Vec<(String, &Value)> {
    let mut out = Vec::new();
    let mut stack = vec![(String::new(), v)];
    while let Some((ptr, node)) = stack.pop() {
        match node {
            Value::Object(map) => stack.extend(map.iter().map(|(k, child)| {
                let token = k.replace('~', "~0").replace('/', "~1");
                (format!("{ptr}/{token}"), child)
            })),
            Value::Array(items) => stack.extend(
                items
                    .iter()
                    .enumerate()
                    .map(|(i, child)| (format!("{ptr}/{i}"), child)),
            ),
            _ if ptr.is_empty() => out.push(("/".to_string(), node)),
            _ => out.push((ptr, node)),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config_hash: String,
    pub canonical_json: String,
    pub config_json: Value,
}

pub fn load_layered_yaml(paths: &[&str]) -> Result<LoadedConfig> {
    let docs = paths
        .iter()
        .map(|p| fs::read_to_string(p).with_context(|| format!("read config layer {p}")))
        .collect::<Result<Vec<String>>>()?;
    let doc_refs: Vec<&str> = docs.iter().map(String::as_str).collect();
    load_layered_yaml_from_strings(&doc_refs)
}

pub fn load_layered_yaml_from_strings(yaml_docs: &[&str]) -> Result<LoadedConfig> {
    let mut merged = Value::Object(serde_json::Map::new());
    for (i, raw) in yaml_docs.iter().enumerate() {
        let layer: serde_yaml::Value =
            serde_yaml::from_str(raw).with_context(|| format!("config layer {i}: invalid yaml"))?;
        // An empty overlay file parses as null; it overrides nothing.
        if layer.is_null() {
            continue;
        }
        let layer = serde_json::to_value(layer)
            .with_context(|| format!("config layer {i}: not representable as json"))?;
        merge_into(&mut merged, layer);
    }

    refuse_secret_literals(&merged)?;

    // serde_json's default Map is key-sorted, so compact output is canonical.
    let canonical_json = serde_json::to_string(&merged).context("serialize canonical config")?;
    let config_hash = hex::encode(Sha256::digest(canonical_json.as_bytes()));
    Ok(LoadedConfig {
        config_hash,
        canonical_json,
        config_json: merged,
    })
}

/// Mappings merge key by key; any other value in `layer` replaces `base`.
fn merge_into(base: &mut Value, layer: Value) {
    match (base, layer) {
        (Value::Object(dst), Value::Object(src)) => {
            for (k, v) in src {
                match dst.get_mut(&k) {
                    Some(slot) => merge_into(slot, v),
                    None => {
                        dst.insert(k, v);
                    }
                }
            }
        }
        (slot, other) => *slot = other,
    }
}

fn refuse_secret_literals(v: &Value) -> Result<()> {
    let hit = leaves(v)
        .into_iter()
        .find(|(_, leaf)| leaf.as_str().is_some_and(looks_like_secret));
    if let Some((ptr, _)) = hit {
        bail!("CONFIG_SECRET_DETECTED leaf={ptr} value=REDACTED");
    }
    Ok(())
}

fn looks_like_secret(s: &str) -> bool {
    let t = s.trim();
    t.len() >= 8 && SECRET_PREFIXES.iter().any(|p| t.starts_with(p))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_pointer_respects_segment_boundary() {
        assert!(is_prefix_pointer("/retry", "/retry/max_attempts"));
        assert!(is_prefix_pointer("/retry", "/retry"));
        assert!(!is_prefix_pointer("/retry", "/retry_extra"));
        assert!(is_prefix_pointer("/", "/anything"));
    }

    #[test]
    fn normalize_pointer_adds_leading_and_strips_trailing_slash() {
        assert_eq!(normalize_pointer("lock/timeout_ms/"), "/lock/timeout_ms");
        assert_eq!(normalize_pointer(""), "/");
    }

    #[test]
    fn short_strings_are_never_secrets() {
        assert!(!looks_like_secret("shpat_"));
        assert!(looks_like_secret("shpat_0123456789abcdef"));
    }
}
