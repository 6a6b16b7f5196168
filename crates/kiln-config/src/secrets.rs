//! Runtime secret resolution for the commerce platform credentials.
//!
//! # Contract
//! - Config YAML stores only the env var NAME (`upstream.access_token_env`).
//! - Binaries call [`resolve_commerce_secrets`] once at startup and pass the
//!   result into the commerce client constructor.
//! - `Debug` output redacts values. Errors name the variable, never its value.

use anyhow::{bail, Result};
use serde_json::Value;

pub const DEFAULT_ACCESS_TOKEN_ENV: &str = "KILN_COMMERCE_TOKEN";

/// Secrets needed to talk to the upstream commerce platform.
#[derive(Clone)]
pub struct ResolvedCommerceSecrets {
    /// Name of the env var the token was read from.
    pub access_token_env: String,
    pub access_token: String,
}

impl std::fmt::Debug for ResolvedCommerceSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedCommerceSecrets")
            .field("access_token_env", &self.access_token_env)
            .field("access_token", &"<REDACTED>")
            .finish()
    }
}

/// Non-empty trimmed string at `pointer`, if any.
fn read_str_at(config: &Value, pointer: &str) -> Option<String> {
    let s = config.pointer(pointer)?.as_str()?.trim();
    (!s.is_empty()).then(|| s.to_string())
}

/// `None` when unset or blank.
fn resolve_env(var_name: &str) -> Option<String> {
    match std::env::var(var_name) {
        Ok(v) if !v.trim().is_empty() => Some(v),
        _ => None,
    }
}

/// Env var name configured at `/upstream/access_token_env`, or the default.
pub fn access_token_env_name(config_json: &Value) -> String {
    read_str_at(config_json, "/upstream/access_token_env")
        .unwrap_or_else(|| DEFAULT_ACCESS_TOKEN_ENV.to_string())
}

/// Resolve the commerce access token. Required: a reconcile run cannot
/// fetch anything without it.
pub fn resolve_commerce_secrets(config_json: &Value) -> Result<ResolvedCommerceSecrets> {
    let access_token_env = access_token_env_name(config_json);
    let Some(access_token) = resolve_env(&access_token_env) else {
        bail!(
            "SECRETS_MISSING: required env var '{}' (commerce access token) is not set or empty",
            access_token_env
        );
    };
    Ok(ResolvedCommerceSecrets {
        access_token_env,
        access_token,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn env_name_defaults_when_absent_or_blank() {
        assert_eq!(access_token_env_name(&json!({})), DEFAULT_ACCESS_TOKEN_ENV);
        assert_eq!(
            access_token_env_name(&json!({"upstream": {"access_token_env": "  "}})),
            DEFAULT_ACCESS_TOKEN_ENV
        );
        assert_eq!(
            access_token_env_name(&json!({"upstream": {"access_token_env": "SHOP_TOKEN"}})),
            "SHOP_TOKEN"
        );
    }

    #[test]
    fn missing_token_error_names_the_variable() {
        let cfg = json!({"upstream": {"access_token_env": "KILN_TEST_TOKEN_NEVER_SET_7F3A"}});
        let err = resolve_commerce_secrets(&cfg).unwrap_err().to_string();
        assert!(err.contains("KILN_TEST_TOKEN_NEVER_SET_7F3A"), "{err}");
    }

    #[test]
    fn debug_redacts_token() {
        let s = ResolvedCommerceSecrets {
            access_token_env: "KILN_COMMERCE_TOKEN".to_string(),
            access_token: "plain-value-123".to_string(),
        };
        let dbg = format!("{s:?}");
        assert!(dbg.contains("<REDACTED>"));
        assert!(!dbg.contains("plain-value-123"));
    }
}
