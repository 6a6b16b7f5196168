//! kiln-commerce
//!
//! HTTP client for the upstream commerce platform (Shopify-style Admin REST
//! API). Implements `kiln_engine::CommerceSource`.
//!
//! - `GET {base_url}/admin/api/{api_version}/orders/{id}.json`
//! - access token sent as `X-Shopify-Access-Token`; never logged
//! - every request bounded by `upstream.timeout_ms`
//! - 404 → `CommerceError::NotFound`; any other failure → `Unavailable`

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use kiln_engine::{CommerceError, CommerceSource};
use kiln_schemas::UpstreamOrder;
use serde_json::Value;
use tracing::debug;

mod wire;

pub const ACCESS_TOKEN_HEADER: &str = "X-Shopify-Access-Token";
pub const DEFAULT_API_VERSION: &str = "2024-01";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(10_000);

/// The `/upstream` config section, minus the secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommerceConfig {
    pub base_url: String,
    pub api_version: String,
    pub timeout: Duration,
}

impl CommerceConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_version: DEFAULT_API_VERSION.to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// `/upstream/base_url` is required; the rest default.
    pub fn from_config_json(config: &Value) -> Result<Self> {
        let Some(base_url) = config
            .pointer("/upstream/base_url")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
        else {
            bail!("CONFIG_MISSING: /upstream/base_url is required");
        };
        let api_version = config
            .pointer("/upstream/api_version")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_API_VERSION)
            .to_string();
        let timeout = config
            .pointer("/upstream/timeout_ms")
            .and_then(Value::as_u64)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_TIMEOUT);
        Ok(Self {
            base_url: base_url.to_string(),
            api_version,
            timeout,
        })
    }
}

#[derive(Clone)]
pub struct HttpCommerceSource {
    http: reqwest::Client,
    config: CommerceConfig,
    access_token: String,
}

impl std::fmt::Debug for HttpCommerceSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpCommerceSource")
            .field("config", &self.config)
            .field("access_token", &"<REDACTED>")
            .finish()
    }
}

enum Fetched {
    Found(UpstreamOrder),
    Missing,
}

impl HttpCommerceSource {
    pub fn new(config: CommerceConfig, access_token: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("build commerce http client")?;
        Ok(Self {
            http,
            config,
            access_token: access_token.into(),
        })
    }

    fn order_url(&self, upstream_order_id: &str) -> String {
        format!(
            "{}/admin/api/{}/orders/{}.json",
            self.config.base_url.trim_end_matches('/'),
            self.config.api_version,
            upstream_order_id
        )
    }

    async fn get_order(&self, upstream_order_id: &str) -> Result<Fetched> {
        let resp = self
            .http
            .get(self.order_url(upstream_order_id))
            .header(ACCESS_TOKEN_HEADER, &self.access_token)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .context("commerce request failed")?;

        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(Fetched::Missing);
        }
        if !status.is_success() {
            bail!("commerce http error status={}", status.as_u16());
        }

        let body: wire::OrderEnvelope = resp
            .json()
            .await
            .context("commerce response json decode failed")?;
        let order = body.into_upstream(upstream_order_id)?;
        debug!(
            upstream_order_id,
            line_items = order.line_items.len(),
            "commerce/order_fetched"
        );
        Ok(Fetched::Found(order))
    }
}

#[async_trait]
impl CommerceSource for HttpCommerceSource {
    async fn fetch_order(&self, upstream_order_id: &str) -> Result<UpstreamOrder, CommerceError> {
        match self.get_order(upstream_order_id).await {
            Ok(Fetched::Found(order)) => Ok(order),
            Ok(Fetched::Missing) => Err(CommerceError::NotFound),
            Err(e) => Err(CommerceError::Unavailable(format!("{e:#}"))),
        }
    }
}
