//! kiln-daemon entry point.
//!
//! This file is intentionally thin: it loads config, wires the Postgres
//! stores and the commerce client into an engine, starts the background
//! tasks and the HTTP server. Route handlers live in `routes.rs`; shared
//! state lives in `state.rs`.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use clap::Parser;
use kiln_commerce::{CommerceConfig, HttpCommerceSource};
use kiln_config::{report_unused_keys, ConfigSurface, UnusedKeyPolicy};
use kiln_daemon::{config::DaemonConfig, routes, state};
use kiln_db::{PgAdvisoryLocker, PgMappingStore, PgOrderStore};
use kiln_engine::{batch_concurrency_from_config_json, ReconciliationEngine, RetryPolicy, RulePolicy};
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(name = "kiln-daemon")]
struct Args {
    /// Layered config paths in merge order
    #[arg(long = "config", required = true)]
    config_paths: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Silent if the file does not exist; production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let args = Args::parse();
    let path_refs: Vec<&str> = args.config_paths.iter().map(|s| s.as_str()).collect();
    let loaded = kiln_config::load_layered_yaml(&path_refs)?;
    let report = report_unused_keys(ConfigSurface::Daemon, &loaded.config_json, UnusedKeyPolicy::Warn)?;
    if !report.is_clean() {
        warn!(unused = ?report.unused_leaf_pointers, "config/unused_keys");
    }
    info!(config_hash = %loaded.config_hash, "config/loaded");

    let cfg = &loaded.config_json;
    let pool = kiln_db::connect_from_env().await?;
    let secrets = kiln_config::secrets::resolve_commerce_secrets(cfg)?;
    let commerce = HttpCommerceSource::new(CommerceConfig::from_config_json(cfg)?, secrets.access_token)?;
    let policy = RulePolicy::from_config_json(cfg).context("invalid /reconcile section")?;

    let orders = Arc::new(PgOrderStore::new(pool.clone()));
    let mappings = Arc::new(PgMappingStore::new(pool.clone()));
    let engine = ReconciliationEngine::new(
        Arc::new(commerce),
        orders.clone(),
        mappings.clone(),
        Arc::new(PgAdvisoryLocker::from_config_json(pool.clone(), cfg)),
        Arc::new(policy),
    )
    .with_batch_concurrency(batch_concurrency_from_config_json(cfg));

    let shared = Arc::new(
        state::AppState::new(engine, orders, mappings, RetryPolicy::from_config_json(cfg))
            .with_run_log(pool.clone()),
    );

    state::spawn_heartbeat(shared.bus.clone(), Duration::from_secs(15));

    if let Some(interval) = DaemonConfig::from_config_json(cfg).resync_interval {
        info!(interval_secs = interval.as_secs(), "resync/enabled");
        let list_pool = pool.clone();
        state::spawn_resync_tick(
            Arc::clone(&shared),
            move || {
                let p = list_pool.clone();
                async move { kiln_db::list_orders_with_upstream(&p).await }
            },
            interval,
        );
    }

    let app = routes::build_router(Arc::clone(&shared))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors_localhost_only());

    let addr = bind_addr_from_env().unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8890)));
    info!("kiln-daemon listening on http://{}", addr);

    axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
        .await
        .context("server crashed")?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

fn bind_addr_from_env() -> Option<SocketAddr> {
    std::env::var("KILN_DAEMON_ADDR").ok()?.parse().ok()
}

/// CORS: allow only localhost origins.
fn cors_localhost_only() -> CorsLayer {
    let allowed_origins = [
        "http://localhost",
        "http://127.0.0.1",
        "http://localhost:3000",
        "http://127.0.0.1:3000",
    ];

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(tower_http::cors::Any)
}
