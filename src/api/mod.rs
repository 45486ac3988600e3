pub mod auth;
pub mod error;
pub mod handlers;
pub mod state;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::config::Config;
use crate::events::{EventBus, NoopBus, WebhookBus};
use crate::payout::sira::{FallbackOracle, HttpSiraOracle, RiskOracle};
use crate::store;

use state::AppState;

pub async fn serve(host: &str, port: u16, config: &Config) -> Result<()> {
    let db = store::open(&config.db_path()).context("opening store")?;

    let auth_secret = match &config.auth_secret {
        Some(secret) => secret.clone(),
        None => {
            let conn = db.lock().await;
            store::ensure_auth_secret(&conn)?
        }
    };

    let oracle: Arc<dyn RiskOracle> = match &config.sira_url {
        Some(url) => Arc::new(HttpSiraOracle::new(url.clone(), config.sira_timeout)?),
        None => {
            info!("no SIRA endpoint configured, using deterministic fallback oracle");
            Arc::new(FallbackOracle)
        }
    };

    let bus: Arc<dyn EventBus> = match &config.event_bus_url {
        Some(url) => Arc::new(WebhookBus::new(url.clone())?),
        None => Arc::new(NoopBus),
    };

    let app_state = AppState {
        db,
        oracle,
        oracle_timeout: config.sira_timeout,
        bus,
        ussd: config.ussd.clone(),
        auth_secret,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        // Health
        .route("/health", get(|| async { "ok" }))
        // USSD gateway boundary
        .route("/ussd", post(handlers::ussd::turn))
        // Payouts
        .route(
            "/marketplaces/{marketplace}/sellers/{seller}/smart-payout",
            post(handlers::payouts::smart_payout),
        )
        .route(
            "/marketplaces/{marketplace}/sellers/{seller}/advances",
            post(handlers::payouts::request_advance),
        )
        .route("/payouts/slices/pending", get(handlers::payouts::pending_slices))
        // Rollouts
        .route(
            "/rollouts",
            get(handlers::rollouts::list).post(handlers::rollouts::create),
        )
        .route("/rollouts/should-upgrade", get(handlers::rollouts::should_upgrade))
        .route("/rollouts/upgrades", post(handlers::rollouts::record_upgrade))
        .route("/rollouts/auto-check", post(handlers::rollouts::auto_check))
        .route(
            "/rollouts/backups",
            get(handlers::rollouts::latest_backup).post(handlers::rollouts::create_backup),
        )
        .route("/rollouts/backups/cleanup", post(handlers::rollouts::cleanup_backups))
        .route("/rollouts/rollbacks", post(handlers::rollouts::initiate_rollback))
        .route(
            "/rollouts/rollbacks/{id}/complete",
            post(handlers::rollouts::complete_rollback),
        )
        .route("/rollouts/{id}", get(handlers::rollouts::get_one))
        .route("/rollouts/{id}/status", post(handlers::rollouts::set_status))
        // Approvals
        .route(
            "/approvals",
            get(handlers::approvals::list).post(handlers::approvals::create),
        )
        .route("/approvals/{id}", get(handlers::approvals::get_one))
        .route("/approvals/{id}/sign", post(handlers::approvals::sign))
        .route("/approvals/{id}/reject", post(handlers::approvals::reject))
        // Simulations
        .route(
            "/simulations",
            post(handlers::simulations::enqueue),
        )
        .route("/simulations/{id}", get(handlers::simulations::get_one))
        .route("/simulations/{id}/journal", get(handlers::simulations::journal))
        .route("/simulations/{id}/errors", get(handlers::simulations::errors))
        .layer(cors)
        .with_state(app_state);

    let addr = format!("{host}:{port}");
    info!(%addr, "sunupay api listening");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;

    axum::serve(listener, app).await.context("running server")?;

    Ok(())
}
