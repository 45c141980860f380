//! Money and trust core — HTTP service entrypoint.
//!
//! Boots the database, the kill switch, the (mock) payment provider, and the
//! auth subsystem, wires the public/protected/auth routers together, and
//! spawns the recovery loops (reaper, DLQ, backfill, reconciler) as
//! background tasks alongside the axum server.

mod api;
mod audit;
mod auth;
mod config;
mod db;
mod errors;
mod ids;
mod ingress;
mod killswitch;
mod ledger;
mod locks;
mod metrics;
mod middleware;
mod msm;
mod provider;
mod recovery;
mod saga;
mod tpee;

use anyhow::{Context, Result};
use auth::{api as auth_api, jwt::JwtHandler, middleware as auth_mw, user_store::UserStore, AuthState};
use axum::{middleware::from_fn_with_state, Router};
use config::Config;
use db::Db;
use killswitch::KillSwitch;
use axum::middleware::from_fn;
use middleware::logging::request_logging;
use middleware::rate_limit::{RateLimitConfig, RateLimitLayer};
use provider::MockProvider;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tower_http::cors::CorsLayer;
use tpee::VelocityTracker;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "escrow_core=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Arc::new(Config::from_env().context("failed to load configuration")?);
    info!(mode = ?config.mode, "starting escrow core");

    let db = Arc::new(Db::open(&config.db_path).context("failed to open database")?);
    let killswitch = Arc::new(KillSwitch::new());
    let provider: Arc<dyn provider::PaymentProvider> = Arc::new(MockProvider::new());
    let velocity = Arc::new(VelocityTracker::new());

    install_metrics_recorder();

    let user_store = Arc::new(UserStore::new(&config.db_path).context("failed to open user store")?);
    let jwt_handler = Arc::new(JwtHandler::new(config.jwt_secret.clone()));
    let auth_state = AuthState::new(user_store.clone(), jwt_handler.clone());

    let app_state = api::AppState {
        db: db.clone(),
        killswitch: killswitch.clone(),
        provider: provider.clone(),
        config: config.clone(),
        velocity: velocity.clone(),
    };

    let financial_limiter = RateLimitLayer::new(RateLimitConfig {
        max_requests: 5,
        window: StdDuration::from_secs(60),
        burst: 0,
    });
    let admin_limiter = RateLimitLayer::new(RateLimitConfig {
        max_requests: 10,
        window: StdDuration::from_secs(60),
        burst: 0,
    });

    let auth_router = Router::new()
        .route("/auth/me", axum::routing::get(auth_api::get_current_user))
        .route(
            "/admin/users",
            axum::routing::get(auth_api::list_users).post(auth_api::create_user),
        )
        .route("/admin/users/:id", axum::routing::delete(auth_api::delete_user))
        .layer(from_fn_with_state(jwt_handler.clone(), auth_mw::auth_middleware))
        .with_state(auth_state.clone());
    // /auth/login must stay reachable without a token; kept on its own
    // router rather than threading an allowlist through the middleware.
    let login_route = Router::new()
        .route("/auth/login", axum::routing::post(auth_api::login))
        .with_state(auth_state);

    let protected_routes = api::protected_router(app_state.clone(), financial_limiter, admin_limiter)
        .layer(from_fn_with_state(jwt_handler.clone(), auth_mw::auth_middleware));

    let public_routes = api::public_router(app_state.clone());

    let app = Router::new()
        .merge(login_route)
        .merge(public_routes)
        .merge(protected_routes)
        .merge(auth_router)
        .layer(CorsLayer::permissive())
        .layer(from_fn(request_logging));

    spawn_recovery_loops(db.clone(), killswitch.clone(), provider.clone(), config.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("failed to bind listener")?;
    info!(%addr, "listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("server error")?;

    Ok(())
}

fn install_metrics_recorder() {
    if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new().install() {
        warn!(error = %e, "failed to install prometheus recorder; metrics will be recorded but not exported");
    }
}

/// Spawns the four recovery loops from §4.6 plus the `FORCE_REFUND_STAGE2`
/// sweep. Each loop owns its own polling interval and never exits; a panic
/// in one does not bring down the HTTP server, but is logged loudly since it
/// means that class of recovery has stopped running.
fn spawn_recovery_loops(
    db: Arc<Db>,
    killswitch: Arc<KillSwitch>,
    provider: Arc<dyn provider::PaymentProvider>,
    config: Arc<Config>,
) {
    {
        let db = db.clone();
        let killswitch = killswitch.clone();
        let timeout = chrono::Duration::minutes(config.pending_reaper_timeout_minutes);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(StdDuration::from_secs(60));
            loop {
                interval.tick().await;
                match recovery::run_pending_reaper(&db, &killswitch, timeout).await {
                    Ok(n) if n > 0 => info!(reaped = n, "pending reaper recovered stuck locks"),
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "pending reaper failed"),
                }
            }
        });
    }

    {
        let db = db.clone();
        let killswitch = killswitch.clone();
        let provider = provider.clone();
        let dlq_max_retries = config.dlq_max_retries;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(StdDuration::from_secs(30));
            loop {
                interval.tick().await;
                match recovery::run_dlq_processor(&db, &killswitch, dlq_max_retries).await {
                    Ok(n) if n > 0 => info!(processed = n, "dlq processor drained actions"),
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "dlq processor failed"),
                }
                if let Err(e) = run_force_refund_stage2_sweep(&db, provider.as_ref(), dlq_max_retries).await {
                    error!(error = %e, "force-refund stage2 sweep failed");
                }
            }
        });
    }

    {
        let db = db.clone();
        let killswitch = killswitch.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(StdDuration::from_secs(120));
            loop {
                interval.tick().await;
                match recovery::run_backfill(&db, &killswitch).await {
                    Ok(n) if n > 0 => info!(booked = n, "backfill reconciled orphaned provider entries"),
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "backfill failed"),
                }
            }
        });
    }

    {
        let db = db.clone();
        let killswitch = killswitch.clone();
        // Config carries no dedicated tolerance field (see DESIGN.md); five
        // minutes matches the reconciler's own polling cadence below.
        let sync_delay_tolerance = chrono::Duration::minutes(5);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(StdDuration::from_secs(300));
            loop {
                interval.tick().await;
                match recovery::run_reconciler(&db, &killswitch, sync_delay_tolerance).await {
                    Ok(mismatches) if !mismatches.is_empty() => {
                        warn!(count = mismatches.len(), "reconciler found ledger/provider mismatches")
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "reconciler failed"),
                }
            }
        });
    }
}

/// `recovery::run_dlq_processor` treats `FORCE_REFUND_STAGE2` rows as a
/// frozen no-op (see its doc comment) because replaying the refund needs a
/// live `PaymentProvider` handle that the generic DLQ poll doesn't hold.
/// This sweep is that replay: it re-drives `saga::run_force_refund_second_leg`
/// directly and does its own status/backoff bookkeeping on the row, since
/// that function's own failure path queues a *new* DLQ row rather than
/// updating the one being retried.
async fn run_force_refund_stage2_sweep(
    db: &Db,
    provider: &dyn provider::PaymentProvider,
    dlq_max_retries: u32,
) -> Result<usize> {
    let now = chrono::Utc::now().to_rfc3339();
    let due: Vec<(String, String, i64)> = {
        let conn = db.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, payload, retry_count FROM pending_actions
             WHERE type = 'FORCE_REFUND_STAGE2' AND status IN ('pending', 'failed')
             AND next_retry_at <= ?1",
        )?;
        let rows = stmt
            .query_map(rusqlite::params![now], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows
    };

    let mut processed = 0usize;
    for (id, payload, retry_count) in due {
        let payload: serde_json::Value = serde_json::from_str(&payload)
            .context("unparseable FORCE_REFUND_STAGE2 payload")?;
        let task_id = payload["task_id"].as_str().unwrap_or_default().to_string();
        let event_id = payload["event_id"].as_str().unwrap_or_default().to_string();
        let price_cents = payload["price_cents"].as_i64().unwrap_or_default();
        let ctx = saga::SagaContext {
            price_cents,
            ..Default::default()
        };

        let outcome = saga::run_force_refund_second_leg(db, provider, &task_id, &event_id, &ctx).await;
        let conn = db.lock().await;
        match outcome {
            Ok(()) => {
                conn.execute(
                    "UPDATE pending_actions SET status = 'resolved' WHERE id = ?1",
                    rusqlite::params![id],
                )?;
            }
            Err(e) => {
                let next_retry_count = retry_count + 1;
                let backoff_minutes = 5i64.pow(next_retry_count.max(1) as u32 - 1);
                let next_retry_at = (chrono::Utc::now() + chrono::Duration::minutes(backoff_minutes)).to_rfc3339();
                conn.execute(
                    "UPDATE pending_actions SET status = 'failed', retry_count = ?1, next_retry_at = ?2, error_log = ?3 WHERE id = ?4",
                    rusqlite::params![next_retry_count, next_retry_at, e.to_string(), id],
                )?;
            }
        }
        let _ = dlq_max_retries; // unlimited retries for this action type, see run_dlq_processor
        processed += 1;
    }
    Ok(processed)
}
