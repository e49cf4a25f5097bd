//! # lodestar_state_server
//!
//! Runs one state server instance: opens the record store, competes for the
//! leadership lock, and once leader rotates encryption keys, serves and runs
//! the convergence loop until the lock is lost or the process is asked to
//! stop.
//!
//! ## HTTP Endpoints
//!
//! - `GET /health` - Shallow liveness check (always 200)
//! - `GET /ready` - 200 while this instance holds the lock
//! - `GET /metrics` - Prometheus exposition
//! - `POST /v1/converge` - Request a convergence cycle now
//!
//! ## Usage
//!
//! ```bash
//! LODESTAR_DATABASE_URL=postgres://lodestar@db/lodestar \
//! LODESTAR_ENCRYPTION_KEYS=primary:correct-horse \
//! LODESTAR_ACTIVE_KEY_LABEL=primary \
//! lodestar_state_server
//! ```

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;

use lodestar_core::encryption::{Cryptor, KeyManager};
use lodestar_core::format::Encoder;
use lodestar_core::observability::{init_logging, LogFormat};
use lodestar_core::{Clock, SystemClock};
use lodestar_state::auction::{AuctionClient, HttpAuctionClient, InMemoryAuctionClient};
use lodestar_state::callback::HttpCallbackHandler;
use lodestar_state::cells::StaticCells;
use lodestar_state::config::{BackendKind, StateConfig};
use lodestar_state::convergence::{CallbackDispatch, Converger};
use lodestar_state::encryptor::Encryptor;
use lodestar_state::leader::kv::KvLeaderElector;
use lodestar_state::leader::sql::SqlLeaderElector;
use lodestar_state::leader::{LeaderElector, LeadershipConfig, LeadershipCoordinator};
use lodestar_state::service::StateService;
use lodestar_state::store::kv::{KvStore, MemoryKeyValue};
use lodestar_state::store::sql::SqlStore;
use lodestar_state::store::Store;
use lodestar_state::workpool::WorkPool;

const LOG_FORMAT_ENV: &str = "LODESTAR_LOG_FORMAT";

// ============================================================================
// HTTP Handlers
// ============================================================================

struct ServiceState {
    leadership: Arc<LeadershipCoordinator>,
    converger: Option<Arc<Converger>>,
    prometheus: PrometheusHandle,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct ReadyResponse {
    ready: bool,
    leader: bool,
    convergence_cycles: u64,
    convergence_running: bool,
}

/// GET /health - Shallow liveness check.
async fn health() -> impl IntoResponse {
    Json(HealthResponse { status: "ok" })
}

/// GET /ready - Ready while holding the lock.
async fn ready(State(state): State<Arc<ServiceState>>) -> impl IntoResponse {
    let leader = state.leadership.is_leader();
    let (convergence_cycles, convergence_running) = state
        .converger
        .as_ref()
        .map_or((0, false), |c| (c.cycles(), c.is_running()));

    let status = if leader {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(ReadyResponse {
            ready: leader,
            leader,
            convergence_cycles,
            convergence_running,
        }),
    )
}

/// GET /metrics - Prometheus text format.
async fn metrics(State(state): State<Arc<ServiceState>>) -> impl IntoResponse {
    state.prometheus.render()
}

/// POST /v1/converge - Request a cycle.
///
/// Returns:
/// - `202 Accepted` when the loop was woken
/// - `409 Conflict` if a cycle is already running
/// - `503 Service Unavailable` if convergence is disabled on this instance
async fn converge(State(state): State<Arc<ServiceState>>) -> impl IntoResponse {
    let Some(converger) = &state.converger else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "disabled",
                "message": "convergence is disabled on this instance"
            })),
        );
    };

    if converger.trigger() {
        (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({
                "status": "accepted",
                "message": "convergence cycle requested"
            })),
        )
    } else {
        (
            StatusCode::CONFLICT,
            Json(serde_json::json!({
                "status": "conflict",
                "message": "convergence already in progress"
            })),
        )
    }
}

fn router(state: Arc<ServiceState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics))
        .route("/v1/converge", post(converge))
        .with_state(state)
}

// ============================================================================
// Wiring
// ============================================================================

/// The store plus the matching lock implementation.
struct Backend {
    store: Arc<dyn Store>,
    elector: Arc<dyn LeaderElector>,
}

async fn open_backend(
    config: &StateConfig,
    encoder: Encoder,
    clock: Arc<dyn Clock>,
) -> Result<Backend> {
    match config.backend {
        BackendKind::Sql => {
            let url = config
                .database_url
                .as_deref()
                .context("database_url is required for the sql backend")?;
            let store = SqlStore::connect(
                url,
                config.max_open_connections,
                encoder,
                Arc::clone(&clock),
            )
            .await?
            .with_retry_policy(config.retry_policy());
            store.ensure_schema().await?;
            let elector = SqlLeaderElector::for_store(&store, config.lock_ttl, clock)
                .with_retry_policy(config.retry_policy());
            Ok(Backend {
                store: Arc::new(store),
                elector: Arc::new(elector),
            })
        }
        BackendKind::Kv => {
            let kv = MemoryKeyValue::new();
            let store = KvStore::new(kv.clone(), encoder, Arc::clone(&clock))
                .with_retry_policy(config.retry_policy());
            store.ensure_schema().await?;
            let elector = KvLeaderElector::new(kv, config.lock_ttl, clock);
            Ok(Backend {
                store: Arc::new(store),
                elector: Arc::new(elector),
            })
        }
    }
}

fn auction_client(config: &StateConfig) -> Arc<dyn AuctionClient> {
    if let Some(url) = &config.auctioneer_url {
        Arc::new(HttpAuctionClient::new(url.clone()))
    } else {
        tracing::warn!("no auctioneer configured, start and stop work is only logged");
        Arc::new(InMemoryAuctionClient::new())
    }
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
#[allow(clippy::too_many_lines)]
async fn main() -> Result<()> {
    let log_format = std::env::var(LOG_FORMAT_ENV)
        .ok()
        .map(|raw| raw.parse::<LogFormat>())
        .transpose()?
        .unwrap_or(LogFormat::Json);
    init_logging(log_format);

    let config = StateConfig::load()?;
    config.validate()?;
    let instance_id = config
        .instance_id
        .clone()
        .unwrap_or_else(|| ulid::Ulid::new().to_string());

    tracing::info!(
        backend = config.backend.as_str(),
        instance_id = %instance_id,
        lock_key = %config.lock_key,
        listen_port = config.listen_port,
        ?config,
        "starting state server"
    );

    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install prometheus recorder")?;

    let keys = KeyManager::from_specs(&config.encryption_keys, &config.active_key_label)?;
    let encoder = Encoder::new(Cryptor::new(keys));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let Backend { store, elector } = open_backend(&config, encoder, Arc::clone(&clock)).await?;

    let leadership = Arc::new(LeadershipCoordinator::new(
        elector,
        LeadershipConfig::new(config.lock_key.clone(), instance_id)
            .with_retry_interval(config.lock_retry_interval),
    ));
    tokio::select! {
        acquired = leadership.acquire() => acquired?,
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!("interrupted while waiting for the lock");
            return Ok(());
        }
    }

    if let Some(report) = Encryptor::new(Arc::clone(&store), config.active_key_label.clone())
        .run()
        .await?
    {
        tracing::info!(
            rewritten = report.rewritten,
            skipped = report.skipped,
            "encryption key rotation finished"
        );
    }

    let callback_pool = Arc::new(WorkPool::start(
        "task_callbacks",
        config.task_callback_workers,
        config.task_callback_queue_capacity,
    ));
    let callbacks = CallbackDispatch::new(
        Arc::clone(&callback_pool),
        Arc::new(HttpCallbackHandler::new(Arc::clone(&store))),
    );

    let service = Arc::new(
        StateService::new(
            Arc::clone(&store),
            Arc::clone(&leadership),
            config.hub_subscriber_buffer,
        )
        .with_callbacks(callbacks.clone()),
    );

    let converger = config.convergence_enabled.then(|| {
        Arc::new(
            Converger::new(
                &service,
                auction_client(&config),
                Arc::new(StaticCells::new(config.static_cells.clone())),
                Arc::clone(&clock),
                config.convergence(),
            )
            .with_callbacks(callbacks),
        )
    });
    let convergence_loop = converger.as_ref().map(Converger::start);

    let state = Arc::new(ServiceState {
        leadership: Arc::clone(&leadership),
        converger,
        prometheus,
    });
    let addr = SocketAddr::from(([0, 0, 0, 0], config.listen_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(address = %addr, "serving");

    let (stop_serving, mut serving_stopped) = tokio::sync::watch::channel(false);
    let mut server = tokio::spawn(async move {
        axum::serve(listener, router(state))
            .with_graceful_shutdown(async move {
                let _ = serving_stopped.changed().await;
            })
            .await
    });

    // Convergence halts on its own the moment the lease is lost; the rest of
    // the process follows.
    let finished_early = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown requested");
            None
        }
        () = leadership.wait_lost() => {
            tracing::error!("leadership lost, shutting down");
            None
        }
        joined = &mut server => Some(joined),
    };

    if let Some(handle) = convergence_loop {
        handle.stop().await;
    }
    service.close();
    let _ = stop_serving.send(true);
    let served = match finished_early {
        Some(joined) => joined,
        None => server.await,
    };
    callback_pool.stop().await;
    if let Err(e) = leadership.release().await {
        tracing::warn!(error = %e, "failed to release leadership lock");
    }

    served
        .context("http server task panicked")?
        .context("http server failed")?;
    if leadership.state() == lodestar_state::leader::LeadershipState::Lost {
        anyhow::bail!("leadership lock was lost");
    }
    tracing::info!("state server stopped");
    Ok(())
}
