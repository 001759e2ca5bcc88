//! Saga worker process.
//!
//! Runs the recovery sweeper against the configured saga store and serves
//! `/health` and `/metrics` over HTTP, with structured logging (tracing) and
//! Prometheus metrics.

pub mod config;
pub mod error;
pub mod routes;

use std::future::Future;
use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use saga::order_fulfillment;
use saga::{
    InMemoryInventoryService, InMemoryPaymentService, InMemoryShippingService, RecoverySweeper,
    SagaOrchestrator, SagaRegistry, SweepReport,
};
use saga_store::{IdempotencyGuard, SagaStateStore};
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use config::Config;
use error::Result;

/// Shared state of the HTTP handlers.
pub struct AppState {
    pub metrics_handle: PrometheusHandle,
    pub sweeps: watch::Receiver<Option<SweepReport>>,
    /// Name of the store backend, `"postgres"` or `"memory"`.
    pub backend: &'static str,
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(routes::health::check))
        .route("/metrics", get(routes::metrics::get))
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Registry of the saga types this worker drives.
pub fn build_registry() -> saga::Result<SagaRegistry> {
    let definition = order_fulfillment::definition(
        InMemoryInventoryService::new(),
        InMemoryPaymentService::new(),
        InMemoryShippingService::new(),
    )?;
    SagaRegistry::new().with(definition)
}

/// Runs the sweeper and the HTTP server on the given backend until
/// `shutdown` resolves, then waits for the sweeper to stop.
pub async fn serve<S, G, F>(
    config: &Config,
    store: S,
    guard: G,
    backend: &'static str,
    metrics_handle: PrometheusHandle,
    shutdown: F,
) -> Result<()>
where
    S: SagaStateStore + 'static,
    G: IdempotencyGuard + 'static,
    F: Future<Output = ()> + Send + 'static,
{
    let orchestrator = SagaOrchestrator::new(
        store,
        guard,
        build_registry()?,
        config.orchestrator_config(),
    );
    let sweeper = RecoverySweeper::new(Arc::new(orchestrator), config.sweeper_config());

    let state = Arc::new(AppState {
        metrics_handle,
        sweeps: sweeper.subscribe(),
        backend,
    });

    let (stop_tx, mut stop_rx) = watch::channel(false);
    let sweeper_task = tokio::spawn(async move {
        sweeper
            .run(async move {
                let _ = stop_rx.wait_for(|stop| *stop).await;
            })
            .await;
    });

    let listener = tokio::net::TcpListener::bind(config.addr()).await?;
    tracing::info!(addr = %listener.local_addr()?, backend, "starting saga worker");

    axum::serve(listener, create_app(state))
        .with_graceful_shutdown(async move {
            shutdown.await;
            let _ = stop_tx.send(true);
        })
        .await?;

    sweeper_task.await?;
    tracing::info!("worker shut down gracefully");
    Ok(())
}
