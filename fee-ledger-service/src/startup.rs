//! Application startup and lifecycle management.

use crate::config::FeeLedgerConfig;
use crate::handlers;
use crate::services::{
    metrics::init_metrics, Database, EventPublisher, LogSink, NotificationSink, PaymentEngine,
    RolloverEngine, WebhookSink,
};
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use service_core::error::AppError;
use service_core::middleware::metrics::metrics_middleware;
use service_core::middleware::tracing::{request_id_middleware, REQUEST_ID_HEADER};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub rollover: RolloverEngine,
    pub payments: PaymentEngine,
    pub events: EventPublisher,
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Connect, migrate and bind the listener.
    pub async fn build(config: FeeLedgerConfig) -> Result<Self, AppError> {
        init_metrics();

        let db = Database::new(
            &config.database.url,
            config.database.max_connections,
            config.database.min_connections,
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to PostgreSQL");
            e
        })?;

        db.run_migrations().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to run migrations");
            e
        })?;

        let events = EventPublisher::new(build_sink(&config)?);
        let rollover = RolloverEngine::new(db.clone(), config.ledger.clone(), events.clone());
        let payments = PaymentEngine::new(db.clone(), config.ledger.clone(), events.clone());

        let state = AppState {
            db,
            rollover,
            payments,
            events,
        };

        let addr: SocketAddr = format!("{}:{}", config.common.host, config.common.port)
            .parse()
            .map_err(|e| {
                AppError::ConfigError(anyhow::anyhow!("Invalid listen address: {}", e))
            })?;
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!(port = port, "Fee ledger listener bound");

        Ok(Self {
            port,
            listener,
            state,
        })
    }

    /// Get the port the server is listening on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Run the application until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let router = build_router(self.state);

        tracing::info!(
            service = "fee-ledger-service",
            version = env!("CARGO_PKG_VERSION"),
            port = self.port,
            "Service ready to accept connections"
        );

        axum::serve(self.listener, router).await.map_err(|e| {
            tracing::error!(error = %e, "HTTP server error");
            std::io::Error::other(format!("HTTP server error: {}", e))
        })
    }
}

/// Webhook sink when a URL is configured, otherwise the log sink.
fn build_sink(config: &FeeLedgerConfig) -> Result<Arc<dyn NotificationSink>, AppError> {
    match &config.notifications.webhook_url {
        Some(url) => {
            let sink = WebhookSink::new(
                url.clone(),
                Duration::from_millis(config.notifications.timeout_ms),
            )
            .map_err(AppError::ConfigError)?;
            tracing::info!(webhook_url = %url, "Ledger events delivered to webhook");
            Ok(Arc::new(sink))
        }
        None => Ok(Arc::new(LogSink)),
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics_handler))
        .route(
            "/payers",
            post(handlers::payers::create_payer).get(handlers::payers::list_payers),
        )
        .route(
            "/payers/:id",
            get(handlers::payers::get_payer).patch(handlers::payers::update_payer),
        )
        .route("/payers/:id/payments", get(handlers::payers::list_payments))
        .route(
            "/payers/:id/advance-credit",
            get(handlers::payers::get_advance_credit),
        )
        .route(
            "/periods",
            post(handlers::periods::open_period).get(handlers::periods::list_periods),
        )
        .route("/periods/active", get(handlers::periods::get_active_period))
        .route(
            "/periods/:id",
            axum::routing::delete(handlers::periods::delete_period),
        )
        .route(
            "/periods/:id/obligations",
            get(handlers::periods::list_obligations),
        )
        .route(
            "/periods/:id/summary",
            get(handlers::periods::get_period_summary),
        )
        .route("/payments", post(handlers::payments::apply_payment))
        .layer(middleware::from_fn(metrics_middleware))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get(REQUEST_ID_HEADER)
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri(),
                    version = ?request.version(),
                )
            }),
        )
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}
