//! HTTP exporter with graceful shutdown

use axum::{
    extract::State,
    http::header,
    response::{Html, IntoResponse, Response},
    routing::get,
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};

use crate::{
    config::Config,
    error::{Error, Result},
    health::{self, SourceHealth},
    registry::MetricsRegistry,
};

const LANDING_PAGE: &str = r#"<html>
<head><title>Audit Exporter</title></head>
<body>
<h1>Audit Exporter</h1>
<p><a href="/metrics">Metrics</a></p>
</body>
</html>
"#;

/// State shared by the HTTP handlers
#[derive(Debug, Clone)]
pub struct ExporterState {
    registry: MetricsRegistry,
    service_name: Arc<str>,
    source_health: SourceHealth,
}

impl ExporterState {
    /// Create handler state over `registry`
    pub fn new(registry: MetricsRegistry, service_name: impl Into<Arc<str>>) -> Self {
        Self {
            registry,
            service_name: service_name.into(),
            source_health: SourceHealth::new(),
        }
    }

    /// Report audit source liveness from `health`
    pub fn with_source_health(mut self, health: SourceHealth) -> Self {
        self.source_health = health;
        self
    }

    /// The metrics registry
    pub fn registry(&self) -> &MetricsRegistry {
        &self.registry
    }

    /// Configured service name
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Audit source liveness
    pub fn source_health(&self) -> &SourceHealth {
        &self.source_health
    }
}

/// Routes served by the exporter
pub fn router(state: ExporterState) -> Router {
    Router::new()
        .route("/", get(landing))
        .route("/metrics", get(metrics))
        .route("/health", get(health::health))
        .with_state(state)
}

async fn landing() -> Html<&'static str> {
    Html(LANDING_PAGE)
}

async fn metrics(State(state): State<ExporterState>) -> Result<Response> {
    let body = state.registry.render()?;
    Ok(([(header::CONTENT_TYPE, state.registry.content_type())], body).into_response())
}

/// Server instance
pub struct Server {
    config: Config,
    registry: MetricsRegistry,
    source_health: SourceHealth,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config, registry: MetricsRegistry) -> Self {
        Self {
            config,
            registry,
            source_health: SourceHealth::new(),
        }
    }

    /// Report audit source liveness on `/health`
    pub fn with_source_health(mut self, health: SourceHealth) -> Self {
        self.source_health = health;
        self
    }

    /// Bind the configured port
    ///
    /// Failing to bind is fatal to the exporter.
    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.service.port));
        TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::Serve(format!("failed to listen on {}: {}", addr, e)))
    }

    /// Serve on `listener` until `shutdown` is cancelled
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let state = ExporterState::new(self.registry.clone(), self.config.service.name.clone())
            .with_source_health(self.source_health.clone());

        let app = router(state).layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(true))
                .on_response(DefaultOnResponse::new().include_headers(true)),
        );

        let addr = listener
            .local_addr()
            .map_err(|e| Error::Serve(e.to_string()))?;
        tracing::info!("{} listening on {}", self.config.service.name, addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(|e| Error::Serve(e.to_string()))?;

        tracing::info!("Server shutdown complete");

        Ok(())
    }
}

/// Wait for SIGINT or SIGTERM, then cancel `shutdown`
///
/// Returns early if `shutdown` is cancelled elsewhere.
pub async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl+C), starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        },
        _ = shutdown.cancelled() => return,
    }

    shutdown.cancel();
}
