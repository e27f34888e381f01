use anyhow::{Context, Result};
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use termrelay_terminal::{spawn_reaper, SessionRegistry};

use crate::config::RelayConfig;
use crate::web::routes::{self, AppState};

/// Upper bound for open connections to flush their close frames
const CONNECTION_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Relay server instance.
///
/// Owns the session registry; connection handlers and the reaper borrow it
/// through `Arc`.
pub struct RelayServer {
    config: RelayConfig,
    registry: Arc<SessionRegistry>,
    shutdown: CancellationToken,
    connections: TaskTracker,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        let registry = Arc::new(SessionRegistry::new(config.shell.clone(), config.policy.clone()));
        Self {
            config,
            registry,
            shutdown: CancellationToken::new(),
            connections: TaskTracker::new(),
        }
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Cancelling this token drains the server
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn router(&self) -> Router {
        let state = AppState {
            registry: Arc::clone(&self.registry),
            persistent: self.config.persistent,
            shutdown: self.shutdown.clone(),
            connections: self.connections.clone(),
        };

        // Terminal pages are served from other origins
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        routes::create_router(state, &self.config.terminal_path)
            .layer(cors)
            .layer(TraceLayer::new_for_http())
    }

    /// Bind the configured address and serve until SIGINT/SIGTERM
    pub async fn start(self) -> Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr)
            .await
            .with_context(|| format!("Failed to bind {}", self.config.bind_addr))?;

        let token = self.shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            tracing::info!("shutdown signal received, draining sessions");
            token.cancel();
        });

        self.serve(listener).await
    }

    /// Serve on `listener` until the shutdown token is cancelled, then drain:
    /// stop the reaper, kill every shell, close every transport.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr().context("Listener has no local address")?;
        tracing::info!(%addr, path = %self.config.terminal_path, persistent = self.config.persistent, "relay listening");

        let reaper = spawn_reaper(Arc::clone(&self.registry), self.shutdown.child_token());
        let app = self.router();

        let served = axum::serve(listener, app)
            .with_graceful_shutdown(self.shutdown.clone().cancelled_owned())
            .await
            .context("Server error");

        // Also reached when serving failed
        self.shutdown.cancel();
        let _ = reaper.await;

        let drained = self.registry.shutdown().await;
        self.connections.close();
        if tokio::time::timeout(CONNECTION_DRAIN_TIMEOUT, self.connections.wait())
            .await
            .is_err()
        {
            tracing::warn!("connections still open after drain timeout");
        }
        tracing::info!(sessions = drained, "relay stopped");

        served
    }
}

/// Resolves on Ctrl+C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
