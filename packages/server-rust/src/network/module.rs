//! Network module with deferred startup lifecycle.
//!
//! `new()` creates resources, `start()` binds the TCP listener, and
//! `serve()` starts accepting connections. Dependencies (the message bus)
//! are connected between `start()` and `serve()`.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::{info, warn};

use super::config::NetworkConfig;
use super::handlers::{
    fallback_handler, health_handler, liveness_handler, readiness_handler, AppState, Dispatcher,
};
use super::middleware::apply_http_layers;
use super::shutdown::ShutdownController;
use crate::controller::{RouteBinding, HEALTH_PATH};
use crate::health::HealthAggregator;

/// Assembles the health routes, one `POST` route per binding, the
/// not-found fallback and the middleware stack.
pub fn build_router(state: AppState, routes: Vec<RouteBinding>, config: &NetworkConfig) -> Router {
    let router = Router::new()
        .route(HEALTH_PATH, get(health_handler))
        .route(&format!("{HEALTH_PATH}/liveness"), get(liveness_handler))
        .route(&format!("{HEALTH_PATH}/readiness"), get(readiness_handler))
        .merge(Dispatcher::routes(routes))
        .fallback(fallback_handler)
        .method_not_allowed_fallback(fallback_handler);

    apply_http_layers(router, config).with_state(state)
}

/// Manages the HTTP server lifecycle.
pub struct NetworkModule {
    config: NetworkConfig,
    listener: Option<TcpListener>,
    health: Arc<HealthAggregator>,
    shutdown: Arc<ShutdownController>,
    shutdown_timeout: Duration,
}

impl NetworkModule {
    /// Creates the module and registers the server's own health record
    /// without binding any port.
    #[must_use]
    pub fn new(
        config: NetworkConfig,
        health: Arc<HealthAggregator>,
        record: impl Into<String>,
        shutdown_timeout: Duration,
    ) -> Self {
        let shutdown = Arc::new(ShutdownController::new(Arc::clone(&health), record));
        Self {
            config,
            listener: None,
            health,
            shutdown,
            shutdown_timeout,
        }
    }

    /// Returns a shared reference to the shutdown controller.
    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    /// Binds the TCP listener to the configured host and port.
    ///
    /// Returns the bound address, whose port differs from the configured one
    /// when port 0 is used.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound (e.g., port in use).
    pub async fn start(&mut self) -> anyhow::Result<SocketAddr> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("binding {addr}"))?;
        let local = listener.local_addr()?;

        info!("TCP listener bound to {local}");

        self.listener = Some(listener);
        Ok(local)
    }

    /// Serves `router` until `signal` fires.
    ///
    /// After the signal:
    /// 1. The server's health record flips to not-ready (Draining)
    /// 2. Registered shutdown callbacks run, bounded by the shutdown timeout
    /// 3. The listener stops accepting connections
    /// 4. In-flight requests get up to the drain timeout to finish
    ///
    /// # Errors
    ///
    /// Returns an error if `start()` was not called or the server hits a
    /// fatal I/O error.
    pub async fn serve(
        self,
        router: Router,
        signal: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let listener = self
            .listener
            .context("start() must be called before serve()")?;
        let shutdown_ctrl = self.shutdown;
        let health = self.health;
        let shutdown_timeout = self.shutdown_timeout;

        shutdown_ctrl.set_ready();
        info!("Serving HTTP connections");

        let graceful = {
            let shutdown_ctrl = Arc::clone(&shutdown_ctrl);
            async move {
                signal.await;
                info!("shutdown signal received");
                shutdown_ctrl.trigger_shutdown();
                health.run_shutdown(shutdown_timeout).await;
            }
        };

        axum::serve(listener, router)
            .with_graceful_shutdown(graceful)
            .await?;

        if shutdown_ctrl
            .wait_for_drain(self.config.drain_timeout())
            .await
        {
            info!("All in-flight requests drained");
        } else {
            warn!("Drain timeout expired with in-flight requests remaining");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::HealthState;

    fn module(port: u16) -> NetworkModule {
        let config = NetworkConfig {
            host: "127.0.0.1".to_string(),
            port,
            ..NetworkConfig::default()
        };
        NetworkModule::new(
            config,
            Arc::new(HealthAggregator::new()),
            "calc:http",
            Duration::from_secs(1),
        )
    }

    #[test]
    fn new_registers_http_record() {
        let module = module(0);
        assert!(module.listener.is_none());
        assert_eq!(module.health.status("calc:http"), Some(false));
    }

    #[test]
    fn shutdown_controller_returns_shared_arc() {
        let module = module(0);
        let s1 = module.shutdown_controller();
        let s2 = module.shutdown_controller();
        assert!(Arc::ptr_eq(&s1, &s2));
    }

    #[tokio::test]
    async fn start_binds_to_os_assigned_port() {
        let mut module = module(0);
        let addr = module.start().await.unwrap();
        assert!(addr.port() > 0);
        assert!(module.listener.is_some());
    }

    #[tokio::test]
    async fn serve_without_start_is_an_error() {
        let module = module(0);
        let result = module.serve(Router::new(), std::future::pending()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn signal_runs_shutdown_callbacks_and_stops() {
        let mut module = module(0);
        module.start().await.unwrap();
        let health = Arc::clone(&module.health);
        let ctrl = module.shutdown_controller();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel::<()>();
        health.register_shutdown(move || async move {
            let _ = done_tx.send(());
            anyhow::Ok(())
        });

        let server = tokio::spawn(module.serve(Router::new(), async move {
            let _ = rx.await;
        }));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(health.is_ready());

        tx.send(()).unwrap();
        server.await.unwrap().unwrap();
        assert!(done_rx.await.is_ok());
        assert_eq!(health.status("calc:http"), Some(false));
        assert_eq!(ctrl.health_state(), HealthState::Stopped);
    }
}
