//! Application assembly: configuration in, a running service out.
//!
//! [`App::bind`] builds every collaborator, binds the HTTP listener and
//! connects the message bus; [`Server::run`] serves until a shutdown signal
//! or a fatal broker failure.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use axum::Router;
use meshkit_core::{ErrorTranslator, MessageCatalog, MetaStamp};
use tokio::sync::{oneshot, watch};
use tracing::{error, info};

use crate::bus::hub::EmitHub;
use crate::bus::transport::BrokerConnector;
use crate::bus::{FatalError, MessageBus};
use crate::config::AppConfig;
use crate::controller::{ControllerRegistry, HandlerContext};
use crate::health::HealthAggregator;
use crate::network::{build_router, AppState, Dispatcher, NetworkModule};
use crate::remote::{RemoteClient, ServiceDirectory};

/// A configured but not yet started service.
pub struct App {
    config: AppConfig,
    registry: ControllerRegistry,
    connector: Option<Arc<dyn BrokerConnector>>,
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("service_id", &self.config.service_id)
            .field("controllers", &self.registry.len())
            .field("broker", &self.connector.is_some())
            .finish()
    }
}

impl App {
    #[must_use]
    pub fn new(config: AppConfig, registry: ControllerRegistry) -> Self {
        Self {
            config,
            registry,
            connector: None,
        }
    }

    /// Broker client factory used when the `queue` section is configured.
    #[must_use]
    pub fn with_broker(mut self, connector: Arc<dyn BrokerConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    fn catalog(&self) -> anyhow::Result<MessageCatalog> {
        let i18n = &self.config.i18n;
        let mut catalog = MessageCatalog::new(i18n.fallback_language.clone())
            .with_escape_values(i18n.escape_values);
        let loaded = catalog
            .load_dir(&i18n.locales_dir)
            .context("loading locales")?;
        info!(loaded, languages = ?catalog.languages(), "message catalog ready");
        Ok(catalog)
    }

    /// Builds the service, binds its listener and connects the message bus.
    ///
    /// # Errors
    ///
    /// Returns an error if the locales cannot be loaded, the queue section is
    /// invalid or has no broker connector, the port cannot be bound, or a
    /// broker client fails to connect or subscribe.
    pub async fn bind(self) -> anyhow::Result<Server> {
        let catalog = self.catalog()?;
        let config = self.config;
        let health = Arc::new(HealthAggregator::new());

        let directory = ServiceDirectory::new(config.services.clone(), config.env.clone());
        let remote = RemoteClient::new(directory, Duration::from_millis(config.call_timeout_ms))?;

        let bus = match (&config.queue, self.connector) {
            (None, _) => None,
            (Some(_), None) => anyhow::bail!("queue is configured but no broker connector is set"),
            (Some(queue), Some(connector)) => Some(MessageBus::new(
                config.service_id.clone(),
                queue.clone(),
                connector,
                Arc::clone(&health),
                Arc::new(EmitHub::new()),
            )?),
        };
        let context = HandlerContext::new(remote, bus.as_ref().map(|bus| Arc::clone(bus.hub())));

        let dispatcher = Dispatcher::new(
            ErrorTranslator::new(Arc::new(catalog)),
            MetaStamp::new(config.service_id.clone()),
            context.clone(),
        );

        let mut network = NetworkModule::new(
            config.http.clone(),
            Arc::clone(&health),
            config.http_record(),
            Duration::from_millis(config.shutdown_timeout_ms),
        );
        let state = AppState {
            shutdown: network.shutdown_controller(),
            health: Arc::clone(&health),
            dispatcher: Arc::new(dispatcher),
            start_time: Instant::now(),
        };
        let router = build_router(state, self.registry.route_bindings(), &config.http);
        let local_addr = network.start().await?;

        let fatal = match &bus {
            Some(bus) => {
                bus.start(self.registry.broker_bindings().into(), context)
                    .await?;
                Some(bus.fatal_receiver())
            }
            None => None,
        };

        info!(
            service_id = %config.service_id,
            %local_addr,
            controllers = self.registry.len(),
            bus = bus.is_some(),
            "service bound"
        );

        Ok(Server {
            local_addr,
            router,
            network,
            health,
            fatal,
            crash_exit_delay: Duration::from_millis(config.crash_exit_delay_ms),
            _bus: bus,
        })
    }
}

/// A bound service ready to accept connections.
pub struct Server {
    local_addr: SocketAddr,
    router: Router,
    network: NetworkModule,
    health: Arc<HealthAggregator>,
    fatal: Option<watch::Receiver<Option<FatalError>>>,
    crash_exit_delay: Duration,
    _bus: Option<MessageBus>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.local_addr)
            .field("health", &self.health)
            .finish_non_exhaustive()
    }
}

impl Server {
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[must_use]
    pub fn health(&self) -> &Arc<HealthAggregator> {
        &self.health
    }

    /// Router with every route and layer, for in-process requests.
    #[must_use]
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Serves until `signal` resolves or a broker consumer crashes, then
    /// shuts down gracefully.
    ///
    /// # Errors
    ///
    /// Returns the [`FatalError`] after the crash exit delay when a consumer
    /// crashed, or any server I/O error.
    pub async fn run(self, signal: impl Future<Output = ()> + Send) -> anyhow::Result<()> {
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let serve = self.network.serve(self.router, async move {
            let _ = stop_rx.await;
        });
        tokio::pin!(serve);

        let fatal = tokio::select! {
            result = &mut serve => return result,
            () = signal => None,
            fatal = wait_fatal(self.fatal) => Some(fatal),
        };

        if let Some(fatal) = &fatal {
            error!(error = %fatal, delay = ?self.crash_exit_delay, "broker failure, exiting");
            // Keep accepting connections through the grace window.
            tokio::select! {
                result = &mut serve => {
                    result?;
                    return Err(fatal.clone().into());
                }
                () = tokio::time::sleep(self.crash_exit_delay) => {}
            }
        }
        let _ = stop_tx.send(());
        serve.await?;

        match fatal {
            Some(fatal) => Err(fatal.into()),
            None => Ok(()),
        }
    }
}

async fn wait_fatal(rx: Option<watch::Receiver<Option<FatalError>>>) -> FatalError {
    if let Some(mut rx) = rx {
        let fatal = rx
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|fatal| (*fatal).clone());
        if let Some(fatal) = fatal {
            return fatal;
        }
    }
    std::future::pending().await
}

/// Resolves on SIGINT, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received SIGINT"),
        () = terminate => info!("received SIGTERM"),
    }
}
