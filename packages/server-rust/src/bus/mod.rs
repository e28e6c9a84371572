//! Message bus: one producer and one consumer per configured broker cluster.
//!
//! Emissions reach producers through [`hub::EmitHub`]; inbound messages are
//! dispatched to the registry's broker bindings. Client lifecycle events
//! feed [`HealthAggregator`] records, and a consumer crash is published on
//! the fatal channel for the process owner to act on.

pub mod config;
pub mod hub;
pub mod memory;
pub mod transport;

mod consumer;
mod producer;

use std::sync::Arc;

use meshkit_core::MetaStamp;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tracing::{error, info, warn};

use self::config::{BusConfigError, ClusterConfig, QueueConfig};
use self::consumer::ConsumerLoop;
use self::hub::EmitHub;
use self::producer::ProducerLoop;
use self::transport::{BrokerConnector, BrokerConsumer, BrokerProducer, ClientEvent, ClientOptions};
use crate::controller::{BrokerBinding, HandlerContext};
use crate::health::HealthAggregator;

pub use self::config::{ConsumerProfile, ProducerProfile};
pub use self::hub::{Emission, EmitError, Emitter};
pub use self::memory::MemoryBroker;

/// An unrecoverable broker client failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{client} crashed: {reason}")]
pub struct FatalError {
    pub client: String,
    pub reason: String,
}

type FatalSender = Arc<watch::Sender<Option<FatalError>>>;

/// Client names derived from the service id and cluster name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientNames {
    pub client_id: String,
    pub producer: String,
    pub consumer: String,
    pub group: String,
}

impl ClientNames {
    #[must_use]
    pub fn new(service_id: &str, cluster: &str) -> Self {
        let base = format!("{service_id}:queue:{cluster}");
        let consumer = format!("{base}:consumer");
        Self {
            client_id: format!("{base}:client"),
            producer: format!("{base}:producer"),
            group: format!("{consumer}:group"),
            consumer,
        }
    }
}

pub struct MessageBus {
    service_id: String,
    config: QueueConfig,
    connector: Arc<dyn BrokerConnector>,
    health: Arc<HealthAggregator>,
    hub: Arc<EmitHub>,
    fatal: FatalSender,
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("service_id", &self.service_id)
            .field("clusters", &self.config.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl MessageBus {
    /// # Errors
    ///
    /// Returns an error if `config` breaks a queue configuration rule.
    pub fn new(
        service_id: impl Into<String>,
        config: QueueConfig,
        connector: Arc<dyn BrokerConnector>,
        health: Arc<HealthAggregator>,
        hub: Arc<EmitHub>,
    ) -> Result<Self, BusConfigError> {
        config::validate(&config)?;
        let (fatal, _rx) = watch::channel(None);
        Ok(Self {
            service_id: service_id.into(),
            config,
            connector,
            health,
            hub,
            fatal: Arc::new(fatal),
        })
    }

    #[must_use]
    pub fn hub(&self) -> &Arc<EmitHub> {
        &self.hub
    }

    /// Holds `Some` once a consumer has crashed.
    #[must_use]
    pub fn fatal_receiver(&self) -> watch::Receiver<Option<FatalError>> {
        self.fatal.subscribe()
    }

    /// Connects every cluster's clients, subscribes consumers and starts the
    /// producer and consumer loops. Disconnects are registered as shutdown
    /// callbacks.
    ///
    /// # Errors
    ///
    /// Returns the first client creation, connect or subscribe failure.
    pub async fn start(
        &self,
        bindings: Arc<[BrokerBinding]>,
        context: HandlerContext,
    ) -> anyhow::Result<()> {
        for (cluster, config) in &self.config {
            let names = ClientNames::new(&self.service_id, cluster);
            let options = ClientOptions {
                cluster: cluster.clone(),
                client_id: names.client_id.clone(),
                brokers: config.brokers.clone(),
                ssl: config.ssl,
            };
            self.start_producer(cluster, config, &names, &options).await?;
            self.start_consumer(cluster, config, &names, &options, Arc::clone(&bindings), context.clone())
                .await?;
            info!(
                cluster = %cluster,
                producers = config.producers.len(),
                consumers = config.consumers.len(),
                "broker cluster started"
            );
        }
        Ok(())
    }

    async fn start_producer(
        &self,
        cluster: &str,
        config: &ClusterConfig,
        names: &ClientNames,
        options: &ClientOptions,
    ) -> anyhow::Result<()> {
        self.health.register_service(&names.producer);
        let producer: Arc<dyn BrokerProducer> = Arc::from(self.connector.producer(options).await?);
        watch_events(
            producer.events(),
            names.producer.clone(),
            Arc::clone(&self.health),
            None,
        );

        let emissions = self.hub.subscribe();
        producer.connect().await?;

        let producer_loop = Arc::new(ProducerLoop::new(
            cluster,
            config.producers.clone(),
            Arc::clone(&producer),
            MetaStamp::new(self.service_id.clone()),
        ));
        let task = tokio::spawn(producer_loop.run(emissions));

        let name = names.producer.clone();
        self.health.register_shutdown(move || async move {
            task.abort();
            info!(client = %name, "disconnecting producer");
            producer.disconnect().await
        });
        Ok(())
    }

    async fn start_consumer(
        &self,
        cluster: &str,
        config: &ClusterConfig,
        names: &ClientNames,
        options: &ClientOptions,
        bindings: Arc<[BrokerBinding]>,
        context: HandlerContext,
    ) -> anyhow::Result<()> {
        self.health.register_service(&names.consumer);
        let consumer: Arc<dyn BrokerConsumer> =
            Arc::from(self.connector.consumer(options, &names.group).await?);
        watch_events(
            consumer.events(),
            names.consumer.clone(),
            Arc::clone(&self.health),
            Some(Arc::clone(&self.fatal)),
        );

        consumer.connect().await?;
        for profile in &config.consumers {
            consumer
                .subscribe(&profile.topic, profile.from_beginning)
                .await?;
        }

        let consumer_loop = ConsumerLoop::new(cluster, Arc::clone(&consumer), bindings, context);
        let health = Arc::clone(&self.health);
        let fatal = Arc::clone(&self.fatal);
        let name = names.consumer.clone();
        tokio::spawn(async move {
            if let Err(e) = consumer_loop.run().await {
                health.emit(&name, false);
                raise_fatal(&fatal, &name, &e.to_string());
            }
        });

        let name = names.consumer.clone();
        self.health.register_shutdown(move || async move {
            info!(client = %name, "disconnecting consumer");
            consumer.disconnect().await
        });
        Ok(())
    }
}

/// Mirrors client lifecycle events into the `name` health record.
fn watch_events(
    mut events: broadcast::Receiver<ClientEvent>,
    name: String,
    health: Arc<HealthAggregator>,
    fatal: Option<FatalSender>,
) {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ClientEvent::Connect | ClientEvent::Heartbeat) => health.emit(&name, true),
                Ok(ClientEvent::Disconnect | ClientEvent::Stop | ClientEvent::RequestTimeout) => {
                    health.emit(&name, false);
                }
                Ok(ClientEvent::Crash(reason)) => {
                    health.emit(&name, false);
                    match &fatal {
                        Some(fatal) => raise_fatal(fatal, &name, &reason),
                        None => warn!(client = %name, %reason, "broker client crashed"),
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(client = %name, skipped, "client events lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

/// Publishes the first fatal error; later ones are only logged.
fn raise_fatal(fatal: &FatalSender, client: &str, reason: &str) {
    error!(client, reason, "broker consumer crashed, process must exit");
    fatal.send_if_modified(|current| {
        if current.is_some() {
            return false;
        }
        *current = Some(FatalError {
            client: client.to_string(),
            reason: reason.to_string(),
        });
        true
    });
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use meshkit_core::{Identity, Meta, Request};
    use serde_json::json;

    use super::*;
    use crate::controller::{Controller, ControllerRegistry, Params};
    use crate::remote::{RemoteClient, ServiceDirectory};

    fn queue() -> QueueConfig {
        serde_json::from_value(json!({
            "q": {
                "brokers": ["memory:9092"],
                "producers": [{"topic": "t"}],
                "consumers": [{"topic": "t", "fromBeginning": true}]
            }
        }))
        .unwrap()
    }

    fn meta() -> Meta {
        Meta {
            service_id: "gateway".into(),
            timestamp: "2024-01-01T00:00:00.000Z".into(),
            request: Request {
                trace_id: "t-rt".into(),
                ip_address: "127.0.0.1".into(),
                identity: Identity::Source("test".into()),
                host: None,
                user_agent: None,
                method: None,
            },
            session_id: None,
            origin_id: None,
        }
    }

    fn counter(address: &str, hits: &Arc<AtomicUsize>) -> Controller {
        let hits = Arc::clone(hits);
        Controller::on([address.to_string()], move |params: Params| {
            let hits = Arc::clone(&hits);
            async move {
                assert_eq!(params.data, json!({"v": 1}));
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(json!({}))
            }
        })
        .build()
        .unwrap()
    }

    struct Fixture {
        broker: MemoryBroker,
        health: Arc<HealthAggregator>,
        bus: MessageBus,
        context: HandlerContext,
    }

    fn fixture() -> Fixture {
        let broker = MemoryBroker::new();
        let health = Arc::new(HealthAggregator::new());
        let hub = Arc::new(EmitHub::new());
        let bus = MessageBus::new(
            "svc",
            queue(),
            Arc::new(broker.clone()),
            Arc::clone(&health),
            Arc::clone(&hub),
        )
        .unwrap();
        let remote = RemoteClient::new(ServiceDirectory::default(), Duration::from_secs(1)).unwrap();
        let context = HandlerContext::new(remote, Some(hub));
        Fixture {
            broker,
            health,
            bus,
            context,
        }
    }

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        check()
    }

    #[test]
    fn client_names_follow_service_and_cluster() {
        let names = ClientNames::new("svc", "main");
        assert_eq!(names.client_id, "svc:queue:main:client");
        assert_eq!(names.producer, "svc:queue:main:producer");
        assert_eq!(names.consumer, "svc:queue:main:consumer");
        assert_eq!(names.group, "svc:queue:main:consumer:group");
    }

    #[test]
    fn invalid_config_is_rejected() {
        let result = MessageBus::new(
            "svc",
            QueueConfig::new(),
            Arc::new(MemoryBroker::new()),
            Arc::new(HealthAggregator::new()),
            Arc::new(EmitHub::new()),
        );
        assert!(matches!(result, Err(BusConfigError::NoClusters)));
    }

    #[tokio::test]
    async fn emitted_envelope_round_trips_to_wildcard_subscriber() {
        let f = fixture();
        let hits = Arc::new(AtomicUsize::new(0));
        let misses = Arc::new(AtomicUsize::new(0));
        let mut registry = ControllerRegistry::new();
        registry.register(counter("q:t:*", &hits)).unwrap();
        registry.register(counter("r:t:e", &misses)).unwrap();

        f.bus
            .start(registry.broker_bindings().into(), f.context.clone())
            .await
            .unwrap();
        assert!(eventually(|| f.health.is_ready()).await);

        let emitter = f.context.params(json!({}), meta()).emit;
        emitter.emit("q:t:e", json!({"v": 1})).unwrap();

        assert!(eventually(|| hits.load(Ordering::SeqCst) == 1).await);
        assert_eq!(misses.load(Ordering::SeqCst), 0);

        let records = f.broker.records("q", "t");
        let wire: serde_json::Value = serde_json::from_slice(&records[0]).unwrap();
        assert_eq!(wire["event"], "e");
        assert_eq!(wire["content"]["meta"]["serviceId"], "svc");
    }

    #[tokio::test]
    async fn consumer_crash_raises_fatal_error() {
        let f = fixture();
        f.bus
            .start(Vec::<BrokerBinding>::new().into(), f.context.clone())
            .await
            .unwrap();
        let mut fatal = f.bus.fatal_receiver();
        assert!(eventually(|| f.health.is_ready()).await);

        f.broker.crash_consumers("q", "partition lost");
        tokio::time::timeout(Duration::from_secs(1), fatal.changed())
            .await
            .unwrap()
            .unwrap();

        let error = fatal.borrow().clone().unwrap();
        assert_eq!(error.client, "svc:queue:q:consumer");
        assert!(eventually(|| f.health.status("svc:queue:q:consumer") == Some(false)).await);
        assert!(!f.health.is_ready());
    }

    #[tokio::test]
    async fn shutdown_disconnects_clients() {
        let f = fixture();
        f.bus
            .start(Vec::<BrokerBinding>::new().into(), f.context.clone())
            .await
            .unwrap();
        assert!(eventually(|| f.health.is_ready()).await);

        assert_eq!(f.health.run_shutdown(Duration::from_secs(1)).await, 2);
        assert!(eventually(|| f.health.status("svc:queue:q:producer") == Some(false)).await);
        assert!(eventually(|| f.health.status("svc:queue:q:consumer") == Some(false)).await);
        assert!(!f.health.is_ready());
    }
}
