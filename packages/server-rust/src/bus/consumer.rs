//! Consumer side of a cluster: dispatches each inbound message to every
//! matching broker binding, then commits.

use std::sync::Arc;
use std::time::Instant;

use futures_util::future::join_all;
use meshkit_core::{BrokerAddress, WireMessage};
use tracing::{debug, error, info_span, warn, Instrument};

use super::transport::{BrokerConsumer, InboundMessage};
use crate::controller::{BrokerBinding, HandlerContext};

/// Outcome of dispatching one inbound message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Dispatched {
    pub matched: usize,
    pub failed: usize,
}

pub(crate) struct ConsumerLoop {
    cluster: String,
    consumer: Arc<dyn BrokerConsumer>,
    bindings: Arc<[BrokerBinding]>,
    context: HandlerContext,
}

impl ConsumerLoop {
    pub(crate) fn new(
        cluster: impl Into<String>,
        consumer: Arc<dyn BrokerConsumer>,
        bindings: Arc<[BrokerBinding]>,
        context: HandlerContext,
    ) -> Self {
        Self {
            cluster: cluster.into(),
            consumer,
            bindings,
            context,
        }
    }

    /// Receives until the consumer stops. One message is fully handled and
    /// committed before the next is requested.
    ///
    /// # Errors
    ///
    /// Returns the consumer's error after a crash.
    pub(crate) async fn run(self) -> anyhow::Result<()> {
        while let Some(message) = self.consumer.recv().await? {
            self.dispatch(&message).await;
            if let Err(e) = self.consumer.commit(&message).await {
                warn!(cluster = %self.cluster, topic = %message.topic, offset = message.offset, error = %e, "offset commit failed");
            }
        }
        debug!(cluster = %self.cluster, "consumer loop finished");
        Ok(())
    }

    /// Runs every handler bound to a pattern matching the message's
    /// `cluster:topic:event` concurrently and waits for all of them. Handler
    /// failures are logged and never abort siblings. Undecodable messages
    /// are logged and skipped.
    pub(crate) async fn dispatch(&self, message: &InboundMessage) -> Dispatched {
        let wire: WireMessage = match serde_json::from_slice(&message.value) {
            Ok(wire) => wire,
            Err(e) => {
                warn!(cluster = %self.cluster, topic = %message.topic, offset = message.offset, error = %e, "undecodable broker message skipped");
                return Dispatched::default();
            }
        };
        let address = match BrokerAddress::concrete(&self.cluster, &message.topic, &wire.event) {
            Ok(address) => address,
            Err(e) => {
                warn!(cluster = %self.cluster, topic = %message.topic, error = %e, "broker message with unusable event skipped");
                return Dispatched::default();
            }
        };

        let matching: Vec<&BrokerBinding> = self
            .bindings
            .iter()
            .filter(|binding| binding.pattern.matches(&address))
            .collect();

        let span = info_span!(
            "broker_message",
            cluster = %self.cluster,
            topic = %message.topic,
            event = %wire.event,
            trace_id = %wire.content.meta.trace_id(),
            handlers = matching.len(),
            outcome = tracing::field::Empty,
            duration_ms = tracing::field::Empty,
        );
        let started = Instant::now();

        let tasks = matching.iter().map(|binding| {
            let params = self
                .context
                .params(wire.content.data.clone(), wire.content.meta.clone());
            let pattern = binding.pattern.to_string();
            let handle = tokio::spawn((binding.handler)(params).instrument(span.clone()));
            async move { (pattern, handle.await) }
        });

        let mut failed = 0;
        for (pattern, result) in join_all(tasks).await {
            match result {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    failed += 1;
                    span.in_scope(|| warn!(%pattern, error = ?e, "broker handler failed"));
                }
                Err(e) => {
                    failed += 1;
                    span.in_scope(|| error!(%pattern, error = %e, "broker handler panicked"));
                }
            }
        }

        let outcome = if failed == 0 { "ok" } else { "partial" };
        #[allow(clippy::cast_possible_truncation)]
        let duration_ms = started.elapsed().as_millis() as u64;
        span.record("outcome", outcome);
        span.record("duration_ms", duration_ms);
        span.in_scope(|| {
            tracing::info!(matched = matching.len(), failed, duration_ms, outcome, "broker message handled");
        });

        Dispatched {
            matched: matching.len(),
            failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use serde_json::{json, Value};
    use tokio::sync::Barrier;

    use super::*;
    use crate::bus::memory::MemoryBroker;
    use crate::bus::transport::{BrokerConnector, ClientOptions};
    use crate::controller::{Controller, ControllerRegistry, Params};
    use crate::remote::{RemoteClient, ServiceDirectory};

    fn context() -> HandlerContext {
        let remote = RemoteClient::new(ServiceDirectory::default(), Duration::from_secs(1)).unwrap();
        HandlerContext::new(remote, None)
    }

    fn wire(event: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "event": event,
            "content": {
                "meta": {
                    "serviceId": "gateway",
                    "timestamp": "2024-01-01T00:00:00.000Z",
                    "request": {"traceId": "t-5", "ipAddress": "127.0.0.1", "source": "test"}
                },
                "data": {"n": 1}
            }
        }))
        .unwrap()
    }

    fn counting(address: &str, counter: &Arc<AtomicUsize>) -> Controller {
        let counter = Arc::clone(counter);
        Controller::on([address.to_string()], move |params: Params| {
            let counter = Arc::clone(&counter);
            async move {
                assert_eq!(params.meta.trace_id(), "t-5");
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(params.data)
            }
        })
        .build()
        .unwrap()
    }

    /// Handler that only returns once `barrier` has as many waiters as parties.
    fn rendezvous(address: &str, barrier: &Arc<Barrier>) -> Controller {
        let barrier = Arc::clone(barrier);
        Controller::on([address.to_string()], move |_params: Params| {
            let barrier = Arc::clone(&barrier);
            async move {
                barrier.wait().await;
                Ok(Value::Null)
            }
        })
        .build()
        .unwrap()
    }

    async fn consumer_loop(broker: &MemoryBroker, registry: &ControllerRegistry) -> ConsumerLoop {
        let options = ClientOptions {
            cluster: "q".into(),
            client_id: "svc:queue:q:client".into(),
            brokers: vec!["memory".into()],
            ssl: false,
        };
        let consumer = broker.consumer(&options, "svc:queue:q:consumer:group").await.unwrap();
        consumer.subscribe("t", true).await.unwrap();
        ConsumerLoop::new("q", Arc::from(consumer), registry.broker_bindings().into(), context())
    }

    #[tokio::test]
    async fn wildcard_pattern_receives_matching_event() {
        let hits = Arc::new(AtomicUsize::new(0));
        let misses = Arc::new(AtomicUsize::new(0));
        let mut registry = ControllerRegistry::new();
        registry.register(counting("q:t:*", &hits)).unwrap();
        registry.register(counting("r:t:e", &misses)).unwrap();

        let broker = MemoryBroker::new();
        broker.publish("q", "t", wire("e"));
        let consumer = consumer_loop(&broker, &registry).await;
        let message = consumer.consumer.recv().await.unwrap().unwrap();

        let dispatched = consumer.dispatch(&message).await;
        assert_eq!(dispatched, Dispatched { matched: 1, failed: 0 });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(misses.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn matching_handlers_run_concurrently() {
        let barrier = Arc::new(Barrier::new(2));
        let mut registry = ControllerRegistry::new();
        registry.register(rendezvous("q:t:e", &barrier)).unwrap();
        registry.register(rendezvous("q:t:*", &barrier)).unwrap();

        let broker = MemoryBroker::new();
        broker.publish("q", "t", wire("e"));
        let consumer = consumer_loop(&broker, &registry).await;
        let message = consumer.consumer.recv().await.unwrap().unwrap();

        let dispatched = tokio::time::timeout(Duration::from_secs(2), consumer.dispatch(&message))
            .await
            .expect("handlers for one message must overlap");
        assert_eq!(dispatched, Dispatched { matched: 2, failed: 0 });
    }

    #[tokio::test]
    async fn failing_handler_does_not_block_siblings_or_commit() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut registry = ControllerRegistry::new();
        registry.register(counting("q:t:e", &hits)).unwrap();
        registry
            .register(
                Controller::on(["q:*:e"], |_params: Params| async move {
                    Err::<Value, _>(anyhow::anyhow!("boom"))
                })
                .build()
                .unwrap(),
            )
            .unwrap();
        registry.register(counting("*:*:*", &hits)).unwrap();

        let broker = MemoryBroker::new();
        broker.publish("q", "t", wire("e"));
        let consumer = consumer_loop(&broker, &registry).await;
        let inner = Arc::clone(&consumer.consumer);
        let task = tokio::spawn(consumer.run());

        for _ in 0..100 {
            if broker.committed_offset("q", "svc:queue:q:consumer:group", "t") == Some(1) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(broker.committed_offset("q", "svc:queue:q:consumer:group", "t"), Some(1));

        inner.disconnect().await.unwrap();
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn undecodable_message_is_skipped() {
        let registry = ControllerRegistry::new();
        let broker = MemoryBroker::new();
        broker.publish("q", "t", "not json");
        let consumer = consumer_loop(&broker, &registry).await;
        let message = consumer.consumer.recv().await.unwrap().unwrap();
        assert_eq!(consumer.dispatch(&message).await, Dispatched::default());
    }

    #[tokio::test]
    async fn crash_ends_the_loop_with_an_error() {
        let registry = ControllerRegistry::new();
        let broker = MemoryBroker::new();
        let consumer = consumer_loop(&broker, &registry).await;
        let task = tokio::spawn(consumer.run());
        tokio::time::sleep(Duration::from_millis(10)).await;
        broker.crash_consumers("q", "rebalance failed");
        assert!(task.await.unwrap().is_err());
    }
}
