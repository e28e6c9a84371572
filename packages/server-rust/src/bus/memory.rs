//! In-process broker used for local runs and tests.
//!
//! Each `(cluster, topic)` is a single-partition append-only log. Consumer
//! groups keep committed offsets; a new subscription resumes from the
//! group's committed offset, or starts at the beginning / end of the log
//! according to `from_beginning`.

use std::collections::BTreeMap;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{broadcast, Notify};

use super::transport::{
    BrokerConnector, BrokerConsumer, BrokerProducer, ClientEvent, ClientOptions, InboundMessage,
    ProducerRecord, CLIENT_EVENT_CAPACITY,
};

type TopicKey = (String, String);
type OffsetKey = (String, String, String);

#[derive(Default)]
struct BrokerState {
    logs: DashMap<TopicKey, Vec<Bytes>>,
    committed: DashMap<OffsetKey, u64>,
    appended: Notify,
    consumers: Mutex<Vec<Arc<ConsumerState>>>,
    failing_sends: AtomicBool,
}

impl BrokerState {
    fn append(&self, cluster: &str, topic: &str, value: Bytes) -> u64 {
        let mut log = self
            .logs
            .entry((cluster.to_string(), topic.to_string()))
            .or_default();
        log.push(value);
        let offset = log.len() as u64 - 1;
        drop(log);
        self.appended.notify_waiters();
        offset
    }

    fn log_len(&self, cluster: &str, topic: &str) -> u64 {
        self.logs
            .get(&(cluster.to_string(), topic.to_string()))
            .map_or(0, |log| log.len() as u64)
    }

    fn read(&self, cluster: &str, topic: &str, offset: u64) -> Option<Bytes> {
        let log = self.logs.get(&(cluster.to_string(), topic.to_string()))?;
        log.get(usize::try_from(offset).ok()?).cloned()
    }
}

/// Shared handle to an in-process broker. Clones share the same logs.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBroker")
            .field("topics", &self.state.logs.len())
            .finish_non_exhaustive()
    }
}

impl MemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a raw message as if another service had published it.
    pub fn publish(&self, cluster: &str, topic: &str, value: impl Into<Bytes>) -> u64 {
        self.state.append(cluster, topic, value.into())
    }

    /// Every message published to `topic`, oldest first.
    #[must_use]
    pub fn records(&self, cluster: &str, topic: &str) -> Vec<Bytes> {
        self.state
            .logs
            .get(&(cluster.to_string(), topic.to_string()))
            .map(|log| log.value().clone())
            .unwrap_or_default()
    }

    /// Next offset the group will read from `topic`, if it ever committed.
    #[must_use]
    pub fn committed_offset(&self, cluster: &str, group: &str, topic: &str) -> Option<u64> {
        self.state
            .committed
            .get(&(cluster.to_string(), group.to_string(), topic.to_string()))
            .map(|offset| *offset)
    }

    /// Makes subsequent producer sends fail.
    pub fn fail_sends(&self, fail: bool) {
        self.state.failing_sends.store(fail, Ordering::SeqCst);
    }

    /// Crashes every consumer connected to `cluster`.
    pub fn crash_consumers(&self, cluster: &str, reason: &str) {
        let consumers = self.state.consumers.lock().clone();
        for consumer in consumers.iter().filter(|c| c.cluster == cluster) {
            *consumer.crashed.lock() = Some(reason.to_string());
            let _ = consumer.events.send(ClientEvent::Crash(reason.to_string()));
        }
        self.state.appended.notify_waiters();
    }
}

#[async_trait]
impl BrokerConnector for MemoryBroker {
    async fn producer(&self, options: &ClientOptions) -> anyhow::Result<Box<dyn BrokerProducer>> {
        let (events, _) = broadcast::channel(CLIENT_EVENT_CAPACITY);
        Ok(Box::new(MemoryProducer {
            cluster: options.cluster.clone(),
            state: Arc::clone(&self.state),
            events,
            connected: AtomicBool::new(false),
        }))
    }

    async fn consumer(
        &self,
        options: &ClientOptions,
        group_id: &str,
    ) -> anyhow::Result<Box<dyn BrokerConsumer>> {
        let (events, _) = broadcast::channel(CLIENT_EVENT_CAPACITY);
        let consumer = Arc::new(ConsumerState {
            cluster: options.cluster.clone(),
            group: group_id.to_string(),
            events,
            positions: Mutex::new(BTreeMap::new()),
            stopped: AtomicBool::new(false),
            crashed: Mutex::new(None),
        });
        self.state.consumers.lock().push(Arc::clone(&consumer));
        Ok(Box::new(MemoryConsumer {
            broker: Arc::clone(&self.state),
            consumer,
        }))
    }
}

// ---------------------------------------------------------------------------
// Producer
// ---------------------------------------------------------------------------

struct MemoryProducer {
    cluster: String,
    state: Arc<BrokerState>,
    events: broadcast::Sender<ClientEvent>,
    connected: AtomicBool,
}

#[async_trait]
impl BrokerProducer for MemoryProducer {
    fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    async fn connect(&self) -> anyhow::Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        let _ = self.events.send(ClientEvent::Connect);
        Ok(())
    }

    async fn send(&self, record: ProducerRecord) -> anyhow::Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            bail!("producer is not connected");
        }
        if self.state.failing_sends.load(Ordering::SeqCst) {
            bail!("broker rejected the record for topic {}", record.topic);
        }
        self.state.append(&self.cluster, &record.topic, record.value);
        Ok(())
    }

    async fn disconnect(&self) -> anyhow::Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.events.send(ClientEvent::Disconnect);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Consumer
// ---------------------------------------------------------------------------

struct ConsumerState {
    cluster: String,
    group: String,
    events: broadcast::Sender<ClientEvent>,
    /// Next offset to deliver, per subscribed topic.
    positions: Mutex<BTreeMap<String, u64>>,
    stopped: AtomicBool,
    crashed: Mutex<Option<String>>,
}

struct MemoryConsumer {
    broker: Arc<BrokerState>,
    consumer: Arc<ConsumerState>,
}

impl MemoryConsumer {
    fn poll(&self) -> Option<InboundMessage> {
        let mut positions = self.consumer.positions.lock();
        for (topic, position) in positions.iter_mut() {
            if let Some(value) = self.broker.read(&self.consumer.cluster, topic, *position) {
                let message = InboundMessage {
                    topic: topic.clone(),
                    offset: *position,
                    value,
                };
                *position += 1;
                return Some(message);
            }
        }
        None
    }
}

#[async_trait]
impl BrokerConsumer for MemoryConsumer {
    fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.consumer.events.subscribe()
    }

    async fn connect(&self) -> anyhow::Result<()> {
        let _ = self.consumer.events.send(ClientEvent::Connect);
        Ok(())
    }

    async fn subscribe(&self, topic: &str, from_beginning: bool) -> anyhow::Result<()> {
        let key = (
            self.consumer.cluster.clone(),
            self.consumer.group.clone(),
            topic.to_string(),
        );
        let start = match self.broker.committed.get(&key) {
            Some(committed) => *committed,
            None if from_beginning => 0,
            None => self.broker.log_len(&self.consumer.cluster, topic),
        };
        self.consumer
            .positions
            .lock()
            .insert(topic.to_string(), start);
        Ok(())
    }

    async fn recv(&self) -> anyhow::Result<Option<InboundMessage>> {
        loop {
            let mut notified = pin!(self.broker.appended.notified());
            notified.as_mut().enable();

            let crashed = self.consumer.crashed.lock().clone();
            if let Some(reason) = crashed {
                bail!("consumer crashed: {reason}");
            }
            if self.consumer.stopped.load(Ordering::SeqCst) {
                return Ok(None);
            }
            if let Some(message) = self.poll() {
                let _ = self.consumer.events.send(ClientEvent::Heartbeat);
                return Ok(Some(message));
            }
            notified.await;
        }
    }

    async fn commit(&self, message: &InboundMessage) -> anyhow::Result<()> {
        let key = (
            self.consumer.cluster.clone(),
            self.consumer.group.clone(),
            message.topic.clone(),
        );
        let next = message.offset + 1;
        self.broker
            .committed
            .entry(key)
            .and_modify(|offset| *offset = (*offset).max(next))
            .or_insert(next);
        Ok(())
    }

    async fn disconnect(&self) -> anyhow::Result<()> {
        self.consumer.stopped.store(true, Ordering::SeqCst);
        let _ = self.consumer.events.send(ClientEvent::Stop);
        let _ = self.consumer.events.send(ClientEvent::Disconnect);
        self.broker.appended.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::bus::transport::{Acks, Compression};

    fn options(cluster: &str) -> ClientOptions {
        ClientOptions {
            cluster: cluster.to_string(),
            client_id: format!("test:{cluster}"),
            brokers: vec!["memory".to_string()],
            ssl: false,
        }
    }

    fn record(topic: &str, value: &'static str) -> ProducerRecord {
        ProducerRecord {
            topic: topic.to_string(),
            value: Bytes::from_static(value.as_bytes()),
            acks: Acks::All,
            compression: Compression::None,
            timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn producer_requires_connect() {
        let broker = MemoryBroker::new();
        let producer = broker.producer(&options("main")).await.unwrap();
        assert!(producer.send(record("orders", "a")).await.is_err());

        let mut events = producer.events();
        producer.connect().await.unwrap();
        assert_eq!(events.recv().await.unwrap(), ClientEvent::Connect);
        producer.send(record("orders", "a")).await.unwrap();
        assert_eq!(broker.records("main", "orders").len(), 1);
        assert!(broker.records("other", "orders").is_empty());
    }

    #[tokio::test]
    async fn consumer_reads_from_beginning_and_commits() {
        let broker = MemoryBroker::new();
        broker.publish("main", "orders", "first");

        let consumer = broker.consumer(&options("main"), "g1").await.unwrap();
        consumer.connect().await.unwrap();
        consumer.subscribe("orders", true).await.unwrap();

        let message = consumer.recv().await.unwrap().unwrap();
        assert_eq!(message.value, Bytes::from_static(b"first"));
        assert_eq!(message.offset, 0);
        consumer.commit(&message).await.unwrap();
        assert_eq!(broker.committed_offset("main", "g1", "orders"), Some(1));
    }

    #[tokio::test]
    async fn latest_subscription_skips_existing_messages() {
        let broker = MemoryBroker::new();
        broker.publish("main", "orders", "old");

        let consumer = broker.consumer(&options("main"), "g1").await.unwrap();
        consumer.subscribe("orders", false).await.unwrap();

        let pending = tokio::spawn(async move { consumer.recv().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.publish("main", "orders", "new");

        let message = pending.await.unwrap().unwrap().unwrap();
        assert_eq!(message.value, Bytes::from_static(b"new"));
    }

    #[tokio::test]
    async fn group_resumes_from_committed_offset() {
        let broker = MemoryBroker::new();
        broker.publish("main", "orders", "a");
        broker.publish("main", "orders", "b");

        let first = broker.consumer(&options("main"), "g1").await.unwrap();
        first.subscribe("orders", true).await.unwrap();
        let message = first.recv().await.unwrap().unwrap();
        first.commit(&message).await.unwrap();
        first.disconnect().await.unwrap();
        assert!(first.recv().await.unwrap().is_none());

        let second = broker.consumer(&options("main"), "g1").await.unwrap();
        second.subscribe("orders", true).await.unwrap();
        let message = second.recv().await.unwrap().unwrap();
        assert_eq!(message.value, Bytes::from_static(b"b"));
    }

    #[tokio::test]
    async fn crash_fails_recv_and_emits_event() {
        let broker = MemoryBroker::new();
        let consumer = broker.consumer(&options("main"), "g1").await.unwrap();
        let mut events = consumer.events();
        consumer.subscribe("orders", false).await.unwrap();

        broker.crash_consumers("main", "partition lost");
        assert_eq!(
            events.recv().await.unwrap(),
            ClientEvent::Crash("partition lost".to_string())
        );
        assert!(consumer.recv().await.is_err());
    }
}
