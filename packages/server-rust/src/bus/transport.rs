//! Broker client seam. The bus only talks to brokers through these traits.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;

/// Capacity of each client's lifecycle event channel.
pub const CLIENT_EVENT_CAPACITY: usize = 64;

/// Lifecycle transitions reported by a broker client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Connect,
    Disconnect,
    Heartbeat,
    /// Unrecoverable client failure.
    Crash(String),
    Stop,
    RequestTimeout,
}

/// Replica acknowledgment required before a send completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acks {
    All,
    Leader,
    NoAck,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
}

/// One message to publish.
#[derive(Debug, Clone)]
pub struct ProducerRecord {
    pub topic: String,
    pub value: Bytes,
    pub acks: Acks,
    pub compression: Compression,
    pub timeout: Duration,
}

/// One message delivered to a consumer.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub offset: u64,
    pub value: Bytes,
}

/// Connection settings for one client.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Cluster name from the queue configuration.
    pub cluster: String,
    pub client_id: String,
    pub brokers: Vec<String>,
    pub ssl: bool,
}

/// Creates producer and consumer clients for a cluster.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn producer(&self, options: &ClientOptions) -> anyhow::Result<Box<dyn BrokerProducer>>;

    async fn consumer(
        &self,
        options: &ClientOptions,
        group_id: &str,
    ) -> anyhow::Result<Box<dyn BrokerConsumer>>;
}

#[async_trait]
pub trait BrokerProducer: Send + Sync {
    /// Subscribes to lifecycle events. Subscribe before `connect` to observe
    /// the initial `Connect`.
    fn events(&self) -> broadcast::Receiver<ClientEvent>;

    async fn connect(&self) -> anyhow::Result<()>;

    async fn send(&self, record: ProducerRecord) -> anyhow::Result<()>;

    async fn disconnect(&self) -> anyhow::Result<()>;
}

#[async_trait]
pub trait BrokerConsumer: Send + Sync {
    fn events(&self) -> broadcast::Receiver<ClientEvent>;

    async fn connect(&self) -> anyhow::Result<()>;

    async fn subscribe(&self, topic: &str, from_beginning: bool) -> anyhow::Result<()>;

    /// Waits for the next message. `Ok(None)` once the consumer is stopped;
    /// `Err` after a crash.
    async fn recv(&self) -> anyhow::Result<Option<InboundMessage>>;

    /// Marks `message` as processed for the consumer group.
    async fn commit(&self, message: &InboundMessage) -> anyhow::Result<()>;

    async fn disconnect(&self) -> anyhow::Result<()>;
}
