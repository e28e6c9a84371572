//! Producer side of a cluster: drains the emit hub onto matching topics.

use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::join_all;
use meshkit_core::{BrokerAddress, Envelope, MetaStamp, WireMessage};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::config::ProducerProfile;
use super::hub::Emission;
use super::transport::{Acks, BrokerProducer, Compression, ProducerRecord};

pub(crate) struct ProducerLoop {
    cluster: String,
    profiles: Vec<ProducerProfile>,
    producer: Arc<dyn BrokerProducer>,
    stamp: MetaStamp,
}

impl ProducerLoop {
    pub(crate) fn new(
        cluster: impl Into<String>,
        profiles: Vec<ProducerProfile>,
        producer: Arc<dyn BrokerProducer>,
        stamp: MetaStamp,
    ) -> Self {
        Self {
            cluster: cluster.into(),
            profiles,
            producer,
            stamp,
        }
    }

    /// Profiles whose cluster and topic the emitted address selects.
    fn destinations(&self, address: &BrokerAddress) -> Vec<&ProducerProfile> {
        self.profiles
            .iter()
            .filter(|profile| address.matches_destination(&self.cluster, &profile.topic))
            .collect()
    }

    /// Sends one emission to every matching topic. Failures are logged and
    /// never reach the emitter. Returns the number of successful sends.
    pub(crate) async fn deliver(&self, emission: Emission) -> usize {
        let targets = self.destinations(&emission.address);
        if targets.is_empty() {
            debug!(cluster = %self.cluster, address = %emission.address, "no producer topic matches");
            return 0;
        }

        let message = WireMessage {
            event: emission.address.event().to_string(),
            content: Envelope::new(self.stamp.stamp(&emission.envelope.meta), emission.envelope.data),
        };
        let value = match serde_json::to_vec(&message) {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => {
                warn!(cluster = %self.cluster, error = %e, "failed to encode broker message");
                return 0;
            }
        };

        let message = &message;
        let sends = targets.into_iter().map(|profile| {
            let record = ProducerRecord {
                topic: profile.topic.clone(),
                value: value.clone(),
                acks: Acks::All,
                compression: Compression::None,
                timeout: profile.timeout(),
            };
            async move {
                let topic = record.topic.clone();
                let result = self.producer.send(record).await;
                if let Err(e) = &result {
                    warn!(
                        cluster = %self.cluster,
                        topic = %topic,
                        event = %message.event,
                        trace_id = %message.content.meta.trace_id(),
                        error = %e,
                        "broker publish failed"
                    );
                }
                result.is_ok()
            }
        });
        join_all(sends).await.into_iter().filter(|ok| *ok).count()
    }

    /// Runs until the hub side of `emissions` is gone. Each emission is
    /// delivered on its own task so a slow acknowledgment does not hold up
    /// later emissions.
    pub(crate) async fn run(self: Arc<Self>, mut emissions: mpsc::UnboundedReceiver<Emission>) {
        while let Some(emission) = emissions.recv().await {
            let this = Arc::clone(&self);
            tokio::spawn(async move {
                this.deliver(emission).await;
            });
        }
        debug!(cluster = %self.cluster, "producer loop finished");
    }
}
