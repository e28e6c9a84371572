//! In-process fan-out point for `emit` calls.
//!
//! Every producer subscribes one unbounded channel; an emission is copied to
//! each of them and the emitting handler returns immediately.

use std::sync::Arc;

use meshkit_core::address::WILDCARD;
use meshkit_core::{BrokerAddress, Envelope, MalformedAddress, Meta};
use parking_lot::RwLock;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Error)]
pub enum EmitError {
    #[error(transparent)]
    MalformedAddress(#[from] MalformedAddress),
    #[error("emit: `{0}` uses a wildcard event segment")]
    WildcardEvent(String),
}

/// An emitted `(address, envelope)` pair awaiting producers.
#[derive(Debug, Clone)]
pub struct Emission {
    pub address: BrokerAddress,
    pub envelope: Envelope,
}

#[derive(Debug, Default)]
pub struct EmitHub {
    sinks: RwLock<Vec<mpsc::UnboundedSender<Emission>>>,
}

impl EmitHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new listener; used once per producer.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Emission> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.sinks.write().push(tx);
        rx
    }

    /// Copies `emission` to every live listener and drops closed ones.
    /// Returns the number of listeners reached.
    pub fn publish(&self, emission: &Emission) -> usize {
        let mut sinks = self.sinks.write();
        sinks.retain(|sink| sink.send(emission.clone()).is_ok());
        sinks.len()
    }

    #[must_use]
    pub fn listeners(&self) -> usize {
        self.sinks.read().len()
    }
}

/// The `emit` capability handed to handlers, bound to the meta of the
/// request or message being handled.
#[derive(Debug, Clone)]
pub struct Emitter {
    hub: Option<Arc<EmitHub>>,
    meta: Arc<Meta>,
}

impl Emitter {
    #[must_use]
    pub fn new(hub: Option<Arc<EmitHub>>, meta: Meta) -> Self {
        Self {
            hub,
            meta: Arc::new(meta),
        }
    }

    /// Hands `{ meta, data }` to the bus without waiting for the broker.
    /// Scope and topic may be `*` to reach every cluster or topic; the event
    /// segment must be concrete.
    ///
    /// # Errors
    ///
    /// Returns an error if `address` is malformed or its event is a wildcard.
    pub fn emit(&self, address: &str, data: Value) -> Result<(), EmitError> {
        let address = BrokerAddress::parse(address)?;
        if address.event() == WILDCARD {
            return Err(EmitError::WildcardEvent(address.to_string()));
        }
        let Some(hub) = &self.hub else {
            debug!(%address, "no message bus configured, emit dropped");
            return Ok(());
        };
        let emission = Emission {
            address,
            envelope: Envelope::new((*self.meta).clone(), data),
        };
        let reached = hub.publish(&emission);
        debug!(address = %emission.address, reached, trace_id = %self.meta.trace_id(), "emit");
        Ok(())
    }
}
