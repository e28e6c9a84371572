//! Static service directory and the synchronous cross-service `call`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use meshkit_core::{BaseError, Envelope, ErrorEnvelope, MalformedAddress, Meta, RoutePath};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

/// Port used when a service has no entry for the current environment.
pub const DEFAULT_SERVICE_PORT: u16 = 3000;

/// Environment tag under which services are reached on `localhost`.
pub const LOCAL_ENV: &str = "local";

#[derive(Debug, Error)]
pub enum CallError {
    #[error(transparent)]
    MalformedAddress(#[from] MalformedAddress),
    #[error("call: `{0}` is not a route address")]
    NotRoute(String),
    #[error("call: the <{0}> service does not exist")]
    ServiceNotFound(String),
    #[error("call: transport failure: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("call: undecodable response (status {status}): {reason}")]
    Decode { status: u16, reason: String },
    /// The remote service answered with a rendered error envelope.
    #[error("call: remote error: {0}")]
    Remote(BaseError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvPort {
    pub port: Option<u16>,
}

/// One directory entry: the service's network id plus per-environment ports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEntry {
    pub id: String,
    #[serde(default)]
    pub env: BTreeMap<String, EnvPort>,
}

/// Resolves the first address segment to a host and port.
#[derive(Debug, Clone, Default)]
pub struct ServiceDirectory {
    services: BTreeMap<String, ServiceEntry>,
    env: String,
}

impl ServiceDirectory {
    #[must_use]
    pub fn new(services: BTreeMap<String, ServiceEntry>, env: impl Into<String>) -> Self {
        Self {
            services,
            env: env.into(),
        }
    }

    /// Target URL for a route address such as `/billing/invoices/create`.
    ///
    /// # Errors
    ///
    /// Returns an error if `address` is not a valid route or its first
    /// segment names no registered service.
    pub fn resolve(&self, address: &str) -> Result<String, CallError> {
        if !meshkit_core::address::is_route(address) {
            return Err(CallError::NotRoute(address.to_string()));
        }
        let route = RoutePath::parse(address)?;
        let mut segments = route.segments();
        let service = segments.next().unwrap_or_default();
        let entry = self
            .services
            .get(service)
            .ok_or_else(|| CallError::ServiceNotFound(service.to_string()))?;

        let host = if self.env == LOCAL_ENV {
            "localhost"
        } else {
            entry.id.as_str()
        };
        let port = entry
            .env
            .get(&self.env)
            .and_then(|env| env.port)
            .unwrap_or(DEFAULT_SERVICE_PORT);
        let rest: Vec<&str> = segments.collect();
        Ok(format!("http://{host}:{port}/{}", rest.join("/")))
    }
}

/// Shared HTTP client plus directory, cloned into every [`Caller`].
#[derive(Debug, Clone)]
pub struct RemoteClient {
    client: reqwest::Client,
    directory: Arc<ServiceDirectory>,
}

impl RemoteClient {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(directory: ServiceDirectory, timeout: Duration) -> Result<Self, CallError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            directory: Arc::new(directory),
        })
    }

    #[must_use]
    pub fn directory(&self) -> &ServiceDirectory {
        &self.directory
    }

    /// Binds the identity context propagated on every call.
    #[must_use]
    pub fn caller(&self, meta: Meta) -> Caller {
        Caller {
            remote: self.clone(),
            meta: Arc::new(meta),
        }
    }
}

/// The `call` capability handed to handlers. Always propagates the meta it
/// was created with, never a handler's modified copy.
#[derive(Debug, Clone)]
pub struct Caller {
    remote: RemoteClient,
    meta: Arc<Meta>,
}

impl Caller {
    /// POSTs `{ meta, data }` to the resolved service and returns the remote
    /// envelope's `data`. No retry is attempted.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::ServiceNotFound`] for unknown services,
    /// [`CallError::Remote`] when the remote replied with an error envelope,
    /// and transport/decode errors otherwise.
    pub async fn call(&self, address: &str, data: Value) -> Result<Value, CallError> {
        let url = self.remote.directory.resolve(address)?;
        debug!(%url, trace_id = %self.meta.trace_id(), "call");

        let body = Envelope::new((*self.meta).clone(), data);
        let response = self.remote.client.post(&url).json(&body).send().await?;
        let status = response.status().as_u16();
        let bytes = response.bytes().await?;

        if let Ok(error) = serde_json::from_slice::<ErrorEnvelope>(&bytes) {
            let error = error.error;
            return Err(CallError::Remote(BaseError::from_rendered(
                error.kind,
                error.message,
                error.status,
            )));
        }
        match serde_json::from_slice::<Value>(&bytes) {
            Ok(mut envelope) if (200..300).contains(&status) => Ok(envelope
                .get_mut("data")
                .map(Value::take)
                .unwrap_or(Value::Null)),
            Ok(_) => Err(CallError::Decode {
                status,
                reason: "non-success status without an error envelope".to_string(),
            }),
            Err(e) => Err(CallError::Decode {
                status,
                reason: e.to_string(),
            }),
        }
    }

    #[must_use]
    pub fn meta(&self) -> &Meta {
        &self.meta
    }
}
