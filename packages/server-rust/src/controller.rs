//! Controller registration: one handler bound to route and/or broker
//! addresses, with an optional payload schema.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use meshkit_core::address::ROUTE_PREFIX;
use meshkit_core::{BrokerAddress, EventAddress, MalformedAddress, Meta, ObjectSchema, RoutePath};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use crate::bus::hub::{EmitHub, Emitter};
use crate::remote::{Caller, RemoteClient};

/// Path prefix owned by the health endpoints.
pub const HEALTH_PATH: &str = "/_health";

pub type HandlerFuture = BoxFuture<'static, anyhow::Result<Value>>;

/// Type-erased handler shared by every address of a controller.
pub type HandlerFn = Arc<dyn Fn(Params) -> HandlerFuture + Send + Sync>;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("controller: at least one address is required")]
    EmptyAddressSet,
    #[error(transparent)]
    MalformedAddress(#[from] MalformedAddress),
    #[error("controller: route `{0}` is already registered")]
    DuplicateRoute(String),
    #[error("controller: route `{0}` is reserved for health endpoints")]
    ReservedRoute(String),
}

// ---------------------------------------------------------------------------
// Params
// ---------------------------------------------------------------------------

/// What a handler receives: the validated payload, the inbound meta, and the
/// two outbound capabilities bound to that meta.
#[derive(Debug, Clone)]
pub struct Params {
    pub data: Value,
    pub meta: Meta,
    pub call: Caller,
    pub emit: Emitter,
}

impl Params {
    /// Decodes the payload into a typed value.
    ///
    /// # Errors
    ///
    /// Returns an error if `data` does not fit `T`.
    pub fn parse<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        T::deserialize(&self.data)
    }
}

/// Builds [`Params`] for both transports.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    remote: RemoteClient,
    hub: Option<Arc<EmitHub>>,
}

impl HandlerContext {
    #[must_use]
    pub fn new(remote: RemoteClient, hub: Option<Arc<EmitHub>>) -> Self {
        Self { remote, hub }
    }

    #[must_use]
    pub fn params(&self, data: Value, meta: Meta) -> Params {
        Params {
            data,
            call: self.remote.caller(meta.clone()),
            emit: Emitter::new(self.hub.clone(), meta.clone()),
            meta,
        }
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// An immutable registration produced by [`ControllerBuilder::build`].
#[derive(Clone)]
pub struct Controller {
    addresses: Vec<EventAddress>,
    schema: Arc<ObjectSchema>,
    handler: HandlerFn,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("addresses", &self.addresses)
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

impl Controller {
    /// Starts a registration for `addresses`.
    pub fn on<I, S, F, Fut>(addresses: I, handler: F) -> ControllerBuilder
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(Params) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let handler: HandlerFn = Arc::new(move |params| Box::pin(handler(params)));
        ControllerBuilder {
            addresses: addresses.into_iter().map(Into::into).collect(),
            schema: ObjectSchema::new(),
            handler,
        }
    }

    #[must_use]
    pub fn addresses(&self) -> &[EventAddress] {
        &self.addresses
    }

    /// The merged payload schema.
    #[must_use]
    pub fn schema(&self) -> &ObjectSchema {
        &self.schema
    }

    #[must_use]
    pub fn handler(&self) -> &HandlerFn {
        &self.handler
    }
}

/// Additive builder: addresses are fixed by [`Controller::on`]; validators
/// only accumulate.
pub struct ControllerBuilder {
    addresses: Vec<String>,
    schema: ObjectSchema,
    handler: HandlerFn,
}

impl ControllerBuilder {
    /// Merges `schema` over the validators added so far.
    #[must_use]
    pub fn validator(mut self, schema: ObjectSchema) -> Self {
        self.schema = self.schema.concat(&schema);
        self
    }

    /// # Errors
    ///
    /// Returns [`RegistryError::EmptyAddressSet`] for an empty address list
    /// and [`RegistryError::MalformedAddress`] for an unparseable address.
    pub fn build(self) -> Result<Controller, RegistryError> {
        if self.addresses.is_empty() {
            return Err(RegistryError::EmptyAddressSet);
        }
        let addresses = self
            .addresses
            .iter()
            .map(|raw| EventAddress::parse(raw))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Controller {
            addresses,
            schema: Arc::new(self.schema),
            handler: self.handler,
        })
    }
}

// ---------------------------------------------------------------------------
// ControllerRegistry
// ---------------------------------------------------------------------------

/// A route address bound to its controller's handler and schema.
#[derive(Clone)]
pub struct RouteBinding {
    pub path: RoutePath,
    pub schema: Arc<ObjectSchema>,
    pub handler: HandlerFn,
}

/// A broker subscription pattern bound to a handler.
#[derive(Clone)]
pub struct BrokerBinding {
    pub pattern: BrokerAddress,
    pub handler: HandlerFn,
}

impl std::fmt::Debug for BrokerBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerBinding")
            .field("pattern", &self.pattern)
            .finish_non_exhaustive()
    }
}

/// Controllers collected at startup, read-only once the server is built.
#[derive(Debug, Default, Clone)]
pub struct ControllerRegistry {
    controllers: Vec<Controller>,
    routes: BTreeSet<String>,
}

impl ControllerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    ///
    /// Returns an error if one of the controller's routes is already bound or
    /// falls under [`HEALTH_PATH`].
    pub fn register(&mut self, controller: Controller) -> Result<&mut Self, RegistryError> {
        let mut added = BTreeSet::new();
        for address in &controller.addresses {
            if let EventAddress::Route(path) = address {
                let raw = path.as_str();
                if is_reserved(raw) {
                    return Err(RegistryError::ReservedRoute(raw.to_string()));
                }
                if self.routes.contains(raw) || !added.insert(raw.to_string()) {
                    return Err(RegistryError::DuplicateRoute(raw.to_string()));
                }
            }
        }
        self.routes.extend(added);
        self.controllers.push(controller);
        Ok(self)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.controllers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }

    /// Route-shaped addresses in registration order.
    #[must_use]
    pub fn route_bindings(&self) -> Vec<RouteBinding> {
        self.controllers
            .iter()
            .flat_map(|controller| {
                controller.addresses.iter().filter_map(|address| match address {
                    EventAddress::Route(path) => Some(RouteBinding {
                        path: path.clone(),
                        schema: Arc::clone(&controller.schema),
                        handler: Arc::clone(&controller.handler),
                    }),
                    EventAddress::Broker(_) => None,
                })
            })
            .collect()
    }

    /// Broker patterns in registration order, `@` marker already stripped.
    #[must_use]
    pub fn broker_bindings(&self) -> Vec<BrokerBinding> {
        self.controllers
            .iter()
            .flat_map(|controller| {
                controller.addresses.iter().filter_map(|address| match address {
                    EventAddress::Broker(pattern) => Some(BrokerBinding {
                        pattern: pattern.clone(),
                        handler: Arc::clone(&controller.handler),
                    }),
                    EventAddress::Route(_) => None,
                })
            })
            .collect()
    }
}

fn is_reserved(path: &str) -> bool {
    path == HEALTH_PATH
        || path
            .strip_prefix(HEALTH_PATH)
            .is_some_and(|rest| rest.starts_with(ROUTE_PREFIX))
}
