//! `meshkit` Server: HTTP request dispatch, broker message bus, health and
//! cross-service calls on axum and tokio.

pub mod app;
pub mod bus;
pub mod config;
pub mod controller;
pub mod health;
pub mod logging;
pub mod network;
pub mod remote;

pub use app::{shutdown_signal, App, Server};
pub use config::{AppConfig, ConfigError, Settings};
pub use controller::{Controller, ControllerRegistry, HandlerContext, Params, RegistryError};
pub use health::HealthAggregator;
pub use remote::{CallError, Caller};
