//! HTTP handler definitions.
//!
//! `AppState` is the shared state carried through axum extractors. Route
//! handlers are generated per registered controller by
//! [`Dispatcher::routes`].

pub mod dispatch;
pub mod health;

pub use dispatch::{fallback_handler, Dispatcher, X_STATUS_CODE, X_TRACE_ID};
pub use health::{health_handler, liveness_handler, readiness_handler};

use std::sync::Arc;
use std::time::Instant;

use super::ShutdownController;
use crate::health::HealthAggregator;

/// Shared application state passed to all axum handlers via `State` extraction.
#[derive(Clone)]
pub struct AppState {
    /// Server lifecycle state and in-flight tracking.
    pub shutdown: Arc<ShutdownController>,
    /// Readiness over every registered dependency.
    pub health: Arc<HealthAggregator>,
    pub dispatcher: Arc<Dispatcher>,
    /// Server process start time, used for uptime calculation.
    pub start_time: Instant,
}
