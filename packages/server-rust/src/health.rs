//! Dependency readiness tracking and shutdown callbacks.
//!
//! Every dependency (HTTP server, broker producer/consumer, datastore)
//! registers a named record at connection-setup time and reports status
//! transitions through [`HealthAggregator::emit`]. Records are never removed.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::{join_all, BoxFuture};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

type ShutdownFn = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// Aggregated readiness over named dependency records.
pub struct HealthAggregator {
    services: DashMap<String, bool>,
    shutdowns: Mutex<Vec<ShutdownFn>>,
    shutdown_started: AtomicBool,
}

impl std::fmt::Debug for HealthAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthAggregator")
            .field("services", &self.snapshot())
            .field("shutdowns", &self.shutdowns.lock().len())
            .finish()
    }
}

impl Default for HealthAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthAggregator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            services: DashMap::new(),
            shutdowns: Mutex::new(Vec::new()),
            shutdown_started: AtomicBool::new(false),
        }
    }

    /// Adds a not-ready record for `name`. No-op if it already exists, so an
    /// established status is never reset.
    pub fn register_service(&self, name: &str) {
        self.services.entry(name.to_string()).or_insert_with(|| {
            debug!(service = name, "registering health record");
            false
        });
    }

    /// Records a status transition. Unregistered names are ignored.
    pub fn emit(&self, name: &str, ready: bool) {
        debug!(service = name, ready, "health status");
        match self.services.get_mut(name) {
            Some(mut status) => *status = ready,
            None => debug!(service = name, "status for unregistered service ignored"),
        }
    }

    /// `true` when at least one record exists and every record is ready.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        !self.services.is_empty() && self.services.iter().all(|entry| *entry.value())
    }

    #[must_use]
    pub fn status(&self, name: &str) -> Option<bool> {
        self.services.get(name).map(|entry| *entry.value())
    }

    /// All records, sorted by name.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, bool> {
        self.services
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    /// Appends a callback run by [`HealthAggregator::run_shutdown`].
    pub fn register_shutdown<F, Fut>(&self, callback: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.shutdowns
            .lock()
            .push(Box::new(move || Box::pin(callback())));
    }

    /// Runs every registered callback concurrently and waits for all of them,
    /// bounded by `timeout`. Only the first invocation does anything; returns
    /// the number of callbacks started.
    pub async fn run_shutdown(&self, timeout: Duration) -> usize {
        if self.shutdown_started.swap(true, Ordering::SeqCst) {
            debug!("shutdown already running");
            return 0;
        }
        let callbacks = std::mem::take(&mut *self.shutdowns.lock());
        let count = callbacks.len();
        info!(count, "running shutdown callbacks");

        let all = join_all(callbacks.into_iter().map(|callback| callback()));
        match tokio::time::timeout(timeout, all).await {
            Ok(results) => {
                for err in results.into_iter().filter_map(Result::err) {
                    warn!(error = %err, "shutdown callback failed");
                }
            }
            Err(_) => warn!(?timeout, "shutdown callbacks timed out"),
        }
        count
    }
}
