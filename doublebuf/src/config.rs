//! Coordinator configuration.

use std::fmt;
use std::sync::Arc;

use crate::buffer::DEFAULT_RETAIN_CAPACITY;
use crate::error::BatchError;

/// Callback receiving every failed batch.
///
/// Called on the drain task, after the failure has been logged and counted.
/// Keep it short: the next batch waits for it.
pub type ErrorObserver = Arc<dyn Fn(&BatchError) + Send + Sync>;

/// Configuration for a [`crate::BatchCoordinator`].
#[derive(Clone)]
pub struct CoordinatorConfig {
    /// Label attached to log output for this coordinator.
    pub name: String,
    /// Initial capacity of each buffer half.
    pub initial_capacity: usize,
    /// Drained storage above this many items is released instead of reused.
    pub retain_capacity: usize,
    /// Receives handler failures and cancelled drain loops.
    ///
    /// Without an observer, failures are logged (with the `tracing` feature)
    /// and counted in [`crate::CoordinatorStats::failed_batches`]. Built
    /// without `tracing`, that counter is the only trace a failure leaves.
    pub on_error: Option<ErrorObserver>,
}

impl CoordinatorConfig {
    /// Sets the error observer.
    #[must_use]
    pub fn on_error(mut self, observer: impl Fn(&BatchError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(observer));
        self
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            name: "doublebuf".to_string(),
            initial_capacity: 0,
            retain_capacity: DEFAULT_RETAIN_CAPACITY,
            on_error: None,
        }
    }
}

impl fmt::Debug for CoordinatorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoordinatorConfig")
            .field("name", &self.name)
            .field("initial_capacity", &self.initial_capacity)
            .field("retain_capacity", &self.retain_capacity)
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}
