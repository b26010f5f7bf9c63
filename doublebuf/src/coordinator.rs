//! Single-flight batch coordinator.
//!
//! A [`BatchCoordinator`] owns a [`SwapBuffer`] and a [`BatchHandler`].
//! [`add_task`](BatchCoordinator::add_task) enqueues and, if no drain loop is
//! running, spawns one on the coordinator's tokio runtime. The loop drains
//! the buffer until a swap comes back empty, then goes idle.
//!
//! # State machine
//!
//! ```text
//!            add_task (first item while idle)
//!   Idle ──────────────────────────────────────► Draining
//!    ▲                                              │
//!    └──────────── buffer empty after a swap ───────┘
//! ```
//!
//! [`finish`](BatchCoordinator::finish) arms a one-shot latch. Taken while
//! idle it fires at once; taken while draining it fires on the next
//! `Draining -> Idle` edge. [`wait_all_finished`](BatchCoordinator::wait_all_finished)
//! awaits that latch.
//!
//! # Failures
//!
//! A failed or panicking handler call ends the current `drain_all` pass. The
//! failure is logged, counted and passed to [`CoordinatorConfig::on_error`];
//! the loop then keeps draining whatever is left, so the coordinator stays
//! usable and the finish latch still fires. The latch means "draining
//! stopped", not "every batch succeeded".
//!
//! If the drain task itself is dropped before going idle (runtime shutdown,
//! task cancellation), the coordinator still returns to `Idle`, fires a
//! pending finish latch and reports [`BatchError::Cancelled`]. Items still
//! queued stay in the buffer for the next drain.
//!
//! # Shutdown
//!
//! `finish` does not close the coordinator. An item added after, or
//! concurrently with, `finish` may or may not be handled before the latch
//! fires. Stop producing before calling `finish` if the latch must cover
//! every item.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use minstant::Instant;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::watch;

use crate::buffer::SwapBuffer;
use crate::config::{CoordinatorConfig, ErrorObserver};
use crate::error::{BatchError, BoxError, CoordinatorError};
use crate::handler::BatchHandler;
use crate::stats::{CoordinatorStats, StatsCounters};
use crate::trace::{debug, error, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DrainState {
    Idle,
    Draining,
}

/// State guarded by the coordinator lock.
#[derive(Debug)]
struct Lifecycle {
    state: DrainState,
    finish_requested: bool,
}

struct Inner<T: Send + 'static> {
    name: String,
    buffer: SwapBuffer<T>,
    handler: Box<dyn BatchHandler<T>>,
    /// Lock order: `lifecycle` before the buffer's internal locks.
    lifecycle: Mutex<Lifecycle>,
    done: watch::Sender<bool>,
    stats: StatsCounters,
    on_error: Option<ErrorObserver>,
    runtime: Handle,
}

/// Batches items from many producers into single-flight handler calls.
///
/// Cloning yields another handle to the same coordinator.
pub struct BatchCoordinator<T: Send + 'static> {
    inner: Arc<Inner<T>>,
}

impl<T: Send + 'static> Clone for BatchCoordinator<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> BatchCoordinator<T> {
    /// Creates a coordinator with default configuration on the current
    /// tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::NoRuntime`] if called outside a tokio
    /// runtime.
    pub fn new<H>(handler: H) -> Result<Self, CoordinatorError>
    where
        H: BatchHandler<T> + 'static,
    {
        Self::with_config(handler, CoordinatorConfig::default())
    }

    /// Creates a coordinator on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::NoRuntime`] if called outside a tokio
    /// runtime.
    pub fn with_config<H>(handler: H, config: CoordinatorConfig) -> Result<Self, CoordinatorError>
    where
        H: BatchHandler<T> + 'static,
    {
        let runtime = Handle::try_current()?;
        Ok(Self::with_runtime(handler, config, runtime))
    }

    /// Creates a coordinator whose drain loops run on `runtime`.
    ///
    /// Producers may then live on any thread, inside a runtime or not.
    #[must_use]
    pub fn with_runtime<H>(handler: H, config: CoordinatorConfig, runtime: Handle) -> Self
    where
        H: BatchHandler<T> + 'static,
    {
        debug!(
            name = %config.name,
            initial_capacity = config.initial_capacity,
            retain_capacity = config.retain_capacity,
            "coordinator created"
        );
        let (done, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                buffer: SwapBuffer::with_capacity(config.initial_capacity, config.retain_capacity),
                name: config.name,
                handler: Box::new(handler),
                lifecycle: Mutex::new(Lifecycle {
                    state: DrainState::Idle,
                    finish_requested: false,
                }),
                done,
                stats: StatsCounters::default(),
                on_error: config.on_error,
                runtime,
            }),
        }
    }

    /// Enqueues an item and makes sure a drain loop will pick it up.
    ///
    /// Never waits on the handler. If a drain loop is already running, the
    /// item is collected by its next swap.
    pub fn add_task(&self, item: T) {
        self.inner.buffer.add(item);
        self.inner.stats.record_enqueued();

        if self.inner.begin_drain() {
            // The guard is built before spawning so that a task dropped
            // unpolled still hands the state back.
            let guard = DrainGuard {
                inner: Arc::clone(&self.inner),
                armed: true,
            };
            self.inner.runtime.spawn(guard.run());
        }
    }

    /// Declares that the caller is done producing.
    ///
    /// The first call arms the completion latch: it fires immediately if no
    /// drain loop is running, otherwise when the running loop goes idle.
    /// Later calls are no-ops. Items may still be added afterwards; see the
    /// module docs for what the latch then covers.
    pub fn finish(&self) {
        let mut lifecycle = self.inner.lifecycle.lock();
        if lifecycle.finish_requested {
            trace!(name = %self.inner.name, "finish already requested");
            return;
        }
        lifecycle.finish_requested = true;

        match lifecycle.state {
            DrainState::Idle => {
                self.inner.done.send_replace(true);
                debug!(name = %self.inner.name, "finished while idle");
            }
            DrainState::Draining => {
                debug!(name = %self.inner.name, "finish armed, waiting for drain loop");
            }
        }
    }

    /// Resolves once [`finish`](Self::finish) has been called and the drain
    /// loop has gone idle.
    ///
    /// Safe to await any number of times, from any number of tasks.
    pub async fn wait_all_finished(&self) {
        self.completion().wait().await;
    }

    /// Returns an owned handle to the completion latch.
    #[must_use]
    pub fn completion(&self) -> Completion {
        Completion {
            rx: self.inner.done.subscribe(),
        }
    }

    /// Returns `true` while a drain loop is running.
    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.inner.lifecycle.lock().state == DrainState::Draining
    }

    /// Returns `true` once [`finish`](Self::finish) has been called.
    #[must_use]
    pub fn is_finish_requested(&self) -> bool {
        self.inner.lifecycle.lock().finish_requested
    }

    /// Number of items waiting for the next swap.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.buffer.len()
    }

    /// Snapshot of this coordinator's counters.
    #[must_use]
    pub fn stats(&self) -> CoordinatorStats {
        self.inner.stats.snapshot()
    }

    /// The configured name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }
}

impl<T: Send + 'static> fmt::Debug for BatchCoordinator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lifecycle = self.inner.lifecycle.lock();
        f.debug_struct("BatchCoordinator")
            .field("name", &self.inner.name)
            .field("state", &lifecycle.state)
            .field("finish_requested", &lifecycle.finish_requested)
            .field("pending", &self.inner.buffer.len())
            .finish()
    }
}

impl<T: Send + 'static> Inner<T> {
    /// Moves `Idle -> Draining`. Returns `true` if the caller must spawn the
    /// drain loop.
    fn begin_drain(&self) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state == DrainState::Draining {
            return false;
        }
        lifecycle.state = DrainState::Draining;
        self.stats.record_drain_loop();
        true
    }

    /// Moves `Draining -> Idle` unless items arrived after the last swap.
    ///
    /// Checking the buffer under the lifecycle lock closes the window where a
    /// producer adds an item, sees `Draining`, and leaves it stranded.
    fn end_drain(&self) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        if !self.buffer.is_empty() {
            return false;
        }
        lifecycle.state = DrainState::Idle;
        if lifecycle.finish_requested {
            self.done.send_replace(true);
            debug!(name = %self.name, "drain loop idle, completion signalled");
        }
        true
    }

    /// Moves `Draining -> Idle` for a drain loop that ended without
    /// reaching [`end_drain`](Self::end_drain).
    ///
    /// The cancellation is reported before the latch fires, so observers see
    /// it before any waiter resumes.
    fn abandon_drain(&self) {
        self.report(&BatchError::Cancelled {
            pending: self.buffer.len(),
        });

        let mut lifecycle = self.lifecycle.lock();
        lifecycle.state = DrainState::Idle;
        if lifecycle.finish_requested {
            self.done.send_replace(true);
            debug!(name = %self.name, "drain loop abandoned, completion signalled");
        }
    }

    fn report(&self, err: &BatchError) {
        error!(name = %self.name, error = %err, "batch failed");
        self.stats.record_failure();

        if let Some(observer) = &self.on_error
            && std::panic::catch_unwind(AssertUnwindSafe(|| observer(err))).is_err()
        {
            warn!(name = %self.name, "error observer panicked");
        }
    }
}

/// Owns the `Draining` state for one drain loop.
///
/// Dropped while armed (task cancelled, runtime shut down, or a panic outside
/// the handler), it returns the coordinator to `Idle` and fires a pending
/// finish latch.
struct DrainGuard<T: Send + 'static> {
    inner: Arc<Inner<T>>,
    armed: bool,
}

impl<T: Send + 'static> DrainGuard<T> {
    async fn run(mut self) {
        let inner = Arc::clone(&self.inner);
        trace!(name = %inner.name, "drain loop started");
        let handler = Instrumented {
            handler: &*inner.handler,
            stats: &inner.stats,
        };

        loop {
            let outcome = AssertUnwindSafe(inner.buffer.drain_all(&handler))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => inner.report(&err),
                Err(payload) => inner.report(&BatchError::from_panic(payload)),
            }

            if inner.end_drain() {
                self.armed = false;
                break;
            }
            trace!(name = %inner.name, "items arrived after final swap, draining again");
        }
    }
}

impl<T: Send + 'static> Drop for DrainGuard<T> {
    fn drop(&mut self) {
        if self.armed {
            warn!(name = %self.inner.name, "drain loop dropped before going idle");
            self.inner.abandon_drain();
        }
    }
}

/// Wraps the user handler with timing and counters.
struct Instrumented<'a, T: Send> {
    handler: &'a dyn BatchHandler<T>,
    stats: &'a StatsCounters,
}

#[async_trait]
impl<'a, T: Send> BatchHandler<T> for Instrumented<'a, T> {
    async fn handle(&self, batch: &mut Vec<T>) -> Result<(), BoxError> {
        let batch_len = batch.len();
        let started = Instant::now();
        let outcome = self.handler.handle(batch).await;
        self.stats.record_batch(batch_len, started, outcome.is_ok());
        outcome
    }
}

/// Owned handle to a coordinator's completion latch.
///
/// Obtained from [`BatchCoordinator::completion`]; clone it to wait from
/// several tasks.
#[derive(Debug, Clone)]
pub struct Completion {
    rx: watch::Receiver<bool>,
}

impl Completion {
    /// Waits for the latch to fire.
    ///
    /// Also returns if every handle to the coordinator is dropped before
    /// `finish` was called and no drain loop is running.
    pub async fn wait(mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Returns `true` if the latch has fired.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        *self.rx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::handler::handler_fn;

    fn counting_handler(count: Arc<AtomicUsize>) -> impl BatchHandler<u32> + 'static {
        handler_fn(move |batch: Vec<u32>| {
            count.fetch_add(batch.len(), Ordering::SeqCst);
            async { Ok::<(), BoxError>(()) }
        })
    }

    #[test]
    fn test_new_outside_runtime_fails() {
        let count = Arc::new(AtomicUsize::new(0));
        let err = BatchCoordinator::new(counting_handler(Arc::clone(&count))).unwrap_err();
        assert!(matches!(err, CoordinatorError::NoRuntime(_)));
    }

    #[tokio::test]
    async fn test_starts_idle() {
        let count = Arc::new(AtomicUsize::new(0));
        let coordinator = BatchCoordinator::new(counting_handler(Arc::clone(&count))).unwrap();

        assert!(!coordinator.is_draining());
        assert!(!coordinator.is_finish_requested());
        assert_eq!(coordinator.pending(), 0);
        assert!(!coordinator.completion().is_complete());
        assert_eq!(coordinator.name(), "doublebuf");
    }

    #[tokio::test]
    async fn test_add_task_on_current_thread_runtime() {
        let count = Arc::new(AtomicUsize::new(0));
        let coordinator = BatchCoordinator::new(counting_handler(Arc::clone(&count))).unwrap();

        coordinator.add_task(1);
        coordinator.add_task(2);
        // The drain task has not been polled yet on a current-thread runtime.
        assert!(coordinator.is_draining());
        assert_eq!(coordinator.pending(), 2);

        coordinator.finish();
        coordinator.wait_all_finished().await;

        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(!coordinator.is_draining());
        let stats = coordinator.stats();
        assert_eq!(stats.items_enqueued, 2);
        assert_eq!(stats.items_handled, 2);
        assert_eq!(stats.batches_handled, 1);
        assert_eq!(stats.drain_loops, 1);
    }

    #[tokio::test]
    async fn test_panicking_observer_does_not_wedge_coordinator() {
        let config = CoordinatorConfig::default().on_error(|_| panic!("observer bug"));
        let coordinator = BatchCoordinator::with_config(
            handler_fn(|_batch: Vec<u32>| async { Err::<(), BoxError>("nope".into()) }),
            config,
        )
        .unwrap();

        coordinator.add_task(1);
        coordinator.finish();
        coordinator.wait_all_finished().await;

        assert!(!coordinator.is_draining());
        assert_eq!(coordinator.stats().failed_batches, 1);
    }

    #[test]
    fn test_with_runtime_from_plain_thread() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .build()
            .unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let coordinator = BatchCoordinator::with_runtime(
            counting_handler(Arc::clone(&count)),
            CoordinatorConfig::default(),
            runtime.handle().clone(),
        );

        for i in 0..10 {
            coordinator.add_task(i);
        }
        coordinator.finish();
        runtime.block_on(coordinator.wait_all_finished());

        assert_eq!(count.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn test_end_drain_keeps_draining_while_items_remain() {
        let count = Arc::new(AtomicUsize::new(0));
        let coordinator = BatchCoordinator::new(counting_handler(Arc::clone(&count))).unwrap();
        let inner = &coordinator.inner;

        // An item that arrived after the loop's final empty swap.
        inner.lifecycle.lock().state = DrainState::Draining;
        inner.lifecycle.lock().finish_requested = true;
        inner.buffer.add(5);

        assert!(!inner.end_drain());
        assert_eq!(inner.lifecycle.lock().state, DrainState::Draining);
        assert!(!coordinator.completion().is_complete());

        assert_eq!(inner.buffer.drain_all(&*inner.handler).await.unwrap(), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        assert!(inner.end_drain());
        assert_eq!(inner.lifecycle.lock().state, DrainState::Idle);
        assert!(coordinator.completion().is_complete());
    }

    #[tokio::test]
    async fn test_end_drain_without_finish_leaves_latch_alone() {
        let count = Arc::new(AtomicUsize::new(0));
        let coordinator = BatchCoordinator::new(counting_handler(Arc::clone(&count))).unwrap();
        let inner = &coordinator.inner;
        inner.lifecycle.lock().state = DrainState::Draining;

        assert!(inner.end_drain());
        assert!(!coordinator.is_draining());
        assert!(!coordinator.completion().is_complete());
    }

    fn wait_on_fresh_runtime(coordinator: &BatchCoordinator<u32>) -> bool {
        let waiter = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        waiter.block_on(async {
            tokio::time::timeout(Duration::from_secs(5), coordinator.wait_all_finished())
                .await
                .is_ok()
        })
    }

    #[test]
    fn test_runtime_shutdown_before_poll_releases_coordinator() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .build()
            .unwrap();
        let failures = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&failures);
        let config =
            CoordinatorConfig::default().on_error(move |err| sink.lock().push(err.to_string()));
        let count = Arc::new(AtomicUsize::new(0));
        let coordinator = BatchCoordinator::with_runtime(
            counting_handler(Arc::clone(&count)),
            config,
            runtime.handle().clone(),
        );
        runtime.shutdown_background();

        coordinator.add_task(1);
        coordinator.finish();

        assert!(wait_on_fresh_runtime(&coordinator), "finish latch never fired");
        assert!(!coordinator.is_draining());
        assert_eq!(coordinator.pending(), 1);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(
            *failures.lock(),
            vec!["drain loop cancelled with 1 items pending".to_string()]
        );
        assert_eq!(coordinator.stats().failed_batches, 1);
    }

    #[test]
    fn test_runtime_shutdown_mid_drain_fires_finish_latch() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .build()
            .unwrap();
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let handler = handler_fn(move |_batch: Vec<u32>| {
            let _ = entered_tx.send(());
            futures::future::pending::<Result<(), BoxError>>()
        });
        let coordinator = BatchCoordinator::with_runtime(
            handler,
            CoordinatorConfig::default(),
            runtime.handle().clone(),
        );

        coordinator.add_task(1);
        entered_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("handler never started");
        coordinator.add_task(2);
        coordinator.finish();
        assert!(!coordinator.completion().is_complete());

        runtime.shutdown_background();

        assert!(wait_on_fresh_runtime(&coordinator), "finish latch never fired");
        assert!(!coordinator.is_draining());
        assert_eq!(coordinator.pending(), 1);
        assert_eq!(coordinator.stats().failed_batches, 1);
    }
}
