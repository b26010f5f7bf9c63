//! Double buffer with a swap-and-drain loop.
//!
//! Producers append to the *active* vector under a short lock. The drainer
//! swaps it for an empty spare, hands the swapped-out vector to a handler,
//! then clears it and keeps it as the next spare. Producers are never held up
//! by the handler: the only shared critical section is the `Vec::push` on one
//! side and a pointer swap on the other.
//!
//! # Example
//!
//! ```
//! use doublebuf::{BoxError, SwapBuffer, handler_fn};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let buffer = SwapBuffer::new();
//! buffer.add(1);
//! buffer.add(2);
//!
//! let handler = handler_fn(|batch: Vec<i32>| async move {
//!     assert_eq!(batch, vec![1, 2]);
//!     Ok::<(), BoxError>(())
//! });
//!
//! assert_eq!(buffer.drain_all(&handler).await.unwrap(), 1);
//! assert!(buffer.is_empty());
//! # }
//! ```

use std::mem;

use parking_lot::Mutex;

use crate::error::BatchError;
use crate::handler::BatchHandler;
use crate::trace::trace;

/// Spare vectors above this capacity are dropped instead of reused.
pub const DEFAULT_RETAIN_CAPACITY: usize = 64 * 1024;

/// Two interchangeable vectors: one accepting items, one being drained.
///
/// `SwapBuffer` does not serialize concurrent [`drain_all`](Self::drain_all)
/// calls. Two drainers stay memory safe but split items between them; wrap it
/// in a [`crate::BatchCoordinator`] for single-flight draining.
#[derive(Debug)]
pub struct SwapBuffer<T> {
    active: Mutex<Vec<T>>,
    /// Cleared storage from the last drained batch, swapped in as the next
    /// active vector.
    spare: Mutex<Vec<T>>,
    retain_capacity: usize,
}

impl<T> Default for SwapBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SwapBuffer<T> {
    /// Creates an empty buffer that allocates on first use.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            active: Mutex::new(Vec::new()),
            spare: Mutex::new(Vec::new()),
            retain_capacity: DEFAULT_RETAIN_CAPACITY,
        }
    }

    /// Creates a buffer with `initial` capacity on both halves.
    ///
    /// Drained storage larger than `retain` items is released rather than
    /// kept for the next swap, so one burst does not pin memory forever.
    #[must_use]
    pub fn with_capacity(initial: usize, retain: usize) -> Self {
        Self {
            active: Mutex::new(Vec::with_capacity(initial)),
            spare: Mutex::new(Vec::with_capacity(initial)),
            retain_capacity: retain.max(initial),
        }
    }

    /// Appends an item to the active vector.
    #[inline]
    pub fn add(&self, item: T) {
        self.active.lock().push(item);
    }

    /// Number of items waiting for the next swap.
    #[must_use]
    pub fn len(&self) -> usize {
        self.active.lock().len()
    }

    /// Returns `true` if no items are waiting for the next swap.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.active.lock().is_empty()
    }

    /// Swaps the active vector for the spare and returns what was active.
    fn swap(&self) -> Vec<T> {
        let mut next = mem::take(&mut *self.spare.lock());
        mem::swap(&mut *self.active.lock(), &mut next);
        next
    }

    /// Returns drained storage to the spare slot.
    fn recycle(&self, mut batch: Vec<T>) {
        batch.clear();
        if batch.capacity() <= self.retain_capacity {
            *self.spare.lock() = batch;
        }
    }

    /// Drains the buffer into `handler` until a swap comes back empty.
    ///
    /// Each loop iteration swaps the halves and, if the swapped-out vector is
    /// non-empty, awaits `handler` on it. Items added while the handler runs
    /// go to the fresh active vector and are picked up by the next iteration.
    ///
    /// Returns the number of batches handled.
    ///
    /// # Errors
    ///
    /// Returns [`BatchError::Handler`] on the first failed batch. Items in
    /// that batch are dropped; items still in the active vector stay there
    /// for the next call.
    pub async fn drain_all<H>(&self, handler: &H) -> Result<usize, BatchError>
    where
        T: Send,
        H: BatchHandler<T> + ?Sized,
    {
        let mut batches = 0;
        loop {
            let mut batch = self.swap();
            if batch.is_empty() {
                self.recycle(batch);
                trace!(batches, "buffer empty after swap");
                return Ok(batches);
            }

            let batch_len = batch.len();
            trace!(batch_len, "handling batch");
            let outcome = handler.handle(&mut batch).await;
            self.recycle(batch);

            outcome.map_err(|source| BatchError::Handler { batch_len, source })?;
            batches += 1;
        }
    }
}
