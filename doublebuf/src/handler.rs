//! The batch handler seam.
//!
//! A [`BatchHandler`] is the downstream operation the coordinator exists to
//! protect: writing a log segment, flushing metrics, sending a bulk request.
//! The coordinator guarantees it is never invoked concurrently with itself.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::BoxError;

/// Processes one batch of items.
///
/// The batch is lent for the duration of the call. Implementations may move
/// items out of it (`batch.drain(..)`), but must not keep the vector: the
/// buffer clears and reuses its storage once the call returns.
///
/// Returning `Err` fails this batch only. The items are not retried; the
/// error is reported through the coordinator's observer.
#[async_trait]
pub trait BatchHandler<T: Send>: Send + Sync {
    /// Handles one non-empty batch.
    async fn handle(&self, batch: &mut Vec<T>) -> Result<(), BoxError>;
}

#[async_trait]
impl<T, H> BatchHandler<T> for Arc<H>
where
    T: Send,
    H: BatchHandler<T> + ?Sized,
{
    async fn handle(&self, batch: &mut Vec<T>) -> Result<(), BoxError> {
        (**self).handle(batch).await
    }
}

/// Adapts a closure over owned batches into a [`BatchHandler`].
///
/// Created with [`handler_fn`]. Each call takes the batch out of the buffer,
/// so its storage is not reused; implement [`BatchHandler`] directly when
/// allocation matters.
pub struct FnHandler<F> {
    f: F,
}

/// Wraps `f` as a [`BatchHandler`].
///
/// ```
/// use doublebuf::{BoxError, handler_fn};
///
/// let handler = handler_fn(|batch: Vec<u64>| async move {
///     let _sum: u64 = batch.iter().sum();
///     Ok::<(), BoxError>(())
/// });
/// # let _ = handler;
/// ```
pub const fn handler_fn<F>(f: F) -> FnHandler<F> {
    FnHandler { f }
}

#[async_trait]
impl<T, F, Fut> BatchHandler<T> for FnHandler<F>
where
    T: Send + 'static,
    F: Fn(Vec<T>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    async fn handle(&self, batch: &mut Vec<T>) -> Result<(), BoxError> {
        (self.f)(std::mem::take(batch)).await
    }
}
