//! Double-buffered, single-flight batch coordination.
//!
//! Producers hand items to a [`BatchCoordinator`] from any thread. Items land
//! in the active half of a [`SwapBuffer`]; a single drain loop swaps the
//! halves and passes each non-empty batch to a [`BatchHandler`], repeating
//! until a swap comes back empty. At most one handler call is in flight per
//! coordinator, and submission never waits on it.
//!
//! # Example
//!
//! ```
//! use doublebuf::{BatchCoordinator, BoxError, handler_fn};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), doublebuf::CoordinatorError> {
//! let coordinator = BatchCoordinator::new(handler_fn(|lines: Vec<String>| async move {
//!     for line in lines {
//!         println!("{line}");
//!     }
//!     Ok::<(), BoxError>(())
//! }))?;
//!
//! coordinator.add_task("hello".to_string());
//! coordinator.add_task("world".to_string());
//!
//! coordinator.finish();
//! coordinator.wait_all_finished().await;
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod handler;
pub mod stats;
mod trace;

pub use buffer::SwapBuffer;
pub use config::{CoordinatorConfig, ErrorObserver};
pub use coordinator::{BatchCoordinator, Completion};
pub use error::{BatchError, BoxError, CoordinatorError};
pub use handler::{BatchHandler, FnHandler, handler_fn};
pub use stats::CoordinatorStats;
pub use trace::init_tracing;
