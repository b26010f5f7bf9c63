//! Error types for batch handlers and coordinator construction.

use std::any::Any;

use thiserror::Error;

/// Boxed error returned by a [`crate::BatchHandler`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A batch that did not complete.
///
/// Reported to the coordinator's error observer. The items of a failed batch
/// are not retried.
#[derive(Debug, Error)]
pub enum BatchError {
    /// The handler returned an error.
    #[error("batch handler failed on {batch_len} items: {source}")]
    Handler {
        /// Number of items in the failed batch.
        batch_len: usize,
        /// Error returned by the handler.
        #[source]
        source: BoxError,
    },
    /// The handler panicked while processing a batch.
    #[error("batch handler panicked: {message}")]
    Panicked {
        /// Panic payload, if it was a string.
        message: String,
    },
    /// The drain task was dropped before the buffer was empty, usually
    /// because its runtime shut down.
    #[error("drain loop cancelled with {pending} items pending")]
    Cancelled {
        /// Items left in the buffer when the loop was dropped.
        pending: usize,
    },
}

impl BatchError {
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self::Panicked { message }
    }

    /// Returns the size of the failed batch, when known.
    #[must_use]
    pub const fn batch_len(&self) -> Option<usize> {
        match self {
            Self::Handler { batch_len, .. } => Some(*batch_len),
            Self::Panicked { .. } | Self::Cancelled { .. } => None,
        }
    }
}

/// Error constructing a coordinator.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// No tokio runtime is running on the calling thread.
    #[error("no tokio runtime available to run the drain loop: {0}")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_payload_str() {
        let err = BatchError::from_panic(Box::new("boom"));
        assert!(matches!(err, BatchError::Panicked { ref message } if message == "boom"));
        assert_eq!(err.batch_len(), None);
    }

    #[test]
    fn test_panic_payload_string() {
        let err = BatchError::from_panic(Box::new(format!("item {}", 7)));
        assert_eq!(err.to_string(), "batch handler panicked: item 7");
    }

    #[test]
    fn test_panic_payload_other() {
        let err = BatchError::from_panic(Box::new(42u32));
        assert_eq!(
            err.to_string(),
            "batch handler panicked: non-string panic payload"
        );
    }

    #[test]
    fn test_cancelled_display() {
        let err = BatchError::Cancelled { pending: 2 };
        assert_eq!(err.to_string(), "drain loop cancelled with 2 items pending");
        assert_eq!(err.batch_len(), None);
    }

    #[test]
    fn test_handler_error_keeps_source() {
        let err = BatchError::Handler {
            batch_len: 3,
            source: "disk full".into(),
        };
        assert_eq!(err.batch_len(), Some(3));
        assert_eq!(err.to_string(), "batch handler failed on 3 items: disk full");
        let source = std::error::Error::source(&err).map(ToString::to_string);
        assert_eq!(source.as_deref(), Some("disk full"));
    }
}
