use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;

/// Error type carried by tasks, bootstrap and shutdown functions.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Why a [`Context`](crate::Context) is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("context canceled")]
    Canceled,
    #[error("context deadline exceeded")]
    DeadlineExceeded,
    /// Cancellation was requested on a graceful context but its period has not elapsed yet.
    #[error("context cancellation pending")]
    CancelPending,
}

/// A panic caught inside a bootstrap function.
#[derive(Debug, Error)]
#[error("bootstrap function panicked: {0}")]
pub struct Panicked(pub String);

/// Errors that prevent a [`Group`](crate::Group) from starting.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("bootstrap failed: {0}")]
    Bootstrap(#[source] BoxError),
    #[error("failed to install signal handler: {0}")]
    Signal(#[source] std::io::Error),
    #[error("failed to bind health handler on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// One failure observed while running or shutting down a group.
#[derive(Debug, Error)]
pub enum Failure {
    #[error(transparent)]
    Task(BoxError),
    #[error("task panicked: {0}")]
    TaskPanicked(String),
    #[error(transparent)]
    Shutdown(BoxError),
    #[error("shutdown function panicked: {0}")]
    ShutdownPanicked(String),
    #[error("shutdown function abandoned: {0}")]
    ShutdownTimeout(ContextError),
}

impl Failure {
    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, Failure::ShutdownTimeout(ContextError::DeadlineExceeded))
    }
}

/// Every failure of a group run, in the order they were recorded. Duplicates are kept.
#[derive(Debug)]
pub struct AggregateError {
    failures: Vec<Failure>,
}

impl AggregateError {
    pub fn failures(&self) -> &[Failure] {
        &self.failures
    }

    pub fn into_failures(self) -> Vec<Failure> {
        self.failures
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// Number of failures whose message equals `message`.
    pub fn count_matching(&self, message: &str) -> usize {
        self.failures
            .iter()
            .filter(|f| f.to_string() == message)
            .count()
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, failure) in self.failures.iter().enumerate() {
            if i > 0 {
                f.write_str("\n")?;
            }
            write!(f, "{failure}")?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}

/// Shared accumulator for failures reported from concurrently running work.
#[derive(Clone, Default)]
pub(crate) struct ErrorCollector {
    failures: Arc<Mutex<Vec<Failure>>>,
}

impl ErrorCollector {
    pub(crate) fn push(&self, failure: Failure) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(failure);
    }

    pub(crate) fn extend(&self, failures: impl IntoIterator<Item = Failure>) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(failures);
    }

    /// Drains the collected failures. `Ok` when nothing failed.
    pub(crate) fn take(&self) -> Result<(), AggregateError> {
        let failures = std::mem::take(
            &mut *self
                .failures
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        if failures.is_empty() {
            Ok(())
        } else {
            Err(AggregateError { failures })
        }
    }
}
