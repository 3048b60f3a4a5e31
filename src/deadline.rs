//! Deadline-bounded execution of remote and blocking operations.
//!
//! Async operations are cancelled by dropping their future once the limit
//! elapses. Blocking operations run on the blocking pool and receive a
//! [`CancellationToken`] that is cancelled on expiry. In both cases a late
//! result is discarded and the caller observes [`DeadlineError::Exceeded`]
//! as soon as the limit passes.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::task;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Outcome of an operation that did not produce a value within its deadline.
#[derive(Debug, Error)]
pub enum DeadlineError<E>
where
    E: std::error::Error + 'static,
{
    /// Raised when the limit elapsed before the operation finished.
    #[error("{} did not finish within {} seconds", .step, .limit.as_secs())]
    Exceeded {
        /// Name of the guarded step.
        step: &'static str,
        /// Limit that was applied.
        limit: Duration,
    },
    /// Raised when the operation itself returned an error in time.
    #[error("{step} failed: {source}")]
    Failed {
        /// Name of the guarded step.
        step: &'static str,
        /// Error returned by the operation.
        #[source]
        source: E,
    },
    /// Raised when a blocking worker panicked or was torn down.
    #[error("{step} was aborted: {message}")]
    Aborted {
        /// Name of the guarded step.
        step: &'static str,
        /// Description of the abort reported by the runtime.
        message: String,
    },
}

impl<E> DeadlineError<E>
where
    E: std::error::Error + 'static,
{
    /// Returns `true` when the limit elapsed.
    #[must_use]
    pub const fn is_exceeded(&self) -> bool {
        matches!(self, Self::Exceeded { .. })
    }

    /// Name of the step the error belongs to.
    #[must_use]
    pub const fn step(&self) -> &'static str {
        match self {
            Self::Exceeded { step, .. } | Self::Failed { step, .. } | Self::Aborted { step, .. } => {
                *step
            }
        }
    }
}

/// A named time limit applied to a single operation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Deadline {
    step: &'static str,
    limit: Duration,
}

impl Deadline {
    /// Creates a deadline for `step` lasting `limit`.
    #[must_use]
    pub const fn new(step: &'static str, limit: Duration) -> Self {
        Self { step, limit }
    }

    /// Name of the guarded step.
    #[must_use]
    pub const fn step(&self) -> &'static str {
        self.step
    }

    /// Time limit applied to the step.
    #[must_use]
    pub const fn limit(&self) -> Duration {
        self.limit
    }

    /// Drives `operation` until it completes or the limit elapses.
    ///
    /// The future is dropped on expiry, which cancels any request it has in
    /// flight.
    ///
    /// # Errors
    ///
    /// Returns [`DeadlineError::Exceeded`] on expiry and
    /// [`DeadlineError::Failed`] when the operation fails in time.
    pub async fn run<T, E, F>(self, operation: F) -> Result<T, DeadlineError<E>>
    where
        F: Future<Output = Result<T, E>>,
        E: std::error::Error + 'static,
    {
        match timeout(self.limit, operation).await {
            Ok(result) => result.map_err(|source| DeadlineError::Failed {
                step: self.step,
                source,
            }),
            Err(_) => Err(DeadlineError::Exceeded {
                step: self.step,
                limit: self.limit,
            }),
        }
    }

    /// Runs a blocking `operation` on the blocking pool under this deadline.
    ///
    /// The operation receives a token that is cancelled when the limit
    /// elapses; well-behaved operations poll it and stop early. Operations
    /// that ignore it keep running in the background, but the caller is
    /// released at the deadline regardless and the late result is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`DeadlineError::Exceeded`] on expiry,
    /// [`DeadlineError::Failed`] when the operation fails in time, and
    /// [`DeadlineError::Aborted`] when the worker panics.
    pub async fn run_blocking<T, E, F>(self, operation: F) -> Result<T, DeadlineError<E>>
    where
        F: FnOnce(CancellationToken) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: std::error::Error + Send + 'static,
    {
        let token = CancellationToken::new();
        let worker_token = token.clone();
        let handle = task::spawn_blocking(move || operation(worker_token));

        match timeout(self.limit, handle).await {
            Ok(Ok(result)) => result.map_err(|source| DeadlineError::Failed {
                step: self.step,
                source,
            }),
            Ok(Err(join_error)) => Err(DeadlineError::Aborted {
                step: self.step,
                message: join_error.to_string(),
            }),
            Err(_) => {
                token.cancel();
                Err(DeadlineError::Exceeded {
                    step: self.step,
                    limit: self.limit,
                })
            }
        }
    }
}

/// Convenience wrapper around [`Deadline::run`].
///
/// # Errors
///
/// See [`Deadline::run`].
pub async fn run_with_deadline<T, E, F>(
    step: &'static str,
    limit: Duration,
    operation: F,
) -> Result<T, DeadlineError<E>>
where
    F: Future<Output = Result<T, E>>,
    E: std::error::Error + 'static,
{
    Deadline::new(step, limit).run(operation).await
}
