//! Cancellation and deadlines for control-plane calls.

use crate::{AzSecretsError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Caller-supplied bounds for a request.
///
/// Every control-plane call made on behalf of a request runs through
/// [`RequestContext::run`], which fails with [`AzSecretsError::Cancelled`]
/// once the token is cancelled or the deadline passes.
///
/// # Example
///
/// ```
/// use azsecrets::RequestContext;
/// use std::time::Duration;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let ctx = RequestContext::new().with_timeout(Duration::from_secs(5));
/// let value = ctx.run("noop", async { Ok(42) }).await.unwrap();
/// assert_eq!(value, 42);
///
/// ctx.cancel();
/// assert!(ctx.run("noop", async { Ok(1) }).await.is_err());
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl RequestContext {
    /// Creates an unbounded context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses an existing cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Sets a deadline `timeout` from now.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    /// Applies `timeout` only if no deadline has been set.
    pub(crate) fn or_timeout(self, timeout: Option<Duration>) -> Self {
        match (self.deadline, timeout) {
            (None, Some(t)) => self.with_timeout(t),
            _ => self,
        }
    }

    /// Cancels the context and every call running under it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Returns true once cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Runs `fut`, failing with [`AzSecretsError::Cancelled`] on cancellation
    /// or deadline.
    pub async fn run<T, F>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.guard(operation, fut, false).await
    }

    /// Like [`run`](Self::run), but a result that is ready wins over a
    /// cancellation observed in the same poll, so the caller learns about
    /// an object the call created and can delete it.
    pub async fn run_create<T, F>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.guard(operation, fut, true).await
    }

    async fn guard<T, F>(&self, operation: &str, fut: F, result_first: bool) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let cancelled = || AzSecretsError::Cancelled(format!("{}: cancelled", operation));
        if self.cancel.is_cancelled() {
            return Err(cancelled());
        }

        let guarded = async {
            if result_first {
                tokio::select! {
                    biased;
                    res = fut => res,
                    _ = self.cancel.cancelled() => Err(cancelled()),
                }
            } else {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => Err(cancelled()),
                    res = fut => res,
                }
            }
        };

        match self.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, guarded)
                .await
                .map_err(|_| {
                    AzSecretsError::Cancelled(format!("{}: deadline exceeded", operation))
                })?,
            None => guarded.await,
        }
    }
}
