//! Cancellation scope for one logical call.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{CancelReason, IntegratorError, IntegratorResult};

/// Caller-controlled stop conditions shared by every wait inside a call.
#[derive(Debug, Clone, Default)]
pub(crate) struct CallContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl CallContext {
    pub(crate) fn new(cancel: Option<CancellationToken>, deadline: Option<Instant>) -> Self {
        Self {
            cancel: cancel.unwrap_or_default(),
            deadline,
        }
    }

    /// Fail if the call has already been cancelled or is past its deadline.
    pub(crate) fn check(&self) -> IntegratorResult<()> {
        if self.cancel.is_cancelled() {
            return Err(IntegratorError::Cancelled(CancelReason::Token));
        }
        if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Err(IntegratorError::Cancelled(CancelReason::Deadline));
        }
        Ok(())
    }

    /// Time left before the deadline, if one is set.
    pub(crate) fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Drive `fut` until it completes or the call is cancelled.
    ///
    /// Dropping `fut` on cancellation releases whatever it holds.
    pub(crate) async fn run<F: Future>(&self, fut: F) -> IntegratorResult<F::Output> {
        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(IntegratorError::Cancelled(CancelReason::Token)),
            () = deadline => Err(IntegratorError::Cancelled(CancelReason::Deadline)),
            output = fut => Ok(output),
        }
    }

    /// Sleep for `duration` unless the call is cancelled first.
    pub(crate) async fn sleep(&self, duration: Duration) -> IntegratorResult<()> {
        self.run(tokio::time::sleep(duration)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_run_completes() {
        let ctx = CallContext::default();
        assert_eq!(ctx.run(async { 7 }).await.unwrap(), 7);
        assert!(ctx.check().is_ok());
        assert!(ctx.remaining().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_cancels_sleep() {
        let token = CancellationToken::new();
        let ctx = CallContext::new(Some(token.clone()), None);

        let trigger = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            token.cancel();
        });

        let result = ctx.sleep(Duration::from_secs(60)).await;
        assert!(matches!(
            result,
            Err(IntegratorError::Cancelled(CancelReason::Token))
        ));
        trigger.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_cancels_sleep() {
        let ctx = CallContext::new(None, Some(Instant::now() + Duration::from_secs(2)));
        let result = ctx.sleep(Duration::from_secs(60)).await;
        assert!(matches!(
            result,
            Err(IntegratorError::Cancelled(CancelReason::Deadline))
        ));
        assert!(ctx.check().is_err());
    }
}
