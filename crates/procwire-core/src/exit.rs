use crate::error::{ProcessError, Result};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Final result of a process: its exit code or the reason none is available.
pub type ExitOutcome = Result<i32>;

/// Completion signal for a process exit code.
///
/// Completes at most once. Any number of waiters may subscribe; cancelling one
/// waiter leaves the signal and the other waiters untouched.
#[derive(Clone, Debug)]
pub struct ExitSignal {
    tx: Arc<watch::Sender<Option<ExitOutcome>>>,
}

impl Default for ExitSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ExitSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Stores the outcome unless one is already stored. Returns whether this call won.
    pub fn complete(&self, outcome: ExitOutcome) -> bool {
        let mut outcome = Some(outcome);
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = outcome.take();
            true
        })
    }

    pub fn is_complete(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub fn peek(&self) -> Option<ExitOutcome> {
        (*self.tx.borrow()).clone()
    }

    /// Waits for the outcome, or until `cancellation` fires.
    pub async fn wait(&self, cancellation: Option<&CancellationToken>) -> ExitOutcome {
        let mut rx = self.tx.subscribe();
        let completed = async move {
            match rx.wait_for(Option::is_some).await {
                Ok(slot) => (*slot)
                    .clone()
                    .unwrap_or(Err(ProcessError::EndedUnexpectedly)),
                // Sender is owned by `self` and outlives this borrow.
                Err(_) => Err(ProcessError::EndedUnexpectedly),
            }
        };

        match cancellation {
            Some(token) => tokio::select! {
                outcome = completed => outcome,
                _ = token.cancelled() => Err(ProcessError::Cancelled),
            },
            None => completed.await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_completes_exactly_once() {
        let signal = ExitSignal::new();
        assert!(!signal.is_complete());

        assert!(signal.complete(Ok(3)));
        assert!(!signal.complete(Err(ProcessError::Killed)));

        assert_eq!(signal.wait(None).await.unwrap(), 3);
        assert!(matches!(signal.peek(), Some(Ok(3))));
    }

    #[tokio::test]
    async fn test_many_waiters_receive_same_outcome() {
        let signal = ExitSignal::new();

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let signal = signal.clone();
                tokio::spawn(async move { signal.wait(None).await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.complete(Err(ProcessError::Killed));

        for waiter in waiters {
            let outcome = waiter.await.unwrap();
            assert!(outcome.unwrap_err().is_killed());
        }
    }

    #[tokio::test]
    async fn test_cancelling_one_waiter_leaves_others() {
        let signal = ExitSignal::new();
        let token = CancellationToken::new();

        let cancelled = {
            let signal = signal.clone();
            let token = token.clone();
            tokio::spawn(async move { signal.wait(Some(&token)).await })
        };
        let patient = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.wait(None).await })
        };

        token.cancel();
        assert!(matches!(
            cancelled.await.unwrap(),
            Err(ProcessError::Cancelled)
        ));
        assert!(!signal.is_complete());

        signal.complete(Ok(0));
        assert_eq!(patient.await.unwrap().unwrap(), 0);
    }
}
