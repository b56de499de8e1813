//! Optimistic-concurrency read/modify/write loop

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::error::{Error, Result};

/// Bounds on the conflict retry loop
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total write attempts, including the first one
    pub attempts: u32,
    /// Pause before attempt `n` is `backoff * (n - 1)`
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            backoff: Duration::from_millis(10),
        }
    }
}

impl RetryPolicy {
    pub fn with_attempts(attempts: u32) -> Self {
        Self {
            attempts: attempts.max(1),
            ..Self::default()
        }
    }
}

/// What a read/modify/write cycle ended with
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The read found nothing to modify
    TargetGone,
    /// The freshly read state already matched, nothing was written
    Unchanged,
    /// A write was accepted
    Written,
}

/// Run `read`, `diff` and `write` until a write is accepted or no write is
/// needed.
///
/// A version conflict from `write` restarts the cycle from `read`, so every
/// attempt computes its patch from fresh state. Any other error is returned
/// as is. After `policy.attempts` conflicts the loop gives up with
/// [`Error::ConflictRetriesExhausted`].
pub async fn read_modify_write<S, P, R, RFut, D, W, WFut>(
    policy: RetryPolicy,
    target: &str,
    mut read: R,
    mut diff: D,
    mut write: W,
) -> Result<WriteOutcome>
where
    R: FnMut() -> RFut,
    RFut: Future<Output = Result<Option<S>>>,
    D: FnMut(&S) -> Option<P>,
    W: FnMut(P) -> WFut,
    WFut: Future<Output = Result<()>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;

        let Some(state) = read().await? else {
            return Ok(WriteOutcome::TargetGone);
        };
        let Some(patch) = diff(&state) else {
            return Ok(WriteOutcome::Unchanged);
        };

        match write(patch).await {
            Ok(()) => return Ok(WriteOutcome::Written),
            Err(e) if e.is_conflict() => {
                if attempt >= attempts {
                    return Err(Error::ConflictRetriesExhausted {
                        attempts: attempt,
                        target: target.to_string(),
                    });
                }
                debug!(target, attempt, "write conflicted, re-reading");
                tokio::time::sleep(policy.backoff * attempt).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::api_error;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_missing_target_skips_write() {
        let writes = AtomicU32::new(0);
        let outcome = read_modify_write(
            RetryPolicy::default(),
            "ns/dc1",
            || async { Ok::<_, Error>(None::<i32>) },
            |_: &i32| Some(1),
            |_: i32| {
                writes.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, Error>(()) }
            },
        )
        .await
        .unwrap();
        assert_eq!(outcome, WriteOutcome::TargetGone);
        assert_eq!(writes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_no_diff_skips_write() {
        let outcome = read_modify_write(
            RetryPolicy::default(),
            "ns/dc1",
            || async { Ok::<_, Error>(Some(3)) },
            |_: &i32| None::<i32>,
            |_: i32| async { Err::<(), _>(Error::ConfigError("unexpected write".to_string())) },
        )
        .await
        .unwrap();
        assert_eq!(outcome, WriteOutcome::Unchanged);
    }

    #[tokio::test]
    async fn test_conflict_recomputes_from_fresh_read() {
        let reads = AtomicU32::new(0);
        let written = Mutex::new(Vec::new());
        let outcome = read_modify_write(
            RetryPolicy::default(),
            "ns/dc1",
            || {
                let n = reads.fetch_add(1, Ordering::SeqCst);
                async move { Ok::<_, Error>(Some(n)) }
            },
            |n: &u32| Some(*n),
            |patch: u32| {
                let result = if patch == 0 {
                    Err(api_error(409, "Conflict"))
                } else {
                    written.lock().unwrap().push(patch);
                    Ok(())
                };
                async move { result }
            },
        )
        .await
        .unwrap();
        assert_eq!(outcome, WriteOutcome::Written);
        assert_eq!(*written.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_conflict_budget_exhausted() {
        let writes = AtomicU32::new(0);
        let err = read_modify_write(
            RetryPolicy::with_attempts(3),
            "ns/dc1",
            || async { Ok::<_, Error>(Some(())) },
            |_: &()| Some(()),
            |_: ()| {
                writes.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(api_error(409, "Conflict")) }
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            Error::ConflictRetriesExhausted { attempts: 3, .. }
        ));
        assert_eq!(writes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_other_errors_abort_immediately() {
        let writes = AtomicU32::new(0);
        let err = read_modify_write(
            RetryPolicy::default(),
            "ns/dc1",
            || async { Ok::<_, Error>(Some(())) },
            |_: &()| Some(()),
            |_: ()| {
                writes.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(api_error(500, "InternalError")) }
            },
        )
        .await
        .unwrap_err();
        assert!(!err.is_conflict());
        assert_eq!(writes.load(Ordering::SeqCst), 1);
    }
}
