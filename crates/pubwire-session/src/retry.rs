//! Retry-with-timeout driver.
//!
//! Runs an idempotent action on a fixed interval until it reports
//! completion, fails, or the deadline passes. The deadline counts from the
//! moment the task is scheduled, not from the latest attempt.

use std::fmt;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Why a retried action gave up.
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    /// The action never completed within the deadline.
    #[error("retry operation was unsuccessful during {0:?}")]
    TimedOut(Duration),

    /// The action itself failed; it is not retried.
    #[error("{0}")]
    Failed(E),
}

/// A scheduled retry loop.
///
/// Ticks run one after another on a single task, so the action never
/// overlaps with itself.
pub struct RetryTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl RetryTask {
    /// Schedule `action` now.
    ///
    /// On `Ok(true)` the loop stops silently; the action is expected to have
    /// signalled success itself. `on_failure` is called at most once, with
    /// [`RetryError::Failed`] for an `Err` or [`RetryError::TimedOut`] for an
    /// `Ok(false)` past the deadline. Cancelling `token` stops the loop before
    /// the next tick.
    pub fn schedule<A, E, F>(
        interval: Duration,
        timeout: Duration,
        token: CancellationToken,
        action: A,
        on_failure: F,
    ) -> Self
    where
        A: FnMut() -> Result<bool, E> + Send + 'static,
        E: Send + 'static,
        F: FnOnce(RetryError<E>) + Send + 'static,
    {
        let started = Instant::now();
        let handle = tokio::spawn(run(
            started,
            interval,
            timeout,
            token.clone(),
            action,
            on_failure,
        ));
        Self { token, handle }
    }

    /// Wait for the loop to end.
    pub async fn join(self) {
        let _ = self.handle.await;
    }
}

impl fmt::Debug for RetryTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryTask")
            .field("cancelled", &self.token.is_cancelled())
            .field("finished", &self.handle.is_finished())
            .finish()
    }
}

/// Shorthand for [`RetryTask::schedule`].
pub fn spawn_retry<A, E, F>(
    interval: Duration,
    timeout: Duration,
    token: CancellationToken,
    action: A,
    on_failure: F,
) -> RetryTask
where
    A: FnMut() -> Result<bool, E> + Send + 'static,
    E: Send + 'static,
    F: FnOnce(RetryError<E>) + Send + 'static,
{
    RetryTask::schedule(interval, timeout, token, action, on_failure)
}

async fn run<A, E, F>(
    started: Instant,
    interval: Duration,
    timeout: Duration,
    token: CancellationToken,
    mut action: A,
    on_failure: F,
) where
    A: FnMut() -> Result<bool, E>,
    F: FnOnce(RetryError<E>),
{
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut attempt: u32 = 0;

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!(attempt, "retry cancelled");
                return;
            }
            _ = ticker.tick() => {}
        }

        attempt += 1;
        match action() {
            Ok(true) => {
                trace!(attempt, "retry completed");
                return;
            }
            Ok(false) => {
                if started.elapsed() >= timeout {
                    debug!(attempt, ?timeout, "retry deadline passed");
                    on_failure(RetryError::TimedOut(timeout));
                    return;
                }
            }
            Err(err) => {
                debug!(attempt, "retried action failed");
                on_failure(RetryError::Failed(err));
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;

    const INTERVAL: Duration = Duration::from_millis(100);

    type Failures = Arc<Mutex<Vec<String>>>;

    fn record(failures: &Failures) -> impl FnOnce(RetryError<&'static str>) + Send + 'static {
        let failures = Arc::clone(failures);
        move |err| failures.lock().unwrap().push(err.to_string())
    }

    #[tokio::test(start_paused = true)]
    async fn first_attempt_runs_immediately() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let task = spawn_retry(
            INTERVAL,
            Duration::from_secs(1),
            CancellationToken::new(),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, &'static str>(true)
            },
            |_| panic!("must not fail"),
        );
        task.join().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_after_success_on_third_attempt() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let failures = Failures::default();
        let task = spawn_retry(
            INTERVAL,
            Duration::from_secs(1),
            CancellationToken::new(),
            move || Ok::<_, &'static str>(counter.fetch_add(1, Ordering::SeqCst) + 1 == 3),
            record(&failures),
        );
        task.join().await;

        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(failures.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_from_first_schedule() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let failures = Failures::default();
        let begin = Instant::now();
        let task = spawn_retry(
            INTERVAL,
            Duration::from_millis(450),
            CancellationToken::new(),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, &'static str>(false)
            },
            record(&failures),
        );
        task.join().await;

        // Attempts at 0, 100, 200, 300, 400 are inside the window; 500 is past it.
        assert_eq!(calls.load(Ordering::SeqCst), 6);
        assert_eq!(begin.elapsed(), Duration::from_millis(500));
        let failures = failures.lock().unwrap();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].contains("unsuccessful"));
    }

    #[tokio::test(start_paused = true)]
    async fn error_fails_immediately_without_retry() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let failures = Failures::default();
        let task = spawn_retry(
            INTERVAL,
            Duration::from_secs(10),
            CancellationToken::new(),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Err("closed")
            },
            record(&failures),
        );
        task.join().await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(failures.lock().unwrap().as_slice(), ["closed"]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_prevents_further_ticks() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let failures = Failures::default();
        let token = CancellationToken::new();
        let task = spawn_retry(
            INTERVAL,
            Duration::from_secs(10),
            token.clone(),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, &'static str>(false)
            },
            record(&failures),
        );

        time::sleep(Duration::from_millis(250)).await;
        let before = calls.load(Ordering::SeqCst);
        token.cancel();
        task.join().await;
        time::sleep(Duration::from_secs(1)).await;

        assert_eq!(before, 3);
        assert_eq!(calls.load(Ordering::SeqCst), before);
        assert!(failures.lock().unwrap().is_empty());
    }
}
