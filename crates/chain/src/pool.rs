//! Endpoint rotation with failure-count cooldown.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use scrutiny_interface::SequencerError;

struct EndpointState<E> {
    endpoint: Arc<E>,
    consecutive_failures: u32,
    disabled_until: Option<Instant>,
}

/// A mutex-guarded rotation over RPC endpoints. An endpoint that fails
/// `retry_count` times in a row is cooled down for `cooldown` before
/// re-entering the rotation; a permanent failure (revert) is returned
/// immediately without rotating.
pub struct RpcPool<E> {
    endpoints: Mutex<Vec<EndpointState<E>>>,
    retry_count: u32,
    cooldown: Duration,
}

impl<E> RpcPool<E> {
    pub fn new(endpoints: Vec<E>, retry_count: u32, cooldown: Duration) -> Self {
        assert!(!endpoints.is_empty(), "an RPC pool needs endpoints");
        Self {
            endpoints: Mutex::new(
                endpoints
                    .into_iter()
                    .map(|endpoint| EndpointState {
                        endpoint: Arc::new(endpoint),
                        consecutive_failures: 0,
                        disabled_until: None,
                    })
                    .collect(),
            ),
            retry_count,
            cooldown,
        }
    }

    /// Runs `op` against the pool: the first enabled endpoint is tried,
    /// transient failures rotate to the next, permanent failures return
    /// immediately. `Busy` is returned when every endpoint is cooling
    /// down or has failed this round.
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T, SequencerError>
    where
        F: Fn(Arc<E>) -> Fut,
        Fut: Future<Output = Result<T, SequencerError>>,
    {
        let now = Instant::now();
        let total = self.endpoints.lock().expect("rpc pool lock poisoned").len();
        let mut tried = 0;
        let mut cursor = 0;

        while tried < total {
            let Some((index, endpoint)) = self.checkout(cursor, now) else {
                break;
            };
            cursor = index + 1;
            tried += 1;

            match op(endpoint).await {
                Ok(value) => {
                    self.report_success(index);
                    return Ok(value);
                }
                Err(SequencerError::PermanentTx(reason)) => {
                    // Reverts are the chain's verdict, not the endpoint's
                    // fault: no rotation, no failure charge.
                    return Err(SequencerError::PermanentTx(reason));
                }
                Err(e) => {
                    tracing::warn!(endpoint = index, error = %e, "rpc call failed, rotating");
                    self.report_failure(index, now);
                }
            }
        }
        Err(SequencerError::Busy)
    }

    /// The first enabled endpoint at or after `start`, re-enabling any
    /// whose cooldown has elapsed.
    fn checkout(&self, start: usize, now: Instant) -> Option<(usize, Arc<E>)> {
        let mut endpoints = self.endpoints.lock().expect("rpc pool lock poisoned");
        let len = endpoints.len();
        for offset in 0..len {
            let index = (start + offset) % len;
            let state = &mut endpoints[index];
            if let Some(until) = state.disabled_until {
                if until <= now {
                    state.disabled_until = None;
                    state.consecutive_failures = 0;
                } else {
                    continue;
                }
            }
            return Some((index, state.endpoint.clone()));
        }
        None
    }

    fn report_success(&self, index: usize) {
        let mut endpoints = self.endpoints.lock().expect("rpc pool lock poisoned");
        endpoints[index].consecutive_failures = 0;
    }

    fn report_failure(&self, index: usize, now: Instant) {
        let mut endpoints = self.endpoints.lock().expect("rpc pool lock poisoned");
        let state = &mut endpoints[index];
        state.consecutive_failures += 1;
        if state.consecutive_failures >= self.retry_count {
            state.disabled_until = Some(now + self.cooldown);
            tracing::warn!(endpoint = index, "endpoint cooled down");
        }
    }

    /// Endpoints currently in rotation.
    pub fn enabled(&self) -> usize {
        let now = Instant::now();
        self.endpoints
            .lock()
            .expect("rpc pool lock poisoned")
            .iter()
            .filter(|s| s.disabled_until.map(|u| u <= now).unwrap_or(true))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    /// A scriptable endpoint: fails its first `fail_first` calls with a
    /// transient error.
    struct Flaky {
        name: &'static str,
        fail_first: u32,
        calls: AtomicU32,
    }

    impl Flaky {
        fn new(name: &'static str, fail_first: u32) -> Self {
            Self {
                name,
                fail_first,
                calls: AtomicU32::new(0),
            }
        }

        async fn call(&self) -> Result<&'static str, SequencerError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(SequencerError::TransientTx("connection reset".to_string()))
            } else {
                Ok(self.name)
            }
        }
    }

    #[tokio::test]
    async fn transient_failures_rotate_to_the_next_endpoint() {
        let pool = RpcPool::new(
            vec![Flaky::new("e1", u32::MAX), Flaky::new("e2", 0)],
            3,
            Duration::from_secs(60),
        );
        let result = pool.execute(|e| async move { e.call().await }).await.unwrap();
        assert_eq!(result, "e2");
    }

    #[tokio::test]
    async fn failing_endpoint_cools_down_after_retry_count() {
        let pool = RpcPool::new(
            vec![Flaky::new("e1", u32::MAX), Flaky::new("e2", 0)],
            3,
            Duration::from_secs(60),
        );

        // Three calls: e1 fails each time (rotating to e2), then is cooled.
        for _ in 0..3 {
            pool.execute(|e| async move { e.call().await }).await.unwrap();
        }
        assert_eq!(pool.enabled(), 1);

        // Subsequent calls go straight to e2; e1 is not called any more.
        let e1_calls_before = {
            let endpoints = pool.endpoints.lock().unwrap();
            endpoints[0].endpoint.calls.load(Ordering::SeqCst)
        };
        pool.execute(|e| async move { e.call().await }).await.unwrap();
        let e1_calls_after = {
            let endpoints = pool.endpoints.lock().unwrap();
            endpoints[0].endpoint.calls.load(Ordering::SeqCst)
        };
        assert_eq!(e1_calls_before, e1_calls_after);
    }

    #[tokio::test]
    async fn permanent_failure_does_not_rotate() {
        struct Reverting;
        impl Reverting {
            async fn call(&self) -> Result<(), SequencerError> {
                Err(SequencerError::PermanentTx("execution reverted".to_string()))
            }
        }
        let pool = RpcPool::new(vec![Reverting, Reverting], 3, Duration::from_secs(60));
        let result = pool.execute(|e| async move { e.call().await }).await;
        assert!(matches!(result, Err(SequencerError::PermanentTx(_))));
        // Both endpoints stay enabled: a revert is not their fault.
        assert_eq!(pool.enabled(), 2);
    }

    #[tokio::test]
    async fn exhausted_pool_reports_busy() {
        let pool = RpcPool::new(
            vec![Flaky::new("e1", u32::MAX)],
            1,
            Duration::from_secs(60),
        );
        let result = pool.execute(|e| async move { e.call().await }).await;
        assert!(matches!(result, Err(SequencerError::Busy)));
        assert_eq!(pool.enabled(), 0);
    }
}
