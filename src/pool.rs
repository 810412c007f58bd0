use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::warn;

use crate::error::JobFault;

/// Runs a batch of async jobs with at most `limit` in flight.
///
/// - Limits concurrency using a `Semaphore`; a permit is taken before a job is spawned
///   and held until it finishes.
/// - A job that panics does not disturb its siblings; `degrade` turns the fault
///   into a regular result for that job's key.
/// - Returns once every job has a result, in completion order. A task that ends
///   without reporting is degraded with [`JobFault::Aborted`] after the rest.
#[derive(Debug, Clone, Copy)]
pub struct BoundedPool {
    limit: usize,
}

impl BoundedPool {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub async fn run<K, T, J, Fut, D>(
        &self,
        keys: impl IntoIterator<Item = K>,
        job: J,
        degrade: D,
    ) -> Vec<T>
    where
        K: Clone + Send + 'static,
        T: Send + 'static,
        J: Fn(K) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
        D: Fn(K, JobFault) -> T,
    {
        let sem = Arc::new(Semaphore::new(self.limit));
        let mut set = JoinSet::new();
        // Keys stay here until their task reports back.
        let mut pending: Vec<Option<K>> = Vec::new();

        for key in keys {
            let permit = match sem.clone().acquire_owned().await {
                Ok(p) => p,
                // The semaphore is never closed while we own it.
                Err(_) => break,
            };
            let slot = pending.len();
            let fut = job(key.clone());
            pending.push(Some(key));
            set.spawn(async move {
                let _permit = permit;
                let outcome = AssertUnwindSafe(fut)
                    .catch_unwind()
                    .await
                    .map_err(|payload| JobFault::Panicked(panic_message(payload.as_ref())));
                (slot, outcome)
            });
        }

        let mut results = Vec::with_capacity(pending.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((slot, outcome)) => {
                    let Some(key) = pending.get_mut(slot).and_then(Option::take) else {
                        continue;
                    };
                    match outcome {
                        Ok(value) => results.push(value),
                        Err(fault) => {
                            warn!(error = %fault, "pooled job failed");
                            results.push(degrade(key, fault));
                        }
                    }
                }
                Err(e) => warn!(error = %e, "pooled task did not complete"),
            }
        }

        // Tasks that died outside the job (aborted, or panicked past the catch)
        // still owe a result.
        for key in pending.into_iter().flatten() {
            results.push(degrade(key, JobFault::Aborted));
        }
        results
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn never_exceeds_limit() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let pool = BoundedPool::new(4);

        let out = pool
            .run(
                0..40u32,
                |i| {
                    let in_flight = in_flight.clone();
                    let peak = peak.clone();
                    async move {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(2 + u64::from(i % 3))).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        i
                    }
                },
                |_, _| u32::MAX,
            )
            .await;

        assert_eq!(out.len(), 40);
        assert!(peak.load(Ordering::SeqCst) <= 4);
        assert_eq!(in_flight.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn panicking_job_is_degraded() {
        let pool = BoundedPool::new(2);
        let mut out = pool
            .run(
                1..=5u32,
                |i| async move {
                    if i == 3 {
                        panic!("boom on {i}");
                    }
                    Ok::<u32, String>(i)
                },
                |k, fault| Err(format!("{k}: {fault}")),
            )
            .await;
        out.sort_by_key(|r| match r {
            Ok(v) => *v,
            Err(_) => 3,
        });

        assert_eq!(out.len(), 5);
        assert_eq!(out[2], Err("3: job panicked: boom on 3".to_string()));
        assert_eq!(out.iter().filter(|r| r.is_ok()).count(), 4);
    }

    #[tokio::test]
    async fn results_arrive_in_completion_order() {
        let pool = BoundedPool::new(3);
        let out = pool
            .run(
                [90u64, 10, 45],
                |ms| async move {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    ms
                },
                |_, _| 0,
            )
            .await;
        assert_eq!(out, vec![10, 45, 90]);
    }

    struct Detonator;

    impl Drop for Detonator {
        fn drop(&mut self) {
            panic!("payload dropped");
        }
    }

    #[tokio::test]
    async fn task_lost_outside_the_job_is_still_degraded() {
        let pool = BoundedPool::new(2);
        let mut out = pool
            .run(
                1..=4u32,
                |i| async move {
                    if i == 2 {
                        // Unwinds through the catch, then panics again as the
                        // payload is dropped inside the task.
                        std::panic::panic_any(Detonator);
                    }
                    Ok::<u32, (u32, JobFault)>(i)
                },
                |k, fault| Err((k, fault)),
            )
            .await;

        assert_eq!(out.len(), 4);
        assert_eq!(out.pop(), Some(Err((2, JobFault::Aborted))));
        out.sort_by_key(|r| r.clone().unwrap_or_default());
        assert_eq!(out, vec![Ok(1), Ok(3), Ok(4)]);
    }

    #[test]
    fn zero_limit_is_raised_to_one() {
        assert_eq!(BoundedPool::new(0).limit(), 1);
    }
}
