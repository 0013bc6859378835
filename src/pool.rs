//! Bounded fan-out for per-commit work.
//!
//! Results always come back in input order regardless of completion order.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use anyhow::{Context, Result};
use rayon::prelude::*;

/// Hard ceiling on concurrently outstanding blocking calls.
pub const MAX_IN_FLIGHT: usize = 10;

/// Cooperative cancellation shared by every fan-out of one invocation.
#[derive(Debug, Clone, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Returned by a fan-out that stopped dispatching because the operation was
/// cancelled.
#[derive(Debug)]
pub struct Cancelled;

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "operation cancelled")
    }
}

impl std::error::Error for Cancelled {}

pub struct WorkerPool {
    pool: rayon::ThreadPool,
    cancellation: Cancellation,
}

impl WorkerPool {
    /// Build a pool with `concurrency` workers, clamped to `1..=MAX_IN_FLIGHT`.
    pub fn new(concurrency: usize, cancellation: Cancellation) -> Result<Self> {
        let threads = concurrency.clamp(1, MAX_IN_FLIGHT);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|idx| format!("stack-sync-{idx}"))
            .build()
            .context("Failed to initialize worker pool")?;
        Ok(Self { pool, cancellation })
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Apply `f` to every item on the pool and return the results in input
    /// order.
    ///
    /// The first failure cancels the operation: items not yet started are
    /// skipped. The failure is returned rather than [`Cancelled`].
    pub fn map_ordered<T, R, F>(&self, items: &[T], f: F) -> Result<Vec<R>>
    where
        T: Sync,
        R: Send,
        F: Fn(&T) -> Result<R> + Sync + Send,
    {
        let cancellation = &self.cancellation;
        let results: Vec<Option<R>> = self.pool.install(|| {
            items
                .par_iter()
                .map(|item| {
                    if cancellation.is_cancelled() {
                        return Ok(None);
                    }
                    f(item).map(Some).inspect_err(|_| cancellation.cancel())
                })
                .collect::<Result<Vec<_>>>()
        })?;

        results
            .into_iter()
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| Cancelled.into())
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::AtomicUsize,
        thread,
        time::Duration,
    };

    use anyhow::bail;

    use super::*;

    #[test]
    fn test_results_keep_input_order() {
        let pool = WorkerPool::new(4, Cancellation::default()).unwrap();
        let items: Vec<u64> = (0..40).collect();
        let out = pool
            .map_ordered(&items, |n| {
                // Later items finish first.
                thread::sleep(Duration::from_millis(40 - n));
                Ok(n * 2)
            })
            .unwrap();
        assert_eq!(out, items.iter().map(|n| n * 2).collect::<Vec<_>>());
    }

    #[test]
    fn test_concurrency_is_capped() {
        let pool = WorkerPool::new(64, Cancellation::default()).unwrap();
        assert_eq!(pool.threads(), MAX_IN_FLIGHT);

        let in_flight = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        let items: Vec<usize> = (0..50).collect();
        pool.map_ordered(&items, |_| {
            let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(5));
            in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
        assert!(peak.load(Ordering::SeqCst) <= MAX_IN_FLIGHT);
    }

    #[test]
    fn test_failure_wins_over_cancellation() {
        let cancellation = Cancellation::default();
        let pool = WorkerPool::new(2, cancellation.clone()).unwrap();
        let items: Vec<usize> = (0..20).collect();
        let err = pool
            .map_ordered(&items, |n| {
                if *n == 3 {
                    bail!("lookup {n} failed");
                }
                Ok(*n)
            })
            .unwrap_err();
        assert_eq!(err.to_string(), "lookup 3 failed");
        assert!(cancellation.is_cancelled());
    }

    #[test]
    fn test_cancelled_pool_dispatches_nothing() {
        let cancellation = Cancellation::default();
        cancellation.cancel();
        let pool = WorkerPool::new(2, cancellation).unwrap();
        let calls = AtomicUsize::new(0);
        let err = pool
            .map_ordered(&[1, 2, 3], |n| {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(*n)
            })
            .unwrap_err();
        assert!(err.downcast_ref::<Cancelled>().is_some());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_empty_input() {
        let pool = WorkerPool::new(3, Cancellation::default()).unwrap();
        let out: Vec<u8> = pool.map_ordered(&[] as &[u8], |n| Ok(*n)).unwrap();
        assert!(out.is_empty());
    }
}
