use futures::FutureExt;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use std::future::Future;
use std::num::NonZeroUsize;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Why a job submitted to the [`Executor`] produced no output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JobError {
    /// The pool shut down before the job finished
    Stopped,
    /// The job panicked, the worker that ran it keeps going
    Panicked,
}

/// Runs scheduled reloads, optionally capped to a fixed number of concurrent jobs.
///
/// Only the reload itself goes through the executor, refresh loops do their waiting outside of it
/// so a sleeping key never holds a slot.
pub(crate) enum Executor {
    /// Each job runs on the task that submitted it
    Unbounded,
    /// A fixed set of workers draining a shared queue
    Pool { jobs: mpsc::UnboundedSender<Job> },
}

impl Executor {
    /// # Panics
    /// If `max_concurrency` is set and this is called outside of a tokio runtime
    pub(crate) fn new(max_concurrency: Option<NonZeroUsize>, shutdown: &CancellationToken) -> Self {
        let Some(workers) = max_concurrency else {
            return Executor::Unbounded;
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let rx = Arc::new(Mutex::new(rx));

        for id in 0..workers.get() {
            tokio::spawn(worker(id, rx.clone(), shutdown.clone()));
        }

        Executor::Pool { jobs: tx }
    }

    /// Run `fut` to completion under the concurrency cap.
    ///
    /// A panic inside `fut` is caught and reported as [`JobError::Panicked`], it never takes a worker down with it.
    pub(crate) async fn run<Fut>(&self, fut: Fut) -> Result<Fut::Output, JobError>
    where
        Fut: Future + Send + 'static,
        Fut::Output: Send + 'static,
    {
        let fut = AssertUnwindSafe(fut).catch_unwind();

        match self {
            Executor::Unbounded => fut.await.map_err(|_| JobError::Panicked),
            Executor::Pool { jobs } => {
                let (tx, rx) = oneshot::channel();

                jobs.send(Box::pin(async move {
                    let _ = tx.send(fut.await);
                }))
                .map_err(|_| JobError::Stopped)?;

                match rx.await {
                    Ok(Ok(output)) => Ok(output),
                    Ok(Err(_)) => Err(JobError::Panicked),
                    Err(_) => Err(JobError::Stopped),
                }
            }
        }
    }
}

async fn worker(id: usize, jobs: Arc<Mutex<mpsc::UnboundedReceiver<Job>>>, shutdown: CancellationToken) {
    tracing::trace!(worker = id, "refresh worker started");

    loop {
        // only the idle worker holding the lock waits on the queue, the lock is released before the job runs
        let job = {
            let mut jobs = jobs.lock().await;

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => None,
                job = jobs.recv() => job,
            }
        };

        match job {
            Some(job) => job.await,
            None => break,
        }
    }

    tracing::trace!(worker = id, "refresh worker stopped");
}

#[cfg(test)]
mod test {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct InFlight {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    impl InFlight {
        fn new() -> Arc<Self> {
            Arc::new(InFlight {
                current: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            })
        }

        async fn work(&self, time: Duration) {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(time).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_caps_concurrency() {
        let shutdown = CancellationToken::new();
        let executor = Arc::new(Executor::new(NonZeroUsize::new(2), &shutdown));
        let in_flight = InFlight::new();

        let started = tokio::time::Instant::now();
        let handles: Vec<_> = (0..5)
            .map(|i| {
                let executor = executor.clone();
                let in_flight = in_flight.clone();
                tokio::spawn(async move {
                    executor
                        .run(async move {
                            in_flight.work(Duration::from_secs(1)).await;
                            i
                        })
                        .await
                })
            })
            .collect();

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }

        assert_eq!(results, vec![Ok(0), Ok(1), Ok(2), Ok(3), Ok(4)]);
        assert_eq!(in_flight.peak.load(Ordering::SeqCst), 2);
        // 5 one second jobs two at a time
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_runs_everything_at_once() {
        let executor = Arc::new(Executor::new(None, &CancellationToken::new()));
        let in_flight = InFlight::new();

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let executor = executor.clone();
                let in_flight = in_flight.clone();
                tokio::spawn(async move {
                    executor
                        .run(async move { in_flight.work(Duration::from_secs(1)).await })
                        .await
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await.unwrap(), Ok(()));
        }

        assert_eq!(in_flight.peak.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_stops_on_shutdown() {
        let shutdown = CancellationToken::new();
        let executor = Executor::new(NonZeroUsize::new(1), &shutdown);

        shutdown.cancel();
        // let the workers observe the cancellation
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(executor.run(async { 1 }).await, Err(JobError::Stopped));
    }

    async fn explode() -> usize {
        tokio::task::yield_now().await;
        panic!("job blew up")
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_worker_survives_panicking_job() {
        let shutdown = CancellationToken::new();
        let executor = Executor::new(NonZeroUsize::new(1), &shutdown);

        // one worker, so every later job only runs if it outlived the panics
        for _ in 0..3 {
            assert_eq!(executor.run(explode()).await, Err(JobError::Panicked));
        }

        assert_eq!(executor.run(async { 1 }).await, Ok(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_catches_panicking_job() {
        let executor = Executor::new(None, &CancellationToken::new());

        assert_eq!(executor.run(explode()).await, Err(JobError::Panicked));
        assert_eq!(executor.run(async { 2 }).await, Ok(2));
    }
}
