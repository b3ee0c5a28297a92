use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use super::{Gate, LoadingGuard};

/// Future returned by [`Gate::ensure_ran`]
#[must_use = "futures do nothing unless you `.await` or poll them"]
#[pin_project::pin_project(project = EnsureRanProj)]
pub enum EnsureRan<'a, F, Fut> {
    Waiting {
        gate: &'a Gate,
        action: Option<F>,
    },
    Working {
        #[pin]
        fut: Fut,
        guard: LoadingGuard<'a>,
    },
    Done,
}

impl<'a, F, Fut, E> Future for EnsureRan<'a, F, Fut>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<(), E>>,
{
    type Output = Result<(), E>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        loop {
            match self.as_mut().project() {
                EnsureRanProj::Waiting { gate, action } => {
                    if gate.is_loaded() {
                        return Poll::Ready(Ok(()));
                    }

                    match gate.try_begin(cx.waker()) {
                        None => return Poll::Ready(Ok(())),
                        Some(false) => return Poll::Pending,
                        Some(true) => {}
                    }

                    let gate: &'a Gate = *gate;
                    // arm the guard before calling the action, it may panic
                    let guard = LoadingGuard::new(gate);
                    let action = action.take().expect("action is only taken once");
                    let fut = action();

                    self.set(EnsureRan::Working { fut, guard });
                }
                EnsureRanProj::Working { fut, guard } => match fut.poll(cx) {
                    Poll::Ready(Ok(())) => {
                        guard.complete();
                        self.set(EnsureRan::Done);

                        return Poll::Ready(Ok(()));
                    }
                    Poll::Ready(Err(e)) => {
                        // dropping the armed guard hands the gate to the next waiter
                        self.set(EnsureRan::Done);

                        return Poll::Ready(Err(e));
                    }
                    Poll::Pending => return Poll::Pending,
                },
                EnsureRanProj::Done => panic!("`EnsureRan` polled after completion"),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::super::{Gate, GateState};

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_ensure_ran_single_caller() {
        let gate = Gate::new();
        let runs = &AtomicUsize::new(0);

        let res: Result<(), ()> = gate
            .ensure_ran(|| async move {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert_eq!(res, Ok(()));
        assert_eq!(gate.state(), GateState::Loaded);

        // a loaded gate never runs the action again
        let res: Result<(), ()> = gate
            .ensure_ran(|| async move {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert_eq!(res, Ok(()));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_ensure_ran_many_callers_run_once_join() {
        let gate = Gate::new();
        let runs = &AtomicUsize::new(0);

        let action = || async move {
            runs.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok::<(), ()>(())
        };

        let (a, b, c) = tokio::join!(
            gate.ensure_ran(action),
            gate.ensure_ran(action),
            gate.ensure_ran(action)
        );

        assert_eq!((a, b, c), (Ok(()), Ok(()), Ok(())));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_ensure_ran_many_tasks_run_once() {
        let gate = Arc::new(Gate::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let gate = gate.clone();
                let runs = runs.clone();
                tokio::spawn(async move {
                    gate.ensure_ran(|| async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok::<(), ()>(())
                    })
                    .await
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await.unwrap(), Ok(()));
        }

        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_ensure_ran_err_resets_gate() {
        let gate = Gate::new();

        let res = gate.ensure_ran(|| async { Err(TestError::IntentionalError) }).await;

        assert_eq!(res, Err(TestError::IntentionalError));
        assert_eq!(gate.state(), GateState::NotLoaded);

        let res = gate.ensure_ran(|| async { Ok::<(), TestError>(()) }).await;

        assert_eq!(res, Ok(()));
        assert_eq!(gate.state(), GateState::Loaded);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_ensure_ran_err_hands_over_to_waiter_join() {
        let gate = Gate::new();
        let runs = &AtomicUsize::new(0);

        let failing = || async move {
            runs.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Err(TestError::IntentionalError)
        };
        let succeeding = || async move {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok::<(), TestError>(())
        };

        let (a, b, c) = tokio::join!(
            gate.ensure_ran(failing),
            gate.ensure_ran(succeeding),
            gate.ensure_ran(succeeding)
        );

        assert_eq!(a, Err(TestError::IntentionalError));
        assert_eq!(b, Ok(()));
        assert_eq!(c, Ok(()));
        // the failed run plus exactly one takeover
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(gate.state(), GateState::Loaded);
    }

    #[tokio::test]
    async fn test_dropped_worker_resets_gate() {
        let gate = Gate::new();

        let stalled = gate.ensure_ran(|| async {
            std::future::pending::<()>().await;
            Ok::<(), ()>(())
        });

        // polls the worker once, then drops it mid-load
        let timed_out = tokio::time::timeout(Duration::from_millis(10), stalled).await;
        assert!(timed_out.is_err());
        assert_eq!(gate.state(), GateState::NotLoaded);

        let res = gate.ensure_ran(|| async { Ok::<(), ()>(()) }).await;
        assert_eq!(res, Ok(()));
    }

    #[tokio::test]
    async fn test_claim_refresh_once() {
        let gate = Gate::new();

        assert!(gate.claim_refresh());
        assert!(!gate.claim_refresh());
    }

    #[derive(Debug, PartialEq, Clone, Copy)]
    pub enum TestError {
        IntentionalError,
    }
}
