mod executor;

pub(crate) use executor::{Executor, JobError};

use tokio_util::sync::CancellationToken;

use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Sleep for `period`, returns false if the cache was shut down first
pub(crate) async fn wait_period(period: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(period) => true,
    }
}

/// One refresh chain: wait out the period, reload, repeat.
///
/// The loop only holds a weak reference to the cache between reloads, so it ends on its own
/// once every handle is dropped, as well as when `shutdown` is cancelled.
pub(crate) async fn refresh_loop<T, F, Fut>(
    cache: Weak<T>,
    period: Duration,
    shutdown: CancellationToken,
    mut reload: F,
) where
    F: FnMut(Arc<T>) -> Fut,
    Fut: Future<Output = ()>,
{
    loop {
        if !wait_period(period, &shutdown).await {
            tracing::debug!("refresh loop cancelled");
            return;
        }

        let Some(cache) = cache.upgrade() else {
            tracing::debug!("cache dropped, ending refresh loop");
            return;
        };

        reload(cache).await;
    }
}
