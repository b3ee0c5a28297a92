use crate::error::BuildError;
use crate::gate::Gate;
use crate::load::BulkLoad;
use crate::refresh::refresh_loop;
use crate::store::{EntryStore, StoreBuilder};

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use std::fmt::Debug;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

type KeyFn<K, V> = Arc<dyn Fn(&V) -> K + Send + Sync>;
type ErrorHook<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// A cache populated all at once by a single [`BulkLoad`].
///
/// The first call to [`BulkCache::get`] or [`BulkCache::get_all`] runs the loader on the calling task,
/// every concurrent caller waits for that one run. With a refresh period configured the loader then
/// runs again in the background every period, for as long as the cache is alive.
///
/// ### Consistency
/// Loaded values are written into the store one at a time, so while a refresh is in progress readers can
/// see some entries from the new load and some from the previous one. Entries missing from a later load are kept.
pub struct BulkCache<K, V, L: BulkLoad<V>> {
    inner: Arc<BulkInner<K, V, L>>,
}

impl<K, V, L: BulkLoad<V>> Clone for BulkCache<K, V, L> {
    fn clone(&self) -> Self {
        BulkCache {
            inner: self.inner.clone(),
        }
    }
}

struct BulkInner<K, V, L: BulkLoad<V>> {
    store: EntryStore<K, V>,
    gate: Gate,
    loader: L,
    key_of: KeyFn<K, V>,
    refresh_every: Option<Duration>,
    on_refresh_error: Option<ErrorHook<L::Error>>,
    shutdown: CancellationToken,
}

impl<K, V, L: BulkLoad<V>> Drop for BulkInner<K, V, L> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl<K, V, L> BulkCache<K, V, L>
where
    K: Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    L: BulkLoad<V> + Send + Sync + 'static,
    L::Error: Debug + Send + 'static,
{
    /// A cache that loads once and never refreshes
    pub fn new<F>(loader: L, key_of: F) -> Self
    where
        F: Fn(&V) -> K + Send + Sync + 'static,
    {
        BulkCache::builder(loader, key_of).assemble()
    }

    pub fn builder<F>(loader: L, key_of: F) -> BulkCacheBuilder<K, V, L>
    where
        F: Fn(&V) -> K + Send + Sync + 'static,
    {
        BulkCacheBuilder {
            loader,
            key_of: Arc::new(key_of),
            refresh_every: None,
            on_refresh_error: None,
            store: StoreBuilder::new(),
        }
    }

    /// Get the value for `id`, loading the whole data set first if it has never been loaded.
    ///
    /// Returns `Ok(None)` if the loaded data has no entry for `id`.
    pub async fn get(&self, id: &K) -> Result<Option<V>, L::Error> {
        self.inner.ensure_loaded().await?;

        Ok(self.inner.store.get(id))
    }

    /// Get every value currently in the cache, loading the data set first if it has never been loaded.
    ///
    /// This is a snapshot, see the type level docs for what a concurrent refresh may look like.
    pub async fn get_all(&self) -> Result<Vec<V>, L::Error> {
        self.inner.ensure_loaded().await?;

        Ok(self.inner.store.values())
    }

    pub fn len(&self) -> usize {
        self.inner.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.store.is_empty()
    }

    /// True once the first load has succeeded
    pub fn is_loaded(&self) -> bool {
        self.inner.gate.is_loaded()
    }

    /// Stop the background refresh. Values already loaded stay readable.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }
}

impl<K, V, L> BulkInner<K, V, L>
where
    K: Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    L: BulkLoad<V> + Send + Sync + 'static,
    L::Error: Debug + Send + 'static,
{
    async fn ensure_loaded(self: &Arc<Self>) -> Result<(), L::Error> {
        if self.gate.is_loaded() {
            return Ok(());
        }

        let this = self;
        self.gate
            .ensure_ran(|| async move {
                this.load().await?;
                this.schedule_refresh();

                Ok::<(), L::Error>(())
            })
            .await
    }

    async fn load(&self) -> Result<usize, L::Error> {
        trace!("running bulk loader");

        let values = self.loader.load_all().await?;
        let count = values.len();

        for value in values {
            let key = (self.key_of)(&value);
            self.store.insert(key, value);
        }

        debug!(entries = count, "bulk load finished");

        Ok(count)
    }

    fn schedule_refresh(self: &Arc<Self>) {
        let Some(period) = self.refresh_every else {
            return;
        };

        if !self.gate.claim_refresh() {
            return;
        }

        debug!(?period, "scheduling bulk refresh");

        tokio::spawn(refresh_loop(
            Arc::downgrade(self),
            period,
            self.shutdown.clone(),
            |inner: Arc<Self>| async move { inner.refresh().await },
        ));
    }

    async fn refresh(&self) {
        match AssertUnwindSafe(self.load()).catch_unwind().await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                warn!(error = ?e, "bulk refresh failed, retrying next period");

                if let Some(hook) = &self.on_refresh_error {
                    hook(&e);
                }
            }
            Err(_) => warn!("bulk loader panicked during refresh, retrying next period"),
        }
    }
}

pub struct BulkCacheBuilder<K, V, L: BulkLoad<V>> {
    loader: L,
    key_of: KeyFn<K, V>,
    refresh_every: Option<Duration>,
    on_refresh_error: Option<ErrorHook<L::Error>>,
    store: StoreBuilder,
}

impl<K, V, L> BulkCacheBuilder<K, V, L>
where
    K: Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    L: BulkLoad<V> + Send + Sync + 'static,
    L::Error: Debug + Send + 'static,
{
    /// Reload the data set every `period` after the first successful load
    pub fn refresh_every(mut self, period: Duration) -> Self {
        self.refresh_every = Some(period);
        self
    }

    /// Called with the error of every failed background refresh
    pub fn on_refresh_error<H>(mut self, hook: H) -> Self
    where
        H: Fn(&L::Error) + Send + Sync + 'static,
    {
        self.on_refresh_error = Some(Arc::new(hook));
        self
    }

    pub fn shards(mut self, shards: usize) -> Self {
        self.store = self.store.shards(shards);
        self
    }

    pub fn estimated_size(mut self, estimated_size: usize) -> Self {
        self.store = self.store.estimated_size(estimated_size);
        self
    }

    pub fn build(self) -> Result<BulkCache<K, V, L>, BuildError> {
        if self.refresh_every == Some(Duration::ZERO) {
            return Err(BuildError::ZeroRefreshPeriod);
        }

        if self.store.shards == Some(0) {
            return Err(BuildError::ZeroShards);
        }

        Ok(self.assemble())
    }

    fn assemble(self) -> BulkCache<K, V, L> {
        BulkCache {
            inner: Arc::new(BulkInner {
                store: self.store.build(Default::default()),
                gate: Gate::new(),
                loader: self.loader,
                key_of: self.key_of,
                refresh_every: self.refresh_every,
                on_refresh_error: self.on_refresh_error,
                shutdown: CancellationToken::new(),
            }),
        }
    }
}
