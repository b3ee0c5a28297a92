mod registry;

use registry::GateRegistry;

use crate::error::BuildError;
use crate::gate::Gate;
use crate::load::Load;
use crate::refresh::{refresh_loop, Executor, JobError};
use crate::store::{EntryStore, StoreBuilder};

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use std::fmt::Debug;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

type KeyFn<K, V> = Arc<dyn Fn(&V) -> K + Send + Sync>;
type ErrorHook<K, E> = Arc<dyn Fn(&K, &E) + Send + Sync>;

/// A cache that loads one entry at a time through a [`Load`].
///
/// The first [`KeyedCache::get`] for a key runs the loader on the calling task, concurrent callers
/// for that same key wait for that one run. Different keys load independently.
///
/// With a refresh period configured every loaded key reloads in the background once per period.
/// Keys waiting for their next refresh cost nothing but a timer, and at most `max_concurrency` background reloads
/// run at once. First loads from [`KeyedCache::get`] are never held back by that limit.
pub struct KeyedCache<K, V, L: Load<K, V>> {
    inner: Arc<KeyedInner<K, V, L>>,
}

impl<K, V, L: Load<K, V>> Clone for KeyedCache<K, V, L> {
    fn clone(&self) -> Self {
        KeyedCache {
            inner: self.inner.clone(),
        }
    }
}

struct KeyedInner<K, V, L: Load<K, V>> {
    store: EntryStore<K, V>,
    gates: GateRegistry<K>,
    loader: L,
    key_of: Option<KeyFn<K, V>>,
    refresh_every: Option<Duration>,
    max_concurrency: Option<NonZeroUsize>,
    executor: OnceLock<Executor>,
    on_refresh_error: Option<ErrorHook<K, L::Error>>,
    shutdown: CancellationToken,
}

impl<K, V, L: Load<K, V>> Drop for KeyedInner<K, V, L> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl<K, V, L> KeyedCache<K, V, L>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    L: Load<K, V> + Send + Sync + 'static,
    L::Error: Debug + Send + 'static,
{
    /// A cache that loads every key once and never refreshes
    pub fn new(loader: L) -> Self {
        KeyedCache::builder(loader).assemble()
    }

    pub fn builder(loader: L) -> KeyedCacheBuilder<K, V, L> {
        KeyedCacheBuilder {
            loader,
            key_of: None,
            refresh_every: None,
            max_concurrency: None,
            on_refresh_error: None,
            store: StoreBuilder::new(),
        }
    }

    /// Get the value for `id`, loading it first if it has never been loaded
    pub async fn get(&self, id: K) -> Result<V, L::Error> {
        // an entry is only ever stored by a load of its own key, so its gate is already loaded
        if let Some(value) = self.inner.store.get(&id) {
            return Ok(value);
        }

        let inner = &self.inner;
        let gate = inner.gates.gate(&id);
        let (key, gate_ref) = (&id, &gate);

        gate.ensure_ran(|| async move {
            inner.load(key.clone()).await?;
            inner.schedule_refresh(key.clone(), gate_ref);

            Ok::<(), L::Error>(())
        })
        .await?;

        match inner.store.get(&id) {
            Some(value) => Ok(value),
            None => unreachable!("the gate for {id:?} is loaded but the store has no entry, this is a bug"),
        }
    }

    /// Read `id` without ever triggering a load
    pub fn peek(&self, id: &K) -> Option<V> {
        self.inner.store.get(id)
    }

    pub fn len(&self) -> usize {
        self.inner.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.store.is_empty()
    }

    /// The number of distinct keys ever requested, loaded or not
    pub fn tracked_keys(&self) -> usize {
        self.inner.gates.len()
    }

    /// Stop every background refresh. Values already loaded stay readable and new keys still load on demand.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }
}

impl<K, V, L> KeyedInner<K, V, L>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    L: Load<K, V> + Send + Sync + 'static,
    L::Error: Debug + Send + 'static,
{
    async fn load(&self, id: K) -> Result<(), L::Error> {
        trace!(key = ?id, "running loader");

        let value = self.loader.load(id.clone()).await?;

        if let Some(key_of) = &self.key_of {
            let loaded = key_of(&value);
            if loaded != id {
                warn!(key = ?id, loaded = ?loaded, "loaded value reports a different key, storing it under the requested one");
            }
        }

        self.store.insert(id, value);

        Ok(())
    }

    fn schedule_refresh(self: &Arc<Self>, id: K, gate: &Gate) {
        let Some(period) = self.refresh_every else {
            return;
        };

        if !gate.claim_refresh() {
            return;
        }

        debug!(key = ?id, ?period, "scheduling refresh");

        tokio::spawn(refresh_loop(
            Arc::downgrade(self),
            period,
            self.shutdown.clone(),
            move |inner: Arc<Self>| inner.refresh(id.clone()),
        ));
    }

    async fn refresh(self: Arc<Self>, id: K) {
        let job = {
            let inner = self.clone();
            let id = id.clone();
            async move { inner.load(id).await }
        };

        match self.executor().run(job).await {
            Ok(Ok(())) => trace!(key = ?id, "refreshed"),
            Ok(Err(e)) => {
                warn!(key = ?id, error = ?e, "refresh failed, retrying next period");

                if let Some(hook) = &self.on_refresh_error {
                    hook(&id, &e);
                }
            }
            Err(JobError::Panicked) => warn!(key = ?id, "loader panicked during refresh, retrying next period"),
            Err(JobError::Stopped) => debug!(key = ?id, "refresh executor stopped, dropping refresh"),
        }
    }

    /// Started on first use, from inside a refresh loop, so the workers land on the caller's runtime
    fn executor(&self) -> &Executor {
        self.executor
            .get_or_init(|| Executor::new(self.max_concurrency, &self.shutdown))
    }
}

pub struct KeyedCacheBuilder<K, V, L: Load<K, V>> {
    loader: L,
    key_of: Option<KeyFn<K, V>>,
    refresh_every: Option<Duration>,
    max_concurrency: Option<usize>,
    on_refresh_error: Option<ErrorHook<K, L::Error>>,
    store: StoreBuilder,
}

impl<K, V, L> KeyedCacheBuilder<K, V, L>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    L: Load<K, V> + Send + Sync + 'static,
    L::Error: Debug + Send + 'static,
{
    /// Reload every key once per `period` after its first successful load
    pub fn refresh_every(mut self, period: Duration) -> Self {
        self.refresh_every = Some(period);
        self
    }

    /// Cap how many background reloads may run at the same time, unbounded by default
    pub fn max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = Some(max_concurrency);
        self
    }

    /// Derive the key of a loaded value, used to flag loaders returning a value for the wrong key
    pub fn key_of<F>(mut self, key_of: F) -> Self
    where
        F: Fn(&V) -> K + Send + Sync + 'static,
    {
        self.key_of = Some(Arc::new(key_of));
        self
    }

    /// Called with the key and error of every failed background refresh
    pub fn on_refresh_error<H>(mut self, hook: H) -> Self
    where
        H: Fn(&K, &L::Error) + Send + Sync + 'static,
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

    pub fn build(self) -> Result<KeyedCache<K, V, L>, BuildError> {
        if self.refresh_every == Some(Duration::ZERO) {
            return Err(BuildError::ZeroRefreshPeriod);
        }

        if self.max_concurrency == Some(0) {
            return Err(BuildError::ZeroConcurrency);
        }

        if self.store.shards == Some(0) {
            return Err(BuildError::ZeroShards);
        }

        Ok(self.assemble())
    }

    fn assemble(self) -> KeyedCache<K, V, L> {
        KeyedCache {
            inner: Arc::new(KeyedInner {
                store: self.store.build(Default::default()),
                gates: GateRegistry::new(),
                loader: self.loader,
                key_of: self.key_of,
                refresh_every: self.refresh_every,
                max_concurrency: self.max_concurrency.and_then(NonZeroUsize::new),
                executor: OnceLock::new(),
                on_refresh_error: self.on_refresh_error,
                shutdown: CancellationToken::new(),
            }),
        }
    }
}
