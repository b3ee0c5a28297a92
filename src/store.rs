pub mod builder;

pub use builder::StoreBuilder;

use parking_lot::RwLock;
use std::hash::{BuildHasher, Hash, Hasher};

use hashbrown::hash_map::DefaultHashBuilder;
use hashbrown::raw::RawTable;

/// A sharded concurrent map holding the loaded entries of a cache.
///
/// Reads and writes only lock the shard the key hashes to, so loads for different keys rarely contend.
/// Nothing is ever removed from the store by the caches, a reload only overwrites.
pub struct EntryStore<K, V, S = DefaultHashBuilder> {
    build_hasher: S,
    shards: Box<[Shard<K, V>]>,
}

struct Shard<K, V> {
    table: RwLock<RawTable<Entry<K, V>>>,
}

struct Entry<K, V> {
    key: K,
    value: V,
}

impl<K, V> EntryStore<K, V> {
    /// An empty store with the default shard count, see [`StoreBuilder`] for tuning
    pub fn new() -> Self {
        StoreBuilder::new().build(Default::default())
    }

    /// An empty store with room for about `capacity` entries before any shard reallocates
    pub fn with_capacity(capacity: usize) -> Self {
        StoreBuilder::new()
            .estimated_size(capacity)
            .build(Default::default())
    }
}

impl<K, V> Default for EntryStore<K, V> {
    fn default() -> Self {
        EntryStore::new()
    }
}

impl<K, V, S: BuildHasher> EntryStore<K, V, S> {
    /// An empty store hashing keys with `build_hasher`, both for picking a shard and within it
    pub fn with_hasher(build_hasher: S) -> Self {
        StoreBuilder::new().build(build_hasher)
    }
}

impl<K, V, S> EntryStore<K, V, S> {
    /// Sums every shard, so the count may be stale by the time it returns under concurrent writes
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.table.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.table.read().is_empty())
    }
}

impl<K, V, S> EntryStore<K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher,
    V: Clone,
{
    /// Insert or overwrite the value for `key`, returning the previous value
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        let (hash, shard) = self.shard(&key);

        shard.insert(key, value, hash, &self.build_hasher)
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let (hash, shard) = self.shard(key);

        shard.get(key, hash)
    }

    /// True if `key` has a value, without cloning it
    pub fn contains_key(&self, key: &K) -> bool {
        let (hash, shard) = self.shard(key);

        shard.table.read().get(hash, |e| e.key == *key).is_some()
    }

    /// Clone out every value currently in the store.
    ///
    /// Shards are read one after another, so a concurrent writer may be seen in some shards and not in others.
    pub fn values(&self) -> Vec<V> {
        let mut out = Vec::with_capacity(self.len());

        for shard in self.shards.iter() {
            let table = shard.table.read();

            // safety: the read guard outlives the iterator and every bucket it yields
            unsafe {
                out.extend(table.iter().map(|bucket| bucket.as_ref().value.clone()));
            }
        }

        out
    }

    fn shard(&self, key: &K) -> (u64, &Shard<K, V>) {
        let hash = hash_key(&self.build_hasher, key);

        // shard count is a power of two and never zero
        let idx = hash as usize & (self.shards.len() - 1);
        (hash, &self.shards[idx])
    }
}

impl<K, V> Shard<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    fn insert<S: BuildHasher>(&self, key: K, value: V, hash: u64, build_hasher: &S) -> Option<V> {
        let mut table = self.table.write();

        let found = table.find_or_find_insert_slot(hash, |e| e.key == key, |e| hash_key(build_hasher, &e.key));

        // safety: the write guard is held across the lookup and the write, so neither the bucket nor the slot can move
        match found {
            Ok(bucket) => Some(std::mem::replace(unsafe { &mut bucket.as_mut().value }, value)),
            Err(slot) => {
                unsafe { table.insert_in_slot(hash, slot, Entry { key, value }) };

                None
            }
        }
    }

    fn get(&self, key: &K, hash: u64) -> Option<V> {
        self.table.read().get(hash, |e| e.key == *key).map(|e| e.value.clone())
    }
}

fn hash_key<K, S>(build_hasher: &S, key: &K) -> u64
where
    K: Hash,
    S: BuildHasher,
{
    let mut hasher = build_hasher.build_hasher();
    key.hash(&mut hasher);
    hasher.finish()
}

/// Four shards per available core, looked up once per process
fn default_shards() -> usize {
    static DEFAULT_SHARDS: std::sync::OnceLock<usize> = std::sync::OnceLock::new();

    *DEFAULT_SHARDS.get_or_init(|| {
        let cores = std::thread::available_parallelism().map_or(1, |n| n.get());

        cores * 4
    })
}
