use super::{default_shards, EntryStore, Shard};

use hashbrown::raw::RawTable;
use parking_lot::RwLock;

use std::hash::BuildHasher;

/// Sizing for an [`EntryStore`]. Unset fields fall back to defaults picked from the machine.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreBuilder {
    pub(crate) shards: Option<usize>,
    pub(crate) estimated_size: Option<usize>,
}

impl StoreBuilder {
    pub fn new() -> Self {
        StoreBuilder {
            shards: None,
            estimated_size: None,
        }
    }

    /// Rounded up to the next power of two.
    ///
    /// [`StoreBuilder::build`] treats zero as one, the cache builders reject it with [`crate::BuildError::ZeroShards`] instead.
    pub fn shards(mut self, shards: usize) -> Self {
        self.shards = Some(shards);
        self
    }

    /// Pre-size every shard for its share of `estimated_size` entries
    pub fn estimated_size(mut self, estimated_size: usize) -> Self {
        self.estimated_size = Some(estimated_size);
        self
    }

    pub fn build<K, V, S: BuildHasher>(self, build_hasher: S) -> EntryStore<K, V, S> {
        let shards = self
            .shards
            .unwrap_or_else(default_shards)
            .max(1)
            .next_power_of_two();

        let per_shard = match self.estimated_size {
            Some(estimated_size) if estimated_size > shards => (estimated_size / shards) * 2,
            _ => 0,
        };

        let shards = (0..shards)
            .map(|_| Shard {
                table: RwLock::new(RawTable::with_capacity(per_shard)),
            })
            .collect();

        EntryStore {
            shards,
            build_hasher,
        }
    }
}
