use crate::gate::Gate;

use hashbrown::HashMap;
use parking_lot::RwLock;

use std::hash::Hash;
use std::sync::Arc;

/// One [`Gate`] per key ever requested.
///
/// Gates are created lazily under the write lock and never removed, so memory grows with the number of
/// distinct keys seen. Once a caller holds a gate it loads through it without touching the registry again.
pub(crate) struct GateRegistry<K> {
    gates: RwLock<HashMap<K, Arc<Gate>>>,
}

impl<K> GateRegistry<K>
where
    K: Clone + Eq + Hash,
{
    pub(crate) fn new() -> Self {
        GateRegistry {
            gates: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) fn gate(&self, key: &K) -> Arc<Gate> {
        if let Some(gate) = self.gates.read().get(key) {
            return gate.clone();
        }

        // check again under the creation lock, another caller may have created it in between
        self.gates
            .write()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Gate::new()))
            .clone()
    }

    pub(crate) fn len(&self) -> usize {
        self.gates.read().len()
    }
}
