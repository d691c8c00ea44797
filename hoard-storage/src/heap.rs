// Copyright 2025 hoard Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use hashbrown::HashMap;
use hoard_common::{
    code::{StoreKey, StoreValue},
    properties::Properties,
};
use itertools::Itertools;
use parking_lot::Mutex;

use crate::{
    capacity::{Admission, SizeGauge, DEFAULT_NEAR_EVICTION_PERCENT},
    error::Result,
    provider::{AddResult, InsertResult, StorageProvider},
    MB,
};

/// Configuration for [`HeapStoreProvider`].
#[derive(Debug, Clone)]
pub struct HeapStoreConfig {
    /// Capacity in bytes.
    pub capacity: usize,
    /// Near-eviction threshold, in percent of the capacity.
    pub near_eviction_percent: u8,
}

impl HeapStoreConfig {
    /// Config with the given capacity in bytes and the default threshold.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            near_eviction_percent: DEFAULT_NEAR_EVICTION_PERCENT,
        }
    }

    /// Build the config from a flat option map. Recognized keys: `max-size` (MB).
    pub fn from_properties(props: &Properties) -> Result<Self> {
        let mb = props.get_or::<usize>("max-size", 1024)?;
        Ok(Self::new(mb * MB))
    }
}

/// Hash-table backend: the index *is* the value store.
///
/// Keys and their native in-process values live in one table; no serialization, no persistence.
/// This is the reference implementation used to validate the contract semantics before testing
/// the heavier backends.
pub struct HeapStoreProvider<K, V>
where
    K: StoreKey,
    V: StoreValue,
{
    state: Mutex<HeapState<K, V>>,
}

struct HeapState<K, V> {
    table: HashMap<K, V>,
    gauge: SizeGauge,
}

impl<K, V> HeapStoreProvider<K, V>
where
    K: StoreKey,
    V: StoreValue,
{
    /// Open a heap backend with the given config.
    pub fn open(config: HeapStoreConfig) -> Self {
        Self {
            state: Mutex::new(HeapState {
                table: HashMap::new(),
                gauge: SizeGauge::new(config.capacity, config.near_eviction_percent),
            }),
        }
    }
}

impl<K, V> StorageProvider<K, V> for HeapStoreProvider<K, V>
where
    K: StoreKey,
    V: StoreValue,
{
    fn add(&self, key: K, value: V, extend: bool) -> AddResult {
        let state = &mut *self.state.lock();
        if state.table.contains_key(&key) {
            return AddResult::KeyExists;
        }
        let incoming = key.weight() + value.weight();
        let admission = state.gauge.admit(incoming as isize, extend);
        if admission == Admission::Reject {
            return AddResult::NotEnoughSpace;
        }
        state.gauge.charge(incoming);
        state.table.insert(key, value);
        AddResult::stored(admission)
    }

    fn insert(&self, key: K, value: V, extend: bool) -> InsertResult {
        let state = &mut *self.state.lock();
        let old_weight = state.table.get(&key).map(|old| old.weight());
        let incoming = match old_weight {
            Some(old) => value.weight() as isize - old as isize,
            None => (key.weight() + value.weight()) as isize,
        };
        let admission = state.gauge.admit(incoming, extend);
        if admission == Admission::Reject {
            return InsertResult::NotEnoughSpace;
        }
        state.gauge.apply(incoming);
        let old = state.table.insert(key, value);
        InsertResult::stored(old.is_some(), admission)
    }

    fn get(&self, key: &K) -> Option<V> {
        self.state.lock().table.get(key).cloned()
    }

    fn item_size(&self, key: &K) -> usize {
        self.state.lock().table.get(key).map(|value| value.weight()).unwrap_or(0)
    }

    fn contains(&self, key: &K) -> bool {
        self.state.lock().table.contains_key(key)
    }

    fn remove(&self, key: &K) -> Option<V> {
        let state = &mut *self.state.lock();
        let value = state.table.remove(key)?;
        state.gauge.credit(key.weight() + value.weight());
        Some(value)
    }

    fn clear(&self) {
        let state = &mut *self.state.lock();
        state.table.clear();
        state.gauge.reset();
    }

    fn len(&self) -> usize {
        self.state.lock().table.len()
    }

    fn keys(&self) -> Vec<K> {
        self.state.lock().table.keys().cloned().collect_vec()
    }

    fn usage(&self) -> usize {
        self.state.lock().gauge.usage()
    }

    fn capacity(&self) -> usize {
        self.state.lock().gauge.capacity()
    }

    fn near_eviction_reported(&self) -> bool {
        self.state.lock().gauge.near_eviction_reported()
    }

    fn reset_near_eviction(&self) {
        self.state.lock().gauge.reset_near_eviction()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(capacity: usize) -> HeapStoreProvider<String, Vec<u8>> {
        HeapStoreProvider::open(HeapStoreConfig::new(capacity))
    }

    #[test]
    fn test_add_never_overwrites() {
        let store = provider(MB);
        assert_eq!(store.add("k1".to_string(), vec![1u8; 8], false), AddResult::Success);
        assert_eq!(store.add("k1".to_string(), vec![2u8; 8], false), AddResult::KeyExists);
        assert_eq!(store.get(&"k1".to_string()).unwrap(), vec![1u8; 8]);
    }

    #[test]
    fn test_insert_overwrite_accounting() {
        let store = provider(MB);
        assert_eq!(store.insert("k1".to_string(), vec![1u8; 100], false), InsertResult::Success);
        assert_eq!(
            store.insert("k1".to_string(), vec![2u8; 40], false),
            InsertResult::SuccessOverwrite
        );
        assert_eq!(store.get(&"k1".to_string()).unwrap(), vec![2u8; 40]);
        // only the replacement value is accounted
        assert_eq!(store.usage(), 2 + 40);
    }

    #[test]
    fn test_remove_absent_is_noop() {
        let store = provider(MB);
        assert!(store.remove(&"nope".to_string()).is_none());
        assert_eq!(store.usage(), 0);
    }

    #[test]
    fn test_from_properties() {
        let props = Properties::new().with("max-size", 4);
        let config = HeapStoreConfig::from_properties(&props).unwrap();
        assert_eq!(config.capacity, 4 * MB);
    }
}
