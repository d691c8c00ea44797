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

//! One contract suite, every backend.
//!
//! The provider contract is backend-independent; each scenario below runs verbatim against the
//! heap, file-system, memory-mapped, and in-memory backends through a capacity-parameterized
//! factory.

use std::collections::HashMap;

use hoard_storage::prelude::*;

type DynStore = Box<dyn StorageProvider<String, Vec<u8>>>;
type Factory<'a> = &'a dyn Fn(usize) -> DynStore;

fn run_all(factory: Factory<'_>) {
    scenario_admission(factory);
    scenario_add_conflict(factory);
    scenario_insert_overwrite(factory);
    scenario_accounting_and_consistency(factory);
    scenario_enumeration(factory);
}

/// Capacity 1000, threshold 90%: success, then a soft warning, then a hard rejection.
fn scenario_admission(factory: Factory<'_>) {
    let store = factory(1000);
    assert_eq!(store.add("k1".to_string(), vec![1; 500], false), AddResult::Success);
    assert!(!store.near_eviction_reported());
    assert_eq!(
        store.add("k2".to_string(), vec![2; 420], false),
        AddResult::SuccessNearEviction
    );
    assert!(store.near_eviction_reported());
    assert_eq!(
        store.add("k3".to_string(), vec![3; 200], false),
        AddResult::NotEnoughSpace
    );
    assert!(!store.contains(&"k3".to_string()));

    assert_eq!(store.item_size(&"k1".to_string()), 500);
    assert_eq!(store.item_size(&"k3".to_string()), 0);

    // the signal is sticky until acknowledged
    store.reset_near_eviction();
    assert!(!store.near_eviction_reported());
}

fn scenario_add_conflict(factory: Factory<'_>) {
    let store = factory(1000);
    assert!(store.add("k1".to_string(), vec![1; 50], false).is_success());
    assert_eq!(store.add("k1".to_string(), vec![2; 50], false), AddResult::KeyExists);
    assert_eq!(store.get(&"k1".to_string()).unwrap(), vec![1; 50]);
}

fn scenario_insert_overwrite(factory: Factory<'_>) {
    let store = factory(1000);
    assert_eq!(
        store.insert("k1".to_string(), vec![1; 100], false),
        InsertResult::Success
    );
    assert_eq!(
        store.insert("k1".to_string(), vec![2; 40], false),
        InsertResult::SuccessOverwrite
    );
    assert_eq!(store.get(&"k1".to_string()).unwrap(), vec![2; 40]);
    // only the replacement value is accounted
    assert_eq!(store.usage(), "k1".len() + 40);
}

/// Replay a mixed mutation sequence against a model map; sizes and membership must match the
/// model exactly afterwards, and `contains` must agree with `get` for every key.
fn scenario_accounting_and_consistency(factory: Factory<'_>) {
    let store = factory(1_000_000);
    let mut model: HashMap<String, usize> = HashMap::new();

    for i in 0..60usize {
        let key = format!("k{}", i % 12);
        let size = (i * 13) % 64 + 1;
        match i % 4 {
            0 => {
                let result = store.add(key.clone(), vec![i as u8; size], false);
                if model.contains_key(&key) {
                    assert_eq!(result, AddResult::KeyExists);
                } else {
                    assert!(result.is_success());
                    model.insert(key, size);
                }
            }
            1 | 3 => {
                let result = store.insert(key.clone(), vec![i as u8; size], false);
                assert_eq!(result.is_overwrite(), model.contains_key(&key));
                model.insert(key, size);
            }
            _ => {
                let removed = store.remove(&key);
                assert_eq!(removed.is_some(), model.remove(&key).is_some());
            }
        }
    }

    let expected: usize = model.iter().map(|(key, size)| key.len() + size).sum();
    assert_eq!(store.usage(), expected);
    assert_eq!(store.len(), model.len());

    let mut keys = store.keys();
    keys.sort();
    let mut expected_keys: Vec<_> = model.keys().cloned().collect();
    expected_keys.sort();
    assert_eq!(keys, expected_keys);

    for i in 0..12 {
        let key = format!("k{i}");
        assert_eq!(store.contains(&key), store.get(&key).is_some());
        assert_eq!(store.contains(&key), model.contains_key(&key));
    }

    store.clear();
    assert_eq!(store.len(), 0);
    assert_eq!(store.usage(), 0);
    assert!(store.get(&"k1".to_string()).is_none());
}

fn scenario_enumeration(factory: Factory<'_>) {
    let store = factory(1_000_000);
    for i in 0..8u8 {
        assert!(store.add(format!("k{i}"), vec![i; 16], false).is_success());
    }
    let mut entries: Vec<_> = Entries::new(store.keys(), &*store).collect();
    entries.sort();
    assert_eq!(entries.len(), 8);
    for (i, (key, value)) in entries.iter().enumerate() {
        assert_eq!(key, &format!("k{i}"));
        assert_eq!(value, &vec![i as u8; 16]);
    }
}

#[test]
fn test_heap_contract() {
    run_all(&|capacity| Box::new(HeapStoreProvider::open(HeapStoreConfig::new(capacity))));
}

#[test]
fn test_fs_contract() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_path_buf();
    run_all(&move |capacity| {
        Box::new(FsStoreProvider::open(FsStoreConfig::new(&root).with_capacity(capacity)).unwrap())
    });
}

#[test]
fn test_mmf_contract() {
    run_all(&|capacity| {
        Box::new(
            MmfStoreProvider::open(
                MmfStoreConfig::new()
                    .with_num_views(1)
                    .with_view_size(4096)
                    .with_capacity(capacity),
            )
            .unwrap(),
        )
    });
}

#[test]
fn test_in_memory_contract() {
    run_all(&|capacity| Box::new(InMemoryStoreProvider::open(InMemoryStoreConfig::new(capacity)).unwrap()));
}
