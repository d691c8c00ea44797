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

//! Memory-mapped arena backend.
//!
//! Values live inside fixed-size memory-mapped views, each subdivided at runtime into
//! variable-length arenas. The in-memory index maps keys to arena handles; growing a value past
//! its arena relocates it, which retargets the handle in the index and frees the old arena under
//! the same lock. [`InMemoryStoreProvider`] specializes the backend onto volatile mappings.

mod alloc;
mod view;

use std::{marker::PhantomData, path::PathBuf, sync::Arc, time::Duration};

use hashbrown::HashMap;
use hoard_common::{
    bits,
    code::{StoreKey, StoreValue},
    properties::Properties,
};
use itertools::Itertools;
use parking_lot::Mutex;

use self::alloc::{ArenaAllocator, ArenaHandle};
use crate::{
    capacity::{Admission, SizeGauge, DEFAULT_NEAR_EVICTION_PERCENT},
    error::{Error, Result},
    flusher::Flusher,
    fs::{DEFAULT_PERSISTENCE_INTERVAL, MIN_PERSISTENCE_INTERVAL},
    provider::{AddResult, InsertResult, StorageProvider},
    serde::StoreItem,
    MB,
};

/// Page-alignment requirement for file-backed view offsets.
const PAGE: usize = 4096;

/// Default bytes per view.
pub const DEFAULT_VIEW_SIZE: usize = 4 * MB;

/// Configuration for [`MmfStoreProvider`].
#[derive(Debug, Clone)]
pub struct MmfStoreConfig {
    /// Backing file for the memory-mapped region. `None` for a pure in-memory instance.
    pub file_name: Option<PathBuf>,
    /// Initial view count.
    pub num_views: usize,
    /// Bytes per view. Must be a multiple of 4 KiB when file-backed.
    pub view_size: usize,
    /// Initial total mapped size in bytes; rounds the initial view count up when it demands
    /// more than `num_views`.
    pub initial_size: usize,
    /// Capacity in bytes; also bounds view growth.
    pub capacity: usize,
    /// Near-eviction threshold, in percent of the capacity.
    pub near_eviction_percent: u8,
    /// View sync period for file-backed instances.
    pub persistence_interval: Duration,
}

impl Default for MmfStoreConfig {
    fn default() -> Self {
        Self {
            file_name: None,
            num_views: 8,
            view_size: DEFAULT_VIEW_SIZE,
            initial_size: 0,
            capacity: 1024 * MB,
            near_eviction_percent: DEFAULT_NEAR_EVICTION_PERCENT,
            persistence_interval: DEFAULT_PERSISTENCE_INTERVAL,
        }
    }
}

impl MmfStoreConfig {
    /// Config with defaults: 8 anonymous views of 4 MiB, 1 GiB capacity.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the backing file.
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file_name = Some(path.into());
        self
    }

    /// Set the initial view count.
    pub fn with_num_views(mut self, num_views: usize) -> Self {
        self.num_views = num_views;
        self
    }

    /// Set the bytes per view.
    pub fn with_view_size(mut self, view_size: usize) -> Self {
        self.view_size = view_size;
        self
    }

    /// Set the initial total mapped size in bytes.
    pub fn with_initial_size(mut self, initial_size: usize) -> Self {
        self.initial_size = initial_size;
        self
    }

    /// Set the capacity in bytes.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Set the near-eviction threshold percent.
    pub fn with_near_eviction_percent(mut self, percent: u8) -> Self {
        self.near_eviction_percent = percent;
        self
    }

    /// Build the config from a flat option map.
    ///
    /// Recognized keys: `file-name` (empty for pure in-memory), `num-views`, `view-size`,
    /// `initial-size-mb`, `max-size` (MB), `persistence-interval` (ms).
    pub fn from_properties(props: &Properties) -> Result<Self> {
        let mut config = Self::default();
        match props.get_raw("file-name") {
            Some(path) if !path.is_empty() => config.file_name = Some(path.into()),
            _ => {}
        }
        config.num_views = props.get_or("num-views", config.num_views)?;
        config.view_size = props.get_or("view-size", config.view_size)?;
        config.initial_size = props.get_or("initial-size-mb", 0usize)? * MB;
        config.capacity = props.get_or("max-size", 1024usize)? * MB;
        let interval = props.get_or::<u64>("persistence-interval", 60_000)?;
        config.persistence_interval = Duration::from_millis(interval).max(MIN_PERSISTENCE_INTERVAL);
        Ok(config)
    }

    fn initial_views(&self) -> usize {
        self.num_views.max(1).max(self.initial_size.div_ceil(self.view_size))
    }

    fn max_views(&self) -> usize {
        self.initial_views().max(self.capacity.div_ceil(self.view_size))
    }
}

#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    handle: ArenaHandle,
    weight: usize,
}

/// Memory-mapped arena backend.
///
/// Envelope bytes are built before the lock is taken; allocator and index mutations, including
/// the relocation sequence, run under the single lock.
pub struct MmfStoreProvider<K, V>
where
    K: StoreKey,
    V: StoreValue,
{
    flusher: Option<Flusher>,
    inner: Arc<MmfInner<K>>,
    _value: PhantomData<V>,
}

struct MmfInner<K> {
    state: Mutex<MmfState<K>>,
}

struct MmfState<K> {
    index: HashMap<K, IndexEntry>,
    alloc: ArenaAllocator,
    gauge: SizeGauge,
}

impl<K, V> MmfStoreProvider<K, V>
where
    K: StoreKey,
    V: StoreValue,
{
    /// Open a memory-mapped backend with the given config.
    ///
    /// A file-backed instance whose backing file already holds views walks every arena, skips
    /// free and corrupt ones, and rebuilds the index from the rest.
    pub fn open(config: MmfStoreConfig) -> Result<Self> {
        if config.view_size < 2 * alloc::HEADER_LEN {
            return Err(Error::other(anyhow::anyhow!(
                "view size {} is too small",
                config.view_size
            )));
        }
        if config.file_name.is_some() && !bits::is_aligned(PAGE, config.view_size) {
            return Err(Error::other(anyhow::anyhow!(
                "view size {} of a file-backed store must be a multiple of {PAGE}",
                config.view_size
            )));
        }

        let initial_views = config.initial_views();
        let max_views = config.max_views();
        let (alloc, recovered) = match &config.file_name {
            None => (
                ArenaAllocator::open_anon(config.view_size, initial_views, max_views)?,
                vec![],
            ),
            Some(path) => ArenaAllocator::open_file(path, config.view_size, initial_views, max_views)?,
        };

        let mut state = MmfState {
            index: HashMap::new(),
            alloc,
            gauge: SizeGauge::new(config.capacity, config.near_eviction_percent),
        };
        for (handle, payload) in recovered {
            match StoreItem::<K, V>::decode(&payload) {
                Ok(item) => {
                    let weight = item.value.weight();
                    state.gauge.charge(item.key.weight() + weight);
                    if let Some(old) = state.index.insert(item.key.clone(), IndexEntry { handle, weight }) {
                        // duplicate key on the medium, keep the later arena
                        state.alloc.release(old.handle);
                        state.gauge.credit(item.key.weight() + old.weight);
                    }
                }
                Err(e) => {
                    tracing::warn!("[mmf store]: dropping undecodable arena: {e}");
                    state.alloc.release(handle);
                }
            }
        }

        let inner = Arc::new(MmfInner {
            state: Mutex::new(state),
        });

        let flusher = if config.file_name.is_some() {
            let target = inner.clone();
            Some(Flusher::spawn("hoard-mmf-flusher", config.persistence_interval, move || {
                if let Err(e) = target.state.lock().alloc.flush(false) {
                    tracing::warn!("[mmf store]: view sync failed: {e}");
                }
            })?)
        } else {
            None
        };

        Ok(Self {
            flusher,
            inner,
            _value: PhantomData,
        })
    }

    fn store_new(state: &mut MmfState<K>, key: K, buf: &[u8], weight: usize) -> Result<Option<()>> {
        let handle = match state.alloc.allocate(buf.len())? {
            Some(handle) => handle,
            None => return Ok(None),
        };
        state.alloc.write(handle, buf);
        state.index.insert(key, IndexEntry { handle, weight });
        Ok(Some(()))
    }
}

impl<K, V> StorageProvider<K, V> for MmfStoreProvider<K, V>
where
    K: StoreKey,
    V: StoreValue,
{
    fn add(&self, key: K, value: V, extend: bool) -> AddResult {
        let mut buf = Vec::new();
        // build the envelope before taking the lock
        if let Err(e) = StoreItem::encode(&key, &value, &mut buf) {
            tracing::warn!("[mmf store]: encode failed: {e}");
            return AddResult::Failure;
        }
        let weight = value.weight();
        let incoming = key.weight() + weight;

        let state = &mut *self.inner.state.lock();
        if state.index.contains_key(&key) {
            return AddResult::KeyExists;
        }
        let admission = state.gauge.admit(incoming as isize, extend);
        if admission == Admission::Reject {
            return AddResult::NotEnoughSpace;
        }
        match Self::store_new(state, key, &buf, weight) {
            Ok(Some(())) => {
                state.gauge.charge(incoming);
                AddResult::stored(admission)
            }
            Ok(None) | Err(Error::EntryTooLarge { .. }) => AddResult::NotEnoughSpace,
            Err(e) => {
                tracing::warn!("[mmf store]: arena allocation failed: {e}");
                AddResult::Failure
            }
        }
    }

    fn insert(&self, key: K, value: V, extend: bool) -> InsertResult {
        let mut buf = Vec::new();
        if let Err(e) = StoreItem::encode(&key, &value, &mut buf) {
            tracing::warn!("[mmf store]: encode failed: {e}");
            return InsertResult::Failure;
        }
        let weight = value.weight();

        let state = &mut *self.inner.state.lock();
        let old = state.index.get(&key).copied();
        let incoming = match &old {
            Some(entry) => weight as isize - entry.weight as isize,
            None => (key.weight() + weight) as isize,
        };
        let admission = state.gauge.admit(incoming, extend);
        if admission == Admission::Reject {
            return InsertResult::NotEnoughSpace;
        }

        match old {
            None => match Self::store_new(state, key, &buf, weight) {
                Ok(Some(())) => {
                    state.gauge.apply(incoming);
                    InsertResult::stored(false, admission)
                }
                Ok(None) | Err(Error::EntryTooLarge { .. }) => InsertResult::NotEnoughSpace,
                Err(e) => {
                    tracing::warn!("[mmf store]: arena allocation failed: {e}");
                    InsertResult::Failure
                }
            },
            Some(entry) => {
                if state.alloc.fits(entry.handle, buf.len()) {
                    // the grown value still fits its arena, pointer unchanged
                    state.alloc.write(entry.handle, &buf);
                    state.index.insert(key, IndexEntry { handle: entry.handle, weight });
                } else {
                    // write the new arena fully, swap the index pointer, then free the old one
                    let handle = match state.alloc.allocate(buf.len()) {
                        Ok(Some(handle)) => handle,
                        Ok(None) | Err(Error::EntryTooLarge { .. }) => return InsertResult::NotEnoughSpace,
                        Err(e) => {
                            tracing::warn!("[mmf store]: arena allocation failed: {e}");
                            return InsertResult::Failure;
                        }
                    };
                    state.alloc.write(handle, &buf);
                    state.index.insert(key, IndexEntry { handle, weight });
                    state.alloc.release(entry.handle);
                }
                state.gauge.apply(incoming);
                InsertResult::stored(true, admission)
            }
        }
    }

    fn get(&self, key: &K) -> Option<V> {
        let payload = {
            let state = &*self.inner.state.lock();
            let entry = state.index.get(key)?;
            match state.alloc.read(entry.handle) {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::warn!("[mmf store]: arena read failed: {e}");
                    return None;
                }
            }
        };
        // decode outside the lock
        match StoreItem::<K, V>::decode(&payload) {
            Ok(item) => Some(item.value),
            Err(e) => {
                tracing::warn!("[mmf store]: decode failed: {e}");
                None
            }
        }
    }

    fn item_size(&self, key: &K) -> usize {
        self.inner
            .state
            .lock()
            .index
            .get(key)
            .map(|entry| entry.weight)
            .unwrap_or(0)
    }

    fn contains(&self, key: &K) -> bool {
        self.inner.state.lock().index.contains_key(key)
    }

    fn remove(&self, key: &K) -> Option<V> {
        let payload = {
            let state = &mut *self.inner.state.lock();
            let entry = state.index.remove(key)?;
            let payload = state.alloc.read(entry.handle);
            state.alloc.release(entry.handle);
            state.gauge.credit(key.weight() + entry.weight);
            payload
        };
        let payload = match payload {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!("[mmf store]: arena read failed: {e}");
                return None;
            }
        };
        match StoreItem::<K, V>::decode(&payload) {
            Ok(item) => Some(item.value),
            Err(e) => {
                tracing::warn!("[mmf store]: decode failed: {e}");
                None
            }
        }
    }

    fn clear(&self) {
        let state = &mut *self.inner.state.lock();
        state.index.clear();
        state.alloc.clear();
        state.gauge.reset();
    }

    fn len(&self) -> usize {
        self.inner.state.lock().index.len()
    }

    fn keys(&self) -> Vec<K> {
        self.inner.state.lock().index.keys().cloned().collect_vec()
    }

    fn usage(&self) -> usize {
        self.inner.state.lock().gauge.usage()
    }

    fn capacity(&self) -> usize {
        self.inner.state.lock().gauge.capacity()
    }

    fn near_eviction_reported(&self) -> bool {
        self.inner.state.lock().gauge.near_eviction_reported()
    }

    fn reset_near_eviction(&self) {
        self.inner.state.lock().gauge.reset_near_eviction()
    }
}

impl<K, V> Drop for MmfStoreProvider<K, V>
where
    K: StoreKey,
    V: StoreValue,
{
    fn drop(&mut self) {
        // stop the sync task first; an in-progress sync is waited for
        self.flusher.take();
        if let Err(e) = self.inner.state.lock().alloc.flush(true) {
            tracing::warn!("[mmf store]: final view sync failed: {e}");
        }
    }
}

/// Configuration for [`InMemoryStoreProvider`].
#[derive(Debug, Clone)]
pub struct InMemoryStoreConfig {
    /// Total capacity in bytes.
    pub capacity: usize,
    /// Bytes per view.
    pub view_size: usize,
    /// Near-eviction threshold, in percent of the capacity.
    pub near_eviction_percent: u8,
}

impl InMemoryStoreConfig {
    /// Config with the given capacity in bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            view_size: DEFAULT_VIEW_SIZE,
            near_eviction_percent: DEFAULT_NEAR_EVICTION_PERCENT,
        }
    }

    /// Build the config from a flat option map. Recognized keys: `max-size` (MB).
    pub fn from_properties(props: &Properties) -> Result<Self> {
        let mb = props.get_or::<usize>("max-size", 1024)?;
        Ok(Self::new(mb * MB))
    }
}

/// Pure-RAM arena backend: the same allocator on volatile mappings, no persistence.
pub struct InMemoryStoreProvider<K, V>
where
    K: StoreKey,
    V: StoreValue,
{
    store: MmfStoreProvider<K, V>,
}

impl<K, V> InMemoryStoreProvider<K, V>
where
    K: StoreKey,
    V: StoreValue,
{
    /// Open an in-memory arena backend with the given config.
    pub fn open(config: InMemoryStoreConfig) -> Result<Self> {
        let store = MmfStoreProvider::open(
            MmfStoreConfig::new()
                .with_num_views(1)
                .with_view_size(config.view_size.min(config.capacity.next_power_of_two()))
                .with_capacity(config.capacity)
                .with_near_eviction_percent(config.near_eviction_percent),
        )?;
        Ok(Self { store })
    }
}

impl<K, V> StorageProvider<K, V> for InMemoryStoreProvider<K, V>
where
    K: StoreKey,
    V: StoreValue,
{
    fn add(&self, key: K, value: V, extend: bool) -> AddResult {
        self.store.add(key, value, extend)
    }

    fn insert(&self, key: K, value: V, extend: bool) -> InsertResult {
        self.store.insert(key, value, extend)
    }

    fn get(&self, key: &K) -> Option<V> {
        self.store.get(key)
    }

    fn item_size(&self, key: &K) -> usize {
        self.store.item_size(key)
    }

    fn contains(&self, key: &K) -> bool {
        self.store.contains(key)
    }

    fn remove(&self, key: &K) -> Option<V> {
        self.store.remove(key)
    }

    fn clear(&self) {
        self.store.clear()
    }

    fn len(&self) -> usize {
        self.store.len()
    }

    fn keys(&self) -> Vec<K> {
        self.store.keys()
    }

    fn usage(&self) -> usize {
        self.store.usage()
    }

    fn capacity(&self) -> usize {
        self.store.capacity()
    }

    fn near_eviction_reported(&self) -> bool {
        self.store.near_eviction_reported()
    }

    fn reset_near_eviction(&self) {
        self.store.reset_near_eviction()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn anon(view_size: usize, capacity: usize) -> MmfStoreProvider<String, Vec<u8>> {
        MmfStoreProvider::open(
            MmfStoreConfig::new()
                .with_num_views(1)
                .with_view_size(view_size)
                .with_capacity(capacity),
        )
        .unwrap()
    }

    impl<K, V> MmfStoreProvider<K, V>
    where
        K: StoreKey,
        V: StoreValue,
    {
        fn arena_of(&self, key: &K) -> Option<alloc::ArenaRef> {
            let state = self.inner.state.lock();
            let entry = state.index.get(key)?;
            state.alloc.resolve(entry.handle)
        }

        fn free_bytes(&self) -> usize {
            self.inner.state.lock().alloc.free_bytes()
        }
    }

    #[test_log::test]
    fn test_relocation_reuses_freed_arena() {
        let store = anon(256, 256);

        // small entry lands at the start of the only view
        assert!(store.add("k1".to_string(), vec![1u8; 20], false).is_success());
        let before = store.arena_of(&"k1".to_string()).unwrap();
        assert_eq!(before.offset, 0);

        // growing past the arena relocates the entry and frees the original slot
        assert!(store
            .insert("k1".to_string(), vec![2u8; 120], false)
            .is_success());
        let after = store.arena_of(&"k1".to_string()).unwrap();
        assert_ne!(before, after);
        assert_eq!(store.get(&"k1".to_string()).unwrap(), vec![2u8; 120]);

        // a same-sized newcomer is served from the freed original arena
        assert!(store.add("k2".to_string(), vec![3u8; 20], false).is_success());
        let reused = store.arena_of(&"k2".to_string()).unwrap();
        assert_eq!((reused.view, reused.offset), (before.view, before.offset));
    }

    #[test_log::test]
    fn test_in_place_overwrite_keeps_pointer() {
        let store = anon(1024, 1024);
        assert!(store.add("k1".to_string(), vec![1u8; 64], false).is_success());
        let before = store.arena_of(&"k1".to_string()).unwrap();
        // shrinking always fits in place
        assert_eq!(
            store.insert("k1".to_string(), vec![2u8; 16], false),
            InsertResult::SuccessOverwrite
        );
        assert_eq!(store.arena_of(&"k1".to_string()).unwrap(), before);
        assert_eq!(store.get(&"k1".to_string()).unwrap(), vec![2u8; 16]);
    }

    #[test_log::test]
    fn test_no_arena_aliasing() {
        let store = anon(4096, 4096);
        for i in 0..16u8 {
            assert!(store.add(format!("k{i}"), vec![i; 32], false).is_success());
        }
        for i in (0..16u8).step_by(2) {
            assert!(store
                .insert(format!("k{i}"), vec![i; 200], false)
                .is_success());
        }
        let state = store.inner.state.lock();
        let live = state.alloc.live_arenas();
        let distinct: HashSet<_> = live.iter().map(|aref| (aref.view, aref.offset)).collect();
        assert_eq!(distinct.len(), live.len());
        assert_eq!(live.len(), state.index.len());
    }

    #[test_log::test]
    fn test_accounting_matches_live_entries() {
        let store = anon(4096, 4096);
        assert!(store.add("k1".to_string(), vec![1u8; 100], false).is_success());
        assert!(store.add("k2".to_string(), vec![2u8; 50], false).is_success());
        assert!(store.insert("k2".to_string(), vec![2u8; 80], false).is_success());
        store.remove(&"k1".to_string());
        assert_eq!(store.usage(), 2 + 80);
        store.clear();
        assert_eq!(store.usage(), 0);
        assert_eq!(store.free_bytes(), 4096);
    }

    #[test_log::test]
    fn test_file_backed_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("views.hoard");
        let config = MmfStoreConfig::new()
            .with_file(&path)
            .with_num_views(1)
            .with_view_size(4096)
            .with_capacity(64 * 4096);

        let store: MmfStoreProvider<String, Vec<u8>> = MmfStoreProvider::open(config.clone()).unwrap();
        assert!(store.add("k1".to_string(), vec![1u8; 40], false).is_success());
        assert!(store.add("k2".to_string(), vec![2u8; 80], false).is_success());
        assert!(store.add("k3".to_string(), vec![3u8; 120], false).is_success());
        store.remove(&"k2".to_string());
        let usage = store.usage();
        drop(store);

        let store: MmfStoreProvider<String, Vec<u8>> = MmfStoreProvider::open(config.clone()).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.usage(), usage);
        assert_eq!(store.get(&"k1".to_string()).unwrap(), vec![1u8; 40]);
        assert_eq!(store.get(&"k3".to_string()).unwrap(), vec![3u8; 120]);
        assert!(!store.contains(&"k2".to_string()));
        drop(store);

        // flip a payload byte of the first arena, its checksum no longer matches
        let mut raw = std::fs::read(&path).unwrap();
        raw[alloc::HEADER_LEN + 4] ^= 0xff;
        std::fs::write(&path, &raw).unwrap();

        let store: MmfStoreProvider<String, Vec<u8>> = MmfStoreProvider::open(config).unwrap();
        assert_eq!(store.len(), 1);
        assert!(!store.contains(&"k1".to_string()));
        assert_eq!(store.get(&"k3".to_string()).unwrap(), vec![3u8; 120]);
    }

    #[test_log::test]
    fn test_in_memory_variant() {
        let store: InMemoryStoreProvider<String, Vec<u8>> =
            InMemoryStoreProvider::open(InMemoryStoreConfig::new(MB)).unwrap();
        assert!(store.add("k1".to_string(), vec![1u8; 100], false).is_success());
        assert_eq!(store.get(&"k1".to_string()).unwrap(), vec![1u8; 100]);
        assert_eq!(store.item_size(&"k1".to_string()), 100);
        assert_eq!(store.remove(&"k1".to_string()).unwrap(), vec![1u8; 100]);
        assert!(store.is_empty());
    }
}
