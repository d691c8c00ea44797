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

//! File-system backend: durable, crash-tolerant single-node storage.
//!
//! Values live as one file per entry inside a per-process data folder; only the key→file index
//! lives in memory. When a persistence key is configured, the index is snapshotted to disk on a
//! timer and on shutdown and reloaded at open for a warm restart.

mod snapshot;

use std::{
    fs::create_dir_all,
    marker::PhantomData,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use hashbrown::HashMap;
use hoard_common::{
    code::{StoreKey, StoreValue},
    properties::Properties,
};
use itertools::Itertools;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
    capacity::{Admission, SizeGauge, DEFAULT_NEAR_EVICTION_PERCENT},
    error::{Error, Result},
    flusher::Flusher,
    provider::{AddResult, InsertResult, StorageProvider},
    serde::StoreItem,
    MB,
};

/// Floor for the snapshot period.
pub const MIN_PERSISTENCE_INTERVAL: Duration = Duration::from_millis(1000);
/// Default snapshot period.
pub const DEFAULT_PERSISTENCE_INTERVAL: Duration = Duration::from_millis(60_000);

/// Configuration for [`FsStoreProvider`].
#[derive(Debug, Clone)]
pub struct FsStoreConfig {
    /// Base directory for the data folder.
    pub root_dir: PathBuf,
    /// Identity naming the data folder. Absent ⇒ a random folder is used and persistence is
    /// disabled for this run.
    pub persistence_key: Option<String>,
    /// Snapshot period. Clamped to [`MIN_PERSISTENCE_INTERVAL`].
    pub persistence_interval: Duration,
    /// Capacity in bytes.
    pub capacity: usize,
    /// Near-eviction threshold, in percent of the capacity.
    pub near_eviction_percent: u8,
}

impl FsStoreConfig {
    /// Config rooted at the given base directory, with defaults for everything else.
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            persistence_key: None,
            persistence_interval: DEFAULT_PERSISTENCE_INTERVAL,
            capacity: 1024 * MB,
            near_eviction_percent: DEFAULT_NEAR_EVICTION_PERCENT,
        }
    }

    /// Name the data folder, enabling persistence.
    pub fn with_persistence_key(mut self, key: impl Into<String>) -> Self {
        self.persistence_key = Some(key.into());
        self
    }

    /// Set the snapshot period.
    pub fn with_persistence_interval(mut self, interval: Duration) -> Self {
        self.persistence_interval = interval.max(MIN_PERSISTENCE_INTERVAL);
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
    /// Recognized keys: `root-dir` (required), `persistence-key`, `persistence-interval` (ms,
    /// floor 1000, default 60000), `max-size` (MB).
    pub fn from_properties(props: &Properties) -> Result<Self> {
        let root_dir = props
            .get_raw("root-dir")
            .ok_or_else(|| Error::other(anyhow::anyhow!("missing required option \"root-dir\"")))?;
        let mut config = Self::new(root_dir);
        if let Some(key) = props.get_raw("persistence-key") {
            config.persistence_key = Some(key.to_string());
        }
        let interval = props.get_or::<u64>("persistence-interval", 60_000)?;
        config.persistence_interval = Duration::from_millis(interval).max(MIN_PERSISTENCE_INTERVAL);
        config.capacity = props.get_or::<usize>("max-size", 1024)? * MB;
        Ok(config)
    }
}

/// Index entry: where an entry's value lives on disk, and its accounted weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct FileRecord {
    pub id: u64,
    pub weight: usize,
}

impl StoreValue for FileRecord {}

pub(crate) fn filename(id: u64) -> String {
    format!("entry-{id:016x}")
}

/// File-system backend.
///
/// All index mutations and the admission read-modify-write run under one lock; entry bytes are
/// encoded before the lock is taken and decoded after it is released.
pub struct FsStoreProvider<K, V>
where
    K: StoreKey,
    V: StoreValue,
{
    flusher: Option<Flusher>,
    inner: Arc<FsInner<K>>,
    _value: PhantomData<V>,
}

struct FsInner<K>
where
    K: StoreKey,
{
    dir: PathBuf,
    persistent: bool,
    state: Mutex<FsState<K>>,
}

struct FsState<K> {
    index: HashMap<K, FileRecord>,
    gauge: SizeGauge,
    next_id: u64,
    /// Mutation counter; the snapshot task skips saving when it has not moved.
    dirty: u64,
    saved: u64,
}

impl<K> FsInner<K>
where
    K: StoreKey,
{
    fn save(&self) {
        let state = &mut *self.state.lock();
        if state.dirty == state.saved {
            return;
        }
        match snapshot::write(&self.dir, &state.index) {
            Ok(()) => {
                state.saved = state.dirty;
                tracing::debug!("[fs store]: snapshot saved, {} entries", state.index.len());
            }
            Err(e) => tracing::warn!("[fs store]: snapshot save failed: {e}"),
        }
    }

    fn read_value<V>(&self, id: u64) -> Option<V>
    where
        V: StoreValue,
    {
        let path = self.dir.join(filename(id));
        let buf = match std::fs::read(&path) {
            Ok(buf) => buf,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!("[fs store]: read {path:?} failed: {e}");
                return None;
            }
        };
        match StoreItem::<K, V>::decode(&buf) {
            Ok(item) => Some(item.value),
            Err(e) => {
                tracing::warn!("[fs store]: decode {path:?} failed: {e}");
                None
            }
        }
    }
}

impl<K, V> FsStoreProvider<K, V>
where
    K: StoreKey,
    V: StoreValue,
{
    /// Open a file-system backend with the given config.
    ///
    /// With persistence enabled the index snapshot is loaded immediately and a recurring save
    /// task is scheduled.
    pub fn open(config: FsStoreConfig) -> Result<Self> {
        let (dir, persistent) = match &config.persistence_key {
            Some(key) => (config.root_dir.join(format!("hoard-{key}")), true),
            None => (
                config.root_dir.join(format!("hoard-{:08x}", rand::random::<u32>())),
                false,
            ),
        };
        create_dir_all(&dir)?;

        let mut state = FsState {
            index: HashMap::new(),
            gauge: SizeGauge::new(config.capacity, config.near_eviction_percent),
            next_id: 0,
            dirty: 0,
            saved: 0,
        };

        if persistent {
            for (key, record) in snapshot::read::<K>(&dir)? {
                // an index entry must never point at a missing file
                if !dir.join(filename(record.id)).is_file() {
                    tracing::debug!("[fs store]: dropping index entry for missing {}", filename(record.id));
                    continue;
                }
                state.next_id = state.next_id.max(record.id + 1);
                state.gauge.charge(key.weight() + record.weight);
                state.index.insert(key, record);
            }
            tracing::debug!("[fs store]: recovered {} entries from {dir:?}", state.index.len());
        }

        let inner = Arc::new(FsInner {
            dir,
            persistent,
            state: Mutex::new(state),
        });

        let flusher = if persistent {
            let interval = config.persistence_interval.max(MIN_PERSISTENCE_INTERVAL);
            let target = inner.clone();
            Some(Flusher::spawn("hoard-fs-flusher", interval, move || target.save())?)
        } else {
            None
        };

        Ok(Self {
            flusher,
            inner,
            _value: PhantomData,
        })
    }

    /// The data folder backing this instance.
    pub fn dir(&self) -> &std::path::Path {
        &self.inner.dir
    }
}

impl<K, V> StorageProvider<K, V> for FsStoreProvider<K, V>
where
    K: StoreKey,
    V: StoreValue,
{
    fn add(&self, key: K, value: V, extend: bool) -> AddResult {
        let mut buf = Vec::new();
        // serialize before taking the lock
        if let Err(e) = StoreItem::encode(&key, &value, &mut buf) {
            tracing::warn!("[fs store]: encode failed: {e}");
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

        let id = state.next_id;
        let path = self.inner.dir.join(filename(id));
        if let Err(e) = std::fs::write(&path, &buf) {
            tracing::warn!("[fs store]: write {path:?} failed: {e}");
            let _ = std::fs::remove_file(&path);
            return AddResult::Failure;
        }
        state.next_id += 1;
        state.gauge.charge(incoming);
        state.index.insert(key, FileRecord { id, weight });
        state.dirty += 1;
        AddResult::stored(admission)
    }

    fn insert(&self, key: K, value: V, extend: bool) -> InsertResult {
        let mut buf = Vec::new();
        if let Err(e) = StoreItem::encode(&key, &value, &mut buf) {
            tracing::warn!("[fs store]: encode failed: {e}");
            return InsertResult::Failure;
        }
        let weight = value.weight();

        let state = &mut *self.inner.state.lock();
        let old = state.index.get(&key).copied();
        let incoming = match &old {
            Some(record) => weight as isize - record.weight as isize,
            None => (key.weight() + weight) as isize,
        };
        let admission = state.gauge.admit(incoming, extend);
        if admission == Admission::Reject {
            return InsertResult::NotEnoughSpace;
        }

        let id = state.next_id;
        let path = self.inner.dir.join(filename(id));
        if let Err(e) = std::fs::write(&path, &buf) {
            tracing::warn!("[fs store]: write {path:?} failed: {e}");
            let _ = std::fs::remove_file(&path);
            return InsertResult::Failure;
        }
        state.next_id += 1;
        state.gauge.apply(incoming);
        state.index.insert(key, FileRecord { id, weight });
        if let Some(record) = old {
            let old_path = self.inner.dir.join(filename(record.id));
            if let Err(e) = std::fs::remove_file(&old_path) {
                tracing::warn!("[fs store]: remove replaced {old_path:?} failed: {e}");
            }
        }
        state.dirty += 1;
        InsertResult::stored(old.is_some(), admission)
    }

    fn get(&self, key: &K) -> Option<V> {
        let id = self.inner.state.lock().index.get(key)?.id;
        // deserialize outside the lock
        self.inner.read_value(id)
    }

    fn item_size(&self, key: &K) -> usize {
        self.inner
            .state
            .lock()
            .index
            .get(key)
            .map(|record| record.weight)
            .unwrap_or(0)
    }

    fn contains(&self, key: &K) -> bool {
        self.inner.state.lock().index.contains_key(key)
    }

    fn remove(&self, key: &K) -> Option<V> {
        let record = {
            let state = &mut *self.inner.state.lock();
            let record = state.index.remove(key)?;
            state.gauge.credit(key.weight() + record.weight);
            state.dirty += 1;
            record
        };
        let value = self.inner.read_value(record.id);
        let path = self.inner.dir.join(filename(record.id));
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("[fs store]: remove {path:?} failed: {e}");
            }
        }
        value
    }

    fn clear(&self) {
        let state = &mut *self.inner.state.lock();
        for record in state.index.values() {
            let path = self.inner.dir.join(filename(record.id));
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("[fs store]: remove {path:?} failed: {e}");
                }
            }
        }
        state.index.clear();
        state.gauge.reset();
        state.dirty += 1;
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

impl<K, V> Drop for FsStoreProvider<K, V>
where
    K: StoreKey,
    V: StoreValue,
{
    fn drop(&mut self) {
        // stop the snapshot task first; an in-progress save is waited for
        self.flusher.take();
        if self.inner.persistent {
            self.inner.save();
        } else if let Err(e) = std::fs::remove_dir_all(&self.inner.dir) {
            tracing::warn!("[fs store]: remove data folder {:?} failed: {e}", self.inner.dir);
        }
    }
}
