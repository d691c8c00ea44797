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

use hoard_common::code::{StoreKey, StoreValue};

use crate::capacity::Admission;

/// Result of [`StorageProvider::add`].
///
/// Capacity exhaustion and key conflicts are expected, recoverable outcomes and are surfaced
/// here as variants, never as errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddResult {
    /// The entry was stored.
    Success,
    /// Stored, but usage crossed the near-eviction threshold: run eviction soon.
    SuccessNearEviction,
    /// The key is already present; `add` never overwrites.
    KeyExists,
    /// Capacity exhausted.
    NotEnoughSpace,
    /// The backing medium failed; details are logged at the backend boundary.
    Failure,
}

impl AddResult {
    /// Whether the entry was stored.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success | Self::SuccessNearEviction)
    }

    pub(crate) fn stored(admission: Admission) -> Self {
        match admission {
            Admission::AdmitNearEviction => Self::SuccessNearEviction,
            _ => Self::Success,
        }
    }
}

/// Result of [`StorageProvider::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertResult {
    /// The key was new and the entry was stored.
    Success,
    /// An existing entry was replaced.
    SuccessOverwrite,
    /// Stored a new entry, crossing the near-eviction threshold.
    SuccessNearEviction,
    /// Replaced an existing entry, crossing the near-eviction threshold.
    SuccessOverwriteNearEviction,
    /// Capacity exhausted.
    NotEnoughSpace,
    /// The backing medium failed; details are logged at the backend boundary.
    Failure,
}

impl InsertResult {
    /// Whether the entry was stored.
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::NotEnoughSpace | Self::Failure)
    }

    /// Whether an existing entry was replaced.
    pub fn is_overwrite(&self) -> bool {
        matches!(self, Self::SuccessOverwrite | Self::SuccessOverwriteNearEviction)
    }

    pub(crate) fn stored(overwrite: bool, admission: Admission) -> Self {
        match (overwrite, admission) {
            (false, Admission::AdmitNearEviction) => Self::SuccessNearEviction,
            (false, _) => Self::Success,
            (true, Admission::AdmitNearEviction) => Self::SuccessOverwriteNearEviction,
            (true, _) => Self::SuccessOverwrite,
        }
    }
}

/// The uniform key/value store contract implemented by every backend.
///
/// Operations on one provider instance are linearized by its single internal lock; operations on
/// different instances are unordered. None of the operations panic on expected runtime
/// conditions: medium failures are logged and translated into result variants or absent values.
pub trait StorageProvider<K, V>: Send + Sync + 'static
where
    K: StoreKey,
    V: StoreValue,
{
    /// Store a new entry. Fails with [`AddResult::KeyExists`] if the key is present.
    ///
    /// `extend` permits temporary overflow past the capacity, for callers that evict afterwards.
    fn add(&self, key: K, value: V, extend: bool) -> AddResult;

    /// Store an entry, replacing any existing one under the same key.
    fn insert(&self, key: K, value: V, extend: bool) -> InsertResult;

    /// Fetch the value stored under `key`.
    ///
    /// Missing keys and undeserializable entries both yield `None`; the latter is logged.
    fn get(&self, key: &K) -> Option<V>;

    /// In-memory byte footprint of the value stored under `key`, `0` if absent or unreadable.
    fn item_size(&self, key: &K) -> usize;

    /// Whether `key` is present. Index lookup only, no deserialization.
    fn contains(&self, key: &K) -> bool;

    /// Remove and return the entry under `key`. Removing an absent key is a no-op.
    fn remove(&self, key: &K) -> Option<V>;

    /// Destroy all entries and reset size accounting to zero.
    fn clear(&self);

    /// Number of live entries.
    fn len(&self) -> usize;

    /// Whether the provider holds no entries.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Eager snapshot of the live keys.
    fn keys(&self) -> Vec<K>;

    /// Bytes consumed by live entries, including key overhead.
    fn usage(&self) -> usize;

    /// Configured capacity in bytes.
    fn capacity(&self) -> usize;

    /// Sticky near-eviction signal for the external eviction-policy collaborator.
    fn near_eviction_reported(&self) -> bool;

    /// Acknowledge the near-eviction signal.
    fn reset_near_eviction(&self);

    /// Lazy entry sequence: values are deserialized one at a time as the iterator advances.
    fn entries(&self) -> Entries<'_, K, V>
    where
        Self: Sized,
    {
        Entries::new(self.keys(), self)
    }
}

/// Lazy entry iterator over a key snapshot.
///
/// Holds no lock between advances; an entry removed concurrently is skipped, as is any entry
/// that fails to deserialize.
pub struct Entries<'a, K, V>
where
    K: StoreKey,
    V: StoreValue,
{
    keys: std::vec::IntoIter<K>,
    provider: &'a dyn StorageProvider<K, V>,
}

impl<'a, K, V> Entries<'a, K, V>
where
    K: StoreKey,
    V: StoreValue,
{
    /// Create an iterator over the given key snapshot.
    pub fn new(keys: Vec<K>, provider: &'a dyn StorageProvider<K, V>) -> Self {
        Self {
            keys: keys.into_iter(),
            provider,
        }
    }
}

impl<K, V> Iterator for Entries<'_, K, V>
where
    K: StoreKey,
    V: StoreValue,
{
    type Item = (K, V);

    fn next(&mut self) -> Option<Self::Item> {
        for key in self.keys.by_ref() {
            if let Some(value) = self.provider.get(&key) {
                return Some((key, value));
            }
        }
        None
    }
}
