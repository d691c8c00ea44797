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

pub use hoard_common::{
    code::{StoreKey, StoreValue},
    properties::Properties,
};

pub use crate::{
    capacity::{Admission, SizeGauge, DEFAULT_NEAR_EVICTION_PERCENT},
    error::{Error, Result},
    fs::{FsStoreConfig, FsStoreProvider},
    heap::{HeapStoreConfig, HeapStoreProvider},
    mmf::{InMemoryStoreConfig, InMemoryStoreProvider, MmfStoreConfig, MmfStoreProvider},
    provider::{AddResult, Entries, InsertResult, StorageProvider},
    serde::{Checksummer, KvInfo, StoreItem},
    MB,
};
