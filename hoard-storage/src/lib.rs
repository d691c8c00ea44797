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

//! Pluggable storage engine for the hoard distributed cache.
//!
//! One uniform key/value contract ([`provider::StorageProvider`]) with three interchangeable
//! backends sharing a single capacity-accounting and eviction-signaling protocol:
//!
//! - [`heap::HeapStoreProvider`] keeps native values in a hash table;
//! - [`fs::FsStoreProvider`] keeps values as files and snapshots its index for warm restarts;
//! - [`mmf::MmfStoreProvider`] packs serialized entries into arenas carved out of memory-mapped
//!   views, with [`mmf::InMemoryStoreProvider`] as its volatile specialization.

/// Size accounting and admission control.
pub mod capacity;
/// Storage engine error types.
pub mod error;
mod flusher;
pub mod fs;
/// Heap backend.
pub mod heap;
pub mod mmf;
/// The storage provider contract.
pub mod provider;
/// The binary entry envelope.
pub mod serde;

/// Re-exports of the crate's public surface.
pub mod prelude;

/// One mebibyte.
pub const MB: usize = 1024 * 1024;
