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

/// Storage engine error.
///
/// Errors below the backend boundary are absorbed there and translated into result variants or
/// absent values; `Error` surfaces only from `open` paths and internal plumbing.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error from the backing medium.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Entry codec error.
    #[error("serde error: {0}")]
    Serde(#[from] bincode::Error),
    /// Payload checksum mismatch.
    #[error("checksum mismatch, expected: {expected}, get: {get}")]
    ChecksumMismatch {
        /// The recorded checksum.
        expected: u64,
        /// The recomputed checksum.
        get: u64,
    },
    /// Frame magic mismatch.
    #[error("magic mismatch, expected: {expected}, get: {get}")]
    MagicMismatch {
        /// The expected magic.
        expected: u32,
        /// The magic found on the medium.
        get: u32,
    },
    /// The entry can never fit the medium.
    #[error("entry too large: {len} > {capacity}")]
    EntryTooLarge {
        /// Encoded entry length.
        len: usize,
        /// Largest slot the medium offers.
        capacity: usize,
    },
    /// Other error.
    #[error("other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Wrap an opaque error.
    pub fn other(e: impl Into<anyhow::Error>) -> Self {
        Self::Other(e.into())
    }
}

/// Storage engine result.
pub type Result<T> = std::result::Result<T, Error>;
