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

use std::fmt::Debug;

use serde::{de::DeserializeOwned, Serialize};

/// Key type storable by a storage provider.
///
/// `weight` reports the key's in-memory footprint in bytes. Capacity accounting charges it
/// alongside the value weight for every live entry.
pub trait StoreKey:
    Send + Sync + 'static + std::hash::Hash + Eq + PartialEq + Clone + Debug + Serialize + DeserializeOwned
{
    /// In-memory footprint in bytes.
    fn weight(&self) -> usize {
        std::mem::size_of::<Self>()
    }
}

/// Value type storable by a storage provider.
///
/// Values must be cloneable because `get` hands out an owned copy while the entry stays live in
/// the backend.
pub trait StoreValue: Send + Sync + 'static + Clone + Debug + Serialize + DeserializeOwned {
    /// In-memory footprint in bytes.
    fn weight(&self) -> usize {
        std::mem::size_of::<Self>()
    }
}

macro_rules! impl_fixed_weight {
    ($( $type:ty, )*) => {
        $(
            impl StoreKey for $type {}
            impl StoreValue for $type {}
        )*
    };
}

impl_fixed_weight! {
    u8, u16, u32, u64, usize,
    i8, i16, i32, i64, isize,
}

impl StoreKey for String {
    fn weight(&self) -> usize {
        self.len()
    }
}

impl StoreValue for String {
    fn weight(&self) -> usize {
        self.len()
    }
}

impl StoreKey for Vec<u8> {
    fn weight(&self) -> usize {
        self.len()
    }
}

impl StoreValue for Vec<u8> {
    fn weight(&self) -> usize {
        self.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weights() {
        assert_eq!(StoreKey::weight(&42u64), 8);
        assert_eq!(StoreKey::weight(&"k1".to_string()), 2);
        assert_eq!(StoreValue::weight(&vec![0u8; 500]), 500);
    }
}
