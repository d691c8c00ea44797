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

use std::hash::Hasher;

use bytes::{Buf, BufMut};
use hoard_common::code::{StoreKey, StoreValue};
use twox_hash::XxHash64;

use crate::error::{Error, Result};

#[derive(Debug)]
pub struct Checksummer;

impl Checksummer {
    /// XxHash64 checksum over the given bytes.
    pub fn checksum64(buf: &[u8]) -> u64 {
        let mut hasher = XxHash64::with_seed(0);
        hasher.write(buf);
        hasher.finish()
    }
}

/// Byte lengths of an encoded entry.
#[derive(Debug)]
pub struct KvInfo {
    /// Encoded key length.
    pub key_len: usize,
    /// Encoded value length.
    pub value_len: usize,
}

/// Serialization envelope pairing a key with its value.
///
/// A `StoreItem` is a pure transformation unit: it exists only while an entry is turned into
/// bytes or back, and is never retained by a backend. Write order is key, then value; read order
/// matches.
#[derive(Debug)]
pub struct StoreItem<K, V> {
    /// The entry key.
    pub key: K,
    /// The entry value.
    pub value: V,
}

impl<K, V> StoreItem<K, V>
where
    K: StoreKey,
    V: StoreValue,
{
    /// Encode the pair into `buf`.
    ///
    /// Layout: `| u32 key len (LE) | key | value |`.
    pub fn encode(key: &K, value: &V, buf: &mut Vec<u8>) -> Result<KvInfo> {
        let base = buf.len();

        // reserve the key length, backfilled below
        buf.put_u32_le(0);
        bincode::serialize_into(&mut *buf, key)?;
        let key_len = buf.len() - base - 4;
        (&mut buf[base..base + 4]).put_u32_le(key_len as u32);

        let cursor = buf.len();
        bincode::serialize_into(&mut *buf, value)?;
        let value_len = buf.len() - cursor;

        Ok(KvInfo { key_len, value_len })
    }

    /// Decode a pair from an encoded buffer.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let (key, remainder) = Self::decode_key(buf)?;
        let value = bincode::deserialize(remainder)?;
        Ok(Self { key, value })
    }

    /// Decode only the key, returning it with the undecoded value bytes.
    pub fn decode_key(mut buf: &[u8]) -> Result<(K, &[u8])> {
        if buf.remaining() < 4 {
            return Err(Error::other(anyhow::anyhow!(
                "truncated store item: {} bytes",
                buf.remaining()
            )));
        }
        let key_len = buf.get_u32_le() as usize;
        if key_len > buf.remaining() {
            return Err(Error::other(anyhow::anyhow!(
                "truncated store item: key len {} > remaining {}",
                key_len,
                buf.remaining()
            )));
        }
        let key = bincode::deserialize(&buf[..key_len])?;
        Ok((key, &buf[key_len..]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_item_roundtrip() {
        let key = "answer".to_string();
        let value = vec![42u8; 100];

        let mut buf = Vec::new();
        let info = StoreItem::encode(&key, &value, &mut buf).unwrap();
        assert_eq!(buf.len(), 4 + info.key_len + info.value_len);

        let item: StoreItem<String, Vec<u8>> = StoreItem::decode(&buf).unwrap();
        assert_eq!(item.key, key);
        assert_eq!(item.value, value);
    }

    #[test]
    fn test_decode_damaged_buffer() {
        let key = "k".to_string();
        let value = vec![7u8; 16];

        let mut buf = Vec::new();
        StoreItem::encode(&key, &value, &mut buf).unwrap();

        // truncated
        assert!(StoreItem::<String, Vec<u8>>::decode(&buf[..3]).is_err());
        // key length pointing past the end
        let mut bad = buf.clone();
        bad[0] = 0xff;
        bad[1] = 0xff;
        assert!(StoreItem::<String, Vec<u8>>::decode(&bad).is_err());
    }

    #[test]
    fn test_checksum_detects_flip() {
        let buf = vec![1u8, 2, 3, 4];
        let checksum = Checksummer::checksum64(&buf);
        let mut flipped = buf.clone();
        flipped[2] ^= 0x80;
        assert_ne!(checksum, Checksummer::checksum64(&flipped));
    }
}
