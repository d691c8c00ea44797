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

//! Index snapshot codec.
//!
//! On-disk framing, little-endian: `i32 count`, then per entry either `i32 len` followed by
//! `len` bytes of an encoded [`StoreItem`], or the sentinel `-1` for an entry that failed to
//! serialize and was skipped. The framing is part of the compatibility surface and must not
//! change.

use std::path::Path;

use bytes::{Buf, BufMut};
use hashbrown::HashMap;
use hoard_common::code::StoreKey;

use super::FileRecord;
use crate::{error::Result, serde::StoreItem};

pub(super) const SNAPSHOT_FILE: &str = "index.snapshot";

const SKIPPED: i32 = -1;

pub(super) fn write<K>(dir: &Path, index: &HashMap<K, FileRecord>) -> Result<()>
where
    K: StoreKey,
{
    let mut buf = Vec::new();
    buf.put_i32_le(index.len() as i32);

    for (key, record) in index {
        let mut frame = Vec::new();
        match StoreItem::encode(key, record, &mut frame) {
            Ok(_) => {
                buf.put_i32_le(frame.len() as i32);
                buf.extend_from_slice(&frame);
            }
            Err(e) => {
                tracing::warn!("[fs store]: skipping unserializable index entry: {e}");
                buf.put_i32_le(SKIPPED);
            }
        }
    }

    let tmp = dir.join(format!("{SNAPSHOT_FILE}.tmp"));
    std::fs::write(&tmp, &buf)?;
    std::fs::rename(&tmp, dir.join(SNAPSHOT_FILE))?;
    Ok(())
}

/// Read the snapshot, tolerating skipped and damaged entries.
///
/// A missing snapshot yields an empty index. Corruption is logged and truncates the reload at
/// the damaged frame; everything decoded up to that point is kept.
pub(super) fn read<K>(dir: &Path) -> Result<Vec<(K, FileRecord)>>
where
    K: StoreKey,
{
    let path = dir.join(SNAPSHOT_FILE);
    let buf = match std::fs::read(&path) {
        Ok(buf) => buf,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
        Err(e) => return Err(e.into()),
    };

    let mut buf = &buf[..];
    if buf.remaining() < 4 {
        tracing::warn!("[fs store]: snapshot {path:?} is truncated, ignoring");
        return Ok(vec![]);
    }
    let count = buf.get_i32_le();

    let mut entries = Vec::new();
    for _ in 0..count {
        if buf.remaining() < 4 {
            tracing::warn!("[fs store]: snapshot {path:?} ends mid-frame, keeping {} entries", entries.len());
            break;
        }
        let len = buf.get_i32_le();
        if len == SKIPPED {
            continue;
        }
        if len < 0 || len as usize > buf.remaining() {
            tracing::warn!("[fs store]: snapshot {path:?} has a damaged frame length {len}, keeping {} entries", entries.len());
            break;
        }
        let frame = &buf[..len as usize];
        buf.advance(len as usize);
        match StoreItem::<K, FileRecord>::decode(frame) {
            Ok(item) => entries.push((item.key, item.value)),
            Err(e) => tracing::warn!("[fs store]: skipping undecodable snapshot entry: {e}"),
        }
    }

    Ok(entries)
}
