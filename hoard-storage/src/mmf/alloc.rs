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

//! Arena allocator over a set of memory-mapped views.
//!
//! Each view is a contiguous chain of arenas, occupied or free, described by 20-byte headers on
//! the mapped memory itself. The chain invariant — every header's `capacity` hops exactly to the
//! next header — is what makes a file-backed instance recoverable: startup walks the chain,
//! rebuilds the free lists from free arenas and the index from occupied ones, and converts
//! anything unreadable into free space.
//!
//! Callers address arenas through [`ArenaHandle`]s resolved by a slot table; handles carry a
//! generation so a stale handle can never alias a recycled slot.

use std::fs::File;

use bytes::{Buf, BufMut};
use hoard_common::bits;

use super::view::View;
use crate::{
    error::{Error, Result},
    serde::Checksummer,
};

pub(super) const HEADER_LEN: usize = 20;
const ARENA_ALIGN: usize = 8;
/// Smallest slot worth splitting off; a shorter tail is absorbed into the allocation.
const MIN_ARENA: usize = HEADER_LEN + ARENA_ALIGN;

const ARENA_MAGIC: u32 = 0x9b31_7400;
const ARENA_MAGIC_MASK: u32 = 0xffff_ff00;

const STATE_OCCUPIED: u8 = 1;
const STATE_FREE: u8 = 2;

/// On-media arena header.
///
/// Layout: `| u32 magic+state | u32 capacity | u32 len | u64 checksum |`. `capacity` covers the
/// header itself; `len` and `checksum` describe the payload and are meaningful for occupied
/// arenas only.
#[derive(Debug, PartialEq, Eq)]
struct ArenaHeader {
    state: u8,
    capacity: u32,
    len: u32,
    checksum: u64,
}

impl ArenaHeader {
    fn write(&self, mut buf: impl BufMut) {
        buf.put_u32(ARENA_MAGIC | self.state as u32);
        buf.put_u32(self.capacity);
        buf.put_u32(self.len);
        buf.put_u64(self.checksum);
    }

    fn read(mut buf: impl Buf) -> Result<Self> {
        let v = buf.get_u32();
        let magic = v & ARENA_MAGIC_MASK;
        if magic != ARENA_MAGIC {
            return Err(Error::MagicMismatch {
                expected: ARENA_MAGIC,
                get: magic,
            });
        }
        let state = v as u8;
        if state != STATE_OCCUPIED && state != STATE_FREE {
            return Err(Error::other(anyhow::anyhow!("invalid arena state: {state}")));
        }
        let capacity = buf.get_u32();
        let len = buf.get_u32();
        let checksum = buf.get_u64();
        Ok(Self {
            state,
            capacity,
            len,
            checksum,
        })
    }
}

/// Handle to a live arena.
///
/// The index stores handles, never byte ranges; the slot table owns the mapping to ranges, so
/// relocation rewrites one table cell instead of chasing back-references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ArenaHandle {
    slot: u32,
    generation: u32,
}

/// Byte range of one arena inside a view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ArenaRef {
    pub view: u32,
    pub offset: u32,
    pub capacity: u32,
}

#[derive(Debug, Default)]
struct ArenaTable {
    slots: Vec<(u32, Option<ArenaRef>)>,
    vacant: Vec<u32>,
}

impl ArenaTable {
    fn insert(&mut self, aref: ArenaRef) -> ArenaHandle {
        match self.vacant.pop() {
            Some(slot) => {
                let cell = &mut self.slots[slot as usize];
                debug_assert!(cell.1.is_none());
                cell.1 = Some(aref);
                ArenaHandle {
                    slot,
                    generation: cell.0,
                }
            }
            None => {
                self.slots.push((0, Some(aref)));
                ArenaHandle {
                    slot: (self.slots.len() - 1) as u32,
                    generation: 0,
                }
            }
        }
    }

    fn get(&self, handle: ArenaHandle) -> Option<ArenaRef> {
        self.slots
            .get(handle.slot as usize)
            .filter(|(generation, _)| *generation == handle.generation)
            .and_then(|(_, aref)| *aref)
    }

    fn remove(&mut self, handle: ArenaHandle) -> Option<ArenaRef> {
        let cell = self.slots.get_mut(handle.slot as usize)?;
        if cell.0 != handle.generation {
            return None;
        }
        let aref = cell.1.take()?;
        cell.0 = cell.0.wrapping_add(1);
        self.vacant.push(handle.slot);
        Some(aref)
    }

    fn live(&self) -> impl Iterator<Item = ArenaRef> + '_ {
        self.slots.iter().filter_map(|(_, aref)| *aref)
    }
}

#[derive(Debug)]
struct ViewSpace {
    view: View,
    /// Free byte ranges `(offset, len)`, sorted by offset, adjacent ranges coalesced.
    free: Vec<(u32, u32)>,
    dirty: bool,
}

fn write_free_header(view: &mut View, offset: u32, capacity: u32) {
    ArenaHeader {
        state: STATE_FREE,
        capacity,
        len: 0,
        checksum: 0,
    }
    .write(view.slice_mut(offset as usize, HEADER_LEN));
}

impl ViewSpace {
    fn formatted(mut view: View) -> Self {
        let capacity = view.size() as u32;
        write_free_header(&mut view, 0, capacity);
        Self {
            view,
            free: vec![(0, capacity)],
            dirty: true,
        }
    }

    /// First-fit allocation of `total` bytes. Returns the granted `(offset, capacity)`; the
    /// grant absorbs a tail too short to carry its own header.
    fn allocate(&mut self, total: u32) -> Option<(u32, u32)> {
        let pos = self.free.iter().position(|(_, len)| *len >= total)?;
        let (offset, len) = self.free[pos];
        let remainder = len - total;
        self.dirty = true;
        if remainder as usize >= MIN_ARENA {
            self.free[pos] = (offset + total, remainder);
            write_free_header(&mut self.view, offset + total, remainder);
            Some((offset, total))
        } else {
            self.free.remove(pos);
            Some((offset, len))
        }
    }

    /// Return a range to the free list, coalescing with adjacent free neighbors and rewriting
    /// the merged range's header so the on-media chain stays walkable.
    fn release(&mut self, offset: u32, capacity: u32) {
        let mut start = offset;
        let mut len = capacity;

        let pos = self.free.partition_point(|(o, _)| *o < offset);
        if pos < self.free.len() && offset + capacity == self.free[pos].0 {
            len += self.free[pos].1;
            self.free.remove(pos);
        }
        let mut insert_at = pos;
        if pos > 0 {
            let (left_offset, left_len) = self.free[pos - 1];
            if left_offset + left_len == offset {
                start = left_offset;
                len += left_len;
                self.free.remove(pos - 1);
                insert_at = pos - 1;
            }
        }
        self.free.insert(insert_at, (start, len));
        write_free_header(&mut self.view, start, len);
        self.dirty = true;
    }

    #[cfg(test)]
    fn free_bytes(&self) -> usize {
        self.free.iter().map(|(_, len)| *len as usize).sum()
    }

    /// Walk the arena chain of a recovered view. Occupied arenas with a valid checksum are
    /// returned with their payload; everything else becomes free space.
    fn recover(view: View, view_id: u32) -> (Self, Vec<(ArenaRef, Vec<u8>)>) {
        let size = view.size() as u32;
        let mut space = Self {
            view,
            free: Vec::new(),
            dirty: false,
        };
        let mut occupied = Vec::new();
        let mut raw_free: Vec<(u32, u32)> = Vec::new();
        let mut offset = 0u32;

        while offset as usize + HEADER_LEN <= size as usize {
            let header = match ArenaHeader::read(space.view.slice(offset as usize, HEADER_LEN)) {
                Ok(header) => header,
                Err(e) => {
                    if offset != 0 || !matches!(e, Error::MagicMismatch { get: 0, .. }) {
                        tracing::warn!(
                            "[arena allocator]: unreadable arena header in view {view_id} at {offset}: {e}, freeing the tail"
                        );
                    }
                    raw_free.push((offset, size - offset));
                    break;
                }
            };
            let capacity = header.capacity;
            if (capacity as usize) < HEADER_LEN || offset + capacity > size {
                tracing::warn!(
                    "[arena allocator]: implausible arena capacity {capacity} in view {view_id} at {offset}, freeing the tail"
                );
                raw_free.push((offset, size - offset));
                break;
            }
            match header.state {
                STATE_FREE => raw_free.push((offset, capacity)),
                _ => {
                    let len = header.len as usize;
                    if HEADER_LEN + len > capacity as usize {
                        tracing::warn!(
                            "[arena allocator]: arena payload overruns its slot in view {view_id} at {offset}, freeing it"
                        );
                        raw_free.push((offset, capacity));
                    } else {
                        let payload = space.view.slice(offset as usize + HEADER_LEN, len);
                        let checksum = Checksummer::checksum64(payload);
                        if checksum != header.checksum {
                            tracing::warn!(
                                "[arena allocator]: checksum mismatch in view {view_id} at {offset}, freeing the arena"
                            );
                            raw_free.push((offset, capacity));
                        } else {
                            occupied.push((
                                ArenaRef {
                                    view: view_id,
                                    offset,
                                    capacity,
                                },
                                payload.to_vec(),
                            ));
                        }
                    }
                }
            }
            offset += capacity;
        }

        // coalesce adjacent free runs and rewrite their headers
        for (offset, len) in raw_free {
            match space.free.last_mut() {
                Some((last_offset, last_len)) if *last_offset + *last_len == offset => {
                    *last_len += len;
                    let (o, l) = (*last_offset, *last_len);
                    write_free_header(&mut space.view, o, l);
                    space.dirty = true;
                }
                _ => {
                    write_free_header(&mut space.view, offset, len);
                    space.free.push((offset, len));
                    space.dirty = true;
                }
            }
        }

        (space, occupied)
    }
}

#[derive(Debug)]
enum Backing {
    Anon,
    File(File),
}

/// Allocator state for one backend instance: the view set, the free lists, and the slot table.
///
/// Mutated only under the owning provider's lock.
#[derive(Debug)]
pub(super) struct ArenaAllocator {
    views: Vec<ViewSpace>,
    view_size: usize,
    max_views: usize,
    backing: Backing,
    table: ArenaTable,
}

impl ArenaAllocator {
    pub fn open_anon(view_size: usize, initial_views: usize, max_views: usize) -> Result<Self> {
        let views = (0..initial_views)
            .map(|_| Ok(ViewSpace::formatted(View::open_anon(view_size)?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            views,
            view_size,
            max_views: max_views.max(initial_views),
            backing: Backing::Anon,
            table: ArenaTable::default(),
        })
    }

    /// Open a file-backed allocator, rebuilding state from any views already on disk.
    ///
    /// Returns the occupied arenas' payloads so the provider can rebuild its index.
    pub fn open_file(
        path: &std::path::Path,
        view_size: usize,
        initial_views: usize,
        max_views: usize,
    ) -> Result<(Self, Vec<(ArenaHandle, Vec<u8>)>)> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let existing = file.metadata()?.len() as usize / view_size;

        let mut allocator = Self {
            views: Vec::new(),
            view_size,
            max_views: max_views.max(initial_views).max(existing),
            backing: Backing::File(file),
            table: ArenaTable::default(),
        };
        let Backing::File(file) = &allocator.backing else { unreachable!() };

        let mut recovered = Vec::new();
        if existing == 0 {
            file.set_len((initial_views * view_size) as u64)?;
            for i in 0..initial_views {
                let view = View::open_file(file, (i * view_size) as u64, view_size)?;
                allocator.views.push(ViewSpace::formatted(view));
            }
        } else {
            for i in 0..existing {
                let view = View::open_file(file, (i * view_size) as u64, view_size)?;
                let (space, occupied) = ViewSpace::recover(view, i as u32);
                allocator.views.push(space);
                recovered.extend(occupied);
            }
            tracing::debug!(
                "[arena allocator]: recovered {} views with {} occupied arenas from {path:?}",
                existing,
                recovered.len(),
            );
        }

        let recovered = recovered
            .into_iter()
            .map(|(aref, payload)| (allocator.table.insert(aref), payload))
            .collect();
        Ok((allocator, recovered))
    }

    /// Allocate an arena big enough for a `payload_len`-byte payload.
    ///
    /// `Ok(None)` means the allocator is exhausted within its budget — the caller translates it
    /// to a not-enough-space result.
    pub fn allocate(&mut self, payload_len: usize) -> Result<Option<ArenaHandle>> {
        let total = bits::align_up(ARENA_ALIGN, HEADER_LEN + payload_len);
        if total > self.view_size {
            return Err(Error::EntryTooLarge {
                len: total,
                capacity: self.view_size,
            });
        }
        let total = total as u32;

        let mut found = None;
        for (i, space) in self.views.iter_mut().enumerate() {
            if let Some((offset, capacity)) = space.allocate(total) {
                found = Some(ArenaRef {
                    view: i as u32,
                    offset,
                    capacity,
                });
                break;
            }
        }
        if found.is_none() && self.views.len() < self.max_views {
            self.grow()?;
            let i = self.views.len() - 1;
            found = self.views[i].allocate(total).map(|(offset, capacity)| ArenaRef {
                view: i as u32,
                offset,
                capacity,
            });
        }
        Ok(found.map(|aref| self.table.insert(aref)))
    }

    fn grow(&mut self) -> Result<()> {
        let view = match &self.backing {
            Backing::Anon => View::open_anon(self.view_size)?,
            Backing::File(file) => {
                let offset = (self.views.len() * self.view_size) as u64;
                file.set_len(offset + self.view_size as u64)?;
                View::open_file(file, offset, self.view_size)?
            }
        };
        self.views.push(ViewSpace::formatted(view));
        tracing::debug!("[arena allocator]: grown to {} views", self.views.len());
        Ok(())
    }

    /// Whether the arena behind `handle` can hold a `payload_len`-byte payload in place.
    pub fn fits(&self, handle: ArenaHandle, payload_len: usize) -> bool {
        self.table
            .get(handle)
            .map(|aref| HEADER_LEN + payload_len <= aref.capacity as usize)
            .unwrap_or(false)
    }

    /// Write an arena's header and payload.
    pub fn write(&mut self, handle: ArenaHandle, payload: &[u8]) {
        let aref = self.table.get(handle).unwrap();
        assert!(
            HEADER_LEN + payload.len() <= aref.capacity as usize,
            "payload ({}) must fit the arena capacity ({})",
            payload.len(),
            aref.capacity,
        );
        let header = ArenaHeader {
            state: STATE_OCCUPIED,
            capacity: aref.capacity,
            len: payload.len() as u32,
            checksum: Checksummer::checksum64(payload),
        };
        let space = &mut self.views[aref.view as usize];
        header.write(space.view.slice_mut(aref.offset as usize, HEADER_LEN));
        space
            .view
            .slice_mut(aref.offset as usize + HEADER_LEN, payload.len())
            .copy_from_slice(payload);
        space.dirty = true;
    }

    /// Read an arena's payload.
    pub fn read(&self, handle: ArenaHandle) -> Result<Vec<u8>> {
        let aref = self
            .table
            .get(handle)
            .ok_or_else(|| Error::other(anyhow::anyhow!("stale arena handle")))?;
        let space = &self.views[aref.view as usize];
        let header = ArenaHeader::read(space.view.slice(aref.offset as usize, HEADER_LEN))?;
        if header.state != STATE_OCCUPIED || HEADER_LEN + header.len as usize > aref.capacity as usize {
            return Err(Error::other(anyhow::anyhow!("arena header does not match its slot")));
        }
        let payload = space
            .view
            .slice(aref.offset as usize + HEADER_LEN, header.len as usize);
        let checksum = Checksummer::checksum64(payload);
        if checksum != header.checksum {
            return Err(Error::ChecksumMismatch {
                expected: header.checksum,
                get: checksum,
            });
        }
        Ok(payload.to_vec())
    }

    /// Retire an arena: drop its handle and return its bytes to the free list.
    pub fn release(&mut self, handle: ArenaHandle) {
        if let Some(aref) = self.table.remove(handle) {
            self.views[aref.view as usize].release(aref.offset, aref.capacity);
        }
    }

    /// Reformat every view to one big free arena and drop all handles.
    pub fn clear(&mut self) {
        for space in &mut self.views {
            let capacity = space.view.size() as u32;
            write_free_header(&mut space.view, 0, capacity);
            space.free = vec![(0, capacity)];
            space.dirty = true;
        }
        self.table = ArenaTable::default();
    }

    /// Commit dirty views (or all of them) to the backing file. No-op for anonymous backing.
    pub fn flush(&mut self, all: bool) -> Result<()> {
        if matches!(self.backing, Backing::Anon) {
            return Ok(());
        }
        for space in &mut self.views {
            if space.dirty || all {
                space.view.flush()?;
                space.dirty = false;
            }
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn resolve(&self, handle: ArenaHandle) -> Option<ArenaRef> {
        self.table.get(handle)
    }

    #[cfg(test)]
    pub fn free_bytes(&self) -> usize {
        self.views.iter().map(ViewSpace::free_bytes).sum()
    }

    #[cfg(test)]
    pub fn live_arenas(&self) -> Vec<ArenaRef> {
        self.table.live().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_fit_and_reuse() {
        let mut alloc = ArenaAllocator::open_anon(1024, 1, 1).unwrap();

        let a = alloc.allocate(100).unwrap().unwrap();
        let b = alloc.allocate(100).unwrap().unwrap();
        let a_ref = alloc.resolve(a).unwrap();
        assert_eq!(a_ref.offset, 0);

        alloc.release(a);
        // stale handle resolves to nothing
        assert!(alloc.resolve(a).is_none());

        // the freed range is handed out again, first fit
        let c = alloc.allocate(100).unwrap().unwrap();
        assert_eq!(alloc.resolve(c).unwrap().offset, 0);
        assert_ne!(alloc.resolve(b).unwrap().offset, 0);
    }

    #[test]
    fn test_coalescing() {
        let mut alloc = ArenaAllocator::open_anon(1024, 1, 1).unwrap();
        let a = alloc.allocate(100).unwrap().unwrap();
        let b = alloc.allocate(100).unwrap().unwrap();
        let c = alloc.allocate(100).unwrap().unwrap();

        // freeing in arbitrary order merges back into one run covering the view
        alloc.release(b);
        alloc.release(a);
        alloc.release(c);
        assert_eq!(alloc.views[0].free, vec![(0, 1024)]);
        assert_eq!(alloc.free_bytes(), 1024);
    }

    #[test]
    fn test_view_growth_within_budget() {
        let mut alloc = ArenaAllocator::open_anon(256, 1, 2).unwrap();
        let payload = 256 - HEADER_LEN - 64;

        assert!(alloc.allocate(payload).unwrap().is_some());
        // second allocation does not fit the first view; the budget allows one more
        assert!(alloc.allocate(payload).unwrap().is_some());
        assert_eq!(alloc.views.len(), 2);
        // budget exhausted
        assert!(alloc.allocate(payload).unwrap().is_none());
    }

    #[test]
    fn test_entry_too_large() {
        let mut alloc = ArenaAllocator::open_anon(256, 1, 4).unwrap();
        assert!(matches!(
            alloc.allocate(1024),
            Err(Error::EntryTooLarge { .. })
        ));
    }

    #[test]
    fn test_write_read_roundtrip() {
        let mut alloc = ArenaAllocator::open_anon(1024, 1, 1).unwrap();
        let handle = alloc.allocate(32).unwrap().unwrap();
        alloc.write(handle, &[7u8; 32]);
        assert_eq!(alloc.read(handle).unwrap(), vec![7u8; 32]);
    }
}
