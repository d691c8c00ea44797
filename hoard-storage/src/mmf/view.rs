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

use std::fs::File;

use memmap2::{MmapMut, MmapOptions};

use crate::error::Result;

/// One fixed-size memory-mapped segment, subdivided into arenas at runtime.
///
/// A view is either a range of the single backing file or an anonymous (volatile) mapping; all
/// byte access is bounds-checked through [`View::slice`] / [`View::slice_mut`].
pub(super) struct View {
    map: MmapMut,
    size: usize,
}

impl std::fmt::Debug for View {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("View").field("size", &self.size).finish()
    }
}

impl View {
    /// Map an anonymous volatile view.
    pub fn open_anon(size: usize) -> Result<Self> {
        let map = MmapMut::map_anon(size)?;
        Ok(Self { map, size })
    }

    /// Map a `size`-byte range of the backing file at `offset`.
    ///
    /// `offset` must be page-aligned; the caller guarantees it by keeping the view size a
    /// multiple of the page size.
    pub fn open_file(file: &File, offset: u64, size: usize) -> Result<Self> {
        // SAFETY: the backing file is created and exclusively owned by this provider instance,
        // it is never truncated while a mapping is live, and all access goes through
        // `slice`/`slice_mut` which bounds-check against the view size.
        let map = unsafe { MmapOptions::new().offset(offset).len(size).map_mut(file)? };
        Ok(Self { map, size })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn slice(&self, offset: usize, len: usize) -> &[u8] {
        assert!(
            offset + len <= self.size,
            "offset ({offset}) + len ({len}) <= view size ({size})",
            size = self.size
        );
        &self.map[offset..offset + len]
    }

    pub fn slice_mut(&mut self, offset: usize, len: usize) -> &mut [u8] {
        assert!(
            offset + len <= self.size,
            "offset ({offset}) + len ({len}) <= view size ({size})",
            size = self.size
        );
        &mut self.map[offset..offset + len]
    }

    /// Commit the view's pages to the backing medium.
    pub fn flush(&self) -> Result<()> {
        self.map.flush()?;
        Ok(())
    }
}
