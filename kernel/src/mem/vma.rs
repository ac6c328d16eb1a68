//! Memory-mapped file regions of a process.

use alloc::collections::BTreeMap;
use kidneyos_shared::mem::pages_spanned;
use thiserror::Error;

pub type MapId = i32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MmapError {
    #[error("address is not page aligned")]
    Unaligned,
    #[error("mapping would cover null or kernel memory")]
    NotUserAddress,
    #[error("console descriptors cannot be mapped")]
    ConsoleDescriptor,
    #[error("descriptor is not open")]
    BadDescriptor,
    #[error("file is empty")]
    EmptyFile,
    #[error("range overlaps existing pages")]
    Overlap,
}

/// A mapped byte range. The file handle itself lives in the backing of each
/// page, so the file stays open until the last page is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmapRegion {
    id: MapId,
    addr: usize,
    size: usize,
}

impl MmapRegion {
    pub fn id(&self) -> MapId {
        self.id
    }
    /// Every page the region covers.
    pub fn pages(&self) -> impl Iterator<Item = usize> {
        pages_spanned(self.addr, self.size)
    }
}

#[derive(Debug)]
pub struct MmapTable {
    regions: BTreeMap<MapId, MmapRegion>,
    /// Ids are never handed out twice, so a stale id can't reach a newer
    /// mapping.
    next_id: MapId,
}

impl Default for MmapTable {
    fn default() -> Self {
        Self::new()
    }
}

impl MmapTable {
    /// New empty table. The first id is 1.
    pub fn new() -> Self {
        Self {
            regions: BTreeMap::new(),
            next_id: 1,
        }
    }

    pub fn insert(&mut self, addr: usize, size: usize) -> MapId {
        let id = self.next_id;
        self.next_id += 1;
        self.regions.insert(id, MmapRegion { id, addr, size });
        id
    }

    pub fn remove(&mut self, id: MapId) -> Option<MmapRegion> {
        self.regions.remove(&id)
    }

    /// Removes every region, oldest first.
    pub fn drain(&mut self) -> impl Iterator<Item = MmapRegion> {
        core::mem::take(&mut self.regions).into_values()
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}
