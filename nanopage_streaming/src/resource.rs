use nanopage_containers::prelude::{GenerationalFreeList, Slot};
use nanopage_format::{BulkDataHandle, FixupChunk, PageStreamingState, StreamableResource};

/// Low bits of a [`ResourceId`] holding the root slot version
pub const RESOURCE_VERSION_BITS: u32 = 8;

pub type PageIndex = u32;

/// Versioned resource handle: root slot index in the high bits, slot version in the low
/// [`RESOURCE_VERSION_BITS`].
///
/// The version changes every time a root slot is reused, so requests recorded for a removed
/// resource never resolve to its successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(u32);

impl ResourceId {
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn to_raw(self) -> u32 {
        self.0
    }

    pub fn root_slot(self) -> u32 {
        self.slot().id()
    }

    pub fn version(self) -> u32 {
        self.slot().generation()
    }

    fn slot(self) -> Slot<ResourceEntry> {
        Slot::unpack(self.0, RESOURCE_VERSION_BITS)
    }
}

/// Global identity of a page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageKey {
    pub resource: ResourceId,
    pub page: PageIndex,
}

impl PageKey {
    pub fn new(resource: ResourceId, page: PageIndex) -> Self {
        Self { resource, page }
    }

    pub fn is_root(&self) -> bool {
        self.page == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageByteRange {
    pub offset: u64,
    pub size: u32,
    pub uncompressed_size: u32,
}

impl From<&PageStreamingState> for PageByteRange {
    fn from(state: &PageStreamingState) -> Self {
        Self {
            offset: state.bulk_offset,
            size: state.bulk_size,
            uncompressed_size: state.uncompressed_size,
        }
    }
}

#[derive(Debug)]
pub struct ResourceEntry {
    pub id: ResourceId,
    pub resource: StreamableResource,
    /// First node of the resource's span in the shared hierarchy
    pub hierarchy_offset: u32,
    pub root_fixups: FixupChunk,
}

/// Live resources indexed by root slot.
#[derive(Debug)]
pub struct ResourceTable {
    slots: GenerationalFreeList<ResourceEntry>,
    entries: Vec<Option<ResourceEntry>>,
}

impl ResourceTable {
    pub fn new(max_root_pages: u32) -> Self {
        Self {
            slots: GenerationalFreeList::new(max_root_pages, RESOURCE_VERSION_BITS),
            entries: (0..max_root_pages).map(|_| None).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Hands out the next root slot, `None` once every slot is live.
    pub fn reserve(&mut self) -> Option<ResourceId> {
        let slot = self.slots.allocate()?;
        Some(ResourceId(slot.pack(RESOURCE_VERSION_BITS)))
    }

    /// Fills a slot handed out by [`ResourceTable::reserve`].
    pub fn insert(&mut self, entry: ResourceEntry) {
        assert!(self.slots.is_valid(&entry.id.slot()), "Inserting into a stale root slot");
        let index = entry.id.root_slot() as usize;
        self.entries[index] = Some(entry);
    }

    /// Releases a reserved slot that was never filled.
    pub fn remove(&mut self, id: ResourceId) -> Option<ResourceEntry> {
        if !self.contains(id) {
            return None;
        }
        let entry = self.entries[id.root_slot() as usize].take();
        self.slots.release(id.slot()).ok()?;
        entry
    }

    pub fn contains(&self, id: ResourceId) -> bool {
        self.slots.is_valid(&id.slot())
            && self
                .entries
                .get(id.root_slot() as usize)
                .is_some_and(|entry| entry.is_some())
    }

    pub fn get(&self, id: ResourceId) -> Option<&ResourceEntry> {
        if !self.slots.is_valid(&id.slot()) {
            return None;
        }
        self.entries.get(id.root_slot() as usize)?.as_ref()
    }

    /// Resolves a handle recorded by the GPU, `None` if it is stale.
    pub fn resolve_raw(&self, raw: u32) -> Option<ResourceId> {
        let id = ResourceId(raw);
        self.contains(id).then_some(id)
    }

    pub fn num_pages(&self, id: ResourceId) -> u32 {
        self.get(id).map_or(0, |entry| entry.resource.num_pages())
    }

    pub fn dependencies(&self, key: PageKey) -> &[PageIndex] {
        match self.get(key.resource) {
            Some(entry) => entry.resource.dependencies(key.page),
            None => panic!("Dependencies requested for unknown resource {:?}", key.resource),
        }
    }

    pub fn byte_range(&self, key: PageKey) -> Option<PageByteRange> {
        self.get(key.resource)?
            .resource
            .page_streaming_states
            .get(key.page as usize)
            .map(PageByteRange::from)
    }

    pub fn backing_store(&self, id: ResourceId) -> Option<&BulkDataHandle> {
        self.get(id).map(|entry| &entry.resource.bulk_data)
    }
}
