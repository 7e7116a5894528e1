use bytemuck::{Pod, Zeroable};

/// Where a page lives in the backing store and which pages it depends on.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct PageStreamingState {
    /// Byte offset of the page in the backing store
    pub bulk_offset: u64,
    /// Bytes to read: header, fixups and compressed payload
    pub bulk_size: u32,
    /// Payload bytes after decompression
    pub uncompressed_size: u32,
    /// Range into [`crate::StreamableResource::page_dependencies`]
    pub dependencies_start: u32,
    pub dependencies_num: u32,
}

impl PageStreamingState {
    pub fn byte_range(&self) -> std::ops::Range<u64> {
        self.bulk_offset..self.bulk_offset + self.bulk_size as u64
    }

    pub fn dependency_range(&self) -> std::ops::Range<usize> {
        self.dependencies_start as usize
            ..self.dependencies_start as usize + self.dependencies_num as usize
    }
}
