pub use super::dedup_table::DedupTable;
pub use super::error::ContainerErrors;
pub use super::free_list::{FreeList, GenerationalFreeList};
pub use super::ring_buffer::RingBuffer;
pub use super::slot::Slot;
pub use super::span_allocator::SpanAllocator;
