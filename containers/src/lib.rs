pub mod dedup_table;
pub mod error;
pub mod free_list;
pub mod prelude;
pub mod ring_buffer;
pub mod slot;
pub mod span_allocator;
