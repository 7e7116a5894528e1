mod builder;
mod codec;
mod error;
pub mod layout;
mod resource;
mod stream_state;

pub use builder::{PageDesc, ResourceBuilder};
pub use codec::{Lz4Codec, PageCodec, StoredCodec};
pub use error::{CodecError, FormatError};
pub use layout::{ClusterFixup, FixupChunk, FixupDependencies, HierarchyFixup, PageHeader};
pub use resource::{BulkDataHandle, StreamableResource};
pub use stream_state::PageStreamingState;
