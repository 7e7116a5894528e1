use crate::error::StreamingError;
use crate::io::ReadTicket;
use crate::resource::PageKey;
use bytes::Bytes;
use nanopage_format::{BulkDataHandle, FixupChunk, PageCodec};

/// Progress of an in-flight page.
///
/// `Selected -> IoRequested -> IoComplete -> Decompressing -> Committed`. A failed read or
/// decompression falls back to `Selected` and is read again on the next update, unless the page
/// is orphaned. Orphans go to `Dropped` instead and release their slot when they reach the front.
#[derive(Debug)]
pub enum PendingState {
    Selected,
    IoRequested(ReadTicket),
    IoComplete(Bytes),
    /// Raw bytes are kept so a batch cut short can hand them back
    Decompressing(Bytes),
    /// Orphan whose read or decompression failed, nothing to install
    Dropped,
    Committed,
}

#[derive(Debug)]
pub struct PendingPage {
    pub slot: u32,
    pub key: PageKey,
    pub state: PendingState,
    /// Read source, kept so retries do not go through the resource table
    pub store: BulkDataHandle,
    pub byte_offset: u64,
    pub byte_size: u32,
    pub uncompressed_size: u32,
    pub attempts: u32,
}

impl PendingPage {
    pub fn state_name(&self) -> &'static str {
        match self.state {
            PendingState::Selected => "selected",
            PendingState::IoRequested(_) => "io requested",
            PendingState::IoComplete(_) => "io complete",
            PendingState::Decompressing(_) => "decompressing",
            PendingState::Dropped => "dropped",
            PendingState::Committed => "committed",
        }
    }
}

#[derive(Debug)]
pub struct DecodedPage {
    pub chunk: FixupChunk,
    pub data: Vec<u8>,
}

/// Splits and decompresses a page read. Runs on the blocking pool.
pub fn decode_page(
    codec: &dyn PageCodec,
    bytes: &[u8],
    uncompressed_size: u32,
    max_clusters: u32,
) -> Result<DecodedPage, StreamingError> {
    let (chunk, payload) = FixupChunk::parse(bytes)?;
    if chunk.num_clusters > max_clusters {
        return Err(nanopage_format::FormatError::TooManyClusters {
            count: chunk.num_clusters,
            max: max_clusters,
        }
        .into());
    }
    let data = codec.decompress(payload, uncompressed_size as usize)?;
    Ok(DecodedPage { chunk, data })
}
