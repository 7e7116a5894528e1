use crate::codec::PageCodec;
use crate::layout::FixupChunk;
use crate::resource::{BulkDataHandle, StreamableResource};
use crate::stream_state::PageStreamingState;
use bytes::Bytes;

#[derive(Debug, Clone, Default)]
pub struct PageDesc {
    pub dependencies: Vec<u32>,
    pub fixups: FixupChunk,
    pub payload: Vec<u8>,
}

/// Assembles a [`StreamableResource`] and its bulk data from page descriptions.
///
/// Page 0 is the root page and is embedded in the resource instead of the bulk data.
#[derive(Debug, Clone)]
pub struct ResourceBuilder {
    name: String,
    pages: Vec<PageDesc>,
    num_hierarchy_nodes: u32,
}

impl ResourceBuilder {
    pub fn new(name: impl Into<String>, root: PageDesc) -> Self {
        Self {
            name: name.into(),
            pages: vec![PageDesc {
                dependencies: Vec::new(),
                ..root
            }],
            num_hierarchy_nodes: 1,
        }
    }

    pub fn hierarchy_nodes(mut self, count: u32) -> Self {
        self.num_hierarchy_nodes = count;
        self
    }

    /// Adds a streaming page and returns its page index.
    pub fn page(&mut self, page: PageDesc) -> u32 {
        self.pages.push(page);
        (self.pages.len() - 1) as u32
    }

    pub fn num_pages(&self) -> u32 {
        self.pages.len() as u32
    }

    /// Encodes every page with `codec`, appending streaming pages to `bulk`.
    pub fn build_into(
        &self,
        codec: &dyn PageCodec,
        bulk_data: BulkDataHandle,
        bulk: &mut Vec<u8>,
    ) -> StreamableResource {
        let mut page_streaming_states = Vec::with_capacity(self.pages.len());
        let mut page_dependencies = Vec::new();
        let mut root_page = Vec::new();

        for (page_index, page) in self.pages.iter().enumerate() {
            let compressed = codec.compress(&page.payload);
            let (bulk_offset, bulk_size) = if page_index == 0 {
                page.fixups.write(&compressed, &mut root_page);
                (0, root_page.len())
            } else {
                let start = bulk.len();
                page.fixups.write(&compressed, bulk);
                (start, bulk.len() - start)
            };
            page_streaming_states.push(PageStreamingState {
                bulk_offset: bulk_offset as u64,
                bulk_size: bulk_size as u32,
                uncompressed_size: page.payload.len() as u32,
                dependencies_start: page_dependencies.len() as u32,
                dependencies_num: page.dependencies.len() as u32,
            });
            page_dependencies.extend_from_slice(&page.dependencies);
        }

        StreamableResource {
            name: self.name.clone(),
            page_streaming_states,
            page_dependencies,
            root_page: Bytes::from(root_page),
            num_hierarchy_nodes: self.num_hierarchy_nodes,
            bulk_data,
        }
    }

    pub fn build(&self, codec: &dyn PageCodec, bulk_data: BulkDataHandle) -> (StreamableResource, Bytes) {
        let mut bulk = Vec::new();
        let resource = self.build_into(codec, bulk_data, &mut bulk);
        (resource, Bytes::from(bulk))
    }
}
