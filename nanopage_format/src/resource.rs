use crate::error::FormatError;
use crate::stream_state::PageStreamingState;
use bytes::Bytes;
use derivative::Derivative;
use std::sync::Arc;

/// Opaque handle to a resource's backing store, interpreted by the page reader.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BulkDataHandle(Arc<str>);

impl BulkDataHandle {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BulkDataHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Build time description of a streamable resource. Immutable once handed to the streamer.
#[derive(Derivative, Clone)]
#[derivative(Debug)]
pub struct StreamableResource {
    pub name: String,
    /// One entry per page, page 0 is the root page
    pub page_streaming_states: Vec<PageStreamingState>,
    /// Flat dependency list indexed by [`PageStreamingState::dependency_range`]
    pub page_dependencies: Vec<u32>,
    /// Encoded root page, always resident while the resource is alive
    #[derivative(Debug = "ignore")]
    pub root_page: Bytes,
    pub num_hierarchy_nodes: u32,
    pub bulk_data: BulkDataHandle,
}

impl StreamableResource {
    pub fn num_pages(&self) -> u32 {
        self.page_streaming_states.len() as u32
    }

    pub fn dependencies(&self, page_index: u32) -> &[u32] {
        &self.page_dependencies[self.page_streaming_states[page_index as usize].dependency_range()]
    }

    /// Checks that every dependency range lies inside the flat dependency list.
    pub fn validate_layout(&self) -> Result<(), FormatError> {
        if self.page_streaming_states.is_empty() {
            return Err(FormatError::MissingRootPage);
        }
        for (page, state) in self.page_streaming_states.iter().enumerate() {
            let range = state.dependency_range();
            if range.end > self.page_dependencies.len() {
                return Err(FormatError::DependencyRange {
                    page: page as u32,
                    start: range.start as u32,
                    end: range.end as u32,
                    len: self.page_dependencies.len() as u32,
                });
            }
        }
        Ok(())
    }
}
