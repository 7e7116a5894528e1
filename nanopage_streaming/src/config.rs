use crate::error::StreamingError;
use crate::resource::RESOURCE_VERSION_BITS;
use nanopage_format::layout::MAX_CLUSTERS_PER_PAGE;

/// Fixed capacities of a [`crate::StreamingManager`]. Everything is allocated once from these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamingConfig {
    /// Slots in the streaming page pool, root pages excluded
    pub max_streaming_pages: u32,
    /// Root page slots, which is also the maximum number of live resources
    pub max_root_pages: u32,
    /// Capacity of the in-flight pipeline
    pub max_pending_pages: u32,
    pub max_page_installs_per_update: u32,
    pub max_selected_pages_per_update: u32,
    /// Unique page keys a single update can collect before requests are dropped
    pub max_unique_requests: u32,
    /// Depth of the request readback ring. Requests are consumed `readback_buffers - 1` updates
    /// after they were submitted.
    pub readback_buffers: u32,
    /// Maximum uncompressed payload size of a page
    pub page_size: u32,
    pub max_clusters_per_page: u32,
    /// Hierarchy nodes shared by all live resources
    pub max_hierarchy_nodes: u32,
    /// Longest chain of streaming page dependencies a resource may declare
    pub max_dependency_depth: u32,
    /// Bytes of page data handed to decompression per update. At least one page always passes.
    pub bandwidth_limit: Option<u64>,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            max_streaming_pages: 4096,
            max_root_pages: 1024,
            max_pending_pages: 128,
            max_page_installs_per_update: 64,
            max_selected_pages_per_update: 128,
            max_unique_requests: 4096,
            readback_buffers: 3,
            page_size: 128 * 1024,
            max_clusters_per_page: MAX_CLUSTERS_PER_PAGE,
            max_hierarchy_nodes: 1 << 16,
            max_dependency_depth: 32,
            bandwidth_limit: None,
        }
    }
}

impl StreamingConfig {
    pub fn validate(&self) -> Result<(), StreamingError> {
        let non_zero = [
            ("max_streaming_pages", self.max_streaming_pages),
            ("max_root_pages", self.max_root_pages),
            ("max_pending_pages", self.max_pending_pages),
            ("max_page_installs_per_update", self.max_page_installs_per_update),
            ("max_selected_pages_per_update", self.max_selected_pages_per_update),
            ("max_unique_requests", self.max_unique_requests),
            ("readback_buffers", self.readback_buffers),
            ("page_size", self.page_size),
            ("max_clusters_per_page", self.max_clusters_per_page),
            ("max_dependency_depth", self.max_dependency_depth),
        ];
        if let Some((name, _)) = non_zero.iter().find(|(_, value)| *value == 0) {
            return Err(StreamingError::Configuration(format!("{name} must be non-zero")));
        }
        if self.max_pending_pages > self.max_streaming_pages {
            return Err(StreamingError::Configuration(format!(
                "max_pending_pages ({}) exceeds max_streaming_pages ({})",
                self.max_pending_pages, self.max_streaming_pages
            )));
        }
        let max_roots = 1u32 << (32 - RESOURCE_VERSION_BITS);
        if self.max_root_pages > max_roots {
            return Err(StreamingError::Configuration(format!(
                "max_root_pages ({}) exceeds the {max_roots} addressable root slots",
                self.max_root_pages
            )));
        }
        if self.max_streaming_pages.checked_add(self.max_root_pages).is_none() {
            return Err(StreamingError::Configuration(
                "max_streaming_pages + max_root_pages overflows".to_string(),
            ));
        }
        if self.max_clusters_per_page > MAX_CLUSTERS_PER_PAGE {
            return Err(StreamingError::Configuration(format!(
                "max_clusters_per_page ({}) exceeds the page format limit of {MAX_CLUSTERS_PER_PAGE}",
                self.max_clusters_per_page
            )));
        }
        if self.bandwidth_limit == Some(0) {
            return Err(StreamingError::Configuration(
                "bandwidth_limit must be non-zero, use None for unlimited".to_string(),
            ));
        }
        Ok(())
    }
}
