use nanopage_format::layout::{INVALID_PAGE_INDEX, MAX_HIERARCHY_CHILDREN};

/// Cluster has no streamed in children, render it as is
pub const CLUSTER_FLAG_LEAF: u32 = 1;

/// Scatter write the GPU copy of the store needs to replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageUpload {
    Page { gpu_page: u32, size: u32 },
    ClusterFlags { gpu_page: u32, cluster: u32, flags: u32 },
    HierarchyChild { node: u32, child: u32, gpu_page: u32 },
}

/// Host mirror of the GPU page pool.
///
/// GPU page indices `0..max_streaming_pages` are streaming slots, root pages follow. Every
/// mutation is logged so an external submitter can replay it with scatter uploads.
#[derive(Debug)]
pub struct PageStore {
    max_streaming_pages: u32,
    max_clusters_per_page: u32,
    pages: Vec<Vec<u8>>,
    cluster_flags: Vec<u32>,
    /// `MAX_HIERARCHY_CHILDREN` entries per node
    hierarchy: Vec<u32>,
    uploads: Vec<PageUpload>,
}

impl PageStore {
    pub fn new(
        max_streaming_pages: u32,
        max_root_pages: u32,
        max_clusters_per_page: u32,
        max_hierarchy_nodes: u32,
    ) -> Self {
        let total_pages = (max_streaming_pages + max_root_pages) as usize;
        Self {
            max_streaming_pages,
            max_clusters_per_page,
            pages: vec![Vec::new(); total_pages],
            cluster_flags: vec![0; total_pages * max_clusters_per_page as usize],
            hierarchy: vec![
                INVALID_PAGE_INDEX;
                max_hierarchy_nodes as usize * MAX_HIERARCHY_CHILDREN as usize
            ],
            uploads: Vec::new(),
        }
    }

    pub fn streaming_page(&self, slot: u32) -> u32 {
        debug_assert!(slot < self.max_streaming_pages);
        slot
    }

    pub fn root_page(&self, root_slot: u32) -> u32 {
        self.max_streaming_pages + root_slot
    }

    pub fn max_clusters_per_page(&self) -> u32 {
        self.max_clusters_per_page
    }

    pub fn page(&self, gpu_page: u32) -> &[u8] {
        &self.pages[gpu_page as usize]
    }

    /// Replaces the page data. The first `num_clusters` clusters start out as leaves.
    pub fn write_page(&mut self, gpu_page: u32, data: Vec<u8>, num_clusters: u32) {
        self.uploads.push(PageUpload::Page {
            gpu_page,
            size: data.len() as u32,
        });
        self.pages[gpu_page as usize] = data;
        let flags = self.flags_mut(gpu_page);
        for (cluster, flag) in flags.iter_mut().enumerate() {
            *flag = if (cluster as u32) < num_clusters {
                CLUSTER_FLAG_LEAF
            } else {
                0
            };
        }
    }

    pub fn clear_page(&mut self, gpu_page: u32) {
        self.pages[gpu_page as usize] = Vec::new();
        self.flags_mut(gpu_page).fill(0);
    }

    fn flags_mut(&mut self, gpu_page: u32) -> &mut [u32] {
        let start = gpu_page as usize * self.max_clusters_per_page as usize;
        &mut self.cluster_flags[start..start + self.max_clusters_per_page as usize]
    }

    pub fn cluster_flags(&self, gpu_page: u32, cluster: u32) -> Option<u32> {
        if cluster >= self.max_clusters_per_page {
            return None;
        }
        self.cluster_flags
            .get((gpu_page * self.max_clusters_per_page + cluster) as usize)
            .copied()
    }

    pub fn is_cluster_leaf(&self, gpu_page: u32, cluster: u32) -> bool {
        self.cluster_flags(gpu_page, cluster)
            .is_some_and(|flags| flags & CLUSTER_FLAG_LEAF != 0)
    }

    /// Returns `false` if the cluster is out of range.
    pub fn set_cluster_leaf(&mut self, gpu_page: u32, cluster: u32, leaf: bool) -> bool {
        if cluster >= self.max_clusters_per_page {
            return false;
        }
        let index = (gpu_page * self.max_clusters_per_page + cluster) as usize;
        let flags = &mut self.cluster_flags[index];
        if leaf {
            *flags |= CLUSTER_FLAG_LEAF;
        } else {
            *flags &= !CLUSTER_FLAG_LEAF;
        }
        self.uploads.push(PageUpload::ClusterFlags {
            gpu_page,
            cluster,
            flags: *flags,
        });
        true
    }

    pub fn hierarchy_child(&self, node: u32, child: u32) -> u32 {
        self.hierarchy[(node * MAX_HIERARCHY_CHILDREN + child) as usize]
    }

    pub fn set_hierarchy_child(&mut self, node: u32, child: u32, gpu_page: u32) {
        self.hierarchy[(node * MAX_HIERARCHY_CHILDREN + child) as usize] = gpu_page;
        self.uploads.push(PageUpload::HierarchyChild {
            node,
            child,
            gpu_page,
        });
    }

    pub fn reset_hierarchy(&mut self, first_node: u32, count: u32) {
        for node in first_node..first_node + count {
            for child in 0..MAX_HIERARCHY_CHILDREN {
                if self.hierarchy_child(node, child) != INVALID_PAGE_INDEX {
                    self.set_hierarchy_child(node, child, INVALID_PAGE_INDEX);
                }
            }
        }
    }

    /// Uploads recorded since the last call, in the order they happened. Nothing else clears the
    /// log.
    pub fn take_uploads(&mut self) -> Vec<PageUpload> {
        std::mem::take(&mut self.uploads)
    }
}
