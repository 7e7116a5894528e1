//! Persisted page layout.
//!
//! ```text
//! PageHeader
//! HierarchyFixup * header.num_hierarchy_fixups
//! ClusterFixup   * header.num_cluster_fixups
//! payload        (header.payload_size bytes, compressed)
//! ```
//!
//! The header and fixup counts are bounded, so [`MAX_FIXUP_CHUNK_SIZE`] is a compile time bound
//! on everything preceding the payload. A reader can fetch a page's full declared size in one go.

use crate::error::FormatError;
use bytemuck::{Pod, Zeroable};

pub const MAX_CLUSTERS_PER_PAGE: u32 = 128;
pub const MAX_HIERARCHY_FIXUPS_PER_PAGE: u32 = MAX_CLUSTERS_PER_PAGE;
pub const MAX_CLUSTER_FIXUPS_PER_PAGE: u32 = MAX_CLUSTERS_PER_PAGE;
/// Children per hierarchy node
pub const MAX_HIERARCHY_CHILDREN: u32 = 4;
pub const INVALID_PAGE_INDEX: u32 = u32::MAX;

pub const PAGE_HEADER_SIZE: usize = size_of::<PageHeader>();
pub const MAX_FIXUP_CHUNK_SIZE: usize = PAGE_HEADER_SIZE
    + MAX_HIERARCHY_FIXUPS_PER_PAGE as usize * size_of::<HierarchyFixup>()
    + MAX_CLUSTER_FIXUPS_PER_PAGE as usize * size_of::<ClusterFixup>();

const _: () = assert!(PAGE_HEADER_SIZE == 16);
const _: () = assert!(size_of::<HierarchyFixup>() == 24);
const _: () = assert!(size_of::<ClusterFixup>() == 16);

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct PageHeader {
    pub num_clusters: u32,
    pub num_hierarchy_fixups: u32,
    pub num_cluster_fixups: u32,
    /// Compressed payload bytes following the fixups
    pub payload_size: u32,
}

/// Points a hierarchy node child at a page once every page in the dependency range is committed.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct HierarchyFixup {
    /// Page holding the clusters the child refers to
    pub page_index: u32,
    /// Node index relative to the resource's first hierarchy node
    pub node_index: u32,
    pub child_index: u32,
    /// First cluster of the group part inside `page_index`
    pub cluster_group_part_start: u32,
    pub dependency_start: u32,
    pub dependency_num: u32,
}

/// Clears the leaf flag of a cluster once every page in the dependency range is committed.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct ClusterFixup {
    /// Page holding the cluster to flag
    pub page_index: u32,
    pub cluster_index: u32,
    pub dependency_start: u32,
    pub dependency_num: u32,
}

/// Page range `dependency_start..dependency_start + dependency_num` shared by both fixup kinds.
///
/// `None` if the range overflows, which only a corrupt page can produce.
pub trait FixupDependencies {
    fn dependencies(&self) -> Option<std::ops::Range<u32>>;
}

fn dependency_range(start: u32, num: u32) -> Option<std::ops::Range<u32>> {
    Some(start..start.checked_add(num)?)
}

impl FixupDependencies for HierarchyFixup {
    fn dependencies(&self) -> Option<std::ops::Range<u32>> {
        dependency_range(self.dependency_start, self.dependency_num)
    }
}

impl FixupDependencies for ClusterFixup {
    fn dependencies(&self) -> Option<std::ops::Range<u32>> {
        dependency_range(self.dependency_start, self.dependency_num)
    }
}

/// Decoded header + fixups of a page. Kept on the host for as long as the page is resident.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FixupChunk {
    pub num_clusters: u32,
    pub hierarchy_fixups: Vec<HierarchyFixup>,
    pub cluster_fixups: Vec<ClusterFixup>,
}

impl FixupChunk {
    /// Size of the header and fixup records, excluding payload.
    pub fn encoded_size(&self) -> usize {
        PAGE_HEADER_SIZE
            + self.hierarchy_fixups.len() * size_of::<HierarchyFixup>()
            + self.cluster_fixups.len() * size_of::<ClusterFixup>()
    }

    pub fn header(&self, payload_size: u32) -> PageHeader {
        PageHeader {
            num_clusters: self.num_clusters,
            num_hierarchy_fixups: self.hierarchy_fixups.len() as u32,
            num_cluster_fixups: self.cluster_fixups.len() as u32,
            payload_size,
        }
    }

    /// Writes the header and fixups, followed by `payload`.
    pub fn write(&self, payload: &[u8], out: &mut Vec<u8>) {
        out.reserve(self.encoded_size() + payload.len());
        out.extend_from_slice(bytemuck::bytes_of(&self.header(payload.len() as u32)));
        for fixup in self.hierarchy_fixups.iter() {
            out.extend_from_slice(bytemuck::bytes_of(fixup));
        }
        for fixup in self.cluster_fixups.iter() {
            out.extend_from_slice(bytemuck::bytes_of(fixup));
        }
        out.extend_from_slice(payload);
    }

    /// Splits a page into its fixup chunk and compressed payload.
    pub fn parse(bytes: &[u8]) -> Result<(FixupChunk, &[u8]), FormatError> {
        if bytes.len() < PAGE_HEADER_SIZE {
            return Err(FormatError::Truncated {
                expected: PAGE_HEADER_SIZE,
                actual: bytes.len(),
            });
        }
        let header: PageHeader = bytemuck::pod_read_unaligned(&bytes[..PAGE_HEADER_SIZE]);
        if header.num_clusters > MAX_CLUSTERS_PER_PAGE {
            return Err(FormatError::TooManyClusters {
                count: header.num_clusters,
                max: MAX_CLUSTERS_PER_PAGE,
            });
        }
        if header.num_hierarchy_fixups > MAX_HIERARCHY_FIXUPS_PER_PAGE {
            return Err(FormatError::TooManyFixups {
                kind: "hierarchy",
                count: header.num_hierarchy_fixups,
                max: MAX_HIERARCHY_FIXUPS_PER_PAGE,
            });
        }
        if header.num_cluster_fixups > MAX_CLUSTER_FIXUPS_PER_PAGE {
            return Err(FormatError::TooManyFixups {
                kind: "cluster",
                count: header.num_cluster_fixups,
                max: MAX_CLUSTER_FIXUPS_PER_PAGE,
            });
        }

        let hierarchy_end = PAGE_HEADER_SIZE
            + header.num_hierarchy_fixups as usize * size_of::<HierarchyFixup>();
        let cluster_end =
            hierarchy_end + header.num_cluster_fixups as usize * size_of::<ClusterFixup>();
        let payload_end = cluster_end + header.payload_size as usize;
        if bytes.len() < payload_end {
            return Err(FormatError::Truncated {
                expected: payload_end,
                actual: bytes.len(),
            });
        }

        let hierarchy_fixups = bytes[PAGE_HEADER_SIZE..hierarchy_end]
            .chunks_exact(size_of::<HierarchyFixup>())
            .map(bytemuck::pod_read_unaligned)
            .collect();
        let cluster_fixups = bytes[hierarchy_end..cluster_end]
            .chunks_exact(size_of::<ClusterFixup>())
            .map(bytemuck::pod_read_unaligned)
            .collect();
        Ok((
            FixupChunk {
                num_clusters: header.num_clusters,
                hierarchy_fixups,
                cluster_fixups,
            },
            &bytes[cluster_end..payload_end],
        ))
    }
}
