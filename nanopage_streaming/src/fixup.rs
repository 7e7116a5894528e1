//! Patching of cross page references as pages come and go.
//!
//! Installing a page points its parents' hierarchy children at it and marks the parent clusters
//! as refined, but only once every page a fixup lists is committed. Uninstalling reverts both
//! unconditionally.

use crate::page_store::PageStore;
use crate::registry::PageRegistry;
use crate::resource::{PageKey, ResourceEntry, ResourceTable};
use nanopage_format::layout::{INVALID_PAGE_INDEX, MAX_HIERARCHY_CHILDREN};
use nanopage_format::{ClusterFixup, FixupChunk, FixupDependencies, HierarchyFixup};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FixupOutcome {
    pub applied: u32,
    /// Fixups waiting on a dependency that is not committed yet
    pub deferred: u32,
    /// Fixups pointing outside their resource
    pub invalid: u32,
}

/// Commit state lookups shared by install and uninstall.
pub struct CommitView<'a> {
    pub resources: &'a ResourceTable,
    pub registry: &'a PageRegistry,
}

impl CommitView<'_> {
    pub fn is_committed(&self, key: PageKey) -> bool {
        if key.is_root() {
            self.resources.contains(key.resource)
        } else {
            self.registry.is_committed(key)
        }
    }

    /// GPU page holding `key`, if it is committed.
    pub fn gpu_page(&self, key: PageKey, store: &PageStore) -> Option<u32> {
        if !self.is_committed(key) {
            return None;
        }
        if key.is_root() {
            Some(store.root_page(key.resource.root_slot()))
        } else {
            self.registry
                .slot_of(key)
                .map(|slot| store.streaming_page(slot))
        }
    }

    /// `None` if the fixup's dependency range is malformed.
    fn dependencies_committed(
        &self,
        entry: &ResourceEntry,
        fixup: &impl FixupDependencies,
    ) -> Option<bool> {
        Some(
            fixup
                .dependencies()?
                .all(|page| self.is_committed(PageKey::new(entry.id, page))),
        )
    }
}

fn hierarchy_node(entry: &ResourceEntry, fixup: &HierarchyFixup) -> Option<u32> {
    (fixup.node_index < entry.resource.num_hierarchy_nodes
        && fixup.child_index < MAX_HIERARCHY_CHILDREN)
        .then(|| entry.hierarchy_offset + fixup.node_index)
}

fn cluster_target(entry: &ResourceEntry, fixup: &ClusterFixup) -> Option<PageKey> {
    (fixup.page_index < entry.resource.num_pages()).then(|| PageKey::new(entry.id, fixup.page_index))
}

pub fn install(
    chunk: &FixupChunk,
    entry: &ResourceEntry,
    view: &CommitView,
    store: &mut PageStore,
) -> FixupOutcome {
    let mut outcome = FixupOutcome::default();
    for fixup in chunk.hierarchy_fixups.iter() {
        let Some(node) = hierarchy_node(entry, fixup) else {
            outcome.invalid += 1;
            continue;
        };
        match view.dependencies_committed(entry, fixup) {
            Some(true) => {}
            Some(false) => {
                outcome.deferred += 1;
                continue;
            }
            None => {
                outcome.invalid += 1;
                continue;
            }
        }
        match view.gpu_page(PageKey::new(entry.id, fixup.page_index), store) {
            Some(gpu_page) => {
                store.set_hierarchy_child(node, fixup.child_index, gpu_page);
                outcome.applied += 1;
            }
            None => outcome.deferred += 1,
        }
    }
    for fixup in chunk.cluster_fixups.iter() {
        let Some(target) = cluster_target(entry, fixup) else {
            outcome.invalid += 1;
            continue;
        };
        match view.dependencies_committed(entry, fixup) {
            Some(true) => {}
            Some(false) => {
                outcome.deferred += 1;
                continue;
            }
            None => {
                outcome.invalid += 1;
                continue;
            }
        }
        match view.gpu_page(target, store) {
            Some(gpu_page) if store.set_cluster_leaf(gpu_page, fixup.cluster_index, false) => {
                outcome.applied += 1
            }
            Some(_) => outcome.invalid += 1,
            None => outcome.deferred += 1,
        }
    }
    outcome
}

/// Reverts the fixups of a page leaving its slot. Targets that are no longer resident are
/// skipped since their flags went with them.
pub fn uninstall(
    chunk: &FixupChunk,
    entry: &ResourceEntry,
    view: &CommitView,
    store: &mut PageStore,
) -> FixupOutcome {
    let mut outcome = FixupOutcome::default();
    for fixup in chunk.hierarchy_fixups.iter() {
        match hierarchy_node(entry, fixup) {
            Some(node) => {
                store.set_hierarchy_child(node, fixup.child_index, INVALID_PAGE_INDEX);
                outcome.applied += 1;
            }
            None => outcome.invalid += 1,
        }
    }
    for fixup in chunk.cluster_fixups.iter() {
        let Some(target) = cluster_target(entry, fixup) else {
            outcome.invalid += 1;
            continue;
        };
        if let Some(gpu_page) = view.gpu_page(target, store)
            && store.set_cluster_leaf(gpu_page, fixup.cluster_index, true)
        {
            outcome.applied += 1;
        }
    }
    outcome
}
