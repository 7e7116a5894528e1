use crate::config::StreamingConfig;
use crate::error::{FailureClass, LogOnce, StreamingError};
use crate::fixup::{self, CommitView, FixupOutcome};
use crate::io::{PageReader, ReadPoll};
use crate::page_store::{PageStore, PageUpload};
use crate::pending::{DecodedPage, PendingPage, PendingState, decode_page};
use crate::registry::PageRegistry;
use crate::request::{RawRequest, ReadbackRing, RequestSink, dedup_requests};
use crate::resolver::{DependencyResolver, validate_resource};
use crate::resource::{PageIndex, PageKey, ResourceEntry, ResourceId, ResourceTable};
use crate::stats::StreamingStats;
use derivative::Derivative;
use nanopage_containers::prelude::{DedupTable, RingBuffer, SpanAllocator};
use nanopage_format::layout::MAX_FIXUP_CHUNK_SIZE;
use nanopage_format::{CodecError, FixupChunk, FormatError, PageCodec, StreamableResource};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::task::JoinHandle;

type DecodeTask = JoinHandle<Result<DecodedPage, StreamingError>>;

/// Streams pages of registered resources into a fixed size page pool.
///
/// Drive it once per frame:
/// ```text
/// submit_frame_requests / request_pages   (any time)
/// begin_update                            selection, eviction, reads, decompression kick off
/// end_update().await                      joins decompression, installs and patches fixups
/// ```
/// The page store may only be read between `end_update` and the next `begin_update`. Every page
/// store write is logged as a [`PageUpload`] until [`StreamingManager::take_uploads`] drains the
/// log, so the submitter must drain it once per update or it grows without bound.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct StreamingManager {
    config: StreamingConfig,
    resources: ResourceTable,
    registry: PageRegistry,
    resolver: DependencyResolver,
    dedup: DedupTable<PageKey, u32>,
    readback: ReadbackRing,
    sink: RequestSink,
    explicit_requests: Vec<(PageKey, u32)>,
    pending: RingBuffer<PendingPage>,
    /// Fixups of whatever currently occupies each streaming slot
    slot_fixups: Vec<FixupChunk>,
    page_store: PageStore,
    hierarchy: SpanAllocator,
    #[derivative(Debug = "ignore")]
    reader: Arc<dyn PageReader>,
    #[derivative(Debug = "ignore")]
    codec: Arc<dyn PageCodec>,
    runtime: tokio::runtime::Handle,
    /// One task per pending entry in `Decompressing`, in ring order
    #[derivative(Debug = "ignore")]
    decode_tasks: Vec<DecodeTask>,
    update_open: bool,
    stats: StreamingStats,
    log_once: LogOnce,
    raw_requests: Vec<RawRequest>,
    misses: Vec<(PageKey, u32)>,
    selected: Vec<PageKey>,
}

impl StreamingManager {
    pub fn new(
        config: StreamingConfig,
        reader: Arc<dyn PageReader>,
        codec: Arc<dyn PageCodec>,
        runtime: tokio::runtime::Handle,
    ) -> Result<Self, StreamingError> {
        config.validate()?;
        let readback = ReadbackRing::new(config.readback_buffers);
        let sink = readback.sink();
        tracing::debug!(
            "Streaming manager: {} streaming pages, {} root pages, {} pending",
            config.max_streaming_pages,
            config.max_root_pages,
            config.max_pending_pages
        );
        Ok(Self {
            resources: ResourceTable::new(config.max_root_pages),
            registry: PageRegistry::new(config.max_streaming_pages),
            resolver: DependencyResolver::new(config.max_dependency_depth),
            dedup: DedupTable::new(config.max_unique_requests as usize),
            readback,
            sink,
            explicit_requests: Vec::new(),
            pending: RingBuffer::with_capacity(config.max_pending_pages as usize),
            slot_fixups: vec![FixupChunk::default(); config.max_streaming_pages as usize],
            page_store: PageStore::new(
                config.max_streaming_pages,
                config.max_root_pages,
                config.max_clusters_per_page,
                config.max_hierarchy_nodes,
            ),
            hierarchy: SpanAllocator::new(config.max_hierarchy_nodes),
            reader,
            codec,
            runtime,
            decode_tasks: Vec::new(),
            update_open: false,
            stats: StreamingStats::default(),
            log_once: LogOnce::default(),
            raw_requests: Vec::new(),
            misses: Vec::new(),
            selected: Vec::new(),
            config,
        })
    }

    pub fn config(&self) -> &StreamingConfig {
        &self.config
    }

    /// Registers a resource and makes its root page resident.
    pub fn add(&mut self, resource: StreamableResource) -> Result<ResourceId, StreamingError> {
        resource.validate_layout()?;
        let invalid = |page: PageIndex, reason: String| StreamingError::InvalidPage {
            resource: resource.name.clone(),
            page,
            reason,
        };
        if resource.num_pages() > u32::MAX >> 3 {
            return Err(invalid(0, format!("{} pages is not addressable", resource.num_pages())));
        }
        if let Some((page, state)) = resource
            .page_streaming_states
            .iter()
            .enumerate()
            .find(|(_, state)| state.uncompressed_size > self.config.page_size)
        {
            return Err(invalid(
                page as PageIndex,
                format!(
                    "{} bytes exceed the page size of {}",
                    state.uncompressed_size, self.config.page_size
                ),
            ));
        }
        // a page read is sized from `bulk_size`, so it must fit the fixup chunk and payload bounds
        let codec = self.codec.as_ref();
        if let Some((page, state)) = resource
            .page_streaming_states
            .iter()
            .enumerate()
            .find(|(_, state)| {
                state.bulk_size as usize
                    > MAX_FIXUP_CHUNK_SIZE + codec.max_compressed_size(state.uncompressed_size as usize)
            })
        {
            return Err(invalid(
                page as PageIndex,
                format!(
                    "{} stored bytes exceed the bound for {} uncompressed bytes",
                    state.bulk_size, state.uncompressed_size
                ),
            ));
        }
        validate_resource(&resource, self.config.max_dependency_depth)?;

        let (root_fixups, payload) = FixupChunk::parse(&resource.root_page)?;
        if root_fixups.num_clusters > self.config.max_clusters_per_page {
            return Err(FormatError::TooManyClusters {
                count: root_fixups.num_clusters,
                max: self.config.max_clusters_per_page,
            }
            .into());
        }
        let root_data = self.codec.decompress(
            payload,
            resource.page_streaming_states[0].uncompressed_size as usize,
        )?;

        let hierarchy_offset = self
            .hierarchy
            .allocate(resource.num_hierarchy_nodes)
            .ok_or(StreamingError::ResourceCapacity {
                what: "hierarchy nodes",
                max: self.config.max_hierarchy_nodes,
            })?;
        let Some(id) = self.resources.reserve() else {
            if let Err(e) = self.hierarchy.free(hierarchy_offset, resource.num_hierarchy_nodes) {
                tracing::error!("Failed to release hierarchy span: {e}");
            }
            return Err(StreamingError::ResourceCapacity {
                what: "root pages",
                max: self.config.max_root_pages,
            });
        };

        let root_gpu_page = self.page_store.root_page(id.root_slot());
        self.page_store
            .write_page(root_gpu_page, root_data, root_fixups.num_clusters);
        tracing::debug!(
            "Added resource {:?} as {id:?}: {} pages, hierarchy nodes {}..{}",
            resource.name,
            resource.num_pages(),
            hierarchy_offset,
            hierarchy_offset + resource.num_hierarchy_nodes
        );
        self.resources.insert(ResourceEntry {
            id,
            resource,
            hierarchy_offset,
            root_fixups,
        });

        if let Some(entry) = self.resources.get(id) {
            let view = CommitView {
                resources: &self.resources,
                registry: &self.registry,
            };
            let outcome = fixup::install(&entry.root_fixups, entry, &view, &mut self.page_store);
            self.record_fixups(PageKey::new(id, 0), outcome);
        }
        self.stats.resources = self.resources.len() as u32;
        Ok(id)
    }

    /// Unregisters a resource. Its idle pages are released right away, in-flight pages are
    /// dropped once their reads land.
    pub fn remove(&mut self, id: ResourceId) -> Result<(), StreamingError> {
        let entry = self
            .resources
            .remove(id)
            .ok_or(StreamingError::UnknownResource(id))?;
        let freed = self.registry.drop_resource(id);
        for slot in freed.iter() {
            let gpu_page = self.page_store.streaming_page(*slot);
            self.page_store.clear_page(gpu_page);
            self.slot_fixups[*slot as usize] = FixupChunk::default();
        }
        let root_gpu_page = self.page_store.root_page(id.root_slot());
        self.page_store.clear_page(root_gpu_page);
        self.page_store
            .reset_hierarchy(entry.hierarchy_offset, entry.resource.num_hierarchy_nodes);
        if let Err(e) = self
            .hierarchy
            .free(entry.hierarchy_offset, entry.resource.num_hierarchy_nodes)
        {
            tracing::error!("Failed to release hierarchy span of {id:?}: {e}");
        }
        self.explicit_requests.retain(|(key, _)| key.resource != id);
        self.stats.resources = self.resources.len() as u32;
        tracing::debug!(
            "Removed resource {:?} ({id:?}), released {} pages",
            entry.resource.name,
            freed.len()
        );
        Ok(())
    }

    /// Queues GPU request records for the readback ring.
    pub fn submit_frame_requests(&self, requests: &[RawRequest]) {
        self.sink.submit(requests);
    }

    /// Handle for submitting request frames from another thread.
    pub fn request_sink(&self) -> RequestSink {
        self.sink.clone()
    }

    /// CPU side requests, merged into the next update without readback latency.
    pub fn request_pages(&mut self, requests: &[(ResourceId, PageIndex, u32)]) {
        self.explicit_requests.extend(
            requests
                .iter()
                .map(|(resource, page, priority)| (PageKey::new(*resource, *page), *priority)),
        );
    }

    pub fn page_store(&self) -> &PageStore {
        &self.page_store
    }

    pub fn take_uploads(&mut self) -> Vec<PageUpload> {
        self.page_store.take_uploads()
    }

    pub fn stats(&self) -> &StreamingStats {
        &self.stats
    }

    pub fn registry(&self) -> &PageRegistry {
        &self.registry
    }

    pub fn resource(&self, id: ResourceId) -> Option<&StreamableResource> {
        self.resources.get(id).map(|entry| &entry.resource)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn commit_view(&self) -> CommitView<'_> {
        CommitView {
            resources: &self.resources,
            registry: &self.registry,
        }
    }

    /// Page data is installed and its slot is registered to it. Root pages of live resources are
    /// always resident.
    pub fn is_page_resident(&self, key: PageKey) -> bool {
        self.commit_view().is_committed(key)
    }

    pub fn gpu_page(&self, key: PageKey) -> Option<u32> {
        self.commit_view().gpu_page(key, &self.page_store)
    }

    /// Starts an update: consumes requests, selects and evicts pages, issues reads and kicks off
    /// decompression of completed reads.
    pub fn begin_update(&mut self) {
        if self.update_open {
            tracing::warn!("begin_update called without finishing the previous update");
            self.abandon_decompression();
        }
        self.update_open = true;
        self.stats.begin_cycle();
        self.registry.begin_cycle();
        self.resolver.begin_cycle();

        self.collect_requests();
        self.select_pages();
        self.assign_slots();
        self.poll_pending();
        self.stats.pending = self.pending.len() as u32;
    }

    /// Finishes the update started by [`StreamingManager::begin_update`]. Installs the longest
    /// run of successfully decompressed pages from the front of the pipeline and patches fixups.
    pub async fn end_update(&mut self) {
        if !self.update_open {
            return;
        }
        let tasks = std::mem::take(&mut self.decode_tasks);
        let results = futures::future::join_all(tasks).await;
        self.update_open = false;

        // decompressed pages form a prefix of the ring, with dropped orphans mixed in
        let mut results = results.into_iter();
        let mut decoded = Vec::new();
        let mut prefix_done = false;
        for index in 0..self.pending.len() {
            let Some(page) = self.pending.get_mut(index) else {
                break;
            };
            let bytes = match &page.state {
                PendingState::Dropped => {
                    if !prefix_done {
                        decoded.push(None);
                    }
                    continue;
                }
                PendingState::Decompressing(bytes) => bytes.clone(),
                _ => {
                    prefix_done = true;
                    continue;
                }
            };
            let Some(result) = results.next() else {
                tracing::error!("Pending page {:?} has no decompression task", page.key);
                prefix_done = true;
                page.state = PendingState::IoComplete(bytes);
                continue;
            };
            if prefix_done {
                page.state = PendingState::IoComplete(bytes);
                continue;
            }
            let result = result.unwrap_or_else(|e| {
                Err(StreamingError::Codec(CodecError::Corrupt(format!(
                    "decompression task failed: {e}"
                ))))
            });
            match result {
                Ok(page_data) => decoded.push(Some(page_data)),
                Err(e) => {
                    self.stats.cycle.decompress_failures += 1;
                    if self.registry.info(page.slot).orphaned {
                        tracing::trace!("Dropping orphaned {:?} after failed decode: {e}", page.key);
                        page.state = PendingState::Dropped;
                        decoded.push(None);
                        continue;
                    }
                    prefix_done = true;
                    if self.log_once.first(FailureClass::Decompress) {
                        tracing::warn!("Page {:?} failed to decode, reading again: {e}", page.key);
                    } else {
                        tracing::trace!("Page {:?} failed to decode: {e}", page.key);
                    }
                    page.state = PendingState::Selected;
                }
            }
        }

        let mut batch = Vec::with_capacity(decoded.len());
        for _ in 0..decoded.len() {
            if let Some(page) = self.pending.pop_front() {
                batch.push(page);
            }
        }
        self.commit_batch(batch, decoded);

        self.stats.pending = self.pending.len() as u32;
        self.stats.registered = self.registry.len() as u32;
        let cycle = &self.stats.cycle;
        tracing::debug!(
            "Update {}: {} requests ({} unique, {} hits), {} selected, {} installed, {} evicted, {} pending",
            self.stats.cycles,
            cycle.requests,
            cycle.unique_requests,
            cycle.hits,
            cycle.selected,
            cycle.installed,
            cycle.evicted,
            self.stats.pending
        );
    }

    /// Hands bytes of abandoned decompression back to the pipeline.
    fn abandon_decompression(&mut self) {
        for task in self.decode_tasks.drain(..) {
            task.abort();
        }
        for index in 0..self.pending.len() {
            if let Some(page) = self.pending.get_mut(index)
                && let PendingState::Decompressing(bytes) = &page.state
            {
                page.state = PendingState::IoComplete(bytes.clone());
            }
        }
    }

    fn collect_requests(&mut self) {
        self.readback.rotate(&mut self.raw_requests);
        self.dedup.clear();
        let outcome = dedup_requests(
            &self.raw_requests,
            &self.explicit_requests,
            &self.resources,
            &mut self.dedup,
        );
        self.explicit_requests.clear();

        let cycle = &mut self.stats.cycle;
        cycle.requests += outcome.requests;
        cycle.stale_requests += outcome.stale;
        cycle.budget_drops += outcome.dropped;
        cycle.unique_requests = self.dedup.len() as u32;
        if outcome.dropped > 0 && self.log_once.first(FailureClass::RequestBudget) {
            tracing::warn!(
                "{}",
                StreamingError::BudgetExceeded {
                    what: "unique request",
                    limit: self.config.max_unique_requests,
                }
            );
        }
        if outcome.stale > 0 && self.log_once.first(FailureClass::StaleRequest) {
            tracing::debug!("Dropped {} requests for removed resources", outcome.stale);
        }

        self.misses.clear();
        for (key, priority) in self.dedup.iter() {
            if self.registry.is_registered(key) {
                self.registry.touch(key);
                self.stats.cycle.hits += 1;
            } else {
                self.misses.push((key, priority));
            }
        }
    }

    fn select_pages(&mut self) {
        // highest priority first, key order breaks ties
        self.misses
            .sort_unstable_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        let budget = (self.config.max_selected_pages_per_update as usize).min(self.pending.free());

        self.selected.clear();
        let mut dropped = 0;
        for (key, _) in self.misses.iter() {
            if self.selected.len() < budget {
                self.resolver
                    .select(*key, &self.resources, &self.registry, budget, &mut self.selected);
            }
            if !self.resolver.is_selected(*key) {
                dropped += 1;
            }
        }
        self.stats.cycle.budget_drops += dropped;
        if dropped > 0 && self.log_once.first(FailureClass::SelectionBudget) {
            tracing::warn!(
                "{}",
                StreamingError::BudgetExceeded {
                    what: "page selection",
                    limit: budget as u32,
                }
            );
        }
    }

    fn assign_slots(&mut self) {
        // nothing this update's selections depend on may be evicted to make room for them
        for key in DependencyResolver::closure(&self.selected, &self.resources) {
            self.registry.protect(key);
        }

        for index in 0..self.selected.len() {
            let key = self.selected[index];
            let Some(slot) = self.acquire_slot() else {
                // later selections may depend on this one, so everything after it waits
                let dropped = (self.selected.len() - index) as u32;
                self.stats.cycle.budget_drops += dropped;
                if self.log_once.first(FailureClass::SlotBudget) {
                    tracing::warn!(
                        "{}",
                        StreamingError::BudgetExceeded {
                            what: "streaming page",
                            limit: self.config.max_streaming_pages,
                        }
                    );
                }
                break;
            };
            let (Some(range), Some(store)) = (
                self.resources.byte_range(key),
                self.resources.backing_store(key.resource).cloned(),
            ) else {
                panic!("Selected page {key:?} has no resource");
            };
            self.registry
                .register(slot, key, self.resources.dependencies(key));
            self.registry.set_in_flight(slot, true);
            let ticket = self.reader.read(&store, range.offset, range.size);
            let page = PendingPage {
                slot,
                key,
                state: PendingState::IoRequested(ticket),
                store,
                byte_offset: range.offset,
                byte_size: range.size,
                uncompressed_size: range.uncompressed_size,
                attempts: 1,
            };
            if self.pending.push_back(page).is_err() {
                panic!("Pending ring overflow, selection budget must not exceed free entries");
            }
            self.stats.cycle.selected += 1;
            tracing::trace!("Selected {key:?} into slot {slot}");
        }
    }

    /// A free slot, or the least recently used evictable one.
    fn acquire_slot(&mut self) -> Option<u32> {
        if let Some(slot) = self.registry.acquire_free_slot() {
            return Some(slot);
        }
        let victim = self.registry.eviction_candidate()?;
        let old = self.registry.info(victim).registered_key?;
        self.registry
            .unregister(old, self.resources.dependencies(old));
        self.stats.cycle.evicted += 1;
        tracing::trace!("Evicted {old:?} from slot {victim}");
        self.registry.acquire_free_slot()
    }

    fn poll_pending(&mut self) {
        for index in 0..self.pending.len() {
            if let Some(page) = self.pending.get_mut(index)
                && matches!(page.state, PendingState::Selected)
            {
                if self.registry.info(page.slot).orphaned {
                    tracing::trace!("Dropping orphaned {:?} instead of reading it again", page.key);
                    page.state = PendingState::Dropped;
                    continue;
                }
                page.state = PendingState::IoRequested(self.reader.read(
                    &page.store,
                    page.byte_offset,
                    page.byte_size,
                ));
                page.attempts += 1;
            }
        }

        // strictly oldest first, the first page that is not ready stops the scan
        let mut started = 0;
        let mut bytes_started = 0u64;
        for index in 0..self.pending.len() {
            if started >= self.config.max_page_installs_per_update {
                break;
            }
            let Some(page) = self.pending.get_mut(index) else {
                break;
            };
            if matches!(page.state, PendingState::Dropped) {
                continue;
            }
            if let PendingState::IoRequested(ticket) = &mut page.state {
                match ticket.poll() {
                    ReadPoll::Pending => break,
                    ReadPoll::Ready(Ok(bytes)) => page.state = PendingState::IoComplete(bytes),
                    ReadPoll::Ready(Err(e)) => {
                        self.stats.cycle.io_failures += 1;
                        if self.registry.info(page.slot).orphaned {
                            // its store may be gone for good, retrying would stall the ring
                            tracing::trace!("Dropping orphaned {:?} after failed read: {e}", page.key);
                            page.state = PendingState::Dropped;
                            continue;
                        }
                        let failure = StreamingError::IoFailure {
                            key: page.key,
                            kind: e.kind(),
                        };
                        if self.log_once.first(FailureClass::Io(e.kind())) {
                            tracing::warn!("{failure}: {e}");
                        } else {
                            tracing::trace!("{failure}: {e}");
                        }
                        page.state = PendingState::Selected;
                        break;
                    }
                }
            }
            let PendingState::IoComplete(bytes) = &page.state else {
                break;
            };
            let bytes = bytes.clone();
            if let Some(limit) = self.config.bandwidth_limit
                && started > 0
                && bytes_started + bytes.len() as u64 > limit
            {
                break;
            }
            started += 1;
            bytes_started += bytes.len() as u64;
            page.state = PendingState::Decompressing(bytes.clone());

            let codec = self.codec.clone();
            let uncompressed_size = page.uncompressed_size;
            let max_clusters = self.config.max_clusters_per_page;
            self.decode_tasks.push(self.runtime.spawn_blocking(move || {
                decode_page(codec.as_ref(), &bytes, uncompressed_size, max_clusters)
            }));
        }
    }

    /// `decoded` is `None` for dropped orphans.
    fn commit_batch(&mut self, mut batch: Vec<PendingPage>, decoded: Vec<Option<DecodedPage>>) {
        let batch_keys: HashSet<PageKey> = batch.iter().map(|page| page.key).collect();

        // every uninstall lands before any install touches the reused slots
        for page in batch.iter() {
            let Some(old) = self.registry.info(page.slot).resident_key else {
                continue;
            };
            if old != page.key
                && !batch_keys.contains(&old)
                && let Some(entry) = self.resources.get(old.resource)
            {
                let view = CommitView {
                    resources: &self.resources,
                    registry: &self.registry,
                };
                let chunk = &self.slot_fixups[page.slot as usize];
                let outcome = fixup::uninstall(chunk, entry, &view, &mut self.page_store);
                tracing::trace!(
                    "Uninstalled {old:?} from slot {}, {} fixups reverted",
                    page.slot,
                    outcome.applied
                );
            }
            self.registry.set_resident(page.slot, None);
        }

        for page in batch.iter() {
            if !self.registry.info(page.slot).orphaned {
                self.registry.set_resident(page.slot, Some(page.key));
            }
        }

        for (page, page_data) in batch.iter_mut().zip(decoded) {
            let gpu_page = self.page_store.streaming_page(page.slot);
            let Some(page_data) = page_data else {
                self.page_store.clear_page(gpu_page);
                self.slot_fixups[page.slot as usize] = FixupChunk::default();
                self.registry.release_orphan(page.slot);
                tracing::trace!("Released slot {} of dropped {:?}", page.slot, page.key);
                page.state = PendingState::Committed;
                continue;
            };
            self.page_store
                .write_page(gpu_page, page_data.data, page_data.chunk.num_clusters);

            if self.registry.info(page.slot).orphaned {
                self.slot_fixups[page.slot as usize] = FixupChunk::default();
                self.registry.release_orphan(page.slot);
                tracing::trace!("Dropped orphaned {:?} from slot {}", page.key, page.slot);
            } else if let Some(entry) = self.resources.get(page.key.resource) {
                let view = CommitView {
                    resources: &self.resources,
                    registry: &self.registry,
                };
                let outcome = fixup::install(&page_data.chunk, entry, &view, &mut self.page_store);
                self.record_fixups(page.key, outcome);
                self.slot_fixups[page.slot as usize] = page_data.chunk;
                self.registry.set_in_flight(page.slot, false);
                self.stats.cycle.installed += 1;
                tracing::trace!(
                    "Installed {:?} into slot {} after {} attempts",
                    page.key,
                    page.slot,
                    page.attempts
                );
            } else {
                tracing::error!("{:?} is neither live nor orphaned", page.key);
            }
            page.state = PendingState::Committed;
        }
    }

    fn record_fixups(&mut self, key: PageKey, outcome: FixupOutcome) {
        self.stats.cycle.fixups_applied += outcome.applied;
        self.stats.cycle.fixups_deferred += outcome.deferred;
        if outcome.invalid > 0 && self.log_once.first(FailureClass::InvalidFixup) {
            tracing::error!("{key:?} carries {} fixups outside its resource", outcome.invalid);
        }
    }
}
