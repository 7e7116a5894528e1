use crate::resource::{PageIndex, PageKey, ResourceId, ResourceTable};
use bytemuck::{Pod, Zeroable};
use nanopage_containers::prelude::DedupTable;

/// Page request as written by the GPU: three little endian `u32`s.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct RawRequest {
    pub runtime_handle: u32,
    /// `(first_page << 3) | num_pages`
    pub page_index_num_pages: u32,
    /// Higher is more important
    pub priority: u32,
}

impl RawRequest {
    pub const MAX_PAGES_PER_REQUEST: u32 = 7;
    const NUM_PAGES_BITS: u32 = 3;

    pub fn new(resource: ResourceId, first_page: PageIndex, num_pages: u32, priority: u32) -> Self {
        assert!(num_pages <= Self::MAX_PAGES_PER_REQUEST);
        Self {
            runtime_handle: resource.to_raw(),
            page_index_num_pages: (first_page << Self::NUM_PAGES_BITS) | num_pages,
            priority,
        }
    }

    pub fn first_page(&self) -> PageIndex {
        self.page_index_num_pages >> Self::NUM_PAGES_BITS
    }

    pub fn num_pages(&self) -> u32 {
        self.page_index_num_pages & Self::MAX_PAGES_PER_REQUEST
    }

    pub fn pages(&self) -> std::ops::Range<PageIndex> {
        let first = self.first_page();
        first..first + self.num_pages()
    }
}

/// Cloneable submission handle for request frames. Submitting never blocks on the manager.
#[derive(Debug, Clone)]
pub struct RequestSink {
    sender: crossbeam_channel::Sender<Vec<RawRequest>>,
}

impl RequestSink {
    /// Returns `false` once the manager is gone.
    pub fn submit(&self, requests: &[RawRequest]) -> bool {
        if requests.is_empty() {
            return true;
        }
        self.sender.send(requests.to_vec()).is_ok()
    }

    /// Submits a readback buffer as copied from the GPU. Trailing partial records are ignored.
    pub fn submit_bytes(&self, bytes: &[u8]) -> bool {
        let requests: Vec<RawRequest> = bytes
            .chunks_exact(size_of::<RawRequest>())
            .map(bytemuck::pod_read_unaligned)
            .collect();
        self.submit(&requests)
    }
}

/// Multi buffered request readback.
///
/// Frames submitted before rotation `n` are handed out by rotation `n + buffers - 1`, mirroring
/// a GPU readback that lags the frame that wrote it.
#[derive(Debug)]
pub struct ReadbackRing {
    buffers: Vec<Vec<RawRequest>>,
    write: usize,
    sender: crossbeam_channel::Sender<Vec<RawRequest>>,
    receiver: crossbeam_channel::Receiver<Vec<RawRequest>>,
}

impl ReadbackRing {
    pub fn new(buffers: u32) -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        Self {
            buffers: (0..buffers.max(1)).map(|_| Vec::new()).collect(),
            write: 0,
            sender,
            receiver,
        }
    }

    pub fn sink(&self) -> RequestSink {
        RequestSink {
            sender: self.sender.clone(),
        }
    }

    /// Closes the buffer being written and swaps the oldest buffer into `out`.
    pub fn rotate(&mut self, out: &mut Vec<RawRequest>) {
        let current = &mut self.buffers[self.write];
        while let Ok(frame) = self.receiver.try_recv() {
            current.extend_from_slice(&frame);
        }
        self.write = (self.write + 1) % self.buffers.len();
        out.clear();
        std::mem::swap(out, &mut self.buffers[self.write]);
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DedupOutcome {
    pub requests: u32,
    pub stale: u32,
    pub dropped: u32,
}

/// Collapses requests into `table`, keeping the highest priority per page.
///
/// Stale handles and pages outside their resource are discarded. Root pages are always resident
/// and never enter the table. Once the table is full new keys are dropped while known keys still
/// raise their priority.
pub fn dedup_requests(
    raw: &[RawRequest],
    explicit: &[(PageKey, u32)],
    resources: &ResourceTable,
    table: &mut DedupTable<PageKey, u32>,
) -> DedupOutcome {
    let mut outcome = DedupOutcome::default();
    let mut insert = |key: PageKey, priority: u32, outcome: &mut DedupOutcome| {
        outcome.requests += 1;
        if key.page >= resources.num_pages(key.resource) || !resources.contains(key.resource) {
            outcome.stale += 1;
            return;
        }
        if key.is_root() {
            return;
        }
        if table.is_full() && !table.contains(&key) {
            outcome.dropped += 1;
            return;
        }
        table.insert_or_max(key, priority);
    };

    for request in raw {
        let Some(resource) = resources.resolve_raw(request.runtime_handle) else {
            outcome.requests += request.num_pages();
            outcome.stale += request.num_pages();
            continue;
        };
        for page in request.pages() {
            insert(PageKey::new(resource, page), request.priority, &mut outcome);
        }
    }
    for (key, priority) in explicit {
        insert(*key, *priority, &mut outcome);
    }
    outcome
}
