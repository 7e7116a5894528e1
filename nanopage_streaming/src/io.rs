use bytes::Bytes;
use nanopage_format::BulkDataHandle;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;

pub type ReadResult = io::Result<Bytes>;

/// Outstanding read. Polled without blocking once per update.
#[derive(Debug)]
pub struct ReadTicket {
    receiver: oneshot::Receiver<ReadResult>,
}

#[derive(Debug)]
pub enum ReadPoll {
    Pending,
    Ready(ReadResult),
}

impl ReadTicket {
    pub fn channel() -> (ReadCompleter, ReadTicket) {
        let (sender, receiver) = oneshot::channel();
        (ReadCompleter { sender }, ReadTicket { receiver })
    }

    pub fn ready(result: ReadResult) -> Self {
        let (completer, ticket) = Self::channel();
        completer.complete(result);
        ticket
    }

    pub fn poll(&mut self) -> ReadPoll {
        match self.receiver.try_recv() {
            Ok(result) => ReadPoll::Ready(result),
            Err(TryRecvError::Empty) => ReadPoll::Pending,
            Err(TryRecvError::Closed) => ReadPoll::Ready(Err(io::Error::new(
                io::ErrorKind::Interrupted,
                "read dropped before completing",
            ))),
        }
    }

    pub async fn wait(self) -> ReadResult {
        self.receiver.await.unwrap_or_else(|_| {
            Err(io::Error::new(
                io::ErrorKind::Interrupted,
                "read dropped before completing",
            ))
        })
    }
}

#[derive(Debug)]
pub struct ReadCompleter {
    sender: oneshot::Sender<ReadResult>,
}

impl ReadCompleter {
    pub fn complete(self, result: ReadResult) {
        // the ticket may be gone if its manager was dropped
        let _ = self.sender.send(result);
    }
}

/// Storage seam. Reads are issued from the update thread and must not block it.
pub trait PageReader: Send + Sync + 'static {
    fn read(&self, store: &BulkDataHandle, offset: u64, size: u32) -> ReadTicket;
}

/// Reads pages from files under `root`, one file per bulk data handle.
#[derive(Debug, Clone)]
pub struct FileReader {
    root: PathBuf,
    runtime: tokio::runtime::Handle,
}

impl FileReader {
    pub fn new(root: impl Into<PathBuf>, runtime: tokio::runtime::Handle) -> Self {
        Self {
            root: root.into(),
            runtime,
        }
    }
}

async fn read_range(path: PathBuf, offset: u64, size: u32) -> ReadResult {
    let mut file = tokio::fs::File::open(&path).await?;
    file.seek(io::SeekFrom::Start(offset)).await?;
    let mut buffer = vec![0u8; size as usize];
    file.read_exact(&mut buffer).await?;
    Ok(Bytes::from(buffer))
}

impl PageReader for FileReader {
    fn read(&self, store: &BulkDataHandle, offset: u64, size: u32) -> ReadTicket {
        let (completer, ticket) = ReadTicket::channel();
        let path = self.root.join(store.as_str());
        self.runtime.spawn(async move {
            let result = read_range(path, offset, size).await;
            if let Err(e) = &result {
                tracing::trace!("Page read at {offset} failed: {e}");
            }
            completer.complete(result);
        });
        ticket
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReadRequest {
    pub store: BulkDataHandle,
    pub offset: u64,
    pub size: u32,
}

#[derive(Debug)]
struct QueuedRead {
    request: ReadRequest,
    completer: ReadCompleter,
}

#[derive(Debug, Default)]
struct MemoryReaderInner {
    stores: HashMap<BulkDataHandle, Bytes>,
    manual: bool,
    queued: VecDeque<QueuedRead>,
    /// Remaining injected failures per `(store, offset)`
    failures: HashMap<(BulkDataHandle, u64), (io::ErrorKind, u32)>,
    reads_issued: u64,
}

impl MemoryReaderInner {
    fn resolve(&mut self, request: &ReadRequest) -> ReadResult {
        let failure_key = (request.store.clone(), request.offset);
        if let Some((kind, remaining)) = self.failures.get_mut(&failure_key) {
            let kind = *kind;
            *remaining -= 1;
            if *remaining == 0 {
                self.failures.remove(&failure_key);
            }
            return Err(io::Error::new(kind, "injected read failure"));
        }
        let data = self.stores.get(&request.store).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no store {}", request.store))
        })?;
        let start = request.offset as usize;
        let end = start + request.size as usize;
        if end > data.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("read {start}..{end} past the end of {}", request.store),
            ));
        }
        Ok(data.slice(start..end))
    }
}

/// In memory [`PageReader`].
///
/// Immediate readers complete every read as it is issued. Manual readers queue reads until the
/// caller completes them, which lets tests and the demo control completion order and throughput.
#[derive(Debug, Clone, Default)]
pub struct MemoryReader {
    inner: Arc<Mutex<MemoryReaderInner>>,
}

impl MemoryReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn manual() -> Self {
        let reader = Self::default();
        reader.lock().manual = true;
        reader
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryReaderInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, store: BulkDataHandle, data: Bytes) {
        self.lock().stores.insert(store, data);
    }

    /// The next `times` reads of `store` at `offset` fail with `kind`.
    pub fn fail_reads(&self, store: &BulkDataHandle, offset: u64, kind: io::ErrorKind, times: u32) {
        if times > 0 {
            self.lock()
                .failures
                .insert((store.clone(), offset), (kind, times));
        }
    }

    pub fn reads_issued(&self) -> u64 {
        self.lock().reads_issued
    }

    /// Reads waiting for completion, oldest first.
    pub fn queued(&self) -> Vec<ReadRequest> {
        self.lock()
            .queued
            .iter()
            .map(|read| read.request.clone())
            .collect()
    }

    /// Completes every queued read matching `filter`, returning how many were completed.
    pub fn complete_where(&self, mut filter: impl FnMut(&ReadRequest) -> bool) -> usize {
        let mut inner = self.lock();
        let (ready, waiting): (VecDeque<QueuedRead>, VecDeque<QueuedRead>) =
            inner.queued.drain(..).partition(|read| filter(&read.request));
        inner.queued = waiting;
        let completed = ready.len();
        for read in ready {
            let result = inner.resolve(&read.request);
            read.completer.complete(result);
        }
        completed
    }

    pub fn complete_all(&self) -> usize {
        self.complete_where(|_| true)
    }

    /// Completes queued reads oldest first until `budget` bytes have been delivered. The first
    /// read always completes.
    pub fn complete_bytes(&self, budget: u64) -> usize {
        let mut inner = self.lock();
        let mut delivered = 0u64;
        let mut completed = 0;
        while let Some(read) = inner.queued.front() {
            let size = read.request.size as u64;
            if completed > 0 && delivered + size > budget {
                break;
            }
            let Some(read) = inner.queued.pop_front() else {
                break;
            };
            delivered += size;
            completed += 1;
            let result = inner.resolve(&read.request);
            read.completer.complete(result);
        }
        completed
    }
}

impl PageReader for MemoryReader {
    fn read(&self, store: &BulkDataHandle, offset: u64, size: u32) -> ReadTicket {
        let request = ReadRequest {
            store: store.clone(),
            offset,
            size,
        };
        let mut inner = self.lock();
        inner.reads_issued += 1;
        if inner.manual {
            let (completer, ticket) = ReadTicket::channel();
            inner.queued.push_back(QueuedRead { request, completer });
            ticket
        } else {
            ReadTicket::ready(inner.resolve(&request))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn store() -> BulkDataHandle {
        BulkDataHandle::new("bulk")
    }

    #[test]
    fn test_immediate_read() {
        let reader = MemoryReader::new();
        reader.insert(store(), Bytes::from_static(&[0, 1, 2, 3, 4, 5]));
        let mut ticket = reader.read(&store(), 2, 3);
        match ticket.poll() {
            ReadPoll::Ready(Ok(bytes)) => assert_eq!(&bytes[..], &[2, 3, 4]),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            reader.read(&store(), 4, 3).poll(),
            ReadPoll::Ready(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof
        ));
    }

    #[test]
    fn test_manual_completion_order() {
        let reader = MemoryReader::manual();
        reader.insert(store(), Bytes::from_static(&[9; 16]));
        let mut first = reader.read(&store(), 0, 4);
        let mut second = reader.read(&store(), 4, 4);
        assert!(matches!(first.poll(), ReadPoll::Pending));

        assert_eq!(reader.complete_where(|read| read.offset == 4), 1);
        assert!(matches!(first.poll(), ReadPoll::Pending));
        assert!(matches!(second.poll(), ReadPoll::Ready(Ok(_))));
        assert_eq!(reader.queued().len(), 1);
        assert_eq!(reader.complete_all(), 1);
        assert!(matches!(first.poll(), ReadPoll::Ready(Ok(_))));
    }

    #[test]
    fn test_injected_failures_run_out() {
        let reader = MemoryReader::new();
        reader.insert(store(), Bytes::from_static(&[1; 8]));
        reader.fail_reads(&store(), 0, io::ErrorKind::TimedOut, 2);
        for _ in 0..2 {
            assert!(matches!(
                reader.read(&store(), 0, 8).poll(),
                ReadPoll::Ready(Err(e)) if e.kind() == io::ErrorKind::TimedOut
            ));
        }
        assert!(matches!(reader.read(&store(), 0, 8).poll(), ReadPoll::Ready(Ok(_))));
        assert_eq!(reader.reads_issued(), 3);
    }

    #[test]
    fn test_complete_bytes_throttles() {
        let reader = MemoryReader::manual();
        reader.insert(store(), Bytes::from_static(&[0; 64]));
        for offset in [0, 16, 32] {
            reader.read(&store(), offset, 16);
        }
        assert_eq!(reader.complete_bytes(20), 1);
        assert_eq!(reader.complete_bytes(1), 1);
        assert_eq!(reader.complete_bytes(64), 1);
        assert_eq!(reader.complete_bytes(64), 0);
    }

    #[tokio::test]
    async fn test_file_reader_reads_range() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("bulk")).unwrap();
        file.write_all(&(0u8..32).collect::<Vec<u8>>()).unwrap();
        drop(file);

        let reader = FileReader::new(dir.path(), tokio::runtime::Handle::current());
        let bytes = reader.read(&store(), 8, 4).wait().await.unwrap();
        assert_eq!(&bytes[..], &[8, 9, 10, 11]);

        let missing = reader.read(&BulkDataHandle::new("missing"), 0, 4).wait().await;
        assert_eq!(missing.unwrap_err().kind(), io::ErrorKind::NotFound);
        let past_end = reader.read(&store(), 30, 4).wait().await;
        assert_eq!(past_end.unwrap_err().kind(), io::ErrorKind::UnexpectedEof);
    }
}
