pub use crate::StreamingManager;
pub use crate::config::StreamingConfig;
pub use crate::error::StreamingError;
pub use crate::io::{FileReader, MemoryReader, PageReader, ReadTicket};
pub use crate::page_store::{PageStore, PageUpload};
pub use crate::registry::{PageRegistry, StreamingPageInfo};
pub use crate::request::{RawRequest, RequestSink};
pub use crate::resource::{PageIndex, PageKey, ResourceId};
pub use crate::stats::{CycleStats, StreamingStats};
