use crate::resource::{PageIndex, PageKey, ResourceId};
use nanopage_format::{CodecError, FormatError};
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StreamingError {
    #[error("Invalid streaming configuration: {0}")]
    Configuration(String),
    #[error("Resource {resource:?} page {page} has an inconsistent dependency: {fault}")]
    DependencyInconsistency {
        resource: String,
        page: PageIndex,
        fault: DependencyFault,
    },
    #[error("{what} budget of {limit} exceeded, excess dropped until the next update")]
    BudgetExceeded { what: &'static str, limit: u32 },
    #[error("Reading {key:?} failed with {kind}, retrying next update")]
    IoFailure {
        key: PageKey,
        kind: std::io::ErrorKind,
    },
    #[error("Resource {0:?} is not registered or was already removed")]
    UnknownResource(ResourceId),
    #[error("Out of {what}: at most {max} can be live at once")]
    ResourceCapacity { what: &'static str, max: u32 },
    #[error("Resource {resource:?} page {page} is invalid: {reason}")]
    InvalidPage {
        resource: String,
        page: PageIndex,
        reason: String,
    },
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DependencyFault {
    #[error("dependency {dependency} is out of range for {num_pages} pages")]
    OutOfRange { dependency: PageIndex, num_pages: u32 },
    #[error("dependency cycle through page {0}")]
    Cycle(PageIndex),
    #[error("dependency chain of {depth} pages exceeds the limit of {max}")]
    TooDeep { depth: u32, max: u32 },
    #[error("the root page cannot have dependencies")]
    RootDependencies,
}

/// Distinct failure kinds that are reported once per manager and silently retried afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    Io(std::io::ErrorKind),
    Decompress,
    RequestBudget,
    SelectionBudget,
    SlotBudget,
    StaleRequest,
    InvalidFixup,
}

#[derive(Debug, Default)]
pub struct LogOnce {
    seen: HashSet<FailureClass>,
}

impl LogOnce {
    /// Returns `true` the first time `class` is seen.
    pub fn first(&mut self, class: FailureClass) -> bool {
        self.seen.insert(class)
    }
}
