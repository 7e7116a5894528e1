use thiserror::Error;

#[derive(Debug, Error, Copy, Clone, PartialEq, Eq, Hash)]
pub enum FormatError {
    #[error("Page data truncated: expected at least {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("Page declares {count} {kind} fixups, at most {max} are allowed")]
    TooManyFixups {
        kind: &'static str,
        count: u32,
        max: u32,
    },
    #[error("Page declares {count} clusters, at most {max} are allowed")]
    TooManyClusters { count: u32, max: u32 },
    #[error("Page {page} dependency range {start}..{end} is outside of {len} dependencies")]
    DependencyRange {
        page: u32,
        start: u32,
        end: u32,
        len: u32,
    },
    #[error("Resource has no pages, the root page is mandatory")]
    MissingRootPage,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Decompressed {actual} bytes, expected {expected}")]
    SizeMismatch { expected: usize, actual: usize },
    #[error("Corrupt compressed payload: {0}")]
    Corrupt(String),
}
