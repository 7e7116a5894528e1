//! Page streaming for dependency linked geometry pages.
//!
//! A [`StreamingManager`] owns a fixed pool of page slots. Every update it turns page requests
//! into reads, evicts the least recently used pages nothing depends on, and installs completed
//! pages in request order while patching the references between them.

pub mod config;
pub mod error;
pub mod fixup;
pub mod io;
mod manager;
pub mod page_store;
pub mod pending;
pub mod prelude;
pub mod registry;
pub mod request;
pub mod resolver;
pub mod resource;
pub mod stats;
mod tests;

pub use manager::StreamingManager;
