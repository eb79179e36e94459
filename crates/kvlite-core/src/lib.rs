//! kvlite Core Library
//!
//! Error type, store configuration, the [`CacheStore`] port and the
//! namespaced cache layer built on top of it.

// Re-export pure types from kvlite-types
pub use kvlite_types::*;

pub mod config;
pub mod error;
pub mod namespace;
pub mod ports;

pub use config::StoreConfig;
pub use error::{CacheError, Result};
pub use namespace::Namespaced;
pub use ports::{CacheStore, EntryStream};
