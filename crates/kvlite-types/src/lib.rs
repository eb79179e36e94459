//! kvlite Types - Pure type definitions
//!
//! Plain data types shared by the cache store crates. Nothing here talks to
//! a database or an async runtime.

pub mod entry;
pub mod ttl;

pub use entry::*;
pub use ttl::*;
