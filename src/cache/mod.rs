//! Generation-scoped response cache.
//!
//! The storage side of the offline-first core:
//! - Cached responses are scoped to a named generation (`"{prefix}-{version}"`)
//! - Exactly one generation is current per worker; stale ones get reaped
//! - Storage sits behind the `CacheStore` trait so the worker logic can be
//!   tested against an in-memory fake instead of a real database

mod generation;
mod store;

pub use generation::{version_token, Generation};
pub use store::{CacheStore, MemoryStore, SqliteStore};
