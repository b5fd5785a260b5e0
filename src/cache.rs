//! The cache: registry over everything shared.
//!
//! [`Cache`] is the top-level object collaborators talk to. It owns the
//! shared-directory roots, the [`FilePool`](crate::pool::FilePool), a
//! chunk-hash index (hash → chunk, for serving network requests without
//! walking the tree) and a normalized entry-name index backing search.
//!
//! The cache implements the [`CacheHooks`](crate::share::CacheHooks)
//! capability set; every entity it owns reports index-relevant mutations
//! through it. External collaborators (downloader, hasher, network layer)
//! observe those mutations through [`Cache::subscribe`] as a stream of
//! [`CacheEvent`]s.

mod events;
mod registry;

pub use events::CacheEvent;
pub use registry::Cache;
