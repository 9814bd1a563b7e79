//! Tiered state persistence.
//!
//! Tier A is a near-cache with TTL ([`CacheTier`]); Tier B is a durable
//! transactional store ([`DurableTier`]). The [`StateStore`] facade writes
//! through to the durable tier, reads through the cache, and transparently
//! gzip-compresses values whose serialized form exceeds 1 MiB.
//!
//! The durable tier also owns the execution audit log, collaborative plan
//! blobs, and continuous agent state with optimistic concurrency (monotonic
//! versions, [`maestro_core::MaestroError::StaleVersion`] on conflict).

pub mod cache;
pub mod codec;
pub mod continuous;
pub mod durable;
pub mod store;

pub use cache::{CacheTier, MemoryCache};
pub use continuous::ContinuousAgentState;
pub use durable::{DurableTier, FileDurableStore};
pub use store::StateStore;
