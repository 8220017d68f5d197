//! Shared event store.
//!
//! Records live in two backends: a durable store (authoritative, retention
//! window) and a volatile cache (bounded, most recent records only). The
//! [`SharedEventStore`] coordinates both and notifies subscribers only after a
//! durable write succeeded.

pub mod in_memory;
pub mod postgres;
#[cfg(feature = "redis")]
pub mod redis_cache;
pub mod shared;
pub mod r#trait;

pub use in_memory::{InMemoryCache, InMemoryDurableStore};
pub use postgres::PostgresEventStore;
#[cfg(feature = "redis")]
pub use redis_cache::RedisEventCache;
pub use r#trait::{DurableStore, RecentQuery, StoreError, VolatileCache};
pub use shared::SharedEventStore;
