//! Counter stores.
//!
//! Correctness of the fixed window rests entirely on
//! [`CounterStore::incr_with_first_expiry`] being one indivisible operation
//! on the store side. Implementations must never read, then write.

mod memory;
mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use crate::error::StoreError;
use async_trait::async_trait;
use std::time::Duration;

#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Add `by` to the integer at `key`, arming `ttl` only if this call
    /// created the key.
    ///
    /// Returns the value after the increment, or `None` if the store
    /// answered with nil.
    async fn incr_with_first_expiry(
        &self,
        key: &str,
        by: i64,
        ttl: Duration,
    ) -> Result<Option<i64>, StoreError>;

    /// Cheap reachability probe.
    async fn ping(&self) -> Result<(), StoreError>;
}
