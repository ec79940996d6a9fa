//! Shared store access
//!
//! The checker fleet coordinates through a remote hash/set/list/pub-sub
//! store. This module defines the typed [`Store`] contract the coordination
//! layer programs against, the Redis-backed implementation used in
//! production, and an in-memory implementation used as a testing adapter.
//!
//! Two operations are deliberately exposed as atomic groups rather than as
//! single commands:
//!
//! - [`Store::acquire`] runs `HSETNX` (place the lock sentinel) and `HEXISTS`
//!   (test the caller's sync key) inside one transaction, so a same-process
//!   re-notification is detected atomically with the lock test.
//! - [`Store::exec_atomic`] runs a batch of set mutations inside one
//!   transaction, so a backend's dead markings land together with their TTL.

pub mod memory;
pub mod redis;

pub use memory::MemoryStore;
pub use redis::RedisStore;

use crate::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Reply from the atomic lock acquisition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquireReply {
    /// Whether this call placed the lock sentinel
    pub acquired: bool,
    /// Whether the caller's sync key already exists
    pub sync_exists: bool,
}

/// One mutation inside an atomic command group
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCmd {
    /// `SADD key member`
    SetAdd { key: String, member: String },
    /// `SREM key member`
    SetRemove { key: String, member: String },
    /// `EXPIRE key seconds`
    Expire { key: String, seconds: u64 },
}

/// Typed operations over the shared store
///
/// Individual command failures return `Err`; callers treat them as
/// "operation not performed, try later." Reconnection is the implementation's
/// concern and must be transparent to callers.
#[async_trait]
pub trait Store: Send + Sync {
    /// Set a hash field
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;

    /// Read a hash field
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;

    /// Delete hash fields
    async fn hdel(&self, key: &str, fields: &[String]) -> Result<()>;

    /// Atomically place the lock sentinel and test the sync key
    async fn acquire(&self, key: &str, lock_field: &str, sync_field: &str)
        -> Result<AcquireReply>;

    /// Read one list element
    async fn lindex(&self, key: &str, index: i64) -> Result<Option<String>>;

    /// Set a scalar key
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Delete a key of any type
    async fn del(&self, key: &str) -> Result<()>;

    /// Run a batch of set mutations atomically with respect to other clients
    async fn exec_atomic(&self, cmds: &[StoreCmd]) -> Result<()>;

    /// Subscribe to a pub-sub channel
    ///
    /// The returned receiver yields message payloads for the lifetime of the
    /// process. Implementations must survive connection loss by retrying with
    /// a bounded backoff rather than closing the channel.
    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>>;
}
