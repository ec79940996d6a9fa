//! In-memory store for tests
//!
//! Implements the full [`Store`] contract against process-local state. Every
//! mutating command is also appended to an operation journal rendered in wire
//! form (`"SADD dead:svc 0"`), so tests can assert exactly which mutations
//! were or were not issued. TTLs are recorded but not enforced; tests that
//! care about expiry inspect [`MemoryStore::ttl`] directly.

use super::{AcquireReply, Store, StoreCmd};
use crate::Result;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Default)]
struct MemoryInner {
    hashes: HashMap<String, HashMap<String, String>>,
    sets: HashMap<String, HashSet<String>>,
    lists: HashMap<String, Vec<String>>,
    scalars: HashMap<String, String>,
    ttls: HashMap<String, u64>,
    subscribers: HashMap<String, Vec<mpsc::Sender<String>>>,
    journal: Vec<String>,
}

/// Mutex-guarded fake of the shared store
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a message to all subscribers of `channel`
    pub fn publish(&self, channel: &str, payload: &str) {
        let senders = {
            let inner = self.inner.lock().unwrap();
            inner.subscribers.get(channel).cloned().unwrap_or_default()
        };
        for tx in senders {
            let _ = tx.try_send(payload.to_string());
        }
    }

    /// Append an element to a list (the proxy's side of `frontend:<key>`)
    pub fn push_list(&self, key: &str, value: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .lists
            .entry(key.to_string())
            .or_default()
            .push(value.to_string());
    }

    /// Replace a list element in place (the proxy re-sharding a slot)
    pub fn set_list_element(&self, key: &str, index: usize, value: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(list) = inner.lists.get_mut(key) {
            if let Some(slot) = list.get_mut(index) {
                *slot = value.to_string();
            }
        }
    }

    /// Read a hash field without going through the async trait
    pub fn hash_field(&self, key: &str, field: &str) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner.hashes.get(key).and_then(|h| h.get(field)).cloned()
    }

    /// Number of fields in a hash
    pub fn hash_len(&self, key: &str) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.hashes.get(key).map_or(0, HashMap::len)
    }

    /// Sorted members of a set
    pub fn set_members(&self, key: &str) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        let mut members: Vec<String> = inner
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        members
    }

    /// Read a scalar key
    pub fn scalar(&self, key: &str) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner.scalars.get(key).cloned()
    }

    /// Last TTL recorded for a key, in seconds
    pub fn ttl(&self, key: &str) -> Option<u64> {
        let inner = self.inner.lock().unwrap();
        inner.ttls.get(key).copied()
    }

    /// Snapshot of the mutation journal
    pub fn ops(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner.journal.clone()
    }

    /// Drop all journal entries recorded so far
    pub fn clear_ops(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.journal.clear();
    }
}

impl MemoryInner {
    fn record(&mut self, op: String) {
        self.journal.push(op);
    }

    fn apply(&mut self, cmd: &StoreCmd) {
        match cmd {
            StoreCmd::SetAdd { key, member } => {
                self.record(format!("SADD {} {}", key, member));
                self.sets
                    .entry(key.clone())
                    .or_default()
                    .insert(member.clone());
            }
            StoreCmd::SetRemove { key, member } => {
                self.record(format!("SREM {} {}", key, member));
                if let Some(set) = self.sets.get_mut(key) {
                    set.remove(member);
                }
            }
            StoreCmd::Expire { key, seconds } => {
                self.record(format!("EXPIRE {} {}", key, seconds));
                self.ttls.insert(key.clone(), *seconds);
            }
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.record(format!("HSET {} {} {}", key, field, value));
        inner
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        Ok(self.hash_field(key, field))
    }

    async fn hdel(&self, key: &str, fields: &[String]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.record(format!("HDEL {} {}", key, fields.join(" ")));
        if let Some(hash) = inner.hashes.get_mut(key) {
            for field in fields {
                hash.remove(field);
            }
        }
        Ok(())
    }

    async fn acquire(
        &self,
        key: &str,
        lock_field: &str,
        sync_field: &str,
    ) -> Result<AcquireReply> {
        let mut inner = self.inner.lock().unwrap();
        inner.record(format!("HSETNX {} {} 1", key, lock_field));
        let hash = inner.hashes.entry(key.to_string()).or_default();
        let acquired = if hash.contains_key(lock_field) {
            false
        } else {
            hash.insert(lock_field.to_string(), "1".to_string());
            true
        };
        let sync_exists = hash.contains_key(sync_field);
        Ok(AcquireReply {
            acquired,
            sync_exists,
        })
    }

    async fn lindex(&self, key: &str, index: i64) -> Result<Option<String>> {
        let inner = self.inner.lock().unwrap();
        if index < 0 {
            return Ok(None);
        }
        Ok(inner
            .lists
            .get(key)
            .and_then(|list| list.get(index as usize))
            .cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.record(format!("SET {} {}", key, value));
        inner.scalars.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.record(format!("DEL {}", key));
        inner.hashes.remove(key);
        inner.sets.remove(key);
        inner.lists.remove(key);
        inner.scalars.remove(key);
        inner.ttls.remove(key);
        Ok(())
    }

    async fn exec_atomic(&self, cmds: &[StoreCmd]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        for cmd in cmds {
            inner.apply(cmd);
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>> {
        let (tx, rx) = mpsc::channel(64);
        let mut inner = self.inner.lock().unwrap();
        inner
            .subscribers
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_is_first_writer_wins() {
        let store = MemoryStore::new();
        let first = store.acquire("hchecker", "http://b1", "http://b1;p1").await.unwrap();
        assert!(first.acquired);
        assert!(!first.sync_exists);

        let second = store.acquire("hchecker", "http://b1", "http://b1;p2").await.unwrap();
        assert!(!second.acquired);
        assert!(!second.sync_exists);

        assert_eq!(store.hash_field("hchecker", "http://b1").as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_acquire_reports_existing_sync_key() {
        let store = MemoryStore::new();
        store.hset("hchecker", "http://b1;p1", "1").await.unwrap();
        store.acquire("hchecker", "http://b1", "http://b1;p1").await.unwrap();
        let reply = store.acquire("hchecker", "http://b1", "http://b1;p1").await.unwrap();
        assert!(!reply.acquired);
        assert!(reply.sync_exists);
    }

    #[tokio::test]
    async fn test_exec_atomic_journals_and_applies() {
        let store = MemoryStore::new();
        store
            .exec_atomic(&[
                StoreCmd::SetAdd {
                    key: "dead:svc".to_string(),
                    member: "0".to_string(),
                },
                StoreCmd::Expire {
                    key: "dead:svc".to_string(),
                    seconds: 60,
                },
            ])
            .await
            .unwrap();
        assert_eq!(store.set_members("dead:svc"), vec!["0".to_string()]);
        assert_eq!(store.ttl("dead:svc"), Some(60));
        assert_eq!(
            store.ops(),
            vec!["SADD dead:svc 0".to_string(), "EXPIRE dead:svc 60".to_string()]
        );
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let store = MemoryStore::new();
        let mut rx = store.subscribe("dead").await.unwrap();
        store.publish("dead", "svc;http://b1;0;2");
        assert_eq!(rx.recv().await.unwrap(), "svc;http://b1;0;2");
    }

    #[tokio::test]
    async fn test_lindex_reads_seeded_list() {
        let store = MemoryStore::new();
        store.push_list("frontend:svc", "meta");
        store.push_list("frontend:svc", "http://b1");
        assert_eq!(
            store.lindex("frontend:svc", 1).await.unwrap().as_deref(),
            Some("http://b1")
        );
        assert_eq!(store.lindex("frontend:svc", 2).await.unwrap(), None);
        assert_eq!(store.lindex("frontend:svc", -1).await.unwrap(), None);
    }
}
