//! Backend lock coordination over the shared store
//!
//! Every checker process runs one [`Cache`]. It owns the distributed
//! per-backend lock, the process-local mapping of backend URL to the
//! `(frontend, slot)` pairs it is responsible for, and the re-arm channels
//! that nudge running probers after a re-notification.
//!
//! ## Locking protocol
//!
//! Acquisition places the sentinel `1` at the backend's hash field with
//! `HSETNX` and, in the same transaction, tests this process's sync key.
//! The winner then upgrades the sentinel to its ownership signature and
//! records the sync key. The upgrade is not atomic with the acquisition,
//! which is safe: a racing acquirer observes either no field (it may win) or
//! the sentinel/signature (it must back off). A prober that later finds a
//! value other than its own signature has been preempted and must retire.
//!
//! ## Serialization
//!
//! One async mutex covers the mapping, the re-arm registry, and store
//! access, so supervisor ingestion and prober callbacks never interleave
//! their read-modify-write sequences.

use crate::check::Check;
use crate::config::CheckerConfig;
use crate::store::{Store, StoreCmd};
use crate::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// Hash holding lock fields and sync markers
pub const HASH_KEY: &str = "hchecker";
/// Scalar updated by the liveness beacon
pub const PING_KEY: &str = "hchecker_ping";
/// Pub-sub channel carrying suspect notifications
pub const SUSPECT_CHANNEL: &str = "dead";

/// TTL on `dead:<frontend>` sets; dead markings age out if the owner dies
const DEAD_SET_TTL_SECS: u64 = 60;

/// Outcome of a lock attempt
#[derive(Debug)]
pub enum LockOutcome {
    /// This call locked the backend; the caller must spawn a prober
    Acquired(Lease),
    /// This process already owns the backend; the running prober was re-armed
    AlreadyOurs,
    /// Another process owns the backend
    ForeignOwner,
}

/// Proof of ownership handed to the prober task
#[derive(Debug)]
pub struct Lease {
    /// Signature stored as the lock value while this prober owns the backend
    pub signature: String,
    /// Single-slot channel; a token forces the next tick to act as a first check
    pub rearm: mpsc::Receiver<()>,
}

#[derive(Default)]
struct CacheInner {
    /// backendUrl → frontendKey → slot index
    mapping: HashMap<String, HashMap<String, usize>>,
    /// backendUrl → re-arm sender for the running prober
    rearm: HashMap<String, mpsc::Sender<()>>,
}

/// Coordination layer shared by the supervisor and all probers
pub struct Cache {
    store: Arc<dyn Store>,
    /// `<hostname>#<pid>`, constant for the process lifetime
    my_id: String,
    /// `hchecker` or `hchecker_<suffix>` when the fleet is partitioned
    hash_key: String,
    dry_run: bool,
    inner: Mutex<CacheInner>,
}

impl Cache {
    /// Create the coordination layer and flush state left by dead processes
    ///
    /// The startup flush deletes the whole lock hash: hash fields carry no
    /// TTL, so locks orphaned by a crashed checker would otherwise block
    /// their backends forever. Fleets sharing one store must therefore use
    /// distinct key suffixes.
    pub async fn new(
        store: Arc<dyn Store>,
        my_id: String,
        config: &CheckerConfig,
    ) -> Result<Self> {
        let hash_key = if config.key_suffix.is_empty() {
            HASH_KEY.to_string()
        } else {
            format!("{}_{}", HASH_KEY, config.key_suffix)
        };
        store.del(&hash_key).await?;
        Ok(Self {
            store,
            my_id,
            hash_key,
            dry_run: config.dry_run,
            inner: Mutex::new(CacheInner::default()),
        })
    }

    /// Try to take ownership of the backend named by `check`
    pub async fn lock_backend(&self, check: &Check) -> Result<LockOutcome> {
        let mut inner = self.inner.lock().await;
        let sync_field = self.sync_field(&check.backend_url);
        let reply = self
            .store
            .acquire(&self.hash_key, &check.backend_url, &sync_field)
            .await?;

        if !reply.acquired && !reply.sync_exists {
            // Monitored by another process
            return Ok(LockOutcome::ForeignOwner);
        }
        if !reply.acquired {
            // Re-notification for a backend we already own: the mapping may
            // gain a new frontend, and the running prober gets nudged
            self.enter_mapping(&mut inner, check);
            debug!("Re-entered mapping for {}", check.backend_url);
            return Ok(LockOutcome::AlreadyOurs);
        }

        // We placed the sentinel; upgrade it to our signature and record the
        // sync key so a later notification from this process is recognized
        let signature = self.mint_signature();
        self.store
            .hset(&self.hash_key, &check.backend_url, &signature)
            .await?;
        self.store.hset(&self.hash_key, &sync_field, "1").await?;
        self.enter_mapping(&mut inner, check);
        let (tx, rx) = mpsc::channel(1);
        inner.rearm.insert(check.backend_url.clone(), tx);
        Ok(LockOutcome::Acquired(Lease {
            signature,
            rearm: rx,
        }))
    }

    /// Whether the backend's lock no longer carries `signature`
    ///
    /// A missing field, the bare sentinel, or a foreign signature all mean
    /// the caller has been preempted and must retire.
    pub async fn is_unlocked_backend(&self, check: &Check, signature: &str) -> Result<bool> {
        let _inner = self.inner.lock().await;
        let current = self.store.hget(&self.hash_key, &check.backend_url).await?;
        Ok(current.as_deref() != Some(signature))
    }

    /// Release the backend and forget everything local about it. Idempotent.
    pub async fn unlock_backend(&self, check: &Check) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.release_locked(&mut inner, check).await
    }

    /// Mark every mapped `(frontend, slot)` of this backend dead
    ///
    /// Returns false when all entries were pruned as stale; the lock has
    /// then been released and there is nothing left to watch.
    pub async fn mark_backend_dead(&self, check: &Check) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let entries = self.valid_entries(&mut inner, check).await?;
        if entries.is_empty() {
            self.release_locked(&mut inner, check).await?;
            return Ok(false);
        }
        if self.dry_run {
            info!(
                "dry-run: would mark {} dead for {:?}",
                check.backend_url, entries
            );
            return Ok(true);
        }
        let mut cmds = Vec::with_capacity(entries.len() * 2);
        for (frontend_key, slot_index) in &entries {
            let dead_key = dead_set_key(frontend_key);
            cmds.push(StoreCmd::SetAdd {
                key: dead_key.clone(),
                member: slot_index.to_string(),
            });
            cmds.push(StoreCmd::Expire {
                key: dead_key,
                seconds: DEAD_SET_TTL_SECS,
            });
        }
        self.store.exec_atomic(&cmds).await?;
        Ok(true)
    }

    /// Remove every mapped `(frontend, slot)` of this backend from the dead sets
    ///
    /// Same return contract as [`Cache::mark_backend_dead`].
    pub async fn mark_backend_alive(&self, check: &Check) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let entries = self.valid_entries(&mut inner, check).await?;
        if entries.is_empty() {
            self.release_locked(&mut inner, check).await?;
            return Ok(false);
        }
        if self.dry_run {
            info!(
                "dry-run: would mark {} alive for {:?}",
                check.backend_url, entries
            );
            return Ok(true);
        }
        let cmds: Vec<StoreCmd> = entries
            .iter()
            .map(|(frontend_key, slot_index)| StoreCmd::SetRemove {
                key: dead_set_key(frontend_key),
                member: slot_index.to_string(),
            })
            .collect();
        self.store.exec_atomic(&cmds).await?;
        Ok(true)
    }

    /// Record `check`'s `(frontend, slot)` pair and re-arm any running prober
    pub async fn update_frontend_mapping(&self, check: &Check) {
        let mut inner = self.inner.lock().await;
        self.enter_mapping(&mut inner, check);
    }

    /// Mapped frontends for a backend; empty once everything was pruned
    pub async fn mapped_frontends(&self, backend_url: &str) -> Vec<String> {
        let inner = self.inner.lock().await;
        let mut frontends: Vec<String> = inner
            .mapping
            .get(backend_url)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        frontends.sort();
        frontends
    }

    fn sync_field(&self, backend_url: &str) -> String {
        format!("{};{}", backend_url, self.my_id)
    }

    /// `"<hostname>#<pid>;<unix-sec>.<unix-nanos>"`, unique per prober
    fn mint_signature(&self) -> String {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        format!("{};{}.{}", self.my_id, now.as_secs(), now.subsec_nanos())
    }

    fn enter_mapping(&self, inner: &mut CacheInner, check: &Check) {
        inner
            .mapping
            .entry(check.backend_url.clone())
            .or_default()
            .insert(check.frontend_key.clone(), check.slot_index);
        if let Some(tx) = inner.rearm.get(&check.backend_url) {
            // Single-slot, drop-on-full: at least one fresh check after the
            // most recent re-notification, not one per notification
            let _ = tx.try_send(());
        }
    }

    async fn release_locked(&self, inner: &mut CacheInner, check: &Check) -> Result<()> {
        inner.mapping.remove(&check.backend_url);
        inner.rearm.remove(&check.backend_url);
        self.store
            .hdel(
                &self.hash_key,
                &[
                    check.backend_url.clone(),
                    self.sync_field(&check.backend_url),
                ],
            )
            .await?;
        debug!("Released lock on {}", check.backend_url);
        Ok(())
    }

    /// Mapped entries for `check`'s backend that still match the proxy's
    /// frontend lists; stale entries are pruned in place
    async fn valid_entries(
        &self,
        inner: &mut CacheInner,
        check: &Check,
    ) -> Result<Vec<(String, usize)>> {
        let snapshot: Vec<(String, usize)> = inner
            .mapping
            .get(&check.backend_url)
            .map(|m| m.iter().map(|(k, v)| (k.clone(), *v)).collect())
            .unwrap_or_default();
        let mut valid = Vec::with_capacity(snapshot.len());
        for (frontend_key, slot_index) in snapshot {
            if self
                .check_backend_mapping(inner, check, &frontend_key, slot_index)
                .await?
            {
                valid.push((frontend_key, slot_index));
            }
        }
        valid.sort();
        Ok(valid)
    }

    /// Validate one `(frontend, slot)` pair against the proxy's list
    ///
    /// The element at `slot + 1` (index 0 is proxy metadata) must still be
    /// this backend's URL; otherwise the proxy has re-sharded the slot and
    /// flagging it would hit a different backend.
    async fn check_backend_mapping(
        &self,
        inner: &mut CacheInner,
        check: &Check,
        frontend_key: &str,
        slot_index: usize,
    ) -> Result<bool> {
        let list_key = frontend_list_key(frontend_key);
        let current = self
            .store
            .lindex(&list_key, slot_index as i64 + 1)
            .await?;
        if current.as_deref() == Some(check.backend_url.as_str()) {
            return Ok(true);
        }
        warn!(
            "Mapping {} slot {} no longer points at {}, pruning",
            frontend_key, slot_index, check.backend_url
        );
        if let Some(map) = inner.mapping.get_mut(&check.backend_url) {
            map.remove(frontend_key);
        }
        Ok(false)
    }
}

/// `dead:<frontendKey>`, the set of dead slot indices the proxy reads
pub fn dead_set_key(frontend_key: &str) -> String {
    format!("dead:{}", frontend_key)
}

/// `frontend:<frontendKey>`, the proxy-owned backend list
pub fn frontend_list_key(frontend_key: &str) -> String {
    format!("frontend:{}", frontend_key)
}
