//! Suspect ingestion and prober supervision
//!
//! The supervisor subscribes to the suspect channel, runs the admission
//! logic for every notification, and spawns one prober task per backend this
//! process manages to lock. It also maintains the operator-facing side
//! channels: a liveness beacon on the store and a periodic stats line.

use crate::cache::{Cache, LockOutcome, PING_KEY, SUSPECT_CHANNEL};
use crate::check::Check;
use crate::config::CheckerConfig;
use crate::probe::ProbeTransport;
use crate::prober::{HealthEvents, Prober, ProberTimings};
use crate::store::Store;
use crate::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Cadence of the `hchecker_ping` liveness beacon
const BEACON_INTERVAL: Duration = Duration::from_secs(10);
/// Cadence of the running-prober stats line
const STATS_INTERVAL: Duration = Duration::from_secs(60);

/// Owns the subscription loop and everything spawned from it
pub struct Supervisor {
    cache: Arc<Cache>,
    store: Arc<dyn Store>,
    transport: Arc<dyn ProbeTransport>,
    timings: ProberTimings,
    dry_run: bool,
    running: Arc<AtomicUsize>,
}

impl Supervisor {
    pub fn new(
        cache: Arc<Cache>,
        store: Arc<dyn Store>,
        transport: Arc<dyn ProbeTransport>,
        config: &CheckerConfig,
    ) -> Self {
        let timings = ProberTimings {
            check_interval: config.check_interval,
            ..ProberTimings::default()
        };
        Self {
            cache,
            store,
            transport,
            timings,
            dry_run: config.dry_run,
            running: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of probers currently running
    pub fn running_checkers(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Subscribe and ingest until the subscription ends
    ///
    /// The store client reconnects the subscription on its own; this only
    /// returns once the receiver is closed, which outside of tests means the
    /// process is going away.
    pub async fn run(&self) -> Result<()> {
        let mut notifications = self.store.subscribe(SUSPECT_CHANNEL).await?;
        self.spawn_beacon();
        self.spawn_stats();
        info!("Listening for suspects on {:?}", SUSPECT_CHANNEL);
        while let Some(line) = notifications.recv().await {
            self.ingest(&line).await;
        }
        Ok(())
    }

    /// Admission logic for one notification line
    pub async fn ingest(&self, line: &str) {
        let check: Check = match line.parse() {
            Ok(check) => check,
            Err(e) => {
                warn!("Ignoring suspect notification: {}", e);
                return;
            }
        };
        if !check.is_grouped() {
            // The frontend is not scaled out; there is nothing to fail over to
            debug!("Ignoring singleton group backend {}", check.backend_url);
            return;
        }
        match self.cache.lock_backend(&check).await {
            Err(e) => warn!("Lock attempt for {} failed: {}", check.backend_url, e),
            Ok(LockOutcome::ForeignOwner) => {
                debug!("{} is monitored by another process", check.backend_url);
            }
            Ok(LockOutcome::AlreadyOurs) => {
                debug!("{} already monitored here, prober re-armed", check.backend_url);
            }
            Ok(LockOutcome::Acquired(lease)) => {
                self.running.fetch_add(1, Ordering::SeqCst);
                let events = Arc::new(CacheEvents {
                    cache: self.cache.clone(),
                    check: check.clone(),
                    signature: lease.signature,
                    running: self.running.clone(),
                });
                let prober = Prober::new(
                    check.clone(),
                    self.transport.clone(),
                    events,
                    lease.rearm,
                    self.timings,
                );
                tokio::spawn(prober.run());
                info!("Added check for {}", check.backend_url);
            }
        }
    }

    /// Write `hchecker_ping = unix-now` every 10 s so an operator can watch
    /// checker freshness. Suppressed in dry-run.
    fn spawn_beacon(&self) {
        if self.dry_run {
            info!("dry-run: liveness beacon suppressed");
            return;
        }
        let store = self.store.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(BEACON_INTERVAL);
            loop {
                ticker.tick().await;
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs();
                if let Err(e) = store.set(PING_KEY, &now.to_string()).await {
                    warn!("Beacon write failed: {}", e);
                }
            }
        });
    }

    fn spawn_stats(&self) {
        let running = self.running.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(STATS_INTERVAL);
            loop {
                ticker.tick().await;
                info!(
                    "{} backend URLs are being tested",
                    running.load(Ordering::SeqCst)
                );
            }
        });
    }
}

/// Capability object binding prober events to the coordination layer
///
/// Store errors inside a callback are logged and swallowed: the mutation is
/// dropped and the next tick retries naturally, which together with the
/// dead-set TTL converges the shared state.
struct CacheEvents {
    cache: Arc<Cache>,
    check: Check,
    signature: String,
    running: Arc<AtomicUsize>,
}

#[async_trait]
impl HealthEvents for CacheEvents {
    async fn mark_dead(&self) -> bool {
        match self.cache.mark_backend_dead(&self.check).await {
            Ok(keep_going) => keep_going,
            Err(e) => {
                warn!("Dropping dead marking for {}: {}", self.check.backend_url, e);
                true
            }
        }
    }

    async fn mark_alive(&self) -> bool {
        match self.cache.mark_backend_alive(&self.check).await {
            Ok(keep_going) => keep_going,
            Err(e) => {
                warn!("Dropping alive marking for {}: {}", self.check.backend_url, e);
                true
            }
        }
    }

    async fn is_still_mine(&self) -> bool {
        match self
            .cache
            .is_unlocked_backend(&self.check, &self.signature)
            .await
        {
            Ok(unlocked) => !unlocked,
            Err(e) => {
                // Cannot confirm the loss; keep probing and retry later
                warn!("Lock check for {} failed: {}", self.check.backend_url, e);
                true
            }
        }
    }

    async fn on_exit(&self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
        if let Err(e) = self.cache.unlock_backend(&self.check).await {
            warn!("Unlock of {} failed: {}", self.check.backend_url, e);
        }
    }
}
