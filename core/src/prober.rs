//! Per-backend prober state machine
//!
//! One prober task runs per backend this process owns. It never touches the
//! shared store or the HTTP stack directly: probing goes through
//! [`ProbeTransport`](crate::probe::ProbeTransport) and every external
//! effect flows through the four-method [`HealthEvents`] capability bound by
//! the supervisor. Both are trivially faked in tests.

use crate::check::Check;
use crate::probe::{ProbeStatus, ProbeTransport};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// Interval between lock-loss and lifetime checks
pub const CHECK_BREAK_INTERVAL_SECS: u64 = 60;
/// A backend stable for this long stops being actively probed; the proxy
/// re-notifies if it misbehaves again
pub const CHECK_DURATION_SECS: u64 = 1800;
/// Re-assert a dead backend at this cadence, well inside the dead-set TTL
pub const DEAD_REFRESH_INTERVAL_SECS: u64 = 30;

/// Events a prober can signal without knowing about the coordination layer
///
/// `mark_dead` and `mark_alive` return false when there is nothing left to
/// watch for this backend; the prober then stops. `is_still_mine` returning
/// false means the lock was lost to another process.
#[async_trait]
pub trait HealthEvents: Send + Sync {
    async fn mark_dead(&self) -> bool;
    async fn mark_alive(&self) -> bool;
    async fn is_still_mine(&self) -> bool;
    async fn on_exit(&self);
}

/// Timing knobs of the prober loop
///
/// Only the probe cadence comes from the command line; the break, lifetime,
/// and refresh intervals are fixed in production and shrunk in tests.
#[derive(Debug, Clone, Copy)]
pub struct ProberTimings {
    pub check_interval: Duration,
    pub break_interval: Duration,
    pub check_duration: Duration,
    pub dead_refresh: Duration,
}

impl Default for ProberTimings {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(crate::config::DEFAULT_CHECK_INTERVAL_SECS),
            break_interval: Duration::from_secs(CHECK_BREAK_INTERVAL_SECS),
            check_duration: Duration::from_secs(CHECK_DURATION_SECS),
            dead_refresh: Duration::from_secs(DEAD_REFRESH_INTERVAL_SECS),
        }
    }
}

/// State machine probing one backend until it retires
pub struct Prober {
    check: Check,
    transport: Arc<dyn ProbeTransport>,
    events: Arc<dyn HealthEvents>,
    rearm: mpsc::Receiver<()>,
    timings: ProberTimings,
}

impl Prober {
    pub fn new(
        check: Check,
        transport: Arc<dyn ProbeTransport>,
        events: Arc<dyn HealthEvents>,
        rearm: mpsc::Receiver<()>,
        timings: ProberTimings,
    ) -> Self {
        Self {
            check,
            transport,
            events,
            rearm,
            timings,
        }
    }

    /// Probe until retirement; invokes the exit event exactly once
    pub async fn run(mut self) {
        let url = self.check.backend_url.clone();
        debug!("Prober started for {}", url);

        // The backend is assumed alive until the first probe says otherwise;
        // first_check forces the first outcome to be reported either way
        let mut status = true;
        let mut first_check = true;
        let mut last_dead_call: Option<Instant> = None;
        let mut last_state_change = Instant::now();
        let mut since_break = Duration::ZERO;

        loop {
            if self.rearm.try_recv().is_ok() {
                debug!("Re-armed, next outcome for {} reports as first check", url);
                first_check = true;
            }

            let outcome = self.transport.probe(&url).await;
            let new_status = outcome.is_alive();
            let mut keep_going = true;

            if new_status != status || first_check {
                last_state_change = Instant::now();
                if new_status {
                    if !first_check {
                        info!("{} is back online", url);
                    }
                    keep_going = self.events.mark_alive().await;
                    last_dead_call = None;
                } else {
                    if let ProbeStatus::Dead(reason) = &outcome {
                        warn!("{}", reason);
                    }
                    keep_going = self.events.mark_dead().await;
                    last_dead_call = Some(Instant::now());
                }
            } else if !new_status {
                // Still dead: re-assert before the dead-set TTL runs out
                if let Some(marked_at) = last_dead_call {
                    if marked_at.elapsed() >= self.timings.dead_refresh {
                        keep_going = self.events.mark_dead().await;
                        last_dead_call = Some(Instant::now());
                    }
                }
            }

            status = new_status;
            first_check = false;
            if !keep_going {
                info!("Nothing left to watch on {}, retiring", url);
                break;
            }

            sleep(self.timings.check_interval).await;
            since_break += self.timings.check_interval;
            if since_break >= self.timings.break_interval {
                if !self.events.is_still_mine().await {
                    info!("Lost the lock on {}, retiring", url);
                    break;
                }
                if last_state_change.elapsed() >= self.timings.check_duration {
                    info!("{} stable for {:?}, retiring", url, self.timings.check_duration);
                    break;
                }
                since_break = Duration::ZERO;
            }
        }

        self.events.on_exit().await;
        debug!("Prober finished for {}", url);
    }
}
