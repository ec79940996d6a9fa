//! End-to-end scenarios over the in-memory store
//!
//! Each test wires a full supervisor (subscription, admission, probers,
//! beacon) against `MemoryStore` and a scripted probe transport, publishes
//! suspect notifications the way the proxy would, and asserts on the store
//! state the proxy would observe. The tokio clock is paused, so multi-minute
//! scenarios run instantly.

use async_trait::async_trait;
use hchecker_core::cache::{HASH_KEY, PING_KEY, SUSPECT_CHANNEL};
use hchecker_core::{
    Cache, CheckerConfig, MemoryStore, ProbeStatus, ProbeTransport, Supervisor,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Replays scripted outcomes, then repeats the fallback forever
struct ScriptedProbe {
    outcomes: Mutex<VecDeque<ProbeStatus>>,
    fallback: ProbeStatus,
}

impl ScriptedProbe {
    fn new(outcomes: Vec<ProbeStatus>, fallback: ProbeStatus) -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(outcomes.into()),
            fallback,
        })
    }
}

#[async_trait]
impl ProbeTransport for ScriptedProbe {
    async fn probe(&self, _backend_url: &str) -> ProbeStatus {
        self.outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

fn dead() -> ProbeStatus {
    ProbeStatus::Dead("HTTP error on http://b1: 500".to_string())
}

fn seed_frontend(store: &MemoryStore, frontend: &str, backends: &[&str]) {
    let key = format!("frontend:{}", frontend);
    store.push_list(&key, "meta");
    for backend in backends {
        store.push_list(&key, backend);
    }
}

/// Build a supervisor over `store`, start its subscription loop, and give
/// the loop a chance to register before anything is published
async fn start_supervisor(
    store: &MemoryStore,
    transport: Arc<ScriptedProbe>,
    config: CheckerConfig,
) -> Arc<Supervisor> {
    let cache = Arc::new(
        Cache::new(
            Arc::new(store.clone()),
            "host#1".to_string(),
            &config,
        )
        .await
        .unwrap(),
    );
    let supervisor = Arc::new(Supervisor::new(
        cache,
        Arc::new(store.clone()),
        transport,
        &config,
    ));
    let runner = supervisor.clone();
    tokio::spawn(async move {
        let _ = runner.run().await;
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    store.clear_ops();
    supervisor
}

#[tokio::test(start_paused = true)]
async fn test_suspect_goes_dead_then_recovers() {
    let store = MemoryStore::new();
    seed_frontend(&store, "svc", &["http://b1"]);
    // 500 at t=0, t=3, t=6, then 200 from t=9 on
    let transport = ScriptedProbe::new(vec![dead(), dead(), dead()], ProbeStatus::Alive);
    let supervisor = start_supervisor(&store, transport, CheckerConfig::default()).await;

    store.publish(SUSPECT_CHANNEL, "svc;http://b1;0;2");
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(supervisor.running_checkers(), 1);
    assert_eq!(store.set_members("dead:svc"), vec!["0".to_string()]);
    assert_eq!(store.ttl("dead:svc"), Some(60));
    let ops = store.ops();
    assert!(ops.contains(&"SADD dead:svc 0".to_string()), "{:?}", ops);
    assert!(ops.contains(&"EXPIRE dead:svc 60".to_string()), "{:?}", ops);

    // Recovery at t=9 clears the slot for the proxy
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(store.set_members("dead:svc").is_empty());
    assert!(store.ops().contains(&"SREM dead:svc 0".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_dead_marking_is_refreshed_within_ttl() {
    let store = MemoryStore::new();
    seed_frontend(&store, "svc", &["http://b1"]);
    let transport = ScriptedProbe::new(vec![], dead());
    let _supervisor = start_supervisor(&store, transport, CheckerConfig::default()).await;

    store.publish(SUSPECT_CHANNEL, "svc;http://b1;0;2");
    tokio::time::sleep(Duration::from_secs(35)).await;

    let sadds = store
        .ops()
        .iter()
        .filter(|op| op.as_str() == "SADD dead:svc 0")
        .count();
    assert_eq!(sadds, 2, "{:?}", store.ops());
}

#[tokio::test(start_paused = true)]
async fn test_singleton_notifications_produce_no_prober() {
    let store = MemoryStore::new();
    seed_frontend(&store, "single", &["http://b"]);
    let transport = ScriptedProbe::new(vec![], ProbeStatus::Alive);
    let supervisor = start_supervisor(&store, transport, CheckerConfig::default()).await;

    store.publish(SUSPECT_CHANNEL, "single;http://b;0;1");
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(supervisor.running_checkers(), 0);
    assert_eq!(store.hash_len(HASH_KEY), 0);
    assert!(store.ops().is_empty(), "{:?}", store.ops());
}

#[tokio::test(start_paused = true)]
async fn test_malformed_notifications_are_skipped() {
    let store = MemoryStore::new();
    let transport = ScriptedProbe::new(vec![], ProbeStatus::Alive);
    let supervisor = start_supervisor(&store, transport, CheckerConfig::default()).await;

    store.publish(SUSPECT_CHANNEL, "");
    store.publish(SUSPECT_CHANNEL, "svc;http://b1;0");
    store.publish(SUSPECT_CHANNEL, "svc;http://b1;first;2");
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(supervisor.running_checkers(), 0);
    assert!(store.ops().is_empty(), "{:?}", store.ops());
}

#[tokio::test(start_paused = true)]
async fn test_renotification_reaches_running_prober() {
    let store = MemoryStore::new();
    seed_frontend(&store, "svc", &["http://b1"]);
    seed_frontend(
        &store,
        "svc2",
        &["http://o1", "http://o2", "http://o3", "http://b1"],
    );
    let transport = ScriptedProbe::new(vec![], ProbeStatus::Alive);
    let supervisor = start_supervisor(&store, transport, CheckerConfig::default()).await;

    store.publish(SUSPECT_CHANNEL, "svc;http://b1;0;2");
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(supervisor.running_checkers(), 1);
    assert_eq!(store.set_members("dead:svc2"), Vec::<String>::new());

    // Same backend re-notified under a new frontend: the running prober is
    // re-armed and reports the still-dead/alive state for the new mapping
    store.publish(SUSPECT_CHANNEL, "svc2;http://b1;3;4");
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(supervisor.running_checkers(), 1);

    // No dead markings anywhere: the backend is alive and the re-armed tick
    // re-asserted that through an SREM on both frontends
    let ops = store.ops();
    assert!(ops.contains(&"SREM dead:svc2 3".to_string()), "{:?}", ops);
}

#[tokio::test(start_paused = true)]
async fn test_dry_run_never_mutates_proxy_state() {
    let store = MemoryStore::new();
    seed_frontend(&store, "svc", &["http://b1"]);
    let transport = ScriptedProbe::new(vec![], dead());
    let mut config = CheckerConfig::default();
    config.dry_run = true;
    let supervisor = start_supervisor(&store, transport, config).await;

    store.publish(SUSPECT_CHANNEL, "svc;http://b1;0;2");
    tokio::time::sleep(Duration::from_secs(45)).await;

    // The lock was taken so the trace is faithful, but nothing the proxy
    // reads was touched and no beacon was written
    assert_eq!(supervisor.running_checkers(), 1);
    let ops = store.ops();
    assert!(
        !ops.iter().any(|op| op.starts_with("SADD")
            || op.starts_with("SREM")
            || op.starts_with("EXPIRE")
            || op.starts_with("SET ")),
        "{:?}",
        ops
    );
    assert!(store.set_members("dead:svc").is_empty());
    assert_eq!(store.scalar(PING_KEY), None);
}

#[tokio::test(start_paused = true)]
async fn test_beacon_reports_liveness() {
    let store = MemoryStore::new();
    let transport = ScriptedProbe::new(vec![], ProbeStatus::Alive);
    let _supervisor = start_supervisor(&store, transport, CheckerConfig::default()).await;

    tokio::time::sleep(Duration::from_secs(25)).await;
    let ping = store.scalar(PING_KEY).expect("beacon must have been written");
    assert!(ping.parse::<u64>().is_ok(), "{:?}", ping);
}
