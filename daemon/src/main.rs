//! hchecker daemon binary
//!
//! Wires the CLI surface to the core: connects the shared store, builds the
//! coordination layer and the HTTP probe transport, and runs the supervisor
//! until interrupted.

use clap::Parser;
use hchecker_core::utils;
use hchecker_core::{Cache, CheckerConfig, CheckerError, HttpProbe, RedisStore, Supervisor};
use hchecker_core::config;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// CPU profile written on shutdown when profiling is enabled
const PROFILE_PATH: &str = "hchecker.prof";

/// Active health checker for a horizontally-sharded reverse proxy
#[derive(Parser, Debug)]
#[command(name = "hchecker", version, about = "Probes suspect backends and flags dead ones on the shared store")]
struct Args {
    /// HTTP method used for each probe
    #[arg(long, default_value = config::DEFAULT_HTTP_METHOD)]
    method: String,

    /// Request path probed on each backend; empty keeps the backend's own path
    #[arg(long, default_value = config::DEFAULT_PROBE_URI)]
    uri: String,

    /// Host header sent with each probe; empty sends the backend's authority
    #[arg(long, default_value = config::DEFAULT_PROBE_HOST)]
    host: String,

    /// User-Agent header sent with each probe
    #[arg(long, default_value = config::DEFAULT_USER_AGENT)]
    agent: String,

    /// Check interval (seconds)
    #[arg(long, default_value_t = config::DEFAULT_CHECK_INTERVAL_SECS)]
    interval: u64,

    /// TCP connection timeout (seconds)
    #[arg(long, default_value_t = config::DEFAULT_CONNECT_TIMEOUT_SECS)]
    connect: u64,

    /// Socket read/write timeout (seconds)
    #[arg(long, default_value_t = config::DEFAULT_IO_TIMEOUT_SECS)]
    io: u64,

    /// Network address of Redis
    #[arg(long, default_value = config::DEFAULT_REDIS_ADDRESS)]
    redis: String,

    /// Store key suffix isolating this checker fleet
    #[arg(long, default_value = "")]
    suffix: String,

    /// Write a CPU profile to hchecker.prof on exit
    #[arg(long)]
    cpuprofile: bool,

    /// Log would-be transitions without mutating the store
    #[arg(long)]
    dryrun: bool,
}

impl Args {
    fn to_config(&self) -> CheckerConfig {
        CheckerConfig {
            http_method: self.method.clone(),
            probe_uri: self.uri.clone(),
            probe_host: self.host.clone(),
            user_agent: self.agent.clone(),
            check_interval: Duration::from_secs(self.interval),
            connect_timeout: Duration::from_secs(self.connect),
            io_timeout: Duration::from_secs(self.io),
            redis_address: self.redis.clone(),
            key_suffix: self.suffix.clone(),
            dry_run: self.dryrun,
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(e) = run(args).await {
        eprintln!("hchecker: {}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> hchecker_core::Result<()> {
    utils::init_tracing("info")?;
    let config = args.to_config();
    config.validate()?;

    let my_id = utils::process_identity();
    info!(
        "Starting hchecker {} as {}",
        env!("CARGO_PKG_VERSION"),
        my_id
    );
    if config.dry_run {
        info!("Dry-run: store mutations will be logged, not executed");
    }

    let profiler = if args.cpuprofile {
        match pprof::ProfilerGuard::new(100) {
            Ok(guard) => Some(guard),
            Err(e) => {
                warn!("Cannot start CPU profiler: {}", e);
                None
            }
        }
    } else {
        None
    };

    // The store is the one dependency the checker refuses to run without
    let store = Arc::new(RedisStore::connect(&config.redis_address).await?);
    let cache = Arc::new(Cache::new(store.clone(), my_id, &config).await?);
    let transport = Arc::new(HttpProbe::new(&config)?);
    let supervisor = Supervisor::new(cache, store, transport, &config);

    let outcome = tokio::select! {
        result = supervisor.run() => {
            // The subscription loop reconnects on its own; reaching this
            // point at all is fatal
            result.and(Err(CheckerError::SubscriptionClosed))
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupt received, shutting down");
            Ok(())
        }
    };

    if let Some(guard) = profiler {
        match write_profile(&guard) {
            Ok(()) => info!("CPU profile written to {}", PROFILE_PATH),
            Err(e) => warn!("Cannot write CPU profile: {}", e),
        }
    }

    outcome
}

fn write_profile(
    guard: &pprof::ProfilerGuard<'_>,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let report = guard.report().build()?;
    let file = std::fs::File::create(PROFILE_PATH)?;
    report.flamegraph(file)?;
    Ok(())
}
