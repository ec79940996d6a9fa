//! Core functionality for the hchecker health checker
//!
//! This crate contains the coordination layer, the prober state machine, the
//! shared store client, and the supervisor that ties them together. The
//! daemon crate provides the CLI surface on top.

pub mod cache;
pub mod check;
pub mod config;
pub mod error;
pub mod probe;
pub mod prober;
pub mod store;
pub mod supervisor;


pub use cache::{Cache, Lease, LockOutcome};
pub use check::Check;
pub use config::CheckerConfig;
pub use error::{CheckerError, Result};
pub use probe::{HttpProbe, ProbeStatus, ProbeTransport};
pub use prober::{HealthEvents, Prober, ProberTimings};
pub use store::{MemoryStore, RedisStore, Store};
pub use supervisor::Supervisor;

/// Core utilities and helper functions
pub mod utils {
    use tracing::info;

    /// Initialize tracing for the application
    pub fn init_tracing(level: &str) -> crate::Result<()> {
        use tracing_subscriber::{fmt, EnvFilter};

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

        fmt()
            .with_env_filter(filter)
            .try_init()
            .map_err(|e| crate::CheckerError::Initialization(e.to_string()))?;

        info!("Tracing initialized with level: {}", level);
        Ok(())
    }

    /// `<hostname>#<pid>`, constant for the lifetime of the process
    pub fn process_identity() -> String {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string());
        format!("{}#{}", host, std::process::id())
    }
}
