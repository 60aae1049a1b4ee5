//! ## flowmem-telemetry::logging
//! **`tracing` subscriber setup**
//!
//! `RUST_LOG` wins when set; otherwise the configured filter applies.

use tracing::info_span;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Clone)]
pub struct EventLogger;

impl EventLogger {
    /// Installs the global fmt subscriber. Fails if one is already set.
    pub fn init(default_filter: &str) -> Result<(), TryInitError> {
        use tracing_subscriber::layer::SubscriberExt;
        use tracing_subscriber::util::SubscriberInitExt;

        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(default_filter))
            .unwrap_or_else(|_| EnvFilter::new("info"));
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true))
            .with(filter)
            .try_init()
    }

    /// One usage snapshot of an allocator instance.
    #[inline]
    pub fn log_usage(component: &str, used: u64, max: u64) {
        let _span = info_span!("usage", component).entered();
        tracing::info!(used, max, "allocator usage");
    }
}
