//! Tracing / logging initialisation helper.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LogLevel;

/// Install a `tracing` subscriber honoring the configured level.
///
/// `RUST_LOG` takes precedence when set. `Indexer::start()` calls this
/// with the configured `log_level`; a subscriber the application already
/// installed wins — this is then a no-op. Returns `true` if the
/// subscriber was installed by this call.
pub fn init_tracing(level: LogLevel) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init()
        .is_ok()
}
