use std::sync::OnceLock;

use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Installs the global subscriber once per process. A subscriber installed by the host
/// (or a test harness) is left alone.
pub fn init_logging() {
    static INIT: OnceLock<bool> = OnceLock::new();
    INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let installed = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()
            .is_ok();
        if installed {
            tracing::debug!("logging initialised");
        }
        installed
    });
}
