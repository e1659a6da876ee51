//! Tracing setup for hosts that want the engine's diagnostics on stderr.
//!
//! Library code only emits through `tracing`; initializing a subscriber is
//! the host's call. `init()` installs a sensible default honoring
//! `RUST_LOG`, once, with span traces attached to errors.

use std::sync::Once;
use tracing_error::ErrorLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

static INIT: Once = Once::new();

/// Install the default subscriber (env-filtered, compact fmt, span-trace
/// capture). Safe to call more than once; later calls are no-ops.
pub fn init() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("rvbbit=info"));
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .with(ErrorLayer::default())
            .try_init();
    });
}
