//! Diagnostic tracing for the controller.
//!
//! Tracing output goes to stderr and is controlled by `RUST_LOG`. It is not
//! part of the run's product output: records, state and the final summary in
//! the run directory are always written, whatever the filter says.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the stderr subscriber. Defaults to `warn` when `RUST_LOG` is unset.
///
/// ```bash
/// RUST_LOG=checkloop=info checkloop run --goal "a red sneaker on a wet street"
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
