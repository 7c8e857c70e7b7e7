//! Ready-made subscriber for binaries embedding the engine.
//!
//! Rule spans carry progress bars, so the fmt layer writes through the
//! indicatif layer to keep log lines from tearing the bars.

use tracing::dispatcher::SetGlobalDefaultError;
use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

const DEFAULT_FILTER: &str = "info,tsumugi=info";

/// Installs a global subscriber with progress bars for request and rule
/// spans. The filter is read from `RUST_LOG`, falling back to `info`.
///
/// Calling this more than once returns an error and keeps the first
/// subscriber.
pub fn init_logging() -> Result<(), SetGlobalDefaultError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let indicatif = IndicatifLayer::new();

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(indicatif.get_stderr_writer()))
        .with(indicatif);

    tracing::subscriber::set_global_default(subscriber)
}
