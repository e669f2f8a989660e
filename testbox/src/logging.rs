use anyhow::{Context, Result, anyhow};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Installs the global subscriber writing to stderr.
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn init(default_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .with_context(|| format!("invalid log filter {default_level:?}"))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .map_err(|err| anyhow!("could not install the logger: {err}"))
}
