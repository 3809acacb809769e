use anyhow::Result;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::reload;

pub type LogHandle = reload::Handle<EnvFilter, tracing_subscriber::Registry>;

/// Initialize JSON logging with a reloadable level filter.
///
/// `RUST_LOG` wins when set; otherwise `log_level` (default "info") seeds
/// the filter. Returns the handle for runtime level changes.
pub fn init_tracing(log_level: Option<&str>) -> Result<LogHandle> {
    let level = log_level.unwrap_or("info");
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter_layer, handle) = reload::Layer::new(filter);
    let fmt_layer = fmt::layer().json().with_target(true);
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to init tracing: {e}"))?;
    Ok(handle)
}

/// Swap the active level filter.
pub fn set_log_level(handle: &LogHandle, level: &str) -> Result<()> {
    let filter =
        EnvFilter::try_new(level).map_err(|e| anyhow::anyhow!("invalid log level {level}: {e}"))?;
    handle
        .modify(|f| *f = filter)
        .map_err(|e| anyhow::anyhow!("failed to apply log level: {e}"))?;
    Ok(())
}
