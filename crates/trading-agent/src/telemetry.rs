use anyhow::Result;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber. `RUST_LOG` sets the filter (default `info`);
/// `RUST_LOG_FORMAT=json` switches to JSON lines.
///
/// Fails if a subscriber is already installed.
pub fn init_tracing() -> Result<()> {
    let json_logging = std::env::var("RUST_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter())
            .try_init()
            .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {}", e))?;
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter())
            .try_init()
            .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {}", e))?;
    }

    Ok(())
}
