//! Tracing setup. stdout carries JSON-RPC, so every log line goes to stderr.

use anyhow::{anyhow, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "fabric_gateway=info";
const VERBOSE_LOG_FILTER: &str = "fabric_gateway=debug";

/// `RUST_LOG` wins when set; otherwise info, or debug with `verbose`.
pub fn env_filter(verbose: bool) -> EnvFilter {
    let fallback = if verbose { VERBOSE_LOG_FILTER } else { DEFAULT_LOG_FILTER };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback))
}

pub fn init_logging(verbose: bool) -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(false)
                .with_target(false)
                .with_filter(env_filter(verbose)),
        )
        .try_init()
        .map_err(|e| anyhow!("failed to install tracing subscriber: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbose_raises_default_level() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        assert_eq!(env_filter(false).to_string(), DEFAULT_LOG_FILTER);
        assert_eq!(env_filter(true).to_string(), VERBOSE_LOG_FILTER);
    }
}
