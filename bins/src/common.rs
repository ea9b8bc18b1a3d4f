//! Common utilities shared by `oms-engine` and `oms-admin`.
//!
//! Logging setup and the Redis connection URL builder live here so both
//! binaries construct them identically.

use anyhow::Result;
use oms_core::config::RedisConfig;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Shared CLI arguments for both binaries.
#[derive(clap::Parser, Debug)]
#[command(author, version, about)]
pub struct CommonArgs {
    /// Config profile to load (`development`, `testing`, `production`).
    /// Defaults to `$OMS_PROFILE`, then `development`.
    #[arg(long)]
    pub profile: Option<String>,

    /// Log level, overridden by `RUST_LOG` if set.
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON instead of the human-readable format.
    #[arg(long)]
    pub json_logs: bool,
}

/// Initialize the global tracing subscriber. `RUST_LOG` takes precedence
/// over `level` when present.
pub fn init_logging(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;

    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_target(true))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(false))
            .with(filter)
            .init();
    }

    Ok(())
}

/// Builds a `redis://` connection URL from the config's `hosts`/`password`/`db`.
/// Only the first host is dialed (see [`RedisConfig`]'s doc comment on why
/// the field is plural).
pub fn redis_url(config: &RedisConfig) -> Result<String> {
    let host = config
        .hosts
        .first()
        .ok_or_else(|| anyhow::anyhow!("redis.hosts must contain at least one host:port"))?;

    Ok(match &config.password {
        Some(password) => format!("redis://:{password}@{host}/{}", config.db),
        None => format!("redis://{host}/{}", config.db),
    })
}
