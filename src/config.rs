//! Process configuration: CLI flags (with environment-variable overrides)
//! for the two listener addresses and the aggregator's bucketing tunables.

use std::net::SocketAddr;

use clap::Parser;

use crate::error::ConfigError;

/// Service-dependency aggregator — ingests OTLP traces and serves the
/// inferred call graph over REST and WebSocket.
#[derive(Parser, Debug, Clone)]
#[command(name = "depviz-server", about = "OTLP service-dependency aggregator")]
pub struct Args {
    /// OTLP gRPC bind address.
    #[arg(long, env = "DEPVIZ_OTLP_ADDR", default_value = "[::]:4317")]
    pub otlp_addr: String,

    /// HTTP / WebSocket bind address.
    #[arg(long, env = "DEPVIZ_HTTP_ADDR", default_value = "0.0.0.0:8000")]
    pub http_addr: String,

    /// Width of one aggregation bucket, in seconds.
    #[arg(long, env = "DEPVIZ_WINDOW_SEC", default_value_t = 10)]
    pub window_sec: i64,

    /// Maximum number of buckets kept resident (retention horizon =
    /// `window_sec * retention_buckets`).
    #[arg(long, env = "DEPVIZ_RETENTION_BUCKETS", default_value_t = 360)]
    pub retention_buckets: usize,
}

impl Args {
    /// Validates both bind addresses up front so a typo'd flag or env
    /// override fails fast with a clear error instead of surfacing as an
    /// opaque bind failure after the other server has already started.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.parse_addr(&self.otlp_addr)?;
        self.parse_addr(&self.http_addr)?;
        Ok(())
    }

    fn parse_addr(&self, addr: &str) -> Result<SocketAddr, ConfigError> {
        addr.parse().map_err(|source| ConfigError::InvalidAddr {
            addr: addr.to_string(),
            source,
        })
    }
}
