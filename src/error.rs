//! Named error type for the crate's few fallible startup paths. Everything
//! past startup (decoding, ingest, snapshotting) is deliberately infallible —
//! see the module docs on `aggregator` and `otlp`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid bind address {addr:?}: {source}")]
    InvalidAddr {
        addr: String,
        #[source]
        source: std::net::AddrParseError,
    },
}
