//! Error taxonomy shared across the crate.

use std::io;

use thiserror::Error;

/// Errors surfaced by managers, channels and the RPC adapter.
#[derive(Debug, Error)]
pub enum CastError {
    /// The caller violated the API contract. Never retried.
    #[error("bad parameter")]
    BadParam,
    /// The requested device, channel or table entry is not present.
    #[error("not found")]
    NotFound,
    /// The device has no address in the requested family.
    #[error("no address in requested family")]
    NoAddress,
    /// TCP/TLS connection establishment failed.
    #[error("connect to {addr} failed: {source}")]
    Dial {
        addr: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// Malformed frame or payload. Demoted to a warning inside read loops.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The discovery collaborator failed to start or browse.
    #[error("discovery error: {0}")]
    Discovery(String),
    /// A watchdog or per-call deadline expired.
    #[error("deadline exceeded")]
    DeadlineExceeded,
    /// Underlying socket failure. Timeouts are benign on read paths only.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    /// Aggregate of all failures collected during shutdown.
    #[error("shutdown failed: {}", join_errors(.0))]
    Shutdown(Vec<CastError>),
}

fn join_errors(errors: &[CastError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
