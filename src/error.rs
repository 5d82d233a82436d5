//! Errors that cross the engine boundary.
//!
//! Per-event failures stay close to their modules and surface as
//! diagnostics instead: `ParseError` in `protocol`, `BookError` in
//! `book`, `TransportError` in `transport`, `SourceError` in `sources`.
//! Transport and snapshot failures are always recovered by the reconnect
//! and retry policies, so they never appear here.

use thiserror::Error;

use crate::sources::SourceError;

/// Startup-time and terminal engine failures.
#[derive(Debug, Error)]
pub enum FeedError {
    /// The code-to-symbol map could not be fetched or is missing a
    /// configured symbol. Nothing can be routed without it.
    #[error("symbol map fetch failed: {0}")]
    SymbolMap(SourceError),
    /// Consecutive reconnects exhausted the configured budget.
    #[error("reconnect attempts exhausted after {attempts}")]
    RetriesExhausted { attempts: u32 },
    /// The engine task itself died.
    #[error("engine task failed: {0}")]
    Worker(String),
}
