//! Change notifications, diagnostics, and observer seams.
//!
//! The engine calls observers synchronously from its processing task, in
//! the exact order mutations were applied. Implementations must return
//! quickly; anything slow belongs behind a channel on the consumer side.

use chrono::{DateTime, Utc};

use crate::book::{BookError, LastTrade, PriceLevel, Side};
use crate::protocol::ParseError;
use crate::transport::TransportError;

/// What changed in a book.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeKind {
    /// One side mutated. Carries a copy of the full visible side, best
    /// level first, so consumers can mirror without holding the book.
    Levels {
        side: Side,
        levels: Vec<PriceLevel>,
    },
    /// A fresh trade print.
    Trade { side: Side, trade: LastTrade },
    /// A snapshot replaced the whole book; both sides attached.
    SnapshotApplied {
        bids: Vec<PriceLevel>,
        asks: Vec<PriceLevel>,
    },
}

/// Emitted for every mutation that altered visible book state. Mutations
/// that change nothing (duplicate trades, re-upserts of identical levels,
/// removals of untracked prices) emit nothing.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeNotification {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub kind: ChangeKind,
}

/// Non-fatal conditions surfaced alongside the change stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Diagnostic {
    /// Data frame for a channel code outside the tracked set.
    UnknownChannel { channel: u64 },
    /// Frame or tuple that failed to decode. `channel` is `None` when the
    /// whole frame was undecodable.
    MalformedEvent {
        channel: Option<u64>,
        error: ParseError,
    },
    /// Level update the book rejected.
    InvalidLevel { symbol: String, error: BookError },
    /// Error payload reported by the feed itself.
    FeedError { message: String },
    /// Snapshot fetch failed; a retry is already scheduled.
    SnapshotFetchFailed { symbol: String, error: String },
    /// Trade print whose exchange timestamp trails local time.
    TradeLagging { symbol: String, lag_secs: i64 },
}

/// Receives book changes and diagnostics.
pub trait BookObserver: Send + Sync {
    fn on_change(&self, change: &ChangeNotification);
    fn on_diagnostic(&self, _diagnostic: &Diagnostic) {}
}

/// Session lifecycle callbacks.
pub trait LifecycleObserver: Send + Sync {
    fn on_connect(&self) {}
    fn on_disconnect(&self) {}
    fn on_connect_error(&self, _error: &TransportError) {}
    fn on_reconnect(&self) {}
}

/// Discards everything; the default when a caller wants no callbacks.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl BookObserver for NoopObserver {
    fn on_change(&self, _change: &ChangeNotification) {}
}

impl LifecycleObserver for NoopObserver {}
