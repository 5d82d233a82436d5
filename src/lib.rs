//! Live order-book mirror for the Poloniex push feed.
//!
//! Consumes the multiplexed WebSocket feed (book snapshots, level diffs,
//! trade prints, heartbeats), maintains a depth-bounded book per tracked
//! pair, and supervises the connection: staleness detection, jittered
//! backoff, and a fresh snapshot with ordered replay after every
//! reconnect.

pub mod apply;
pub mod book;
pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod notify;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod sources;
pub mod transport;

pub use book::{LastTrade, LevelBook, PriceLevel, Side};
pub use config::FeedConfig;
pub use engine::{EngineHandle, EngineStopper, FeedEngine};
pub use error::FeedError;
pub use notify::{BookObserver, ChangeKind, ChangeNotification, Diagnostic, LifecycleObserver};
pub use registry::BookRegistry;
pub use session::SessionState;
pub use sources::{BookSides, RestClient, SnapshotSource, SourceError, SymbolMapSource};
pub use transport::{FeedSession, FeedTransport, SessionEvent, TransportError, WsTransport};
