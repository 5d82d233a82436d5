//! Feed engine: composition and the supervisor run loop.
//!
//! One spawned task owns the registry, the session tracker, and the live
//! transport session; every book mutation and state transition happens on
//! it, so books need no locks and observers see mutations in arrival
//! order. Snapshot fetches are the only side work, spawned per symbol and
//! reporting back through a channel into the same `select!` loop.
//!
//! Sync protocol, per symbol and per connection:
//! 1. going live starts a snapshot fetch and marks the symbol syncing
//! 2. while syncing, decoded events buffer in arrival order (including
//!    any in-band snapshot, which simply applies during replay)
//! 3. the fetched snapshot applies, then the buffer replays on top
//! 4. every result carries the connection generation and a per-symbol
//!    fetch token; a result from a previous epoch or a superseded fetch
//!    is discarded, so a stale snapshot can never clobber a fresh book

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::apply::{ApplyOutcome, EventApplier};
use crate::config::FeedConfig;
use crate::error::FeedError;
use crate::metrics::FeedMetrics;
use crate::notify::{
    BookObserver, ChangeKind, ChangeNotification, Diagnostic, LifecycleObserver, NoopObserver,
};
use crate::protocol::{self, BookEvent, FeedMessage, ParseError};
use crate::registry::BookRegistry;
use crate::session::{
    BackoffPolicy, LivenessClock, SessionState, SessionTracker, TransitionReason,
};
use crate::sources::{BookSides, SnapshotSource, SourceError, SymbolMapSource};
use crate::transport::{FeedTransport, SessionEvent, TransportError};

// ============================================================================
// ENGINE
// ============================================================================

/// Composes transport, parser, applier, sources, and the supervisor.
pub struct FeedEngine {
    config: FeedConfig,
    transport: Arc<dyn FeedTransport>,
    snapshots: Arc<dyn SnapshotSource>,
    symbol_map: Arc<dyn SymbolMapSource>,
    book_observer: Arc<dyn BookObserver>,
    lifecycle: Arc<dyn LifecycleObserver>,
}

impl FeedEngine {
    pub fn new(
        config: FeedConfig,
        transport: Arc<dyn FeedTransport>,
        snapshots: Arc<dyn SnapshotSource>,
        symbol_map: Arc<dyn SymbolMapSource>,
    ) -> Self {
        Self {
            config,
            transport,
            snapshots,
            symbol_map,
            book_observer: Arc::new(NoopObserver),
            lifecycle: Arc::new(NoopObserver),
        }
    }

    pub fn with_book_observer(mut self, observer: Arc<dyn BookObserver>) -> Self {
        self.book_observer = observer;
        self
    }

    pub fn with_lifecycle_observer(mut self, observer: Arc<dyn LifecycleObserver>) -> Self {
        self.lifecycle = observer;
        self
    }

    /// Fetches the symbol map, builds the registry, and spawns the run
    /// loop. Fails fast if the map is unavailable or a configured symbol
    /// has no channel code.
    pub async fn start(self) -> Result<EngineHandle, FeedError> {
        let map = self
            .symbol_map
            .fetch_symbol_map()
            .await
            .map_err(FeedError::SymbolMap)?;
        let entries = select_tracked(&map, &self.config.symbols)?;
        let registry = BookRegistry::new(entries, self.config.depth);
        info!(
            symbols = registry.len(),
            depth = self.config.depth,
            "registry built"
        );

        let tracker = Arc::new(SessionTracker::new());
        let metrics = Arc::new(FeedMetrics::new());
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let (snapshot_tx, snapshot_rx) = mpsc::channel(64);

        let backoff = BackoffPolicy::new(
            self.config.backoff_base(),
            self.config.backoff_max(),
            self.config.backoff_jitter,
        );
        let applier = EventApplier::new(self.config.trade_lag_threshold_secs);
        let sync = self
            .config
            .symbols
            .iter()
            .map(|s| (s.clone(), SyncStatus::new()))
            .collect();

        let worker = FeedWorker {
            config: self.config,
            transport: self.transport,
            snapshots: self.snapshots,
            registry,
            applier,
            tracker: Arc::clone(&tracker),
            metrics: Arc::clone(&metrics),
            book_observer: self.book_observer,
            lifecycle: self.lifecycle,
            sync,
            snapshot_tx,
            backoff,
        };
        let join = tokio::spawn(worker.run(cmd_rx, snapshot_rx));

        Ok(EngineHandle {
            cmd_tx,
            tracker,
            metrics,
            join,
        })
    }
}

fn select_tracked(
    map: &HashMap<u64, String>,
    symbols: &[String],
) -> Result<Vec<(u64, String)>, FeedError> {
    let mut entries = Vec::with_capacity(symbols.len());
    for symbol in symbols {
        let code = map
            .iter()
            .find(|(_, mapped)| *mapped == symbol)
            .map(|(code, _)| *code);
        match code {
            Some(code) => entries.push((code, symbol.clone())),
            None => {
                return Err(FeedError::SymbolMap(SourceError::MissingSymbol(
                    symbol.clone(),
                )))
            }
        }
    }
    Ok(entries)
}

// ============================================================================
// HANDLE
// ============================================================================

/// Control handle for a running engine. Dropping it without `stop` also
/// stops the engine once the command channel closes.
pub struct EngineHandle {
    cmd_tx: mpsc::Sender<EngineCommand>,
    tracker: Arc<SessionTracker>,
    metrics: Arc<FeedMetrics>,
    join: JoinHandle<Result<(), FeedError>>,
}

impl EngineHandle {
    /// Requests shutdown. Valid from any state; the transport closes and
    /// no reconnect follows.
    pub async fn stop(&self) {
        let _ = self.cmd_tx.send(EngineCommand::Stop).await;
    }

    /// Waits for the run loop to exit and returns its terminal outcome.
    pub async fn join(self) -> Result<(), FeedError> {
        let EngineHandle { cmd_tx, join, .. } = self;
        let result = match join.await {
            Ok(result) => result,
            Err(e) => Err(FeedError::Worker(e.to_string())),
        };
        drop(cmd_tx);
        result
    }

    /// Stop, then wait for the loop to wind down.
    pub async fn shutdown(self) -> Result<(), FeedError> {
        self.stop().await;
        self.join().await
    }

    /// Cheap clone that can stop the engine from another task.
    pub fn stopper(&self) -> EngineStopper {
        EngineStopper {
            cmd_tx: self.cmd_tx.clone(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.tracker.state()
    }

    pub fn needs_resync(&self) -> bool {
        self.tracker.needs_resync()
    }

    pub fn metrics(&self) -> &FeedMetrics {
        &self.metrics
    }
}

/// Detached stop switch, for signal handlers.
#[derive(Clone)]
pub struct EngineStopper {
    cmd_tx: mpsc::Sender<EngineCommand>,
}

impl EngineStopper {
    pub async fn stop(&self) {
        let _ = self.cmd_tx.send(EngineCommand::Stop).await;
    }
}

#[derive(Debug)]
enum EngineCommand {
    Stop,
}

// ============================================================================
// RUN LOOP
// ============================================================================

/// Per-symbol sync status within the current connection epoch.
enum SyncStatus {
    /// Snapshot in flight; events buffer in arrival order. Only the
    /// result carrying the latest `fetch_token` may complete the sync.
    Syncing {
        buffered: Vec<BookEvent>,
        fetch_attempts: u32,
        fetch_token: u64,
    },
    /// Snapshot applied; events apply directly.
    Current,
}

impl SyncStatus {
    fn new() -> Self {
        SyncStatus::Syncing {
            buffered: Vec::new(),
            fetch_attempts: 0,
            fetch_token: 0,
        }
    }
}

struct SnapshotResult {
    generation: u64,
    token: u64,
    symbol: String,
    outcome: Result<BookSides, SourceError>,
}

enum SessionExit {
    Stopped,
    Lost(TransitionReason),
}

struct FeedWorker {
    config: FeedConfig,
    transport: Arc<dyn FeedTransport>,
    snapshots: Arc<dyn SnapshotSource>,
    registry: BookRegistry,
    applier: EventApplier,
    tracker: Arc<SessionTracker>,
    metrics: Arc<FeedMetrics>,
    book_observer: Arc<dyn BookObserver>,
    lifecycle: Arc<dyn LifecycleObserver>,
    sync: HashMap<String, SyncStatus>,
    snapshot_tx: mpsc::Sender<SnapshotResult>,
    backoff: BackoffPolicy,
}

impl FeedWorker {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<EngineCommand>,
        mut snapshot_rx: mpsc::Receiver<SnapshotResult>,
    ) -> Result<(), FeedError> {
        let mut connect_reason = TransitionReason::StartRequested;
        loop {
            self.tracker
                .transition(SessionState::Connecting, connect_reason);

            match self.run_session(&mut cmd_rx, &mut snapshot_rx).await {
                SessionExit::Stopped => {
                    self.tracker
                        .transition(SessionState::Disconnected, TransitionReason::StopRequested);
                    info!(metrics = %self.metrics.summary(), "engine stopped");
                    return Ok(());
                }
                SessionExit::Lost(reason) => {
                    self.tracker.transition(SessionState::Stale, reason);
                    self.tracker.set_needs_resync(true);
                    self.metrics.record_reconnect();

                    if self.config.max_reconnect_attempts > 0
                        && self.backoff.attempt() >= self.config.max_reconnect_attempts
                    {
                        let attempts = self.backoff.attempt();
                        self.tracker.transition(
                            SessionState::Disconnected,
                            TransitionReason::RetriesExhausted,
                        );
                        warn!(attempts, metrics = %self.metrics.summary(), "reconnect attempts exhausted");
                        return Err(FeedError::RetriesExhausted { attempts });
                    }

                    info!(metrics = %self.metrics.summary(), "session metrics");
                    let delay = self.backoff.next_delay();
                    self.tracker.transition(SessionState::Reconnecting, reason);
                    info!(
                        delay_ms = delay.as_millis() as u64,
                        attempt = self.backoff.attempt(),
                        "reconnect scheduled"
                    );
                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = cmd_rx.recv() => {
                            self.tracker.transition(
                                SessionState::Disconnected,
                                TransitionReason::StopRequested,
                            );
                            info!(metrics = %self.metrics.summary(), "engine stopped");
                            return Ok(());
                        }
                    }
                    connect_reason = TransitionReason::BackoffElapsed;
                }
            }
        }
    }

    /// One connection from dial to teardown.
    async fn run_session(
        &mut self,
        cmd_rx: &mut mpsc::Receiver<EngineCommand>,
        snapshot_rx: &mut mpsc::Receiver<SnapshotResult>,
    ) -> SessionExit {
        let url = self.config.ws_url.clone();
        let connect_timeout = self.config.connect_timeout();
        let transport = Arc::clone(&self.transport);
        let dial = async {
            match tokio::time::timeout(connect_timeout, transport.connect(&url)).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Connect(format!(
                    "timed out after {}ms",
                    connect_timeout.as_millis()
                ))),
            }
        };
        let mut session = tokio::select! {
            result = dial => match result {
                Ok(session) => session,
                Err(error) => {
                    warn!(%error, url = %self.config.ws_url, "connect failed");
                    self.lifecycle.on_connect_error(&error);
                    return SessionExit::Lost(TransitionReason::TransportFailed);
                }
            },
            _ = cmd_rx.recv() => return SessionExit::Stopped,
        };

        let generation = self.tracker.bump_generation();
        info!(url = %self.config.ws_url, generation, "feed connected");
        self.lifecycle.on_connect();
        if generation > 1 {
            self.lifecycle.on_reconnect();
        }

        self.tracker
            .transition(SessionState::Subscribing, TransitionReason::TransportOpen);
        for symbol in self.config.symbols.clone() {
            if let Err(error) = session.send(protocol::subscribe_command(&symbol)).await {
                warn!(symbol = %symbol, %error, "subscribe failed");
                session.close().await;
                self.lifecycle.on_disconnect();
                return SessionExit::Lost(TransitionReason::TransportFailed);
            }
        }

        // The feed never acks subscriptions: live as soon as the commands
        // are flushed, with snapshots fetched out of band from here.
        self.tracker
            .transition(SessionState::Live, TransitionReason::SubscribeFlushed);
        self.backoff.reset();
        self.start_sync_cycle(generation);

        let mut liveness = LivenessClock::new(self.config.liveness_timeout());
        loop {
            let deadline = tokio::time::Instant::from_std(liveness.deadline());
            tokio::select! {
                event = session.next_event() => match event {
                    SessionEvent::Message(text) => {
                        liveness.touch();
                        self.metrics.record_message();
                        self.handle_frame(&text, generation);
                    }
                    SessionEvent::Closed => {
                        info!("feed closed the connection");
                        self.lifecycle.on_disconnect();
                        return SessionExit::Lost(TransitionReason::TransportClosed);
                    }
                    SessionEvent::Failed(error) => {
                        warn!(%error, "transport failed");
                        self.lifecycle.on_disconnect();
                        return SessionExit::Lost(TransitionReason::TransportFailed);
                    }
                },
                Some(result) = snapshot_rx.recv() => {
                    self.handle_snapshot_result(result, generation);
                }
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(
                        idle_ms = liveness.idle().as_millis() as u64,
                        "no frames within the liveness window"
                    );
                    session.close().await;
                    self.lifecycle.on_disconnect();
                    return SessionExit::Lost(TransitionReason::LivenessTimeout);
                }
                _ = cmd_rx.recv() => {
                    session.close().await;
                    self.lifecycle.on_disconnect();
                    return SessionExit::Stopped;
                }
            }
        }
    }

    /// Marks every symbol syncing and starts its snapshot fetch.
    fn start_sync_cycle(&mut self, generation: u64) {
        self.tracker.set_needs_resync(true);
        for symbol in self.config.symbols.clone() {
            self.sync.insert(symbol.clone(), SyncStatus::new());
            let token = self.next_fetch_token(&symbol);
            self.spawn_fetch(symbol, generation, token, Duration::ZERO);
        }
    }

    /// Advances the symbol's fetch token. Any fetch still in flight for
    /// the symbol is retired: its result no longer matches.
    fn next_fetch_token(&mut self, symbol: &str) -> u64 {
        match self.sync.get_mut(symbol) {
            Some(SyncStatus::Syncing { fetch_token, .. }) => {
                *fetch_token += 1;
                *fetch_token
            }
            _ => 0,
        }
    }

    fn spawn_fetch(&self, symbol: String, generation: u64, token: u64, delay: Duration) {
        let snapshots = Arc::clone(&self.snapshots);
        let tx = self.snapshot_tx.clone();
        let depth = self.config.depth;
        tokio::spawn(async move {
            if !delay.is_zero() {
                sleep(delay).await;
            }
            let outcome = snapshots.fetch_snapshot(&symbol, depth).await;
            let _ = tx
                .send(SnapshotResult {
                    generation,
                    token,
                    symbol,
                    outcome,
                })
                .await;
        });
    }

    fn handle_frame(&mut self, raw: &str, generation: u64) {
        let message = match protocol::parse_message(raw) {
            Ok(message) => message,
            Err(error) => {
                warn!(%error, "dropping undecodable frame");
                self.emit(ApplyOutcome::Diagnostic(Diagnostic::MalformedEvent {
                    channel: None,
                    error,
                }));
                return;
            }
        };
        match message {
            // Liveness was re-armed on receipt; nothing else to do.
            FeedMessage::Heartbeat => {
                self.metrics.record_heartbeat();
            }
            FeedMessage::FeedError(message) => {
                warn!(feed_error = %message, "feed reported an error");
                self.emit(ApplyOutcome::Diagnostic(Diagnostic::FeedError { message }));
            }
            FeedMessage::Batch {
                channel,
                sequence,
                events,
            } => {
                self.handle_batch(channel, sequence, events, generation);
            }
        }
    }

    fn handle_batch(
        &mut self,
        channel: u64,
        sequence: Option<u64>,
        events: Vec<Result<BookEvent, ParseError>>,
        generation: u64,
    ) {
        let Some(symbol) = self.registry.resolve(channel).map(str::to_string) else {
            debug!(channel, "frame for unmapped channel dropped");
            self.emit(ApplyOutcome::Diagnostic(Diagnostic::UnknownChannel {
                channel,
            }));
            return;
        };

        // Split out decode failures so buffered replay only ever holds
        // well-formed events.
        let mut good = Vec::with_capacity(events.len());
        for event in events {
            match event {
                Ok(event) => good.push(event),
                Err(error) => {
                    warn!(channel, %error, "dropping malformed event tuple");
                    self.emit(ApplyOutcome::Diagnostic(Diagnostic::MalformedEvent {
                        channel: Some(channel),
                        error,
                    }));
                }
            }
        }

        if !matches!(self.sync.get(&symbol), Some(SyncStatus::Syncing { .. })) {
            let outcomes = self
                .applier
                .apply_events(&mut self.registry, &symbol, sequence, good);
            self.emit_all(outcomes);
            return;
        }

        let overflowed = match self.sync.get_mut(&symbol) {
            Some(SyncStatus::Syncing { buffered, .. }) => {
                buffered.extend(good);
                if buffered.len() > self.config.sync_buffer_limit {
                    buffered.clear();
                    true
                } else {
                    false
                }
            }
            _ => false,
        };
        if overflowed {
            warn!(
                symbol = %symbol,
                limit = self.config.sync_buffer_limit,
                "sync buffer overflow, restarting snapshot fetch"
            );
            self.metrics.record_snapshot_retry();
            let token = self.next_fetch_token(&symbol);
            self.spawn_fetch(symbol, generation, token, Duration::ZERO);
        }
    }

    fn handle_snapshot_result(&mut self, result: SnapshotResult, generation: u64) {
        if result.generation != generation {
            debug!(symbol = %result.symbol, "dropping snapshot result from a previous epoch");
            return;
        }
        let SnapshotResult {
            symbol,
            token,
            outcome,
            ..
        } = result;
        match self.sync.get(&symbol) {
            Some(SyncStatus::Syncing { fetch_token, .. }) if *fetch_token == token => {}
            Some(SyncStatus::Syncing { .. }) => {
                debug!(symbol = %symbol, token, "dropping superseded snapshot result");
                return;
            }
            _ => {
                debug!(symbol = %symbol, "dropping snapshot result for a symbol already current");
                return;
            }
        }
        match outcome {
            Ok(sides) => self.finish_sync(&symbol, sides),
            Err(error) => {
                let attempts = match self.sync.get_mut(&symbol) {
                    Some(SyncStatus::Syncing { fetch_attempts, .. }) => {
                        *fetch_attempts = fetch_attempts.saturating_add(1);
                        *fetch_attempts
                    }
                    _ => 1,
                };
                let delay = self.backoff.delay_for(attempts);
                warn!(
                    symbol = %symbol,
                    %error,
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    "snapshot fetch failed, retrying"
                );
                self.metrics.record_snapshot_retry();
                self.emit(ApplyOutcome::Diagnostic(Diagnostic::SnapshotFetchFailed {
                    symbol: symbol.clone(),
                    error: error.to_string(),
                }));
                let token = self.next_fetch_token(&symbol);
                self.spawn_fetch(symbol, generation, token, delay);
            }
        }
    }

    /// Applies the fetched snapshot, then replays the buffer on top.
    fn finish_sync(&mut self, symbol: &str, sides: BookSides) {
        let buffered = match self
            .sync
            .insert(symbol.to_string(), SyncStatus::Current)
        {
            Some(SyncStatus::Syncing { buffered, .. }) => buffered,
            _ => Vec::new(),
        };

        let notification = {
            let Some(book) = self.registry.book_mut(symbol) else {
                return;
            };
            book.apply_snapshot(sides.bids, sides.asks, None);
            debug!(symbol, "book after snapshot:\n{book}");
            ChangeNotification {
                symbol: symbol.to_string(),
                timestamp: Utc::now(),
                kind: ChangeKind::SnapshotApplied {
                    bids: book.bids().to_vec(),
                    asks: book.asks().to_vec(),
                },
            }
        };
        self.emit(ApplyOutcome::Change(notification));

        if !buffered.is_empty() {
            debug!(symbol, events = buffered.len(), "replaying buffered events");
            let outcomes = self
                .applier
                .apply_events(&mut self.registry, symbol, None, buffered);
            self.emit_all(outcomes);
        }

        if self
            .sync
            .values()
            .all(|status| matches!(status, SyncStatus::Current))
        {
            self.tracker.set_needs_resync(false);
            info!("all symbols synced");
        }
    }

    fn emit_all(&self, outcomes: Vec<ApplyOutcome>) {
        for outcome in outcomes {
            self.emit(outcome);
        }
    }

    /// Single funnel for observer callbacks and outcome counters.
    fn emit(&self, outcome: ApplyOutcome) {
        match &outcome {
            ApplyOutcome::Change(change) => {
                match &change.kind {
                    ChangeKind::SnapshotApplied { .. } => self.metrics.record_snapshot_applied(),
                    ChangeKind::Levels { .. } => self.metrics.record_level_change(),
                    ChangeKind::Trade { .. } => self.metrics.record_trade_applied(),
                }
                self.book_observer.on_change(change);
            }
            ApplyOutcome::Diagnostic(diagnostic) => {
                match diagnostic {
                    Diagnostic::UnknownChannel { .. } => self.metrics.record_unknown_channel(),
                    Diagnostic::MalformedEvent { .. } => self.metrics.record_malformed(),
                    Diagnostic::InvalidLevel { .. } => self.metrics.record_invalid_level(),
                    _ => {}
                }
                self.book_observer.on_diagnostic(diagnostic);
            }
        }
    }
}
