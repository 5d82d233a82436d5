//! Session lifecycle: states, backoff, liveness.
//!
//! The engine run loop is the only writer of session state; everything
//! here is bookkeeping it drives. Transitions:
//!
//! - DISCONNECTED -> CONNECTING on start
//! - CONNECTING -> SUBSCRIBING once the socket is open
//! - SUBSCRIBING -> LIVE once subscribe commands are flushed (the feed
//!   sends no subscribe ack)
//! - LIVE -> STALE on liveness timeout or transport failure
//! - STALE -> RECONNECTING, then -> CONNECTING after the backoff delay
//! - any state -> DISCONNECTED on stop
//!
//! Design principles:
//! - State is observable from other tasks but never written by them
//! - Backoff is exponential with jitter so reconnect storms de-correlate
//! - Liveness is deadline-based: the run loop sleeps until the deadline
//!   instead of polling on an interval

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use tracing::info;

// ============================================================================
// SESSION STATE
// ============================================================================

/// Connection lifecycle phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Not connected. Initial state and the terminal state after stop.
    Disconnected,
    /// Socket dial in progress.
    Connecting,
    /// Socket open, subscribe commands being flushed.
    Subscribing,
    /// Receiving data with the liveness clock armed.
    Live,
    /// Liveness lost or transport failed; session being torn down.
    Stale,
    /// Waiting out the backoff delay before the next dial.
    Reconnecting,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "DISCONNECTED",
            SessionState::Connecting => "CONNECTING",
            SessionState::Subscribing => "SUBSCRIBING",
            SessionState::Live => "LIVE",
            SessionState::Stale => "STALE",
            SessionState::Reconnecting => "RECONNECTING",
        };
        write!(f, "{}", name)
    }
}

/// Why a transition fired, for logs and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionReason {
    StartRequested,
    TransportOpen,
    SubscribeFlushed,
    LivenessTimeout,
    TransportFailed,
    TransportClosed,
    BackoffElapsed,
    StopRequested,
    RetriesExhausted,
}

impl fmt::Display for TransitionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransitionReason::StartRequested => "start_requested",
            TransitionReason::TransportOpen => "transport_open",
            TransitionReason::SubscribeFlushed => "subscribe_flushed",
            TransitionReason::LivenessTimeout => "liveness_timeout",
            TransitionReason::TransportFailed => "transport_failed",
            TransitionReason::TransportClosed => "transport_closed",
            TransitionReason::BackoffElapsed => "backoff_elapsed",
            TransitionReason::StopRequested => "stop_requested",
            TransitionReason::RetriesExhausted => "retries_exhausted",
        };
        write!(f, "{}", name)
    }
}

/// Shared view of the supervisor. The run loop writes, handles read.
#[derive(Debug)]
pub struct SessionTracker {
    state: RwLock<SessionState>,
    generation: AtomicU64,
    needs_resync: AtomicBool,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(SessionState::Disconnected),
            generation: AtomicU64::new(0),
            needs_resync: AtomicBool::new(true),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    /// Records a transition and logs it. Returns the previous state.
    pub fn transition(&self, next: SessionState, reason: TransitionReason) -> SessionState {
        let previous = {
            let mut state = self.state.write();
            std::mem::replace(&mut *state, next)
        };
        info!(from = %previous, to = %next, reason = %reason, "session_transition");
        previous
    }

    /// Current connection epoch. Bumped on every successful dial; results
    /// of work started under an older epoch are discarded on arrival.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn bump_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// True from the moment a session is lost until every tracked symbol
    /// has a fresh snapshot applied.
    pub fn needs_resync(&self) -> bool {
        self.needs_resync.load(Ordering::Acquire)
    }

    pub fn set_needs_resync(&self, value: bool) {
        self.needs_resync.store(value, Ordering::Release);
    }
}

impl Default for SessionTracker {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// BACKOFF
// ============================================================================

/// Exponential backoff with a floor, a ceiling, and jitter.
#[derive(Debug)]
pub struct BackoffPolicy {
    base: Duration,
    max: Duration,
    jitter: f64,
    attempt: u32,
    rng_state: u64,
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration, jitter: f64) -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0x5eed)
            | 1;
        Self {
            base: base.max(Duration::from_millis(1)),
            max,
            jitter: jitter.clamp(0.0, 1.0),
            attempt: 0,
            rng_state: seed,
        }
    }

    /// Delay for the current attempt; advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.delay_for(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Delay for an arbitrary attempt number, without touching the
    /// counter. Doubles from the floor toward the ceiling, with jitter
    /// applied either way, never below the floor.
    pub fn delay_for(&mut self, attempt: u32) -> Duration {
        let floor = self.base.as_millis() as f64;
        let raw = floor * 2f64.powi(attempt.min(32) as i32);
        let capped = raw.min(self.max.as_millis() as f64);
        let jitter = (self.next_random() * 2.0 - 1.0) * capped * self.jitter;
        Duration::from_millis((capped + jitter).max(floor) as u64)
    }

    /// Clears the attempt counter; called once a session reaches LIVE.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Fast PRNG for jitter (xorshift64).
    fn next_random(&mut self) -> f64 {
        self.rng_state ^= self.rng_state << 13;
        self.rng_state ^= self.rng_state >> 7;
        self.rng_state ^= self.rng_state << 17;
        (self.rng_state as f64) / (u64::MAX as f64)
    }
}

// ============================================================================
// LIVENESS
// ============================================================================

/// Tracks the most recent frame arrival and the deadline after which the
/// session counts as stale. Heartbeats and data frames both re-arm it.
#[derive(Debug)]
pub struct LivenessClock {
    timeout: Duration,
    last_activity: Instant,
}

impl LivenessClock {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            last_activity: Instant::now(),
        }
    }

    /// Re-arms the clock; called for every frame.
    #[inline]
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Instant at which the session goes stale absent further activity.
    pub fn deadline(&self) -> Instant {
        self.last_activity + self.timeout
    }

    pub fn is_stale(&self) -> bool {
        self.last_activity.elapsed() >= self.timeout
    }

    pub fn idle(&self) -> Duration {
        self.last_activity.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_toward_the_ceiling() {
        let mut backoff = BackoffPolicy::new(
            Duration::from_millis(100),
            Duration::from_millis(30_000),
            0.3,
        );

        // With 30% jitter: 100ms -> 70..130, 200ms -> 140..260.
        let first = backoff.next_delay().as_millis();
        assert!((70..=130).contains(&first), "first delay was {}ms", first);
        let second = backoff.next_delay().as_millis();
        assert!(
            (140..=260).contains(&second),
            "second delay was {}ms",
            second
        );
        assert_eq!(backoff.attempt(), 2);

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        let after_reset = backoff.next_delay().as_millis();
        assert!(
            (70..=130).contains(&after_reset),
            "post-reset delay was {}ms",
            after_reset
        );
    }

    #[test]
    fn backoff_respects_the_ceiling() {
        let mut backoff = BackoffPolicy::new(
            Duration::from_millis(100),
            Duration::from_millis(5_000),
            0.3,
        );
        for _ in 0..20 {
            let delay = backoff.next_delay().as_millis();
            assert!(delay <= 6_500, "delay {}ms exceeded ceiling + jitter", delay);
        }
    }

    #[test]
    fn backoff_never_drops_below_the_floor() {
        let mut backoff = BackoffPolicy::new(
            Duration::from_millis(200),
            Duration::from_millis(1_000),
            1.0,
        );
        for attempt in 0..50 {
            assert!(backoff.delay_for(attempt % 8).as_millis() >= 200);
        }
    }

    #[test]
    fn delay_for_leaves_the_counter_alone() {
        let mut backoff = BackoffPolicy::new(
            Duration::from_millis(100),
            Duration::from_millis(1_000),
            0.0,
        );
        assert_eq!(backoff.delay_for(3).as_millis(), 800);
        assert_eq!(backoff.attempt(), 0);
    }

    #[test]
    fn tracker_records_transitions_and_generations() {
        let tracker = SessionTracker::new();
        assert_eq!(tracker.state(), SessionState::Disconnected);
        assert!(tracker.needs_resync());

        let previous = tracker.transition(SessionState::Connecting, TransitionReason::StartRequested);
        assert_eq!(previous, SessionState::Disconnected);
        assert_eq!(tracker.state(), SessionState::Connecting);

        assert_eq!(tracker.bump_generation(), 1);
        assert_eq!(tracker.bump_generation(), 2);
        assert_eq!(tracker.generation(), 2);

        tracker.set_needs_resync(false);
        assert!(!tracker.needs_resync());
    }

    #[test]
    fn state_and_reason_render_for_logs() {
        assert_eq!(SessionState::Live.to_string(), "LIVE");
        assert_eq!(SessionState::Reconnecting.to_string(), "RECONNECTING");
        assert_eq!(
            TransitionReason::LivenessTimeout.to_string(),
            "liveness_timeout"
        );
        assert_eq!(
            TransitionReason::SubscribeFlushed.to_string(),
            "subscribe_flushed"
        );
    }

    #[test]
    fn liveness_goes_stale_without_activity() {
        let clock = LivenessClock::new(Duration::from_millis(20));
        assert!(!clock.is_stale());
        std::thread::sleep(Duration::from_millis(40));
        assert!(clock.is_stale());
    }

    #[test]
    fn touch_rearms_the_deadline() {
        let mut clock = LivenessClock::new(Duration::from_millis(500));
        let first_deadline = clock.deadline();
        std::thread::sleep(Duration::from_millis(30));
        clock.touch();
        assert!(clock.deadline() > first_deadline);
        assert!(!clock.is_stale());
        assert!(clock.idle() < Duration::from_millis(500));
    }
}
