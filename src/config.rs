//! Engine configuration.

use std::time::Duration;

/// Tunables for the feed engine. `Default` carries the exchange's public
/// endpoints; `from_env` applies `POLOFEED_*` overrides on top.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Push feed endpoint.
    pub ws_url: String,
    /// Public REST endpoint for the symbol map and snapshots.
    pub rest_url: String,
    /// Currency pairs to track.
    pub symbols: Vec<String>,
    /// Levels tracked per side.
    pub depth: usize,
    /// Idle time after which the session counts as stale.
    pub liveness_timeout_ms: u64,
    /// Socket dial timeout.
    pub connect_timeout_ms: u64,
    /// REST request timeout.
    pub http_timeout_ms: u64,
    /// Reconnect backoff floor.
    pub backoff_base_ms: u64,
    /// Reconnect backoff ceiling.
    pub backoff_max_ms: u64,
    /// Jitter fraction applied to each backoff delay, 0.0 to 1.0.
    pub backoff_jitter: f64,
    /// Consecutive failed reconnects before giving up. 0 = never.
    pub max_reconnect_attempts: u32,
    /// Cap on events buffered per symbol while its snapshot is in
    /// flight; overflow restarts the fetch.
    pub sync_buffer_limit: usize,
    /// Trade prints trailing local time by more than this raise a
    /// diagnostic. 0 disables the check.
    pub trade_lag_threshold_secs: i64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            ws_url: "wss://api2.poloniex.com/".to_string(),
            rest_url: "https://poloniex.com/public".to_string(),
            symbols: vec!["USDT_BTC".to_string()],
            depth: 5,
            liveness_timeout_ms: 10_000,
            connect_timeout_ms: 10_000,
            http_timeout_ms: 10_000,
            backoff_base_ms: 1_000,
            backoff_max_ms: 30_000,
            backoff_jitter: 0.3,
            max_reconnect_attempts: 0,
            sync_buffer_limit: 8_192,
            trade_lag_threshold_secs: 60,
        }
    }
}

impl FeedConfig {
    /// Load from environment with defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("POLOFEED_WS_URL") {
            config.ws_url = v;
        }
        if let Ok(v) = std::env::var("POLOFEED_REST_URL") {
            config.rest_url = v;
        }
        if let Ok(v) = std::env::var("POLOFEED_SYMBOLS") {
            let symbols = parse_symbol_list(&v);
            if !symbols.is_empty() {
                config.symbols = symbols;
            }
        }
        if let Ok(v) = std::env::var("POLOFEED_DEPTH") {
            if let Ok(n) = v.parse() {
                config.depth = n;
            }
        }
        if let Ok(v) = std::env::var("POLOFEED_LIVENESS_TIMEOUT_MS") {
            if let Ok(n) = v.parse() {
                config.liveness_timeout_ms = n;
            }
        }
        if let Ok(v) = std::env::var("POLOFEED_CONNECT_TIMEOUT_MS") {
            if let Ok(n) = v.parse() {
                config.connect_timeout_ms = n;
            }
        }
        if let Ok(v) = std::env::var("POLOFEED_HTTP_TIMEOUT_MS") {
            if let Ok(n) = v.parse() {
                config.http_timeout_ms = n;
            }
        }
        if let Ok(v) = std::env::var("POLOFEED_BACKOFF_BASE_MS") {
            if let Ok(n) = v.parse() {
                config.backoff_base_ms = n;
            }
        }
        if let Ok(v) = std::env::var("POLOFEED_BACKOFF_MAX_MS") {
            if let Ok(n) = v.parse() {
                config.backoff_max_ms = n;
            }
        }
        if let Ok(v) = std::env::var("POLOFEED_BACKOFF_JITTER") {
            if let Ok(n) = v.parse::<f64>() {
                if (0.0..=1.0).contains(&n) {
                    config.backoff_jitter = n;
                }
            }
        }
        if let Ok(v) = std::env::var("POLOFEED_MAX_RECONNECT_ATTEMPTS") {
            if let Ok(n) = v.parse() {
                config.max_reconnect_attempts = n;
            }
        }
        if let Ok(v) = std::env::var("POLOFEED_SYNC_BUFFER_LIMIT") {
            if let Ok(n) = v.parse() {
                config.sync_buffer_limit = n;
            }
        }
        if let Ok(v) = std::env::var("POLOFEED_TRADE_LAG_THRESHOLD_SECS") {
            if let Ok(n) = v.parse() {
                config.trade_lag_threshold_secs = n;
            }
        }

        config
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

fn parse_symbol_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
