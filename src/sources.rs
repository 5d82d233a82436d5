//! Out-of-band REST collaborators: the symbol map and book snapshots.
//!
//! The push feed identifies pairs by numeric channel code, so the engine
//! fetches the code-to-symbol map once at startup. Book snapshots are
//! fetched at every go-live and resync; diffs buffered in the meantime
//! replay on top.

use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

/// REST collaborator failure. Snapshot failures are retried with the
/// reconnect backoff policy, never escalated on their own; a symbol map
/// failure aborts startup.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {0}")]
    Status(u16),
    #[error("bad payload: {0}")]
    Decode(String),
    #[error("no channel code for {0}")]
    MissingSymbol(String),
}

/// Both sides of a fetched snapshot, unsorted as delivered.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BookSides {
    pub bids: Vec<(Decimal, Decimal)>,
    pub asks: Vec<(Decimal, Decimal)>,
}

/// Fetches one symbol's book snapshot.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch_snapshot(&self, symbol: &str, depth: usize) -> Result<BookSides, SourceError>;
}

/// Fetches the channel-code to symbol mapping.
#[async_trait]
pub trait SymbolMapSource: Send + Sync {
    async fn fetch_symbol_map(&self) -> Result<HashMap<u64, String>, SourceError>;
}

/// Public HTTP API client backing both source traits. All commands go to
/// the same endpoint, switched by a `command` query parameter.
#[derive(Debug, Clone)]
pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct TickerEntry {
    id: u64,
}

impl RestClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    async fn get(&self, query: &[(&str, &str)]) -> Result<Value, SourceError> {
        let response = self.http.get(&self.base_url).query(query).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Status(status.as_u16()));
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl SymbolMapSource for RestClient {
    async fn fetch_symbol_map(&self) -> Result<HashMap<u64, String>, SourceError> {
        let body = self.get(&[("command", "returnTicker")]).await?;
        let entries: HashMap<String, TickerEntry> =
            serde_json::from_value(body).map_err(|e| SourceError::Decode(e.to_string()))?;
        let map = invert_ticker_map(entries);
        debug!(pairs = map.len(), "fetched symbol map");
        Ok(map)
    }
}

#[async_trait]
impl SnapshotSource for RestClient {
    async fn fetch_snapshot(&self, symbol: &str, depth: usize) -> Result<BookSides, SourceError> {
        let depth = depth.to_string();
        let body = self
            .get(&[
                ("command", "returnOrderBook"),
                ("currencyPair", symbol),
                ("depth", &depth),
            ])
            .await?;
        if let Some(error) = body.get("error").and_then(Value::as_str) {
            return Err(SourceError::Decode(error.to_string()));
        }
        let bids = parse_rest_side(body.get("bids"), "bids")?;
        let asks = parse_rest_side(body.get("asks"), "asks")?;
        debug!(symbol, bids = bids.len(), asks = asks.len(), "fetched book snapshot");
        Ok(BookSides { bids, asks })
    }
}

fn invert_ticker_map(entries: HashMap<String, TickerEntry>) -> HashMap<u64, String> {
    entries
        .into_iter()
        .map(|(symbol, entry)| (entry.id, symbol))
        .collect()
}

/// Levels arrive as `[priceString, sizeNumber]` rows.
fn parse_rest_side(
    value: Option<&Value>,
    field: &'static str,
) -> Result<Vec<(Decimal, Decimal)>, SourceError> {
    let rows = value
        .and_then(Value::as_array)
        .ok_or_else(|| SourceError::Decode(format!("missing {field} array")))?;
    let mut levels = Vec::with_capacity(rows.len());
    for row in rows {
        let pair = row
            .as_array()
            .filter(|pair| pair.len() >= 2)
            .ok_or_else(|| SourceError::Decode(format!("bad row in {field}")))?;
        let price = decimal_from(&pair[0])
            .ok_or_else(|| SourceError::Decode(format!("bad price in {field}")))?;
        let size = decimal_from(&pair[1])
            .ok_or_else(|| SourceError::Decode(format!("bad size in {field}")))?;
        levels.push((price, size));
    }
    Ok(levels)
}

/// Numbers round-trip through their literal JSON text, so a size printed
/// as `1500.6` stays exactly `1500.6`.
fn decimal_from(value: &Value) -> Option<Decimal> {
    match value {
        Value::String(s) => Decimal::from_str(s).ok(),
        Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
        _ => None,
    }
}
