//! Wire protocol for the push feed.
//!
//! Every frame is JSON. Data frames multiplex all subscribed pairs over a
//! single socket:
//!
//! ```text
//! [channelCode, sequenceOrNull, [tuple, tuple, ...]]
//! ```
//!
//! where each tuple is tagged by its first element: `"i"` carries a full
//! book snapshot, `"o"` a single level update (size `"0.00000000"` marks
//! a removal), `"t"` a trade print. Heartbeats are a bare `[1010]`, and
//! the server reports rejected commands as `{"error": "..."}` objects.
//!
//! Tuples decode independently: one malformed tuple is reported in place
//! and the rest of the batch still applies.

use std::str::FromStr;

use rust_decimal::Decimal;
use serde_json::Value;
use thiserror::Error;

use crate::book::Side;

/// Channel code reserved for heartbeat frames.
pub const HEARTBEAT_CHANNEL: u64 = 1010;

/// Per-message or per-tuple decode failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("not valid JSON: {0}")]
    Json(String),
    #[error("unrecognized message shape")]
    UnrecognizedShape,
    #[error("{context}: expected {expected}")]
    Field {
        context: &'static str,
        expected: &'static str,
    },
    #[error("unknown tuple tag {tag:?}")]
    UnknownTag { tag: String },
    #[error("bad decimal {value:?} in {context}")]
    BadDecimal {
        context: &'static str,
        value: String,
    },
    #[error("bad side flag {0}")]
    BadSideFlag(i64),
}

/// One decoded book event out of a channel batch.
#[derive(Debug, Clone, PartialEq)]
pub enum BookEvent {
    /// Full replacement of both sides.
    Snapshot {
        sequence: Option<u64>,
        bids: Vec<(Decimal, Decimal)>,
        asks: Vec<(Decimal, Decimal)>,
    },
    /// Single level update; zero size marks a removal.
    Level {
        side: Side,
        price: Decimal,
        size: Decimal,
    },
    /// Trade print; `timestamp` is the exchange's unix time in seconds.
    Trade {
        trade_id: String,
        side: Side,
        price: Decimal,
        size: Decimal,
        timestamp: Option<i64>,
    },
}

/// One decoded feed frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    /// Liveness-only frame, no book data.
    Heartbeat,
    /// Server-reported error payload.
    FeedError(String),
    /// Channel batch; per-tuple failures stay in place so callers can
    /// apply the good events and report the bad ones.
    Batch {
        channel: u64,
        sequence: Option<u64>,
        events: Vec<Result<BookEvent, ParseError>>,
    },
}

/// Builds the subscribe command for one channel (currency pair name).
pub fn subscribe_command(channel: &str) -> String {
    serde_json::json!({ "command": "subscribe", "channel": channel }).to_string()
}

/// Decodes one raw frame.
pub fn parse_message(raw: &str) -> Result<FeedMessage, ParseError> {
    let value: Value = serde_json::from_str(raw).map_err(|e| ParseError::Json(e.to_string()))?;

    if let Some(object) = value.as_object() {
        if let Some(error) = object.get("error") {
            let message = error
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            return Ok(FeedMessage::FeedError(message));
        }
        return Err(ParseError::UnrecognizedShape);
    }

    let frame = value.as_array().ok_or(ParseError::UnrecognizedShape)?;
    let channel = frame
        .first()
        .and_then(as_u64_lenient)
        .ok_or(ParseError::Field {
            context: "frame",
            expected: "numeric channel code",
        })?;

    if channel == HEARTBEAT_CHANNEL {
        return Ok(FeedMessage::Heartbeat);
    }

    let sequence = frame.get(1).and_then(Value::as_u64);
    let tuples = frame
        .get(2)
        .and_then(Value::as_array)
        .ok_or(ParseError::Field {
            context: "frame",
            expected: "tuple array",
        })?;

    let events = tuples.iter().map(parse_tuple).collect();
    Ok(FeedMessage::Batch {
        channel,
        sequence,
        events,
    })
}

fn parse_tuple(tuple: &Value) -> Result<BookEvent, ParseError> {
    let fields = tuple.as_array().ok_or(ParseError::Field {
        context: "tuple",
        expected: "array",
    })?;
    let tag = fields
        .first()
        .and_then(Value::as_str)
        .ok_or(ParseError::Field {
            context: "tuple",
            expected: "string tag",
        })?;
    match tag {
        "i" => parse_snapshot(fields),
        "o" => parse_level(fields),
        "t" => parse_trade(fields),
        other => Err(ParseError::UnknownTag {
            tag: other.to_string(),
        }),
    }
}

/// `["i", seq, {"orderBook": [askMap, bidMap]}]`. Asks come first.
fn parse_snapshot(fields: &[Value]) -> Result<BookEvent, ParseError> {
    let sequence = fields.get(1).and_then(as_u64_lenient);
    let payload = fields
        .get(2)
        .and_then(Value::as_object)
        .ok_or(ParseError::Field {
            context: "snapshot",
            expected: "payload object",
        })?;
    let sides = payload
        .get("orderBook")
        .and_then(Value::as_array)
        .ok_or(ParseError::Field {
            context: "snapshot",
            expected: "orderBook array",
        })?;
    let asks = parse_side_map(sides.first(), "snapshot asks")?;
    let bids = parse_side_map(sides.get(1), "snapshot bids")?;
    Ok(BookEvent::Snapshot {
        sequence,
        bids,
        asks,
    })
}

/// `["o", sideFlag, priceString, sizeString]`.
fn parse_level(fields: &[Value]) -> Result<BookEvent, ParseError> {
    let side = parse_side(fields.get(1))?;
    let price = parse_decimal_field(fields.get(2), "level price")?;
    let size = parse_decimal_field(fields.get(3), "level size")?;
    Ok(BookEvent::Level { side, price, size })
}

/// `["t", tradeId, sideFlag, priceString, sizeString, unixTime]`.
fn parse_trade(fields: &[Value]) -> Result<BookEvent, ParseError> {
    let trade_id = match fields.get(1) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => {
            return Err(ParseError::Field {
                context: "trade",
                expected: "trade id",
            })
        }
    };
    let side = parse_side(fields.get(2))?;
    let price = parse_decimal_field(fields.get(3), "trade price")?;
    let size = parse_decimal_field(fields.get(4), "trade size")?;
    let timestamp = fields.get(5).and_then(Value::as_i64);
    Ok(BookEvent::Trade {
        trade_id,
        side,
        price,
        size,
        timestamp,
    })
}

fn parse_side(value: Option<&Value>) -> Result<Side, ParseError> {
    let flag = value.and_then(Value::as_i64).ok_or(ParseError::Field {
        context: "side",
        expected: "numeric flag",
    })?;
    Side::from_flag(flag).ok_or(ParseError::BadSideFlag(flag))
}

fn parse_side_map(
    value: Option<&Value>,
    context: &'static str,
) -> Result<Vec<(Decimal, Decimal)>, ParseError> {
    let map = value.and_then(Value::as_object).ok_or(ParseError::Field {
        context,
        expected: "price map",
    })?;
    let mut levels = Vec::with_capacity(map.len());
    for (price, size) in map {
        let price = parse_decimal_str(price, context)?;
        let size = parse_decimal_value(size, context)?;
        levels.push((price, size));
    }
    Ok(levels)
}

fn parse_decimal_field(
    value: Option<&Value>,
    context: &'static str,
) -> Result<Decimal, ParseError> {
    let value = value.ok_or(ParseError::Field {
        context,
        expected: "decimal",
    })?;
    parse_decimal_value(value, context)
}

/// The feed serializes decimals as strings; the REST side also uses bare
/// numbers, which round-trip through their literal JSON text so no float
/// precision leaks in.
fn parse_decimal_value(value: &Value, context: &'static str) -> Result<Decimal, ParseError> {
    match value {
        Value::String(s) => parse_decimal_str(s, context),
        Value::Number(n) => parse_decimal_str(&n.to_string(), context),
        other => Err(ParseError::BadDecimal {
            context,
            value: other.to_string(),
        }),
    }
}

fn parse_decimal_str(raw: &str, context: &'static str) -> Result<Decimal, ParseError> {
    Decimal::from_str(raw).map_err(|_| ParseError::BadDecimal {
        context,
        value: raw.to_string(),
    })
}

fn as_u64_lenient(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}
