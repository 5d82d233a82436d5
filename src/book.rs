//! Depth-bounded price level books.
//!
//! One `LevelBook` mirrors the top N bid and ask levels of a single
//! currency pair, plus the most recent trade print. Sides are small
//! sorted vectors (best level first), so every mutation is an O(depth)
//! scan. The engine applies all mutations from a single task; the book
//! itself carries no locking.

use std::collections::BTreeMap;
use std::fmt;

use rust_decimal::Decimal;
use thiserror::Error;

/// Book side. The feed flags sides numerically: `0` = ask, `1` = bid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Bid,
    Ask,
}

impl Side {
    pub fn from_flag(flag: i64) -> Option<Self> {
        match flag {
            0 => Some(Side::Ask),
            1 => Some(Side::Bid),
            _ => None,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Bid => write!(f, "bid"),
            Side::Ask => write!(f, "ask"),
        }
    }
}

/// One resting level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriceLevel {
    pub price: Decimal,
    pub size: Decimal,
}

/// Most recent trade print for a symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastTrade {
    pub price: Decimal,
    pub size: Decimal,
    pub trade_id: String,
}

/// Rejected level mutation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BookError {
    #[error("{side} level {price} x {size} rejected: {reason}")]
    InvalidLevel {
        side: Side,
        price: Decimal,
        size: Decimal,
        reason: &'static str,
    },
}

/// Top-of-book mirror for one currency pair.
///
/// Bids are kept descending by price, asks ascending, both truncated to
/// the tracked depth. A removal for a price the book does not hold is a
/// no-op: the feed keeps sending deletions for levels that already fell
/// off the tracked window, and the replacement level below the window was
/// never observed, so there is nothing to backfill with.
#[derive(Debug, Clone)]
pub struct LevelBook {
    symbol: String,
    depth: usize,
    bids: Vec<PriceLevel>,
    asks: Vec<PriceLevel>,
    last_trade: Option<LastTrade>,
    last_sequence: Option<u64>,
}

impl LevelBook {
    pub fn new(symbol: impl Into<String>, depth: usize) -> Self {
        let depth = depth.max(1);
        Self {
            symbol: symbol.into(),
            depth,
            bids: Vec::with_capacity(depth),
            asks: Vec::with_capacity(depth),
            last_trade: None,
            last_sequence: None,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn bids(&self) -> &[PriceLevel] {
        &self.bids
    }

    pub fn asks(&self) -> &[PriceLevel] {
        &self.asks
    }

    pub fn last_trade(&self) -> Option<&LastTrade> {
        self.last_trade.as_ref()
    }

    pub fn last_sequence(&self) -> Option<u64> {
        self.last_sequence
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }

    /// Replaces both sides wholesale. Input levels are deduplicated by
    /// price (last entry wins), entries with non-positive size or negative
    /// price are dropped, and each side is sorted best-first and truncated
    /// to the tracked depth. The last trade survives; the feed replays the
    /// final print after a reconnect and dedup needs the stored id.
    pub fn apply_snapshot(
        &mut self,
        bids: Vec<(Decimal, Decimal)>,
        asks: Vec<(Decimal, Decimal)>,
        sequence: Option<u64>,
    ) {
        self.bids = normalize_side(bids, Side::Bid, self.depth);
        self.asks = normalize_side(asks, Side::Ask, self.depth);
        if sequence.is_some() {
            self.last_sequence = sequence;
        }
    }

    /// Inserts or replaces the level at `price`, keeping the side sorted
    /// and capped at the tracked depth. Returns whether the visible book
    /// changed: re-upserting an identical level, or inserting below the
    /// tail of a full side, leaves it untouched.
    pub fn upsert(&mut self, side: Side, price: Decimal, size: Decimal) -> Result<bool, BookError> {
        if price < Decimal::ZERO || size < Decimal::ZERO {
            return Err(BookError::InvalidLevel {
                side,
                price,
                size,
                reason: "negative value",
            });
        }
        if size.is_zero() {
            return Err(BookError::InvalidLevel {
                side,
                price,
                size,
                reason: "zero size is the removal sentinel",
            });
        }

        let depth = self.depth;
        let levels = self.side_mut(side);
        let pos = match side {
            Side::Bid => levels.iter().position(|l| l.price <= price),
            Side::Ask => levels.iter().position(|l| l.price >= price),
        };
        let changed = match pos {
            Some(i) if levels[i].price == price => {
                if levels[i].size == size {
                    false
                } else {
                    levels[i].size = size;
                    true
                }
            }
            Some(i) => {
                levels.insert(i, PriceLevel { price, size });
                levels.truncate(depth);
                true
            }
            None => {
                if levels.len() >= depth {
                    // Worse than every tracked level on a full side.
                    false
                } else {
                    levels.push(PriceLevel { price, size });
                    true
                }
            }
        };
        Ok(changed)
    }

    /// Deletes the level at `price` if present. Returns whether anything
    /// was removed; an absent price is a silent no-op.
    pub fn remove(&mut self, side: Side, price: Decimal) -> bool {
        let levels = self.side_mut(side);
        match levels.iter().position(|l| l.price == price) {
            Some(i) => {
                levels.remove(i);
                true
            }
            None => false,
        }
    }

    /// Records a trade print. A repeat of the stored trade id is dropped
    /// and reported as unchanged.
    pub fn apply_trade(&mut self, price: Decimal, size: Decimal, trade_id: String) -> bool {
        if self
            .last_trade
            .as_ref()
            .map_or(false, |t| t.trade_id == trade_id)
        {
            return false;
        }
        self.last_trade = Some(LastTrade {
            price,
            size,
            trade_id,
        });
        true
    }

    /// Records the feed's envelope sequence for observability.
    pub fn note_sequence(&mut self, sequence: u64) {
        self.last_sequence = Some(sequence);
    }

    /// Level at `rank` on `side`, rank 0 being the best price. `None`
    /// past the tracked tail.
    pub fn level(&self, side: Side, rank: usize) -> Option<&PriceLevel> {
        match side {
            Side::Bid => self.bids.get(rank),
            Side::Ask => self.asks.get(rank),
        }
    }

    #[inline]
    pub fn best_bid(&self) -> Option<&PriceLevel> {
        self.bids.first()
    }

    #[inline]
    pub fn best_ask(&self) -> Option<&PriceLevel> {
        self.asks.first()
    }

    /// True when the best bid is at or through the best ask.
    pub fn is_crossed(&self) -> bool {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => bid.price >= ask.price,
            _ => false,
        }
    }

    fn side_mut(&mut self, side: Side) -> &mut Vec<PriceLevel> {
        match side {
            Side::Bid => &mut self.bids,
            Side::Ask => &mut self.asks,
        }
    }
}

/// Stacked rendering: asks worst-to-best on top, then bids best-to-worst,
/// the way the book reads on an exchange screen.
impl fmt::Display for LevelBook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} (depth {})", self.symbol, self.depth)?;
        for level in self.asks.iter().rev() {
            writeln!(f, "  ask {:>18} x {}", level.price, level.size)?;
        }
        writeln!(f, "  ------------------")?;
        for level in &self.bids {
            writeln!(f, "  bid {:>18} x {}", level.price, level.size)?;
        }
        if let Some(trade) = &self.last_trade {
            writeln!(f, "  last {} x {} (#{})", trade.price, trade.size, trade.trade_id)?;
        }
        Ok(())
    }
}

fn normalize_side(levels: Vec<(Decimal, Decimal)>, side: Side, depth: usize) -> Vec<PriceLevel> {
    let mut by_price: BTreeMap<Decimal, Decimal> = BTreeMap::new();
    for (price, size) in levels {
        if price < Decimal::ZERO {
            continue;
        }
        if size > Decimal::ZERO {
            by_price.insert(price, size);
        } else {
            by_price.remove(&price);
        }
    }
    let sorted = by_price
        .into_iter()
        .map(|(price, size)| PriceLevel { price, size });
    match side {
        Side::Bid => sorted.rev().take(depth).collect(),
        Side::Ask => sorted.take(depth).collect(),
    }
}
