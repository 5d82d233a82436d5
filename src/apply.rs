//! Event application: decoded book events to book mutations.
//!
//! The applier only sees well-formed events for an already-resolved
//! symbol; routing, buffering, and malformed-tuple reporting happen in
//! the engine run loop before events get here. Every mutation that
//! changes visible state produces a `ChangeNotification`; silent no-ops
//! (duplicate trades, identical re-upserts, removals of untracked
//! prices) produce nothing.

use chrono::Utc;
use tracing::warn;

use crate::book::{LastTrade, Side};
use crate::notify::{ChangeKind, ChangeNotification, Diagnostic};
use crate::protocol::BookEvent;
use crate::registry::BookRegistry;

/// Outcome of applying one event.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    Change(ChangeNotification),
    Diagnostic(Diagnostic),
}

/// Applies decoded events to the registry's books.
#[derive(Debug, Clone)]
pub struct EventApplier {
    /// Trade prints whose exchange timestamp trails local time by more
    /// than this raise a lag diagnostic. Zero disables the check.
    trade_lag_threshold_secs: i64,
}

impl EventApplier {
    pub fn new(trade_lag_threshold_secs: i64) -> Self {
        Self {
            trade_lag_threshold_secs,
        }
    }

    /// Applies `events` to `symbol`'s book in order and returns the
    /// outcomes in the same order. `sequence` is the envelope sequence of
    /// the frame that carried the events, recorded for observability.
    pub fn apply_events(
        &self,
        registry: &mut BookRegistry,
        symbol: &str,
        sequence: Option<u64>,
        events: Vec<BookEvent>,
    ) -> Vec<ApplyOutcome> {
        let mut outcomes = Vec::new();
        for event in events {
            self.apply_event(registry, symbol, event, &mut outcomes);
        }
        if let Some(sequence) = sequence {
            if let Some(book) = registry.book_mut(symbol) {
                book.note_sequence(sequence);
            }
        }
        outcomes
    }

    fn apply_event(
        &self,
        registry: &mut BookRegistry,
        symbol: &str,
        event: BookEvent,
        outcomes: &mut Vec<ApplyOutcome>,
    ) {
        let Some(book) = registry.book_mut(symbol) else {
            return;
        };
        match event {
            BookEvent::Snapshot {
                sequence,
                bids,
                asks,
            } => {
                book.apply_snapshot(bids, asks, sequence);
                outcomes.push(ApplyOutcome::Change(ChangeNotification {
                    symbol: symbol.to_string(),
                    timestamp: Utc::now(),
                    kind: ChangeKind::SnapshotApplied {
                        bids: book.bids().to_vec(),
                        asks: book.asks().to_vec(),
                    },
                }));
            }
            BookEvent::Level { side, price, size } => {
                // Zero size is the wire's removal sentinel.
                let changed = if size.is_zero() {
                    book.remove(side, price)
                } else {
                    match book.upsert(side, price, size) {
                        Ok(changed) => changed,
                        Err(error) => {
                            warn!(symbol, %error, "dropping level the book rejected");
                            outcomes.push(ApplyOutcome::Diagnostic(Diagnostic::InvalidLevel {
                                symbol: symbol.to_string(),
                                error,
                            }));
                            return;
                        }
                    }
                };
                if changed {
                    let levels = match side {
                        Side::Bid => book.bids().to_vec(),
                        Side::Ask => book.asks().to_vec(),
                    };
                    outcomes.push(ApplyOutcome::Change(ChangeNotification {
                        symbol: symbol.to_string(),
                        timestamp: Utc::now(),
                        kind: ChangeKind::Levels { side, levels },
                    }));
                }
            }
            BookEvent::Trade {
                trade_id,
                side,
                price,
                size,
                timestamp,
            } => {
                if self.trade_lag_threshold_secs > 0 {
                    if let Some(printed_at) = timestamp {
                        let lag = Utc::now().timestamp() - printed_at;
                        if lag > self.trade_lag_threshold_secs {
                            warn!(symbol, lag_secs = lag, "trade print trails local clock");
                            outcomes.push(ApplyOutcome::Diagnostic(Diagnostic::TradeLagging {
                                symbol: symbol.to_string(),
                                lag_secs: lag,
                            }));
                        }
                    }
                }
                let trade = LastTrade {
                    price,
                    size,
                    trade_id: trade_id.clone(),
                };
                if book.apply_trade(price, size, trade_id) {
                    outcomes.push(ApplyOutcome::Change(ChangeNotification {
                        symbol: symbol.to_string(),
                        timestamp: Utc::now(),
                        kind: ChangeKind::Trade { side, trade },
                    }));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn registry() -> BookRegistry {
        BookRegistry::new(vec![(148, "USDT_BTC".to_string())], 5)
    }

    fn seeded_registry() -> BookRegistry {
        let mut registry = registry();
        EventApplier::new(0).apply_events(
            &mut registry,
            "USDT_BTC",
            None,
            vec![BookEvent::Snapshot {
                sequence: Some(100),
                bids: vec![(dec!(10.0), dec!(1)), (dec!(9.5), dec!(2))],
                asks: vec![(dec!(10.5), dec!(1)), (dec!(11.0), dec!(3))],
            }],
        );
        registry
    }

    fn changes(outcomes: &[ApplyOutcome]) -> Vec<&ChangeNotification> {
        outcomes
            .iter()
            .filter_map(|o| match o {
                ApplyOutcome::Change(c) => Some(c),
                ApplyOutcome::Diagnostic(_) => None,
            })
            .collect()
    }

    #[test]
    fn snapshot_event_notifies_with_both_sides() {
        let mut registry = registry();
        let outcomes = EventApplier::new(0).apply_events(
            &mut registry,
            "USDT_BTC",
            None,
            vec![BookEvent::Snapshot {
                sequence: Some(100),
                bids: vec![(dec!(10.0), dec!(1))],
                asks: vec![(dec!(10.5), dec!(1))],
            }],
        );
        let changes = changes(&outcomes);
        assert_eq!(changes.len(), 1);
        let ChangeKind::SnapshotApplied { bids, asks } = &changes[0].kind else {
            panic!("expected snapshot notification");
        };
        assert_eq!(bids[0].price, dec!(10.0));
        assert_eq!(asks[0].price, dec!(10.5));
        assert_eq!(
            registry.book("USDT_BTC").unwrap().last_sequence(),
            Some(100)
        );
    }

    #[test]
    fn zero_size_routes_to_removal() {
        let mut registry = seeded_registry();
        let outcomes = EventApplier::new(0).apply_events(
            &mut registry,
            "USDT_BTC",
            None,
            vec![BookEvent::Level {
                side: Side::Ask,
                price: dec!(10.5),
                size: dec!(0),
            }],
        );
        let changes = changes(&outcomes);
        assert_eq!(changes.len(), 1);
        let ChangeKind::Levels { side, levels } = &changes[0].kind else {
            panic!("expected level notification");
        };
        assert_eq!(*side, Side::Ask);
        assert_eq!(levels[0].price, dec!(11.0));
        assert_eq!(levels[0].size, dec!(3));
    }

    #[test]
    fn removal_of_untracked_price_stays_silent() {
        let mut registry = seeded_registry();
        let outcomes = EventApplier::new(0).apply_events(
            &mut registry,
            "USDT_BTC",
            None,
            vec![BookEvent::Level {
                side: Side::Bid,
                price: dec!(7.77),
                size: dec!(0),
            }],
        );
        assert!(outcomes.is_empty());
    }

    #[test]
    fn level_notification_carries_the_full_side() {
        let mut registry = seeded_registry();
        let outcomes = EventApplier::new(0).apply_events(
            &mut registry,
            "USDT_BTC",
            Some(101),
            vec![BookEvent::Level {
                side: Side::Bid,
                price: dec!(9.8),
                size: dec!(4),
            }],
        );
        let changes = changes(&outcomes);
        let ChangeKind::Levels { levels, .. } = &changes[0].kind else {
            panic!("expected level notification");
        };
        let prices: Vec<_> = levels.iter().map(|l| l.price).collect();
        assert_eq!(prices, vec![dec!(10.0), dec!(9.8), dec!(9.5)]);
        assert_eq!(
            registry.book("USDT_BTC").unwrap().last_sequence(),
            Some(101)
        );
    }

    #[test]
    fn identical_reupsert_emits_nothing() {
        let mut registry = seeded_registry();
        let outcomes = EventApplier::new(0).apply_events(
            &mut registry,
            "USDT_BTC",
            None,
            vec![BookEvent::Level {
                side: Side::Bid,
                price: dec!(10.0),
                size: dec!(1),
            }],
        );
        assert!(outcomes.is_empty());
    }

    #[test]
    fn invalid_level_surfaces_as_diagnostic() {
        let mut registry = seeded_registry();
        let outcomes = EventApplier::new(0).apply_events(
            &mut registry,
            "USDT_BTC",
            None,
            vec![BookEvent::Level {
                side: Side::Bid,
                price: dec!(-1),
                size: dec!(1),
            }],
        );
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(
            outcomes[0],
            ApplyOutcome::Diagnostic(Diagnostic::InvalidLevel { .. })
        ));
        // The book is untouched.
        assert_eq!(registry.book("USDT_BTC").unwrap().bids().len(), 2);
    }

    #[test]
    fn duplicate_trade_emits_once() {
        let mut registry = seeded_registry();
        let applier = EventApplier::new(0);
        let trade = BookEvent::Trade {
            trade_id: "10200147".to_string(),
            side: Side::Bid,
            price: dec!(10.2),
            size: dec!(0.5),
            timestamp: None,
        };
        let first = applier.apply_events(&mut registry, "USDT_BTC", None, vec![trade.clone()]);
        let second = applier.apply_events(&mut registry, "USDT_BTC", None, vec![trade]);
        assert_eq!(changes(&first).len(), 1);
        assert!(second.is_empty());
    }

    #[test]
    fn lagging_trade_raises_diagnostic_but_still_applies() {
        let mut registry = seeded_registry();
        let outcomes = EventApplier::new(60).apply_events(
            &mut registry,
            "USDT_BTC",
            None,
            vec![BookEvent::Trade {
                trade_id: "1".to_string(),
                side: Side::Ask,
                price: dec!(10.4),
                size: dec!(1),
                timestamp: Some(Utc::now().timestamp() - 600),
            }],
        );
        assert!(outcomes.iter().any(|o| matches!(
            o,
            ApplyOutcome::Diagnostic(Diagnostic::TradeLagging { lag_secs, .. }) if *lag_secs >= 600
        )));
        assert_eq!(changes(&outcomes).len(), 1);
        assert!(registry.book("USDT_BTC").unwrap().last_trade().is_some());
    }

    #[test]
    fn same_events_reproduce_the_same_book() {
        let events = vec![
            BookEvent::Snapshot {
                sequence: Some(1),
                bids: vec![(dec!(10.0), dec!(1)), (dec!(9.5), dec!(2))],
                asks: vec![(dec!(10.5), dec!(1)), (dec!(11.0), dec!(3))],
            },
            BookEvent::Level {
                side: Side::Bid,
                price: dec!(9.8),
                size: dec!(4),
            },
            BookEvent::Level {
                side: Side::Ask,
                price: dec!(10.5),
                size: dec!(0),
            },
            BookEvent::Trade {
                trade_id: "7".to_string(),
                side: Side::Bid,
                price: dec!(10.4),
                size: dec!(0.25),
                timestamp: None,
            },
            BookEvent::Level {
                side: Side::Bid,
                price: dec!(9.5),
                size: dec!(1),
            },
        ];
        let applier = EventApplier::new(0);

        let mut first = registry();
        let mut second = registry();
        applier.apply_events(&mut first, "USDT_BTC", Some(5), events.clone());
        applier.apply_events(&mut second, "USDT_BTC", Some(5), events);

        let a = first.book("USDT_BTC").unwrap();
        let b = second.book("USDT_BTC").unwrap();
        assert_eq!(a.bids(), b.bids());
        assert_eq!(a.asks(), b.asks());
        assert_eq!(a.last_trade(), b.last_trade());
        assert_eq!(a.last_sequence(), b.last_sequence());
    }
}
