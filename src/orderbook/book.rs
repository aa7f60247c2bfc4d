//! Core order book implementation
//!
//! Uses BTreeMap keyed by `Decimal` so levels are ordered by numeric price.

use chrono::Utc;
use rust_decimal::Decimal;
use std::cmp::Reverse;
use std::collections::BTreeMap;

use super::{BookSnapshot, Level, Side};
use crate::decoder::{DepthDelta, DepthUpdate};
use crate::error::{FeedError, Result};

/// Order book for a single symbol
#[derive(Debug)]
pub struct OrderBook {
    symbol: String,
    /// Bids sorted by price descending (highest first)
    bids: BTreeMap<Reverse<Decimal>, Decimal>,
    /// Asks sorted by price ascending (lowest first)
    asks: BTreeMap<Decimal, Decimal>,
    /// Updates applied since creation
    sequence: u64,
}

impl OrderBook {
    /// Create a new empty order book
    pub fn new(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            sequence: 0,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Apply a depth update.
    ///
    /// All deltas are validated before anything is touched, so a malformed
    /// update leaves the book exactly as it was. A snapshot update clears both
    /// sides first. Deltas are applied in delivery order, last writer wins.
    pub fn apply_update(&mut self, update: &DepthUpdate) -> Result<()> {
        let asks = validate(&update.symbol, Side::Ask, &update.asks)?;
        let bids = validate(&update.symbol, Side::Bid, &update.bids)?;

        if update.is_snapshot {
            self.bids.clear();
            self.asks.clear();
        }

        for (price, quantity) in asks {
            self.update_level(Side::Ask, price, quantity);
        }
        for (price, quantity) in bids {
            self.update_level(Side::Bid, price, quantity);
        }

        self.sequence += 1;
        Ok(())
    }

    /// Update a single price level; zero quantity removes it
    fn update_level(&mut self, side: Side, price: Decimal, quantity: Decimal) {
        match side {
            Side::Bid => {
                if quantity.is_zero() {
                    self.bids.remove(&Reverse(price));
                } else {
                    self.bids.insert(Reverse(price), quantity);
                }
            }
            Side::Ask => {
                if quantity.is_zero() {
                    self.asks.remove(&price);
                } else {
                    self.asks.insert(price, quantity);
                }
            }
        }
    }

    /// Get best bid price
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first_key_value().map(|(Reverse(p), _)| *p)
    }

    /// Get best ask price
    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first_key_value().map(|(p, _)| *p)
    }

    pub fn bid_levels(&self) -> usize {
        self.bids.len()
    }

    pub fn ask_levels(&self) -> usize {
        self.asks.len()
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Materialize the book, optionally truncated to `depth` levels per side
    pub fn snapshot(&self, depth: Option<usize>) -> BookSnapshot {
        let limit = depth.unwrap_or(usize::MAX);
        BookSnapshot {
            symbol: self.symbol.clone(),
            sequence: self.sequence,
            timestamp: Utc::now(),
            bids: self
                .bids
                .iter()
                .take(limit)
                .map(|(Reverse(p), q)| Level {
                    price: *p,
                    quantity: *q,
                })
                .collect(),
            asks: self
                .asks
                .iter()
                .take(limit)
                .map(|(p, q)| Level {
                    price: *p,
                    quantity: *q,
                })
                .collect(),
        }
    }
}

fn validate(symbol: &str, side: Side, deltas: &[DepthDelta]) -> Result<Vec<(Decimal, Decimal)>> {
    deltas
        .iter()
        .enumerate()
        .map(|(i, delta)| match (delta.price, delta.quantity) {
            (Some(_), Some(quantity)) if quantity.is_sign_negative() && !quantity.is_zero() => {
                Err(FeedError::MalformedDelta(format!(
                    "{} {:?} delta {}: negative quantity {}",
                    symbol, side, i, quantity
                )))
            }
            (Some(price), Some(quantity)) => Ok((price, quantity)),
            (None, _) => Err(FeedError::MalformedDelta(format!(
                "{} {:?} delta {}: missing price",
                symbol, side, i
            ))),
            (_, None) => Err(FeedError::MalformedDelta(format!(
                "{} {:?} delta {}: missing quantity",
                symbol, side, i
            ))),
        })
        .collect()
}
