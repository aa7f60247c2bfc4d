//! Order book manager
//!
//! Manages order books for multiple symbols.

use std::collections::HashMap;
use tracing::debug;

use super::{BookSnapshot, OrderBook};
use crate::decoder::DepthUpdate;
use crate::error::Result;

/// Manages order books for multiple symbols
#[derive(Debug, Default)]
pub struct OrderBookManager {
    books: HashMap<String, OrderBook>,
    max_depth: Option<usize>,
}

impl OrderBookManager {
    /// Create a new order book manager emitting full-depth snapshots
    pub fn new() -> Self {
        Self::default()
    }

    /// Create with a snapshot depth limit
    pub fn with_depth(max_depth: Option<usize>) -> Self {
        Self {
            books: HashMap::new(),
            max_depth,
        }
    }

    /// Apply a depth update to the appropriate book and return the fresh snapshot.
    ///
    /// The first update for a symbol creates its book, so it acts as a snapshot.
    pub fn apply_update(&mut self, update: &DepthUpdate) -> Result<BookSnapshot> {
        let book = self.books.entry(update.symbol.clone()).or_insert_with(|| {
            debug!(symbol = %update.symbol, "Creating order book");
            OrderBook::new(&update.symbol)
        });

        book.apply_update(update)?;
        Ok(book.snapshot(self.max_depth))
    }

    /// Get the current snapshot of a specific book
    pub fn get_snapshot(&self, symbol: &str) -> Option<BookSnapshot> {
        self.books.get(symbol).map(|book| book.snapshot(self.max_depth))
    }

    /// Get list of symbols being tracked
    pub fn symbols(&self) -> Vec<String> {
        self.books.keys().cloned().collect()
    }

    /// Check if a symbol exists
    pub fn has_symbol(&self, symbol: &str) -> bool {
        self.books.contains_key(symbol)
    }

    /// Forget a symbol's book; the next update rebuilds it from scratch
    pub fn remove(&mut self, symbol: &str) -> Option<OrderBook> {
        self.books.remove(symbol)
    }
}
