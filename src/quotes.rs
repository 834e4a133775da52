// ===============================
// src/quotes.rs
// ===============================
//
// Market data cache: per-symbol best bid/ask (last write wins) plus the
// per-symbol depth book that incremental refreshes mutate. Snapshot entries
// without an MDEntryID update the spot quote directly; entries with ids
// replace the book, and best bid/ask is recomputed after every book change.

use ahash::AHashMap as HashMap;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::domain::MarketQuote;
use crate::fix::{field, FixMessage};
use crate::metrics::QUOTE_UPDATES;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    Bid,
    Ask,
}

impl EntryKind {
    fn from_fix(v: &str) -> Option<EntryKind> {
        match v {
            "0" => Some(EntryKind::Bid),
            "1" => Some(EntryKind::Ask),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookEntry {
    pub kind: EntryKind,
    pub price: f64,
    pub size: f64,
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[derive(Debug, Default)]
pub struct QuoteBoard {
    quotes: HashMap<String, MarketQuote>,
    books: HashMap<String, HashMap<String, BookEntry>>,
}

impl QuoteBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn quote(&self, symbol: &str) -> Option<&MarketQuote> {
        self.quotes.get(symbol)
    }

    /// All cached quotes, sorted by symbol for stable snapshots.
    pub fn quotes(&self) -> Vec<MarketQuote> {
        let mut qs: Vec<MarketQuote> = self.quotes.values().cloned().collect();
        qs.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        qs
    }

    /// MarketDataSnapshot (35=W) for `symbol`. Returns the updated quote.
    pub fn apply_snapshot(&mut self, symbol: &str, m: &FixMessage) -> Option<MarketQuote> {
        let entries = m.groups(field::NO_MD_ENTRIES, field::MD_ENTRY_TYPE, None);
        if entries.is_empty() {
            return None;
        }

        if entries.iter().all(|e| !e.contains_key(&field::MD_ENTRY_ID)) {
            // Top-of-book refresh: no entry ids, just bid/ask prices.
            let mut q = self.quotes.get(symbol).cloned().unwrap_or(MarketQuote {
                symbol: symbol.to_string(),
                bid: 0.0,
                ask: 0.0,
                ts_ms: 0,
            });
            for e in &entries {
                let kind = e
                    .get(&field::MD_ENTRY_TYPE)
                    .and_then(|v| EntryKind::from_fix(v));
                let px = e.get(&field::MD_ENTRY_PX).and_then(|v| v.parse().ok());
                let (Some(kind), Some(px)) = (kind, px) else {
                    continue;
                };
                match kind {
                    EntryKind::Bid => q.bid = px,
                    EntryKind::Ask => q.ask = px,
                }
            }
            q.ts_ms = now_ms();
            QUOTE_UPDATES.with_label_values(&[symbol]).inc();
            self.quotes.insert(symbol.to_string(), q.clone());
            return Some(q);
        }

        // Full refresh: replace the book for this symbol.
        let book = self.books.entry(symbol.to_string()).or_default();
        book.clear();
        for e in &entries {
            let id = e.get(&field::MD_ENTRY_ID);
            let kind = e
                .get(&field::MD_ENTRY_TYPE)
                .and_then(|v| EntryKind::from_fix(v));
            let px = e.get(&field::MD_ENTRY_PX).and_then(|v| v.parse().ok());
            let (Some(id), Some(kind), Some(px)) = (id, kind, px) else {
                continue;
            };
            let size = e
                .get(&field::MD_ENTRY_SIZE)
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.0);
            book.insert(
                id.clone(),
                BookEntry {
                    kind,
                    price: px,
                    size,
                },
            );
        }
        self.refresh_from_book(symbol)
    }

    /// MarketDataIncrementalRefresh (35=X): action 0 adds an entry, action 2
    /// deletes one; best bid/ask is then recomputed from the book.
    pub fn apply_incremental(&mut self, symbol: &str, m: &FixMessage) -> Option<MarketQuote> {
        let entries = m.groups(field::NO_MD_ENTRIES, field::MD_UPDATE_ACTION, None);
        let book = self.books.entry(symbol.to_string()).or_default();
        for e in &entries {
            match e.get(&field::MD_UPDATE_ACTION).map(String::as_str) {
                Some("2") => {
                    if let Some(id) = e.get(&field::MD_ENTRY_ID) {
                        book.remove(id);
                    }
                }
                Some("0") => {
                    let id = e.get(&field::MD_ENTRY_ID);
                    let kind = e
                        .get(&field::MD_ENTRY_TYPE)
                        .and_then(|v| EntryKind::from_fix(v));
                    let px = e.get(&field::MD_ENTRY_PX).and_then(|v| v.parse().ok());
                    let (Some(id), Some(kind), Some(px)) = (id, kind, px) else {
                        continue;
                    };
                    let size = e
                        .get(&field::MD_ENTRY_SIZE)
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(0.0);
                    book.insert(
                        id.clone(),
                        BookEntry {
                            kind,
                            price: px,
                            size,
                        },
                    );
                }
                _ => {}
            }
        }
        self.refresh_from_book(symbol)
    }

    /// Best bid = highest bid entry, best ask = lowest ask entry.
    fn refresh_from_book(&mut self, symbol: &str) -> Option<MarketQuote> {
        let book = self.books.get(symbol)?;
        let mut best_bid: Option<f64> = None;
        let mut best_ask: Option<f64> = None;
        for e in book.values() {
            match e.kind {
                EntryKind::Bid => {
                    best_bid = Some(best_bid.map_or(e.price, |b: f64| b.max(e.price)));
                }
                EntryKind::Ask => {
                    best_ask = Some(best_ask.map_or(e.price, |a: f64| a.min(e.price)));
                }
            }
        }

        let mut q = self.quotes.get(symbol).cloned().unwrap_or(MarketQuote {
            symbol: symbol.to_string(),
            bid: 0.0,
            ask: 0.0,
            ts_ms: 0,
        });
        if let Some(b) = best_bid {
            q.bid = b;
        }
        if let Some(a) = best_ask {
            q.ask = a;
        }
        q.ts_ms = now_ms();
        QUOTE_UPDATES.with_label_values(&[symbol]).inc();
        self.quotes.insert(symbol.to_string(), q.clone());
        Some(q)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spot_snapshot(bid: &str, ask: &str) -> FixMessage {
        FixMessage {
            fields: vec![
                (field::MSG_TYPE, "W".into()),
                (field::SYMBOL, "1".into()),
                (field::NO_MD_ENTRIES, "2".into()),
                (field::MD_ENTRY_TYPE, "0".into()),
                (field::MD_ENTRY_PX, bid.into()),
                (field::MD_ENTRY_TYPE, "1".into()),
                (field::MD_ENTRY_PX, ask.into()),
            ],
        }
    }

    #[test]
    fn spot_snapshot_updates_bid_and_ask() {
        let mut board = QuoteBoard::new();
        let q = board
            .apply_snapshot("EURUSD", &spot_snapshot("1.0801", "1.0803"))
            .unwrap();
        assert_eq!(q.bid, 1.0801);
        assert_eq!(q.ask, 1.0803);
        let cached = board.quote("EURUSD").unwrap();
        assert_eq!(cached.bid, 1.0801);
        assert_eq!(cached.ask, 1.0803);
    }

    #[test]
    fn later_snapshot_wins() {
        let mut board = QuoteBoard::new();
        board.apply_snapshot("EURUSD", &spot_snapshot("1.0801", "1.0803"));
        board.apply_snapshot("EURUSD", &spot_snapshot("1.0805", "1.0807"));
        let q = board.quote("EURUSD").unwrap();
        assert_eq!(q.bid, 1.0805);
        assert_eq!(q.ask, 1.0807);
    }

    fn book_snapshot() -> FixMessage {
        FixMessage {
            fields: vec![
                (field::MSG_TYPE, "W".into()),
                (field::SYMBOL, "1".into()),
                (field::NO_MD_ENTRIES, "3".into()),
                (field::MD_ENTRY_TYPE, "0".into()),
                (field::MD_ENTRY_ID, "b1".into()),
                (field::MD_ENTRY_PX, "1.0799".into()),
                (field::MD_ENTRY_SIZE, "1000".into()),
                (field::MD_ENTRY_TYPE, "0".into()),
                (field::MD_ENTRY_ID, "b2".into()),
                (field::MD_ENTRY_PX, "1.0801".into()),
                (field::MD_ENTRY_SIZE, "500".into()),
                (field::MD_ENTRY_TYPE, "1".into()),
                (field::MD_ENTRY_ID, "a1".into()),
                (field::MD_ENTRY_PX, "1.0803".into()),
                (field::MD_ENTRY_SIZE, "800".into()),
            ],
        }
    }

    #[test]
    fn book_snapshot_recomputes_best_bid_ask() {
        let mut board = QuoteBoard::new();
        let q = board.apply_snapshot("EURUSD", &book_snapshot()).unwrap();
        assert_eq!(q.bid, 1.0801); // highest bid
        assert_eq!(q.ask, 1.0803); // lowest ask
    }

    #[test]
    fn incremental_delete_falls_back_to_next_level() {
        let mut board = QuoteBoard::new();
        board.apply_snapshot("EURUSD", &book_snapshot());

        // Delete the top bid; b1 becomes best.
        let incr = FixMessage {
            fields: vec![
                (field::MSG_TYPE, "X".into()),
                (field::SYMBOL, "1".into()),
                (field::NO_MD_ENTRIES, "1".into()),
                (field::MD_UPDATE_ACTION, "2".into()),
                (field::MD_ENTRY_ID, "b2".into()),
            ],
        };
        let q = board.apply_incremental("EURUSD", &incr).unwrap();
        assert_eq!(q.bid, 1.0799);
        assert_eq!(q.ask, 1.0803);
    }

    #[test]
    fn incremental_add_improves_best() {
        let mut board = QuoteBoard::new();
        board.apply_snapshot("EURUSD", &book_snapshot());

        let incr = FixMessage {
            fields: vec![
                (field::MSG_TYPE, "X".into()),
                (field::SYMBOL, "1".into()),
                (field::NO_MD_ENTRIES, "1".into()),
                (field::MD_UPDATE_ACTION, "0".into()),
                (field::MD_ENTRY_ID, "a2".into()),
                (field::MD_ENTRY_TYPE, "1".into()),
                (field::MD_ENTRY_PX, "1.0802".into()),
                (field::MD_ENTRY_SIZE, "200".into()),
            ],
        };
        let q = board.apply_incremental("EURUSD", &incr).unwrap();
        assert_eq!(q.ask, 1.0802);
    }
}
