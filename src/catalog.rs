// ===============================
// src/catalog.rs
// ===============================
//
// Security catalog: symbol name <-> numeric id <-> price digits, rebuilt
// from the SecurityList response once per Trade connection. Every request
// that references a symbol id is deferred until this table is populated.

use ahash::AHashMap as HashMap;

use crate::domain::{Conversion, Security};
use crate::fix::{field, FixMessage};

#[derive(Debug, Default)]
pub struct SecurityCatalog {
    by_id: HashMap<i64, Security>,
    by_name: HashMap<String, Security>,
}

impl SecurityCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_loaded(&self) -> bool {
        !self.by_id.is_empty()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn insert(&mut self, sec: Security) {
        self.by_id.insert(sec.id, sec.clone());
        self.by_name.insert(sec.name.clone(), sec);
    }

    pub fn by_id(&self, id: i64) -> Option<&Security> {
        self.by_id.get(&id)
    }

    pub fn by_name(&self, name: &str) -> Option<&Security> {
        self.by_name.get(name)
    }

    /// Rebuild the table from a SecurityList (35=y): one repeating-group
    /// instance per symbol, keyed by tag 55, with name/digits in 1007/1008.
    /// Returns the number of securities loaded.
    pub fn load(&mut self, m: &FixMessage) -> usize {
        self.by_id.clear();
        self.by_name.clear();
        for g in m.groups(field::NO_RELATED_SYM, field::SYMBOL, None) {
            let id = g.get(&field::SYMBOL).and_then(|v| v.parse::<i64>().ok());
            let name = g.get(&field::SYMBOL_NAME);
            let (Some(id), Some(name)) = (id, name) else {
                continue;
            };
            let digits = g
                .get(&field::SYMBOL_DIGITS)
                .and_then(|v| v.parse().ok())
                .unwrap_or(5);
            self.insert(Security {
                id,
                name: name.clone(),
                digits,
            });
        }
        self.by_id.len()
    }

    /// Conversion pair needed to value `symbol` in `account_currency`.
    /// Uses the direct pair (quote+account) when the venue lists it, the
    /// inverse pair otherwise; `None` when the quote currency already is the
    /// account currency.
    pub fn conversion_pair(&self, symbol: &str, account_currency: &str) -> Option<Conversion> {
        if symbol.len() < 6 {
            return None;
        }
        let quote_ccy = &symbol[symbol.len() - 3..];
        if quote_ccy == account_currency {
            return None;
        }
        let direct = format!("{quote_ccy}{account_currency}");
        if self.by_name(&direct).is_some() {
            return Some(Conversion {
                pair: direct,
                inverse: false,
            });
        }
        Some(Conversion {
            pair: format!("{account_currency}{quote_ccy}"),
            inverse: true,
        })
    }
}
