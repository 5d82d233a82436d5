//! Channel-code to book routing.

use std::collections::HashMap;

use crate::book::LevelBook;

/// Owns one book per tracked symbol and resolves the feed's numeric
/// channel codes to them. The code map is fixed at construction; only
/// the books themselves mutate afterwards.
#[derive(Debug)]
pub struct BookRegistry {
    code_to_symbol: HashMap<u64, String>,
    books: HashMap<String, LevelBook>,
}

impl BookRegistry {
    /// Builds the registry from `(code, symbol)` pairs, creating an empty
    /// book of the given depth per symbol.
    pub fn new(entries: impl IntoIterator<Item = (u64, String)>, depth: usize) -> Self {
        let mut code_to_symbol = HashMap::new();
        let mut books = HashMap::new();
        for (code, symbol) in entries {
            books
                .entry(symbol.clone())
                .or_insert_with(|| LevelBook::new(symbol.clone(), depth));
            code_to_symbol.insert(code, symbol);
        }
        Self {
            code_to_symbol,
            books,
        }
    }

    /// Symbol for a channel code, `None` for codes outside the tracked set.
    pub fn resolve(&self, code: u64) -> Option<&str> {
        self.code_to_symbol.get(&code).map(String::as_str)
    }

    pub fn book(&self, symbol: &str) -> Option<&LevelBook> {
        self.books.get(symbol)
    }

    pub fn book_mut(&mut self, symbol: &str) -> Option<&mut LevelBook> {
        self.books.get_mut(symbol)
    }

    pub fn len(&self) -> usize {
        self.books.len()
    }

    pub fn is_empty(&self) -> bool {
        self.books.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::Side;
    use rust_decimal_macros::dec;

    fn registry() -> BookRegistry {
        BookRegistry::new(
            vec![(148, "USDT_BTC".to_string()), (149, "USDT_ETH".to_string())],
            5,
        )
    }

    #[test]
    fn resolves_known_codes_only() {
        let registry = registry();
        assert_eq!(registry.resolve(148), Some("USDT_BTC"));
        assert_eq!(registry.resolve(149), Some("USDT_ETH"));
        assert_eq!(registry.resolve(999), None);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn mutations_land_in_the_right_book() {
        let mut registry = registry();
        registry
            .book_mut("USDT_BTC")
            .unwrap()
            .upsert(Side::Bid, dec!(10), dec!(1))
            .unwrap();

        assert_eq!(registry.book("USDT_BTC").unwrap().bids().len(), 1);
        assert!(registry.book("USDT_ETH").unwrap().is_empty());
    }
}
