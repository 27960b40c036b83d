// exchange-common/src/data/book.rs
// ====
// Order book maintenance: snapshot rebuild + incremental level updates
// ====

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookLevel {
    pub price: Decimal,
    pub amount: Decimal,
    /// Cumulative amount from the best price outward; the first level's
    /// total equals its own amount.
    pub total: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookSide {
    Bids,
    Asks,
}

/// Bids sorted descending by price, asks ascending.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderBook {
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
}

impl OrderBook {
    /// Rebuilds the book from a full snapshot of (price, amount) pairs.
    pub fn from_snapshot(bids: Vec<(Decimal, Decimal)>, asks: Vec<(Decimal, Decimal)>) -> Self {
        let mut book = OrderBook {
            bids: levels_of(bids),
            asks: levels_of(asks),
        };
        book.normalize();
        book
    }

    /// Applies one incremental level update: unknown price with amount > 0
    /// inserts, amount == 0 removes, otherwise the amount at that price is
    /// replaced. The side is re-sorted and totals re-accumulated.
    pub fn apply_delta(&mut self, side: BookSide, price: Decimal, amount: Decimal) {
        let levels = match side {
            BookSide::Bids => &mut self.bids,
            BookSide::Asks => &mut self.asks,
        };
        match levels.iter().position(|l| l.price == price) {
            Some(i) if amount.is_zero() => {
                levels.remove(i);
            }
            Some(i) => levels[i].amount = amount,
            None if amount.is_zero() => {}
            None => levels.push(BookLevel {
                price,
                amount,
                total: Decimal::ZERO,
            }),
        }
        self.normalize();
    }

    /// Re-sorts both sides and recomputes running totals.
    pub fn normalize(&mut self) {
        self.bids.sort_by(|a, b| b.price.cmp(&a.price));
        self.asks.sort_by(|a, b| a.price.cmp(&b.price));
        accumulate(&mut self.bids);
        accumulate(&mut self.asks);
    }

    pub fn best_bid(&self) -> Option<&BookLevel> {
        self.bids.first()
    }

    pub fn best_ask(&self) -> Option<&BookLevel> {
        self.asks.first()
    }
}

fn levels_of(pairs: Vec<(Decimal, Decimal)>) -> Vec<BookLevel> {
    pairs
        .into_iter()
        .filter(|(_, amount)| !amount.is_zero())
        .map(|(price, amount)| BookLevel {
            price,
            amount,
            total: Decimal::ZERO,
        })
        .collect()
}

fn accumulate(levels: &mut [BookLevel]) {
    let mut running = Decimal::ZERO;
    for level in levels.iter_mut() {
        running += level.amount;
        level.total = running;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn snapshot() -> OrderBook {
        OrderBook::from_snapshot(
            vec![(dec!(100), dec!(1)), (dec!(99), dec!(2))],
            vec![(dec!(101), dec!(1)), (dec!(102), dec!(2))],
        )
    }

    #[test]
    fn test_snapshot_totals() {
        let book = snapshot();
        assert_eq!(book.bids[0].total, dec!(1));
        assert_eq!(book.bids[1].total, dec!(3));
        assert_eq!(book.asks[0].total, dec!(1));
        assert_eq!(book.asks[1].total, dec!(3));
    }

    #[test]
    fn test_delta_zero_amount_removes_level() {
        let mut book = snapshot();
        book.apply_delta(BookSide::Bids, dec!(100), Decimal::ZERO);
        assert_eq!(book.bids.len(), 1);
        assert_eq!(book.bids[0].price, dec!(99));
        assert_eq!(book.bids[0].total, dec!(2));
    }

    #[test]
    fn test_delta_new_price_inserts_sorted() {
        let mut book = snapshot();
        book.apply_delta(BookSide::Bids, dec!(99.5), dec!(4));
        let prices: Vec<Decimal> = book.bids.iter().map(|l| l.price).collect();
        assert_eq!(prices, vec![dec!(100), dec!(99.5), dec!(99)]);
        assert_eq!(book.bids[1].total, dec!(5));
        assert_eq!(book.bids[2].total, dec!(7));
    }

    #[test]
    fn test_delta_replaces_amount_in_place() {
        let mut book = snapshot();
        book.apply_delta(BookSide::Asks, dec!(101), dec!(5));
        assert_eq!(book.asks[0].amount, dec!(5));
        assert_eq!(book.asks[1].total, dec!(7));
    }

    #[test]
    fn test_zero_amount_delta_for_unknown_price_is_noop() {
        let mut book = snapshot();
        book.apply_delta(BookSide::Asks, dec!(105), Decimal::ZERO);
        assert_eq!(book.asks.len(), 2);
    }
}
