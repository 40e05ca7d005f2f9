use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Holding of one asset inside one engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub mint: String,
    pub balance: Decimal,
    pub avg_price: Decimal,
    pub cost_basis_usd: Decimal,
    pub opened_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl Position {
    #[must_use]
    pub fn open(
        symbol: impl Into<String>,
        mint: impl Into<String>,
        quantity: Decimal,
        price: Decimal,
        cost_usd: Decimal,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            mint: mint.into(),
            balance: quantity,
            avg_price: price,
            cost_basis_usd: cost_usd,
            opened_at: now,
            last_updated: now,
        }
    }

    /// Adds to the holding, folding the new fill into the weighted average price.
    pub fn add(&mut self, quantity: Decimal, price: Decimal, cost_usd: Decimal, now: DateTime<Utc>) {
        let total_cost = self.avg_price * self.balance + price * quantity;
        self.balance += quantity;
        if self.balance > Decimal::ZERO {
            self.avg_price = total_cost / self.balance;
        }
        self.cost_basis_usd += cost_usd;
        self.last_updated = now;
    }

    /// Removes `quantity` (capped at the balance) and returns the cost basis released.
    pub fn reduce(&mut self, quantity: Decimal, now: DateTime<Utc>) -> Decimal {
        let quantity = quantity.min(self.balance);
        if self.balance <= Decimal::ZERO {
            return Decimal::ZERO;
        }

        let released = self.cost_basis_usd * quantity / self.balance;
        self.balance -= quantity;
        self.cost_basis_usd -= released;
        self.last_updated = now;
        released
    }

    /// True when the remaining balance is at or below `dust`.
    #[must_use]
    pub fn is_flat(&self, dust: Decimal) -> bool {
        self.balance <= dust
    }

    #[must_use]
    pub fn market_value(&self, price: Decimal) -> Decimal {
        self.balance * price
    }

    #[must_use]
    pub fn unrealized_pnl(&self, price: Decimal) -> Decimal {
        (price - self.avg_price) * self.balance
    }

    /// Seconds the position has been open at `now`.
    #[must_use]
    pub fn held_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.opened_at).num_seconds()
    }
}

/// Running performance counters for one engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineStats {
    pub wins: u32,
    pub losses: u32,
    pub trades: u32,
    pub failed_transactions: u32,
    pub total_pnl_usd: Decimal,
    pub fees_paid_usd: Decimal,
    pub slippage_usd: Decimal,
}

impl EngineStats {
    #[must_use]
    pub fn win_rate(&self) -> f64 {
        let closed = self.wins + self.losses;
        if closed == 0 {
            return 0.0;
        }
        f64::from(self.wins) / f64::from(closed)
    }
}

/// Typed per-engine capital record.
///
/// `cash_balance` never goes negative; every debit is checked before it is applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineAccount {
    pub id: String,
    pub allocated_capital: Decimal,
    pub cash_balance: Decimal,
    /// Native token held for transaction fees.
    pub gas_reserve: Decimal,
    pub positions: HashMap<String, Position>,
    pub stats: EngineStats,
    pub peak_equity: Decimal,
    pub daily_start_equity: Decimal,
    pub day_started_at: DateTime<Utc>,
}

impl EngineAccount {
    #[must_use]
    pub fn new(id: impl Into<String>, capital: Decimal, gas_reserve: Decimal, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            allocated_capital: capital,
            cash_balance: capital,
            gas_reserve,
            positions: HashMap::new(),
            stats: EngineStats::default(),
            peak_equity: capital,
            daily_start_equity: capital,
            day_started_at: now,
        }
    }

    /// Cash plus positions, marked at `marks` where available and at cost otherwise.
    #[must_use]
    pub fn equity(&self, marks: &HashMap<String, Decimal>) -> Decimal {
        let held: Decimal = self
            .positions
            .values()
            .map(|p| p.market_value(marks.get(&p.symbol).copied().unwrap_or(p.avg_price)))
            .sum();
        self.cash_balance + held
    }

    /// Cash plus positions at their average entry price.
    #[must_use]
    pub fn book_equity(&self) -> Decimal {
        self.equity(&HashMap::new())
    }
}

/// Serialized state of the whole ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub engines: Vec<EngineAccount>,
    pub saved_at: DateTime<Utc>,
    /// Monotonic counter so stale snapshots can be told apart from newer ones.
    #[serde(default)]
    pub version: u64,
}

/// Persisted watcher state for one (engine, symbol).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatcherRecord {
    pub engine: String,
    pub symbol: String,
    #[serde(default)]
    pub mint: String,
    pub in_position: bool,
    pub entry_price: Decimal,
    pub cost_basis: Decimal,
    pub entry_time: Option<DateTime<Utc>>,
    pub max_price_achieved: Decimal,
    pub trailing_stop_price: Option<Decimal>,
    pub last_signal_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub hibernate_until: Option<DateTime<Utc>>,
    /// Set when the record was synthesized from the ledger instead of a real entry.
    #[serde(default)]
    pub orphan_recovered: bool,
    /// Entries and exits inside the last hour, for the hourly trade cap.
    #[serde(default)]
    pub recent_trades: Vec<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_weighted_average_on_add() {
        let now = Utc::now();
        let mut pos = Position::open("SOL", "mint", dec!(1), dec!(100), dec!(100), now);
        pos.add(dec!(3), dec!(120), dec!(360), now);

        // (1*100 + 3*120) / 4 = 115
        assert_eq!(pos.balance, dec!(4));
        assert_eq!(pos.avg_price, dec!(115));
        assert_eq!(pos.cost_basis_usd, dec!(460));
    }

    #[test]
    fn test_reduce_releases_proportional_cost() {
        let now = Utc::now();
        let mut pos = Position::open("SOL", "mint", dec!(4), dec!(100), dec!(400), now);

        let released = pos.reduce(dec!(1), now);
        assert_eq!(released, dec!(100));
        assert_eq!(pos.balance, dec!(3));
        assert_eq!(pos.cost_basis_usd, dec!(300));
        assert_eq!(pos.avg_price, dec!(100));
    }

    #[test]
    fn test_reduce_is_capped_at_balance() {
        let now = Utc::now();
        let mut pos = Position::open("SOL", "mint", dec!(2), dec!(10), dec!(20), now);

        let released = pos.reduce(dec!(5), now);
        assert_eq!(released, dec!(20));
        assert!(pos.is_flat(Decimal::ZERO));
    }

    #[test]
    fn test_engine_equity_uses_marks_when_present() {
        let now = Utc::now();
        let mut account = EngineAccount::new("PRIMARY", dec!(1000), dec!(0.02), now);
        account.cash_balance = dec!(800);
        account.positions.insert(
            "SOL".to_string(),
            Position::open("SOL", "mint", dec!(2), dec!(100), dec!(200), now),
        );

        assert_eq!(account.book_equity(), dec!(1000));

        let marks = HashMap::from([("SOL".to_string(), dec!(110))]);
        assert_eq!(account.equity(&marks), dec!(1020));
    }

    #[test]
    fn test_win_rate() {
        let stats = EngineStats {
            wins: 3,
            losses: 1,
            ..Default::default()
        };
        assert!((stats.win_rate() - 0.75).abs() < f64::EPSILON);
        assert!((EngineStats::default().win_rate() - 0.0).abs() < f64::EPSILON);
    }
}
