//! Seams to the world outside the execution core.
//!
//! Each trait is implemented by an external adapter in production and by an
//! in-process double in tests. Callers treat every error as a collaborator
//! failure: advisory checks fail open, persistence failures are logged.

use crate::events::{ShadowAudit, Signal, TradeAction, TradeResult};
use crate::position::{LedgerSnapshot, WatcherRecord};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Quote from an independent low-latency price oracle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferencePrice {
    pub price: Decimal,
    pub confidence_interval: Decimal,
    pub publish_time: DateTime<Utc>,
    pub is_stale: bool,
}

impl ReferencePrice {
    /// True when the quote is flagged stale or older than `max_age_secs` at `now`.
    #[must_use]
    pub fn is_unusable(&self, now: DateTime<Utc>, max_age_secs: i64) -> bool {
        self.is_stale || self.price <= Decimal::ZERO || (now - self.publish_time).num_seconds() > max_age_secs
    }
}

#[async_trait]
pub trait PriceReference: Send + Sync {
    async fn fetch(&self, symbol: &str) -> Result<ReferencePrice>;
}

#[async_trait]
pub trait LiquiditySource: Send + Sync {
    /// Pool depth in USD.
    async fn get_liquidity(&self, symbol: &str) -> Result<Decimal>;
}

/// Outcome of the external token-safety screen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SafetyVerdict {
    Safe,
    Unsafe(String),
}

#[async_trait]
pub trait AssetSafety: Send + Sync {
    async fn check(&self, symbol: &str, mint: &str) -> Result<SafetyVerdict>;
}

#[async_trait]
pub trait PredictiveFilter: Send + Sync {
    /// Probability in `[0, 1]` that the signal is profitable.
    async fn probability(&self, signal: &Signal) -> Result<f64>;
}

/// Parameters handed to the live swap backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapRequest {
    pub direction: TradeAction,
    pub amount_usd: Decimal,
    pub symbol: String,
    pub mint: String,
    /// Token quantity to sell. `None` on buys.
    pub quantity: Option<Decimal>,
    pub max_slippage_bps: u32,
    pub priority_fee_lamports: u64,
}

/// What the live backend reports back after landing a swap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapReceipt {
    pub tx_id: String,
    pub fill_price: Decimal,
    pub quantity: Decimal,
}

#[async_trait]
pub trait SwapBackend: Send + Sync {
    async fn execute_swap(&self, request: SwapRequest) -> Result<SwapReceipt>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NotificationPriority {
    Low,
    Normal,
    High,
    Critical,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, message: &str, priority: NotificationPriority) -> Result<()>;
}

/// Durable storage for watcher state, ledger snapshots, and append-only logs.
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn save_position(&self, record: &WatcherRecord) -> Result<()>;
    async fn load_position(&self, engine: &str, symbol: &str) -> Result<Option<WatcherRecord>>;
    async fn delete_position(&self, engine: &str, symbol: &str) -> Result<()>;
    async fn load_all_positions(&self) -> Result<Vec<WatcherRecord>>;

    async fn save_ledger(&self, snapshot: &LedgerSnapshot) -> Result<()>;
    async fn load_ledger(&self) -> Result<Option<LedgerSnapshot>>;

    async fn append_trade(&self, result: &TradeResult) -> Result<()>;
    async fn append_audit(&self, audit: &ShadowAudit) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn quote(age_secs: i64, is_stale: bool) -> ReferencePrice {
        ReferencePrice {
            price: dec!(150),
            confidence_interval: dec!(0.05),
            publish_time: Utc::now() - Duration::seconds(age_secs),
            is_stale,
        }
    }

    #[test]
    fn test_fresh_quote_is_usable() {
        assert!(!quote(1, false).is_unusable(Utc::now(), 10));
    }

    #[test]
    fn test_old_or_flagged_quote_is_unusable() {
        assert!(quote(30, false).is_unusable(Utc::now(), 10));
        assert!(quote(0, true).is_unusable(Utc::now(), 10));
    }
}
