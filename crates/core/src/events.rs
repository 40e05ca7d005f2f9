//! Signals, trade results, and audit records exchanged between components.
//!
//! Everything in this module is plain data: produced once, never mutated
//! after it leaves the component that created it.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// =============================================================================
// Enums
// =============================================================================

/// Direction of a proposed trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeAction {
    Buy,
    Sell,
    Hold,
}

impl fmt::Display for TradeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
            Self::Hold => write!(f, "HOLD"),
        }
    }
}

/// Where a fill came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExecutionMode {
    /// Simulated fills against the paper ledger.
    #[default]
    Paper,
    /// Fills reported by the live swap backend.
    Live,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Paper => write!(f, "PAPER"),
            Self::Live => write!(f, "LIVE"),
        }
    }
}

// =============================================================================
// Signal
// =============================================================================

/// A trade proposal produced by an external strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub action: TradeAction,
    pub symbol: String,
    /// Token address. Empty when the caller does not track one.
    #[serde(default)]
    pub mint: String,
    pub price: Decimal,
    #[serde(default)]
    pub reason: String,
    /// Requested notional. `None` lets the executor size from confidence.
    #[serde(default)]
    pub size_usd: Option<Decimal>,
    pub confidence: f64,
    /// Set by the strategy when the market is moving abnormally fast.
    #[serde(default)]
    pub volatile: bool,
    /// Used by the priority-fee abort check on live buys.
    #[serde(default)]
    pub expected_profit_usd: Option<Decimal>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Signal {
    /// Creates a BUY signal with full confidence.
    #[must_use]
    pub fn buy(symbol: impl Into<String>, price: Decimal) -> Self {
        Self::new(TradeAction::Buy, symbol, price)
    }

    /// Creates a SELL signal with full confidence.
    #[must_use]
    pub fn sell(symbol: impl Into<String>, price: Decimal) -> Self {
        Self::new(TradeAction::Sell, symbol, price)
    }

    fn new(action: TradeAction, symbol: impl Into<String>, price: Decimal) -> Self {
        Self {
            action,
            symbol: symbol.into(),
            mint: String::new(),
            price,
            reason: String::new(),
            size_usd: None,
            confidence: 1.0,
            volatile: false,
            expected_profit_usd: None,
            timestamp: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_mint(mut self, mint: impl Into<String>) -> Self {
        self.mint = mint.into();
        self
    }

    #[must_use]
    pub fn with_size(mut self, size_usd: Decimal) -> Self {
        self.size_usd = Some(size_usd);
        self
    }

    #[must_use]
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    #[must_use]
    pub fn with_expected_profit(mut self, profit_usd: Decimal) -> Self {
        self.expected_profit_usd = Some(profit_usd);
        self
    }

    #[must_use]
    pub fn volatile(mut self) -> Self {
        self.volatile = true;
        self
    }
}

// =============================================================================
// Rejections
// =============================================================================

/// Why an order attempt did not produce a fill.
///
/// Admission rejections are expected outcomes. They travel inside a failed
/// [`TradeResult`] rather than as an `Err`.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Rejection {
    #[error("Confidence {confidence:.2} below minimum {minimum:.2}")]
    LowConfidence { confidence: f64, minimum: f64 },

    #[error("Unsupported asset: {reason}")]
    UnsupportedAsset { reason: String },

    #[error("Insufficient cash: need ${required}, have ${available}")]
    InsufficientCash {
        required: Decimal,
        available: Decimal,
    },

    #[error("Insufficient native balance for gas: {reserve} < {floor}")]
    GasFloorBreach { reserve: Decimal, floor: Decimal },

    #[error("Low liquidity ${liquidity} < ${minimum}")]
    LowLiquidity { liquidity: Decimal, minimum: Decimal },

    #[error("MAX_POSITIONS ({open}/{max})")]
    PositionCeiling { open: usize, max: usize },

    #[error("Predictive filter probability {probability:.2} below {threshold:.2}")]
    PredictiveFilterReject { probability: f64, threshold: f64 },

    #[error("Price divergence {divergence_pct:.3}% exceeds {tolerance_pct:.3}%")]
    PriceDivergence {
        divergence_pct: f64,
        tolerance_pct: f64,
    },

    #[error("Signal cooldown active, {remaining_secs}s remaining")]
    CooldownActive { remaining_secs: i64 },

    #[error("Hibernating after stop-loss, {remaining_secs}s remaining")]
    Hibernating { remaining_secs: i64 },

    #[error("Hourly trade limit reached ({count}/{max})")]
    HourlyTradeLimit { count: u32, max: u32 },

    #[error("Priority tip ${tip_usd:.4} too large for expected profit ${expected_profit_usd}")]
    TipExceedsProfit {
        tip_usd: f64,
        expected_profit_usd: Decimal,
    },

    #[error("Drawdown halt: {detail}")]
    DrawdownHalt { detail: String },

    #[error("No position in {symbol}")]
    NoPosition { symbol: String },

    #[error("Ledger lock timed out")]
    LockTimeout,

    #[error("Transaction failed: {reason}")]
    TransactionFailed { reason: String },

    #[error("Ledger rejected order: {reason}")]
    LedgerRejected { reason: String },

    #[error("HOLD signals are not executed")]
    NotActionable,
}

// =============================================================================
// Trade Result
// =============================================================================

/// Outcome of one order attempt, including rejections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeResult {
    pub success: bool,
    pub action: TradeAction,
    pub engine: String,
    pub symbol: String,
    pub fill_price: Decimal,
    pub quantity: Decimal,
    /// Percent difference between the requested and the filled price.
    pub slippage_pct: f64,
    pub tx_id: Option<String>,
    pub pnl_usd: Option<Decimal>,
    pub fee_usd: Decimal,
    pub source: ExecutionMode,
    pub timestamp: DateTime<Utc>,
    pub latency_ms: u64,
    pub reason: String,
    pub rejection: Option<Rejection>,
}

impl TradeResult {
    /// Creates a successful result. Remaining fields are set with the `with_*` methods.
    #[must_use]
    pub fn filled(
        engine: impl Into<String>,
        symbol: impl Into<String>,
        action: TradeAction,
        source: ExecutionMode,
        fill_price: Decimal,
        quantity: Decimal,
    ) -> Self {
        Self {
            success: true,
            action,
            engine: engine.into(),
            symbol: symbol.into(),
            fill_price,
            quantity,
            slippage_pct: 0.0,
            tx_id: None,
            pnl_usd: None,
            fee_usd: Decimal::ZERO,
            source,
            timestamp: Utc::now(),
            latency_ms: 0,
            reason: String::new(),
            rejection: None,
        }
    }

    /// Creates a failed result carrying the rejection reason.
    #[must_use]
    pub fn rejected(
        engine: impl Into<String>,
        symbol: impl Into<String>,
        action: TradeAction,
        source: ExecutionMode,
        rejection: Rejection,
    ) -> Self {
        Self {
            success: false,
            action,
            engine: engine.into(),
            symbol: symbol.into(),
            fill_price: Decimal::ZERO,
            quantity: Decimal::ZERO,
            slippage_pct: 0.0,
            tx_id: None,
            pnl_usd: None,
            fee_usd: Decimal::ZERO,
            source,
            timestamp: Utc::now(),
            latency_ms: 0,
            reason: rejection.to_string(),
            rejection: Some(rejection),
        }
    }

    #[must_use]
    pub fn with_slippage_pct(mut self, slippage_pct: f64) -> Self {
        self.slippage_pct = slippage_pct;
        self
    }

    #[must_use]
    pub fn with_tx_id(mut self, tx_id: impl Into<String>) -> Self {
        self.tx_id = Some(tx_id.into());
        self
    }

    #[must_use]
    pub fn with_pnl(mut self, pnl_usd: Decimal) -> Self {
        self.pnl_usd = Some(pnl_usd);
        self
    }

    #[must_use]
    pub fn with_fee(mut self, fee_usd: Decimal) -> Self {
        self.fee_usd = fee_usd;
        self
    }

    #[must_use]
    pub fn with_latency_ms(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    #[must_use]
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Notional value of the fill.
    #[must_use]
    pub fn notional(&self) -> Decimal {
        self.fill_price * self.quantity
    }
}

// =============================================================================
// Shadow Audit
// =============================================================================

/// Paper-vs-live comparison for a single signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShadowAudit {
    pub symbol: String,
    pub action: TradeAction,
    pub signal_price: Decimal,
    pub paper_fill: Decimal,
    pub live_fill: Decimal,
    /// `(live - paper) / paper * 100`.
    pub delta_pct: f64,
    /// Live completion time minus paper completion time.
    pub lag_ms: i64,
    pub paper_slippage: f64,
    pub live_slippage: f64,
    pub timestamp: DateTime<Utc>,
}

impl ShadowAudit {
    /// Drift above this magnitude (percent) is considered significant.
    pub const SIGNIFICANT_DELTA_PCT: f64 = 1.0;

    #[must_use]
    pub fn is_significant(&self) -> bool {
        self.delta_pct.abs() > Self::SIGNIFICANT_DELTA_PCT
    }
}
