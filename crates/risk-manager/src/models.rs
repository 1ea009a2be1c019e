use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use trading_core::PositionSide;

/// Account-level limits. Percentages are fractions of equity (0.02 = 2%).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskLimits {
    /// Halt once daily P/L over equity falls to minus this
    pub max_daily_loss_pct: f64,
    /// Halt once decline from peak equity reaches this
    pub max_drawdown_pct: f64,
    /// Largest single position as a share of equity
    pub max_position_size_pct: f64,
    /// Equity put at risk per trade, measured at the stop-loss distance
    pub max_risk_per_trade_pct: f64,
    /// Cap on aggregate open plus reserved notional
    pub max_portfolio_exposure_pct: f64,
    /// Losing streak that raises a non-blocking warning
    pub consecutive_loss_warning: u32,
    /// Losing streak that halts trading; off unless set
    pub max_consecutive_losses: Option<u32>,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_daily_loss_pct: 0.02,
            max_drawdown_pct: 0.10,
            max_position_size_pct: 0.20,
            max_risk_per_trade_pct: 0.01,
            max_portfolio_exposure_pct: 0.80,
            consecutive_loss_warning: 3,
            max_consecutive_losses: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HaltReason {
    DailyLossLimit,
    MaxDrawdown,
    ConsecutiveLosses,
    Manual { note: String },
}

impl HaltReason {
    pub fn is_manual(&self) -> bool {
        matches!(self, HaltReason::Manual { .. })
    }
}

impl std::fmt::Display for HaltReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HaltReason::DailyLossLimit => f.write_str("daily loss limit"),
            HaltReason::MaxDrawdown => f.write_str("max drawdown"),
            HaltReason::ConsecutiveLosses => f.write_str("consecutive losses"),
            HaltReason::Manual { note } => write!(f, "manual halt: {}", note),
        }
    }
}

/// Account risk state. Owned by the risk manager and mutated only through it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskState {
    pub equity: Decimal,
    pub daily_pnl: Decimal,
    pub peak_equity: Decimal,
    pub drawdown_pct: f64,
    pub consecutive_losses: u32,
    pub trading_halted: bool,
    pub halt_reason: Option<HaltReason>,
    pub trading_day: NaiveDate,
    pub day_start_equity: Decimal,
}

impl RiskState {
    pub fn new(equity: Decimal, trading_day: NaiveDate) -> Self {
        Self {
            equity,
            daily_pnl: Decimal::ZERO,
            peak_equity: equity,
            drawdown_pct: 0.0,
            consecutive_losses: 0,
            trading_halted: false,
            halt_reason: None,
            trading_day,
            day_start_equity: equity,
        }
    }

    /// Daily P/L as a fraction of current equity
    pub fn daily_pnl_pct(&self) -> f64 {
        if self.equity <= Decimal::ZERO {
            return if self.daily_pnl < Decimal::ZERO { -1.0 } else { 0.0 };
        }
        (self.daily_pnl / self.equity).to_f64().unwrap_or(0.0)
    }

    pub(crate) fn mark_peak(&mut self) {
        if self.equity > self.peak_equity {
            self.peak_equity = self.equity;
        }
        self.drawdown_pct = if self.peak_equity > Decimal::ZERO {
            ((self.peak_equity - self.equity) / self.peak_equity)
                .to_f64()
                .unwrap_or(0.0)
                .max(0.0)
        } else {
            0.0
        };
    }
}

impl std::fmt::Display for RiskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "equity=${:.2} daily_pnl=${:.2} ({:.2}%) peak=${:.2} drawdown={:.2}% losses_in_row={} halted={}",
            self.equity,
            self.daily_pnl,
            self.daily_pnl_pct() * 100.0,
            self.peak_equity,
            self.drawdown_pct * 100.0,
            self.consecutive_losses,
            self.trading_halted
        )
    }
}

/// Approved size for a new entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSize {
    pub instrument: String,
    pub side: PositionSide,
    pub quantity: Decimal,
    pub price: Decimal,
    pub notional: Decimal,
    /// Loss if the stop is hit at `stop_loss_pct`
    pub risk_amount: Decimal,
    pub stop_loss_pct: f64,
}

/// Fill notification as seen by the risk manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FillEvent {
    /// Entry filled; the reservation becomes open exposure at the filled notional
    Entry { instrument: String, notional: Decimal },
    /// Exit filled; exposure is released and the P/L realized
    Exit { instrument: String, realized_pnl: Decimal },
}

impl FillEvent {
    pub fn instrument(&self) -> &str {
        match self {
            FillEvent::Entry { instrument, .. } | FillEvent::Exit { instrument, .. } => instrument,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExposureStatus {
    /// Held by a sizing decision that has not produced an order yet
    Reserved,
    /// Backed by a submitted entry order awaiting its fill
    Committed,
    Open,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExposureEntry {
    pub notional: Decimal,
    pub status: ExposureStatus,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RiskError {
    #[error("trading halted: {reason}")]
    TradingHalted { reason: String },

    #[error("no safe size for {instrument}: {reason}")]
    NoSafeSize { instrument: String, reason: String },

    #[error("{0} already has an open position or pending entry")]
    PositionAlreadyOpen(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    ConsecutiveLossWarning,
    TradingHalted,
    ExitOrderFailed,
    /// A broker fill with no position to track it
    UntrackedFill,
}

/// Operator-facing notice with enough context to act on without the logs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    /// Whether new entries are blocked while this condition stands
    pub blocking: bool,
    pub instrument: Option<String>,
    pub message: String,
    pub snapshot: RiskState,
    pub raised_at: DateTime<Utc>,
}

impl Alert {
    pub fn new(
        kind: AlertKind,
        severity: AlertSeverity,
        blocking: bool,
        instrument: Option<String>,
        message: String,
        snapshot: RiskState,
    ) -> Self {
        Self {
            kind,
            severity,
            blocking,
            instrument,
            message,
            snapshot,
            raised_at: Utc::now(),
        }
    }

    /// Single line for logs and chat notifications
    pub fn summary(&self) -> String {
        match &self.instrument {
            Some(instrument) => format!(
                "[{:?}] {} ({}) | {}",
                self.severity, self.message, instrument, self.snapshot
            ),
            None => format!("[{:?}] {} | {}", self.severity, self.message, self.snapshot),
        }
    }
}
