use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::Action;

/// How far past the volatility-derived reach a configured threshold may sit
/// before it is considered unreachable.
const REACHABILITY_SLACK: f64 = 1.5;

/// Stop-loss distance relative to take-profit distance in calibrated profiles
const CALIBRATED_STOP_RATIO: f64 = 0.75;

/// Volatility bucket that selects an instrument's exit thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetClass {
    LowVolatility,
    Equity,
    Commodity,
    Crypto,
}

impl AssetClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetClass::LowVolatility => "low_volatility",
            AssetClass::Equity => "equity",
            AssetClass::Commodity => "commodity",
            AssetClass::Crypto => "crypto",
        }
    }
}

impl fmt::Display for AssetClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssetClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low_volatility" | "low_vol" => Ok(AssetClass::LowVolatility),
            "equity" => Ok(AssetClass::Equity),
            "commodity" => Ok(AssetClass::Commodity),
            "crypto" => Ok(AssetClass::Crypto),
            other => Err(format!("unknown asset class '{}'", other)),
        }
    }
}

/// Exit thresholds for one asset class.
///
/// Percentages are fractions (0.004 = 0.4%). Holding periods count
/// evaluation cycles. Thresholds must be sized to the class's typical
/// range; a profile wider than the class ever moves never exits.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExitProfile {
    pub take_profit_pct: f64,
    pub stop_loss_pct: f64,
    pub max_holding_periods: u32,
    /// Typical per-period range of the class, used to sanity-check thresholds
    #[serde(default)]
    pub typical_daily_range_pct: Option<f64>,
}

impl ExitProfile {
    pub fn new(take_profit_pct: f64, stop_loss_pct: f64, max_holding_periods: u32) -> Self {
        Self {
            take_profit_pct,
            stop_loss_pct,
            max_holding_periods,
            typical_daily_range_pct: None,
        }
    }

    /// Derive thresholds from the class's typical range: take profit is the
    /// range scaled by √periods, stop loss sits at 75% of that.
    pub fn calibrated(typical_daily_range_pct: f64, max_holding_periods: u32) -> Self {
        let reach = typical_daily_range_pct * (max_holding_periods.max(1) as f64).sqrt();
        Self {
            take_profit_pct: reach,
            stop_loss_pct: reach * CALIBRATED_STOP_RATIO,
            max_holding_periods,
            typical_daily_range_pct: Some(typical_daily_range_pct),
        }
    }

    /// Whether the class can plausibly reach both thresholds before the
    /// holding period runs out. Profiles without a declared range pass.
    pub fn is_reachable(&self) -> bool {
        match self.typical_daily_range_pct {
            Some(range) if range > 0.0 => {
                let reach = range
                    * (self.max_holding_periods.max(1) as f64).sqrt()
                    * REACHABILITY_SLACK;
                self.take_profit_pct <= reach && self.stop_loss_pct <= reach
            }
            _ => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// Side opened by an entry decision; HOLD opens nothing
    pub fn from_action(action: Action) -> Option<Self> {
        match action {
            Action::Buy => Some(PositionSide::Long),
            Action::Sell => Some(PositionSide::Short),
            Action::Hold => None,
        }
    }

    /// Order action that closes this side
    pub fn closing_action(&self) -> Action {
        match self {
            PositionSide::Long => Action::Sell,
            PositionSide::Short => Action::Buy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionState {
    Open,
    ExitPending,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    TakeProfit,
    StopLoss,
    MaxHoldingPeriod,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::TakeProfit => "take_profit",
            ExitReason::StopLoss => "stop_loss",
            ExitReason::MaxHoldingPeriod => "max_holding_period",
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exit order bookkeeping while a position is EXIT_PENDING
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingExit {
    pub reason: ExitReason,
    pub triggered_at: DateTime<Utc>,
    /// Broker order id of the outstanding exit order, if one was accepted
    pub order_id: Option<String>,
    pub attempts: u32,
    /// Set once retries are exhausted; automatic retries stop until reset
    pub escalated: bool,
    pub last_error: Option<String>,
}

impl PendingExit {
    pub fn new(reason: ExitReason, triggered_at: DateTime<Utc>) -> Self {
        Self {
            reason,
            triggered_at,
            order_id: None,
            attempts: 0,
            escalated: false,
            last_error: None,
        }
    }
}

/// One open exposure in one instrument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub instrument: String,
    pub asset_class: AssetClass,
    pub side: PositionSide,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub entry_time: DateTime<Utc>,
    pub take_profit_pct: f64,
    pub stop_loss_pct: f64,
    pub max_holding_periods: u32,
    pub periods_held: u32,
    pub last_price: Decimal,
    pub unrealized_pnl: Decimal,
    pub state: PositionState,
    pub pending_exit: Option<PendingExit>,
}

impl Position {
    pub fn open(
        instrument: impl Into<String>,
        asset_class: AssetClass,
        side: PositionSide,
        quantity: Decimal,
        entry_price: Decimal,
        entry_time: DateTime<Utc>,
        profile: &ExitProfile,
    ) -> Self {
        Self {
            instrument: instrument.into(),
            asset_class,
            side,
            quantity,
            entry_price,
            entry_time,
            take_profit_pct: profile.take_profit_pct,
            stop_loss_pct: profile.stop_loss_pct,
            max_holding_periods: profile.max_holding_periods,
            periods_held: 0,
            last_price: entry_price,
            unrealized_pnl: Decimal::ZERO,
            state: PositionState::Open,
            pending_exit: None,
        }
    }

    /// Capital committed at entry
    pub fn entry_notional(&self) -> Decimal {
        self.quantity * self.entry_price
    }

    /// P/L of closing the whole position at `price`
    pub fn pnl_at(&self, price: Decimal) -> Decimal {
        let per_unit = match self.side {
            PositionSide::Long => price - self.entry_price,
            PositionSide::Short => self.entry_price - price,
        };
        per_unit * self.quantity
    }

    /// Direction-aware return since entry at `price`, as a fraction
    pub fn return_at(&self, price: Decimal) -> f64 {
        if self.entry_price <= Decimal::ZERO {
            return 0.0;
        }
        let change = ((price - self.entry_price) / self.entry_price)
            .to_f64()
            .unwrap_or(0.0);
        match self.side {
            PositionSide::Long => change,
            PositionSide::Short => -change,
        }
    }

    pub fn unrealized_return(&self) -> f64 {
        self.return_at(self.last_price)
    }

    /// Apply a price update
    pub fn mark(&mut self, price: Decimal) {
        self.last_price = price;
        self.unrealized_pnl = self.pnl_at(price);
    }

    /// First exit condition that currently holds, in priority order
    /// stop loss, take profit, holding period.
    pub fn exit_trigger(&self) -> Option<ExitReason> {
        let ret = self.unrealized_return();
        if ret <= -self.stop_loss_pct {
            Some(ExitReason::StopLoss)
        } else if ret >= self.take_profit_pct {
            Some(ExitReason::TakeProfit)
        } else if self.periods_held >= self.max_holding_periods {
            Some(ExitReason::MaxHoldingPeriod)
        } else {
            None
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == PositionState::Open
    }
}
