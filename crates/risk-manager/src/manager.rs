use std::collections::HashMap;

use chrono::NaiveDate;
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use trading_core::{Decision, Position, PositionSide, PositionState};

use crate::models::*;

/// Mutable book guarded by the manager's single lock
struct RiskBook {
    state: RiskState,
    exposure: HashMap<String, ExposureEntry>,
    warning_raised: bool,
    halt_alerted: bool,
}

impl RiskBook {
    fn open_exposure(&self) -> Decimal {
        self.exposure.values().map(|e| e.notional).sum()
    }
}

fn pct(value: f64) -> Decimal {
    Decimal::from_f64(value).unwrap_or_default()
}

fn halted(state: &RiskState) -> RiskError {
    RiskError::TradingHalted {
        reason: state
            .halt_reason
            .as_ref()
            .map(|r| r.to_string())
            .unwrap_or_else(|| "halted".to_string()),
    }
}

/// Size a new entry from the current state alone.
///
/// Candidate value is the smaller of the position-size cap and the amount
/// whose loss at `stop_loss_pct` equals the per-trade risk budget. The result
/// is rounded down to whole units.
pub fn size_for(
    limits: &RiskLimits,
    state: &RiskState,
    open_exposure: Decimal,
    decision: &Decision,
    price: Decimal,
    stop_loss_pct: f64,
) -> Result<PositionSize, RiskError> {
    let instrument = decision.instrument.clone();
    let no_size = |reason: String| RiskError::NoSafeSize {
        instrument: decision.instrument.clone(),
        reason,
    };

    if state.trading_halted {
        return Err(halted(state));
    }
    let side = PositionSide::from_action(decision.action)
        .ok_or_else(|| no_size("HOLD decisions open nothing".to_string()))?;
    if price <= Decimal::ZERO {
        return Err(no_size(format!("invalid price {}", price)));
    }
    if state.equity <= Decimal::ZERO {
        return Err(no_size(format!("non-positive equity {}", state.equity)));
    }

    let cap_value = state.equity * pct(limits.max_position_size_pct);
    let budget_value = if stop_loss_pct > 0.0 {
        // Stops below Decimal precision round to zero
        (state.equity * pct(limits.max_risk_per_trade_pct))
            .checked_div(pct(stop_loss_pct))
            .ok_or_else(|| no_size(format!("stop loss {} too small to size against", stop_loss_pct)))?
    } else {
        cap_value
    };
    let value = cap_value.min(budget_value);

    let quantity = (value / price).floor();
    if quantity <= Decimal::ZERO {
        return Err(no_size(format!(
            "${:.2} budget buys no whole unit at ${}",
            value, price
        )));
    }
    let notional = quantity * price;

    let exposure_cap = state.equity * pct(limits.max_portfolio_exposure_pct);
    if open_exposure + notional > exposure_cap {
        return Err(no_size(format!(
            "exposure ${:.2} + ${:.2} would exceed cap ${:.2}",
            open_exposure, notional, exposure_cap
        )));
    }

    Ok(PositionSize {
        instrument,
        side,
        quantity,
        price,
        notional,
        risk_amount: notional * pct(stop_loss_pct),
        stop_loss_pct,
    })
}

/// Single owner of account risk state and the exposure book.
///
/// Every read and write goes through one lock so concurrent sizing
/// decisions see a consistent budget.
pub struct RiskManager {
    limits: RiskLimits,
    book: Mutex<RiskBook>,
}

impl RiskManager {
    pub fn new(limits: RiskLimits, equity: Decimal, trading_day: NaiveDate) -> Self {
        Self::from_state(limits, RiskState::new(equity, trading_day))
    }

    pub fn from_state(limits: RiskLimits, state: RiskState) -> Self {
        Self {
            limits,
            book: Mutex::new(RiskBook {
                state,
                exposure: HashMap::new(),
                warning_raised: false,
                halt_alerted: false,
            }),
        }
    }

    pub fn limits(&self) -> &RiskLimits {
        &self.limits
    }

    pub async fn snapshot(&self) -> RiskState {
        self.book.lock().await.state.clone()
    }

    pub async fn is_halted(&self) -> bool {
        self.book.lock().await.state.trading_halted
    }

    /// Open plus reserved notional
    pub async fn open_exposure(&self) -> Decimal {
        self.book.lock().await.open_exposure()
    }

    pub async fn exposure_for(&self, instrument: &str) -> Option<ExposureEntry> {
        self.book.lock().await.exposure.get(instrument).cloned()
    }

    /// Size an entry and reserve its notional against the exposure cap.
    ///
    /// The reservation stands until it is committed, released or filled.
    pub async fn size_position(
        &self,
        decision: &Decision,
        price: Decimal,
        stop_loss_pct: f64,
    ) -> Result<PositionSize, RiskError> {
        let mut book = self.book.lock().await;

        if book.state.trading_halted {
            return Err(halted(&book.state));
        }
        if book.exposure.contains_key(&decision.instrument) {
            return Err(RiskError::PositionAlreadyOpen(decision.instrument.clone()));
        }

        let size = size_for(
            &self.limits,
            &book.state,
            book.open_exposure(),
            decision,
            price,
            stop_loss_pct,
        )?;

        book.exposure.insert(
            size.instrument.clone(),
            ExposureEntry {
                notional: size.notional,
                status: ExposureStatus::Reserved,
            },
        );

        tracing::info!(
            "Sized {} {:?}: {} @ ${} (${:.2} notional, ${:.2} at risk)",
            size.instrument,
            size.side,
            size.quantity,
            size.price,
            size.notional,
            size.risk_amount
        );

        Ok(size)
    }

    /// Mark a reservation as backed by a submitted order
    pub async fn commit_reservation(&self, instrument: &str) -> bool {
        let mut book = self.book.lock().await;
        match book.exposure.get_mut(instrument) {
            Some(entry) if entry.status == ExposureStatus::Reserved => {
                entry.status = ExposureStatus::Committed;
                true
            }
            _ => false,
        }
    }

    /// Drop a reservation no order was submitted for. Committed and open
    /// exposure is left alone.
    pub async fn release_reservation(&self, instrument: &str) -> bool {
        let mut book = self.book.lock().await;
        let reserved = matches!(
            book.exposure.get(instrument),
            Some(ExposureEntry {
                status: ExposureStatus::Reserved,
                ..
            })
        );
        if reserved {
            book.exposure.remove(instrument);
            tracing::debug!("Released reservation for {}", instrument);
        }
        reserved
    }

    /// Drop the reservation of an entry order that failed or was rejected
    pub async fn cancel_entry(&self, instrument: &str) -> bool {
        let mut book = self.book.lock().await;
        let pending = matches!(
            book.exposure.get(instrument),
            Some(ExposureEntry {
                status: ExposureStatus::Reserved | ExposureStatus::Committed,
                ..
            })
        );
        if pending {
            book.exposure.remove(instrument);
            tracing::info!("Cancelled entry exposure for {}", instrument);
        }
        pending
    }

    pub async fn update_on_fill(&self, fill: &FillEvent) {
        let mut book = self.book.lock().await;

        match fill {
            FillEvent::Entry {
                instrument,
                notional,
            } => {
                book.exposure.insert(
                    instrument.clone(),
                    ExposureEntry {
                        notional: *notional,
                        status: ExposureStatus::Open,
                    },
                );
            }
            FillEvent::Exit {
                instrument,
                realized_pnl,
            } => {
                book.exposure.remove(instrument);

                let state = &mut book.state;
                state.equity += *realized_pnl;
                state.daily_pnl += *realized_pnl;
                if *realized_pnl < Decimal::ZERO {
                    state.consecutive_losses += 1;
                } else {
                    state.consecutive_losses = 0;
                }
                state.mark_peak();

                tracing::info!(
                    "Closed {} for ${:.2}: {}",
                    instrument,
                    realized_pnl,
                    state
                );
            }
        }

        self.evaluate_halts(&mut book.state);
    }

    /// Mark equity to the broker's account value
    pub async fn sync_equity(&self, equity: Decimal) {
        let mut book = self.book.lock().await;
        let state = &mut book.state;
        state.equity = equity;
        state.daily_pnl = equity - state.day_start_equity;
        state.mark_peak();
        self.evaluate_halts(&mut book.state);
    }

    /// Reset daily P/L for a new session. Automatic halts are lifted and
    /// re-checked at once, so a drawdown breach halts again immediately.
    /// Manual halts persist.
    pub async fn start_trading_day(&self, day: NaiveDate) {
        let mut book = self.book.lock().await;
        let state = &mut book.state;

        state.trading_day = day;
        state.day_start_equity = state.equity;
        state.daily_pnl = Decimal::ZERO;

        let manual = state.halt_reason.as_ref().is_some_and(|r| r.is_manual());
        if state.trading_halted && !manual {
            tracing::info!("New trading day {}: lifting {:?} halt", day, state.halt_reason);
            state.trading_halted = false;
            state.halt_reason = None;
            book.halt_alerted = false;
        }

        self.evaluate_halts(&mut book.state);
    }

    /// Start a new day if `day` is later than the current one
    pub async fn roll_day_if_needed(&self, day: NaiveDate) -> bool {
        let current = self.book.lock().await.state.trading_day;
        if day > current {
            self.start_trading_day(day).await;
            true
        } else {
            false
        }
    }

    pub async fn halt(&self, note: &str) {
        let mut book = self.book.lock().await;
        book.state.trading_halted = true;
        book.state.halt_reason = Some(HaltReason::Manual {
            note: note.to_string(),
        });
        book.halt_alerted = false;
        tracing::warn!("Trading manually halted: {}", note);
    }

    /// Lift any halt and clear the losing streak. Daily loss and drawdown
    /// limits are re-checked, so a standing breach halts again.
    pub async fn resume(&self) -> bool {
        let mut book = self.book.lock().await;
        book.state.trading_halted = false;
        book.state.halt_reason = None;
        book.state.consecutive_losses = 0;
        book.halt_alerted = false;
        book.warning_raised = false;
        self.evaluate_halts(&mut book.state);
        let resumed = !book.state.trading_halted;
        if resumed {
            tracing::info!("Trading resumed");
        } else {
            tracing::warn!(
                "Resume refused, limits still breached: {:?}",
                book.state.halt_reason
            );
        }
        resumed
    }

    /// Replace state with a persisted snapshot and rebuild exposure from
    /// the positions that are still live.
    pub async fn restore(&self, state: RiskState, positions: &[Position]) {
        let mut book = self.book.lock().await;
        book.exposure = positions
            .iter()
            .filter(|p| p.state != PositionState::Closed)
            .map(|p| {
                (
                    p.instrument.clone(),
                    ExposureEntry {
                        notional: p.entry_notional(),
                        status: ExposureStatus::Open,
                    },
                )
            })
            .collect();
        book.state = state;
        book.warning_raised = false;
        book.halt_alerted = false;

        tracing::info!(
            "Restored risk state with {} open positions: {}",
            book.exposure.len(),
            book.state
        );
    }

    /// Alerts for conditions that newly hold since the last call
    pub async fn run_circuit_breakers(&self) -> Vec<Alert> {
        let mut book = self.book.lock().await;
        self.evaluate_halts(&mut book.state);

        let mut alerts = Vec::new();
        let state = book.state.clone();

        if state.consecutive_losses >= self.limits.consecutive_loss_warning {
            if !book.warning_raised {
                book.warning_raised = true;
                alerts.push(Alert::new(
                    AlertKind::ConsecutiveLossWarning,
                    AlertSeverity::Warning,
                    false,
                    None,
                    format!(
                        "{} consecutive losing trades (warning at {})",
                        state.consecutive_losses, self.limits.consecutive_loss_warning
                    ),
                    state.clone(),
                ));
            }
        } else {
            book.warning_raised = false;
        }

        if state.trading_halted {
            if !book.halt_alerted {
                book.halt_alerted = true;
                let detail = match &state.halt_reason {
                    Some(HaltReason::DailyLossLimit) => format!(
                        "daily P/L {:.2}% breached -{:.2}% limit",
                        state.daily_pnl_pct() * 100.0,
                        self.limits.max_daily_loss_pct * 100.0
                    ),
                    Some(HaltReason::MaxDrawdown) => format!(
                        "drawdown {:.2}% breached {:.2}% limit",
                        state.drawdown_pct * 100.0,
                        self.limits.max_drawdown_pct * 100.0
                    ),
                    Some(HaltReason::ConsecutiveLosses) => format!(
                        "{} consecutive losses reached limit of {}",
                        state.consecutive_losses,
                        self.limits.max_consecutive_losses.unwrap_or_default()
                    ),
                    Some(other) => other.to_string(),
                    None => "halted".to_string(),
                };
                alerts.push(Alert::new(
                    AlertKind::TradingHalted,
                    AlertSeverity::Critical,
                    true,
                    None,
                    format!("Trading halted: {}", detail),
                    state.clone(),
                ));
            }
        } else {
            book.halt_alerted = false;
        }

        for alert in &alerts {
            match alert.severity {
                AlertSeverity::Critical => tracing::error!("{}", alert.summary()),
                _ => tracing::warn!("{}", alert.summary()),
            }
        }

        alerts
    }

    /// Apply halt conditions. Once halted the flag sticks until a new day,
    /// a resume, or never for manual halts.
    fn evaluate_halts(&self, state: &mut RiskState) {
        if state.trading_halted {
            return;
        }

        let reason = if state.daily_pnl_pct() <= -self.limits.max_daily_loss_pct {
            Some(HaltReason::DailyLossLimit)
        } else if state.drawdown_pct >= self.limits.max_drawdown_pct {
            Some(HaltReason::MaxDrawdown)
        } else {
            match self.limits.max_consecutive_losses {
                Some(max) if state.consecutive_losses >= max => Some(HaltReason::ConsecutiveLosses),
                _ => None,
            }
        };

        if let Some(reason) = reason {
            tracing::error!("Circuit breaker tripped ({}): {}", reason, state);
            state.trading_halted = true;
            state.halt_reason = Some(reason);
        }
    }
}
