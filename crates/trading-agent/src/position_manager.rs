use std::collections::HashMap;
use std::sync::Arc;

use broker_trait::{
    ExecutionGateway, Fill, FillStatus, GatewayError, OrderHandle, OrderRequest, OrderSide,
};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use risk_manager::{Alert, AlertKind, AlertSeverity, FillEvent, RiskError, RiskManager};
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use trading_core::{PendingExit, Position, PositionState};

use crate::types::LifecycleTransition;

/// What one lifecycle pass produced
#[derive(Debug, Default)]
pub struct LifecycleReport {
    pub transitions: Vec<LifecycleTransition>,
    pub alerts: Vec<Alert>,
}

enum ExitAttempt {
    Filled(Fill),
    Pending,
    Failed(String),
}

/// Owns open positions and drives each through OPEN -> EXIT_PENDING -> CLOSED.
///
/// Every position sits behind its own lock; an evaluation holds it for the
/// whole evaluate-then-transition step so entries and exits on the same
/// instrument never interleave.
pub struct PositionLifecycleManager {
    positions: DashMap<String, Arc<Mutex<Position>>>,
    gateway: Arc<dyn ExecutionGateway>,
    risk: Arc<RiskManager>,
    max_exit_retries: u32,
}

impl PositionLifecycleManager {
    pub fn new(
        gateway: Arc<dyn ExecutionGateway>,
        risk: Arc<RiskManager>,
        max_exit_retries: u32,
    ) -> Self {
        Self {
            positions: DashMap::new(),
            gateway,
            risk,
            max_exit_retries: max_exit_retries.max(1),
        }
    }

    /// Track a freshly filled entry. One position per instrument.
    pub fn open_position(&self, position: Position) -> Result<(), RiskError> {
        match self.positions.entry(position.instrument.clone()) {
            Entry::Occupied(_) => Err(RiskError::PositionAlreadyOpen(position.instrument)),
            Entry::Vacant(slot) => {
                tracing::info!(
                    "Opened {:?} {} x{} @ ${} (tp {:.2}%, sl {:.2}%, max {} periods)",
                    position.side,
                    position.instrument,
                    position.quantity,
                    position.entry_price,
                    position.take_profit_pct * 100.0,
                    position.stop_loss_pct * 100.0,
                    position.max_holding_periods
                );
                slot.insert(Arc::new(Mutex::new(position)));
                Ok(())
            }
        }
    }

    pub fn has_position(&self, instrument: &str) -> bool {
        self.positions.contains_key(instrument)
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub async fn position(&self, instrument: &str) -> Option<Position> {
        let slot = self.positions.get(instrument).map(|s| Arc::clone(s.value()))?;
        let position = slot.lock().await;
        Some(position.clone())
    }

    pub async fn positions_snapshot(&self) -> Vec<Position> {
        let mut snapshot = Vec::with_capacity(self.positions.len());
        for slot in self.slots() {
            snapshot.push(slot.lock().await.clone());
        }
        snapshot.sort_by(|a, b| a.instrument.cmp(&b.instrument));
        snapshot
    }

    /// Replace tracked positions with persisted ones. Closed positions are dropped.
    pub fn restore(&self, positions: Vec<Position>) {
        self.positions.clear();
        for position in positions {
            if position.state != PositionState::Closed {
                self.positions
                    .insert(position.instrument.clone(), Arc::new(Mutex::new(position)));
            }
        }
        tracing::info!("Restored {} positions", self.positions.len());
    }

    /// Lift an escalation so the exit is attempted again next cycle
    pub async fn retry_exit(&self, instrument: &str) -> bool {
        let Some(slot) = self.positions.get(instrument).map(|s| Arc::clone(s.value())) else {
            return false;
        };
        let mut position = slot.lock().await;
        match position.pending_exit.as_mut() {
            Some(pending) if pending.escalated => {
                pending.escalated = false;
                pending.attempts = 0;
                pending.last_error = None;
                tracing::info!("Exit retries re-enabled for {}", instrument);
                true
            }
            _ => false,
        }
    }

    /// One cycle over every tracked position.
    ///
    /// Each position ages by one period, is marked to `prices` when a price is
    /// known, and works its exit order if it has one.
    pub async fn evaluate_all(
        &self,
        prices: &HashMap<String, Decimal>,
        now: DateTime<Utc>,
    ) -> LifecycleReport {
        let mut report = LifecycleReport::default();

        for slot in self.slots() {
            let closed = {
                let mut position = slot.lock().await;
                let price = prices.get(&position.instrument).copied();
                self.evaluate_one(&mut position, price, now, &mut report).await
            };

            if let Some(instrument) = closed {
                self.positions
                    .remove_if(&instrument, |_, tracked| Arc::ptr_eq(tracked, &slot));
            }
        }

        report
    }

    fn slots(&self) -> Vec<Arc<Mutex<Position>>> {
        self.positions.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Returns the instrument when the position closed
    async fn evaluate_one(
        &self,
        position: &mut Position,
        price: Option<Decimal>,
        now: DateTime<Utc>,
        report: &mut LifecycleReport,
    ) -> Option<String> {
        if let Some(price) = price {
            position.mark(price);
        }

        match position.state {
            PositionState::Closed => return Some(position.instrument.clone()),
            PositionState::Open => {
                position.periods_held += 1;
                let reason = position.exit_trigger()?;

                tracing::info!(
                    "{} exit triggered by {} after {} periods (return {:.3}%)",
                    position.instrument,
                    reason,
                    position.periods_held,
                    position.unrealized_return() * 100.0
                );
                position.state = PositionState::ExitPending;
                position.pending_exit = Some(PendingExit::new(reason, now));
                report.transitions.push(LifecycleTransition {
                    instrument: position.instrument.clone(),
                    from: PositionState::Open,
                    to: PositionState::ExitPending,
                    reason: Some(reason),
                    realized_pnl: None,
                    at: now,
                });
            }
            PositionState::ExitPending => {}
        }

        let (escalated, order_id) = match &position.pending_exit {
            Some(pending) => (pending.escalated, pending.order_id.clone()),
            None => (false, None),
        };
        if escalated {
            return None;
        }

        let attempt = match order_id {
            Some(order_id) => self.poll_exit(position, order_id).await,
            None => self.submit_exit(position).await,
        };

        match attempt {
            ExitAttempt::Pending => None,
            ExitAttempt::Filled(fill) => Some(self.close(position, fill, now, report).await),
            ExitAttempt::Failed(reason) => {
                self.record_failure(position, reason, report).await;
                None
            }
        }
    }

    async fn submit_exit(&self, position: &mut Position) -> ExitAttempt {
        let side = match OrderSide::from_action(position.side.closing_action()) {
            Some(side) => side,
            None => return ExitAttempt::Failed("no closing side".to_string()),
        };
        let order = OrderRequest::market(&position.instrument, side, position.quantity);

        let handle = match self.gateway.submit_order(&order).await {
            Ok(handle) => handle,
            Err(e) => return ExitAttempt::Failed(e.to_string()),
        };
        tracing::info!(
            "Submitted exit {} {} x{} via {} (order {})",
            side.as_str(),
            position.instrument,
            position.quantity,
            self.gateway.broker_name(),
            handle.order_id
        );

        if let Some(pending) = position.pending_exit.as_mut() {
            pending.order_id = Some(handle.order_id.clone());
        }

        self.read_fill(&handle).await
    }

    async fn poll_exit(&self, position: &Position, order_id: String) -> ExitAttempt {
        let submitted_at = position
            .pending_exit
            .as_ref()
            .map(|p| p.triggered_at)
            .unwrap_or_else(Utc::now);
        // Gateways resolve orders by id; the client id is not kept across restarts
        let handle = OrderHandle {
            client_order_id: order_id.clone(),
            order_id,
            instrument: position.instrument.clone(),
            submitted_at,
        };
        self.read_fill(&handle).await
    }

    async fn read_fill(&self, handle: &OrderHandle) -> ExitAttempt {
        match self.gateway.get_fill(handle).await {
            Ok(FillStatus::Filled(fill)) => ExitAttempt::Filled(fill),
            Ok(FillStatus::Pending) => ExitAttempt::Pending,
            Ok(FillStatus::Failed { reason }) => ExitAttempt::Failed(reason),
            // The order may still be live; keep polling it rather than resubmit
            Err(GatewayError::Unavailable(e)) => {
                tracing::warn!(
                    "Fill lookup for exit order {} on {} unavailable: {}",
                    handle.order_id,
                    handle.instrument,
                    e
                );
                ExitAttempt::Pending
            }
            Err(e) => ExitAttempt::Failed(e.to_string()),
        }
    }

    async fn close(
        &self,
        position: &mut Position,
        fill: Fill,
        now: DateTime<Utc>,
        report: &mut LifecycleReport,
    ) -> String {
        let realized_pnl = position.pnl_at(fill.price);
        let reason = position.pending_exit.as_ref().map(|p| p.reason);

        position.mark(fill.price);
        position.state = PositionState::Closed;

        tracing::info!(
            "Closed {} @ ${} ({}): realized ${:.2}",
            position.instrument,
            fill.price,
            reason.map(|r| r.as_str()).unwrap_or("exit"),
            realized_pnl
        );

        self.risk
            .update_on_fill(&FillEvent::Exit {
                instrument: position.instrument.clone(),
                realized_pnl,
            })
            .await;

        report.transitions.push(LifecycleTransition {
            instrument: position.instrument.clone(),
            from: PositionState::ExitPending,
            to: PositionState::Closed,
            reason,
            realized_pnl: Some(realized_pnl),
            at: now,
        });

        position.instrument.clone()
    }

    async fn record_failure(
        &self,
        position: &mut Position,
        reason: String,
        report: &mut LifecycleReport,
    ) {
        let Some(pending) = position.pending_exit.as_mut() else {
            return;
        };
        pending.attempts += 1;
        pending.order_id = None;
        pending.last_error = Some(reason.clone());

        tracing::warn!(
            "Exit order for {} failed (attempt {}/{}): {}",
            position.instrument,
            pending.attempts,
            self.max_exit_retries,
            reason
        );

        if pending.attempts >= self.max_exit_retries && !pending.escalated {
            pending.escalated = true;
            let message = format!(
                "exit ({}) failed {} times, last error: {}; retries stopped until an operator intervenes",
                pending.reason, pending.attempts, reason
            );
            tracing::error!("{}: {}", position.instrument, message);
            report.alerts.push(Alert::new(
                AlertKind::ExitOrderFailed,
                AlertSeverity::Critical,
                false,
                Some(position.instrument.clone()),
                message,
                self.risk.snapshot().await,
            ));
        }
    }
}
