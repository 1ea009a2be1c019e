//! In-memory gateway that fills against a price table.
//!
//! Per-instrument behaviour can be switched to keep orders pending, fail
//! fills or reject submissions, which is how tests drive the slow and
//! broken-broker paths.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use rust_decimal::Decimal;

use crate::{
    ExecutionGateway, Fill, FillStatus, GatewayError, OrderHandle, OrderRequest, OrderSide,
    OrderType,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PaperBehavior {
    #[default]
    FillImmediately,
    StayPending,
    FailFills,
    RejectSubmissions,
}

struct PaperOrder {
    request: OrderRequest,
    status: FillStatus,
}

#[derive(Default)]
pub struct PaperGateway {
    prices: DashMap<String, Decimal>,
    behaviors: DashMap<String, PaperBehavior>,
    orders: DashMap<String, PaperOrder>,
    submissions: AtomicUsize,
    lookup_outages: AtomicUsize,
}

impl PaperGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_price(&self, instrument: &str, price: Decimal) {
        self.prices.insert(instrument.to_string(), price);
    }

    pub fn set_behavior(&self, instrument: &str, behavior: PaperBehavior) {
        self.behaviors.insert(instrument.to_string(), behavior);
    }

    /// Number of submit attempts, accepted or not
    pub fn submission_count(&self) -> usize {
        self.submissions.load(Ordering::SeqCst)
    }

    /// Orders whose terminal status has not been read yet
    pub fn open_order_count(&self) -> usize {
        self.orders.len()
    }

    /// Make the next `count` fill lookups fail with `Unavailable`
    pub fn interrupt_lookups(&self, count: usize) {
        self.lookup_outages.store(count, Ordering::SeqCst);
    }

    /// Complete a pending order. Market orders fill at the current price,
    /// resting limit orders at their limit.
    pub fn fill_pending(&self, order_id: &str) -> Result<(), GatewayError> {
        let mut order = self
            .orders
            .get_mut(order_id)
            .ok_or_else(|| GatewayError::UnknownOrder(order_id.to_string()))?;
        if order.status == FillStatus::Pending {
            let price = match order.request.order_type {
                OrderType::Limit { price } => price,
                OrderType::Market => self.market_price(&order.request)?,
            };
            let fill = fill_at(order_id, &order.request, price);
            order.status = FillStatus::Filled(fill);
        }
        Ok(())
    }

    fn behavior(&self, instrument: &str) -> PaperBehavior {
        self.behaviors
            .get(instrument)
            .map(|b| *b)
            .unwrap_or_default()
    }

    fn market_price(&self, request: &OrderRequest) -> Result<Decimal, GatewayError> {
        self.prices
            .get(&request.instrument)
            .map(|p| *p)
            .ok_or_else(|| GatewayError::Rejected {
                instrument: request.instrument.clone(),
                reason: "no price available".to_string(),
            })
    }

    /// Fill at the table price when the order is marketable, otherwise rest
    fn try_fill(&self, order_id: &str, request: &OrderRequest) -> Result<FillStatus, GatewayError> {
        let market = self.market_price(request)?;
        let marketable = match (request.order_type, request.side) {
            (OrderType::Market, _) => true,
            (OrderType::Limit { price }, OrderSide::Buy) => market <= price,
            (OrderType::Limit { price }, OrderSide::Sell) => market >= price,
        };
        if marketable {
            Ok(FillStatus::Filled(fill_at(order_id, request, market)))
        } else {
            Ok(FillStatus::Pending)
        }
    }
}

fn fill_at(order_id: &str, request: &OrderRequest, price: Decimal) -> Fill {
    Fill {
        order_id: order_id.to_string(),
        instrument: request.instrument.clone(),
        side: request.side,
        quantity: request.quantity,
        price,
        filled_at: Utc::now(),
    }
}

#[async_trait]
impl ExecutionGateway for PaperGateway {
    async fn submit_order(&self, order: &OrderRequest) -> Result<OrderHandle, GatewayError> {
        self.submissions.fetch_add(1, Ordering::SeqCst);

        if order.quantity <= Decimal::ZERO {
            return Err(GatewayError::Rejected {
                instrument: order.instrument.clone(),
                reason: format!("invalid quantity {}", order.quantity),
            });
        }

        let order_id = uuid::Uuid::new_v4().to_string();
        let status = match self.behavior(&order.instrument) {
            PaperBehavior::RejectSubmissions => {
                return Err(GatewayError::Rejected {
                    instrument: order.instrument.clone(),
                    reason: "paper gateway configured to reject".to_string(),
                });
            }
            PaperBehavior::FillImmediately => self.try_fill(&order_id, order)?,
            PaperBehavior::StayPending => FillStatus::Pending,
            PaperBehavior::FailFills => FillStatus::Failed {
                reason: "simulated fill failure".to_string(),
            },
        };

        tracing::debug!(
            "Paper order {} {} {} x{}",
            order_id,
            order.side.as_str(),
            order.instrument,
            order.quantity
        );

        self.orders.insert(
            order_id.clone(),
            PaperOrder {
                request: order.clone(),
                status,
            },
        );

        Ok(OrderHandle {
            order_id,
            client_order_id: order.client_order_id.clone(),
            instrument: order.instrument.clone(),
            submitted_at: Utc::now(),
        })
    }

    async fn get_fill(&self, handle: &OrderHandle) -> Result<FillStatus, GatewayError> {
        if self
            .lookup_outages
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(GatewayError::Unavailable("simulated lookup outage".to_string()));
        }

        let status = self
            .orders
            .get(&handle.order_id)
            .map(|o| o.status.clone())
            .ok_or_else(|| GatewayError::UnknownOrder(handle.order_id.clone()))?;

        // Terminal orders are forgotten once reported
        if status != FillStatus::Pending {
            self.orders.remove(&handle.order_id);
        }
        Ok(status)
    }

    fn broker_name(&self) -> &str {
        "paper"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn market_order_fills_at_table_price() {
        let gw = PaperGateway::new();
        gw.set_price("AAPL", dec!(190.5));

        let order = OrderRequest::market("AAPL", OrderSide::Buy, dec!(3));
        let handle = gw.submit_order(&order).await.unwrap();
        match gw.get_fill(&handle).await.unwrap() {
            FillStatus::Filled(fill) => {
                assert_eq!(fill.price, dec!(190.5));
                assert_eq!(fill.side, OrderSide::Buy);
                assert_eq!(fill.notional(), dec!(571.5));
            }
            other => panic!("expected fill, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn pending_order_fills_on_demand() {
        let gw = PaperGateway::new();
        gw.set_price("TLT", dec!(90));
        gw.set_behavior("TLT", PaperBehavior::StayPending);

        let order = OrderRequest::market("TLT", OrderSide::Sell, dec!(10));
        let handle = gw.submit_order(&order).await.unwrap();
        assert_eq!(gw.get_fill(&handle).await.unwrap(), FillStatus::Pending);

        gw.fill_pending(&handle.order_id).unwrap();
        assert!(matches!(gw.get_fill(&handle).await.unwrap(), FillStatus::Filled(_)));
    }

    #[tokio::test]
    async fn rejected_submissions_are_counted() {
        let gw = PaperGateway::new();
        gw.set_price("GLD", dec!(180));
        gw.set_behavior("GLD", PaperBehavior::RejectSubmissions);

        let order = OrderRequest::market("GLD", OrderSide::Buy, dec!(1));
        let err = gw.submit_order(&order).await.unwrap_err();
        assert!(matches!(err, GatewayError::Rejected { .. }));
        assert_eq!(gw.submission_count(), 1);
    }

    #[tokio::test]
    async fn missing_price_rejects_market_order() {
        let gw = PaperGateway::new();
        let order = OrderRequest::market("XYZ", OrderSide::Buy, dec!(1));
        let err = gw.submit_order(&order).await.unwrap_err();
        assert!(matches!(err, GatewayError::Rejected { .. }));
    }

    #[tokio::test]
    async fn terminal_orders_are_evicted_once_read() {
        let gw = PaperGateway::new();
        gw.set_price("AAPL", dec!(190));

        let handle = gw
            .submit_order(&OrderRequest::market("AAPL", OrderSide::Sell, dec!(2)))
            .await
            .unwrap();
        assert_eq!(gw.open_order_count(), 1);
        assert!(matches!(gw.get_fill(&handle).await.unwrap(), FillStatus::Filled(_)));
        assert_eq!(gw.open_order_count(), 0);

        let err = gw.get_fill(&handle).await.unwrap_err();
        assert_eq!(err, GatewayError::UnknownOrder(handle.order_id.clone()));
    }

    #[tokio::test]
    async fn lookup_outage_reports_unavailable_then_recovers() {
        let gw = PaperGateway::new();
        gw.set_price("TLT", dec!(90));
        gw.set_behavior("TLT", PaperBehavior::StayPending);
        let handle = gw
            .submit_order(&OrderRequest::market("TLT", OrderSide::Sell, dec!(5)))
            .await
            .unwrap();

        gw.interrupt_lookups(1);
        assert!(matches!(
            gw.get_fill(&handle).await,
            Err(GatewayError::Unavailable(_))
        ));
        assert_eq!(gw.get_fill(&handle).await.unwrap(), FillStatus::Pending);
        assert_eq!(gw.open_order_count(), 1);
    }

    #[tokio::test]
    async fn limit_orders_rest_until_marketable() {
        let gw = PaperGateway::new();
        gw.set_price("MSFT", dec!(410));

        let mut order = OrderRequest::market("MSFT", OrderSide::Buy, dec!(1));
        order.order_type = OrderType::Limit { price: dec!(400) };
        let resting = gw.submit_order(&order).await.unwrap();
        assert_eq!(gw.get_fill(&resting).await.unwrap(), FillStatus::Pending);

        gw.fill_pending(&resting.order_id).unwrap();
        match gw.get_fill(&resting).await.unwrap() {
            FillStatus::Filled(fill) => assert_eq!(fill.price, dec!(400)),
            other => panic!("expected fill, got {:?}", other),
        }

        order.order_type = OrderType::Limit { price: dec!(415) };
        let crossing = gw.submit_order(&order).await.unwrap();
        match gw.get_fill(&crossing).await.unwrap() {
            FillStatus::Filled(fill) => assert_eq!(fill.price, dec!(410)),
            other => panic!("expected fill, got {:?}", other),
        }
    }
}
