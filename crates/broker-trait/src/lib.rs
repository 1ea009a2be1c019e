use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use trading_core::Action;

pub mod paper;

pub use paper::{PaperBehavior, PaperGateway};

// ---------------------------------------------------------------------------
// Order types (broker-agnostic)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn from_action(action: Action) -> Option<Self> {
        match action {
            Action::Buy => Some(OrderSide::Buy),
            Action::Sell => Some(OrderSide::Sell),
            Action::Hold => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit { price: Decimal },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub client_order_id: String,
    pub instrument: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub order_type: OrderType,
}

impl OrderRequest {
    pub fn market(instrument: impl Into<String>, side: OrderSide, quantity: Decimal) -> Self {
        Self {
            client_order_id: uuid::Uuid::new_v4().to_string(),
            instrument: instrument.into(),
            side,
            quantity,
            order_type: OrderType::Market,
        }
    }
}

/// Receipt for an accepted order; fills are looked up with it later
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderHandle {
    pub order_id: String,
    pub client_order_id: String,
    pub instrument: String,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub order_id: String,
    pub instrument: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub price: Decimal,
    pub filled_at: DateTime<Utc>,
}

impl Fill {
    pub fn notional(&self) -> Decimal {
        self.quantity * self.price
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum FillStatus {
    Filled(Fill),
    Pending,
    Failed { reason: String },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    #[error("order for {instrument} rejected: {reason}")]
    Rejected { instrument: String, reason: String },

    #[error("unknown order {0}")]
    UnknownOrder(String),

    #[error("gateway unavailable: {0}")]
    Unavailable(String),
}

// ---------------------------------------------------------------------------
// Gateway trait
// ---------------------------------------------------------------------------

/// Order routing to a broker. Fills are never assumed synchronous:
/// callers poll `get_fill` with the handle until it leaves `Pending`.
#[async_trait]
pub trait ExecutionGateway: Send + Sync {
    async fn submit_order(&self, order: &OrderRequest) -> Result<OrderHandle, GatewayError>;

    async fn get_fill(&self, handle: &OrderHandle) -> Result<FillStatus, GatewayError>;

    /// Broker name for logging
    fn broker_name(&self) -> &str;
}
