//! Decision engine for multi-source trading signals.
//!
//! Votes from independent signal sources are combined by the ensemble voter,
//! screened by an ordered gate pipeline, sized by the risk manager and sent
//! to an execution gateway. Open positions are walked through their exit
//! lifecycle every cycle.

pub mod config;
pub mod engine;
pub mod gates;
pub mod metrics;
pub mod position_manager;
pub mod telemetry;
pub mod types;

pub use config::{ConfigError, GateConfig, MomentumGateConfig, PipelineConfig};
pub use engine::{CycleReport, DecisionEngine, InstrumentOutcome};
pub use gates::{
    ConfidenceGate, Gate, GatePipeline, MomentumGate, RiskSizingGate, SentimentGate,
    CONFIDENCE_GATE, KNOWN_GATES, MOMENTUM_GATE, RISK_SIZING_GATE, SENTIMENT_GATE,
};
pub use metrics::{AgentMetrics, GateCounts};
pub use position_manager::{LifecycleReport, PositionLifecycleManager};
pub use types::{GateResult, GateVerdict, LifecycleTransition, PipelineOutcome};
