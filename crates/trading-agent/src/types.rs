use chrono::{DateTime, Utc};
use risk_manager::PositionSize;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use trading_core::{ExitReason, PositionState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GateVerdict {
    Pass,
    Reject,
    Abstain,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateResult {
    pub gate_name: String,
    pub verdict: GateVerdict,
    pub reason: String,
    /// Size reserved by the risk-sizing gate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sized: Option<PositionSize>,
}

impl GateResult {
    pub fn pass(gate_name: &str, reason: impl Into<String>) -> Self {
        Self::new(gate_name, GateVerdict::Pass, reason)
    }

    pub fn reject(gate_name: &str, reason: impl Into<String>) -> Self {
        Self::new(gate_name, GateVerdict::Reject, reason)
    }

    pub fn abstain(gate_name: &str, reason: impl Into<String>) -> Self {
        Self::new(gate_name, GateVerdict::Abstain, reason)
    }

    pub fn with_size(mut self, size: PositionSize) -> Self {
        self.sized = Some(size);
        self
    }

    fn new(gate_name: &str, verdict: GateVerdict, reason: impl Into<String>) -> Self {
        Self {
            gate_name: gate_name.to_string(),
            verdict,
            reason: reason.into(),
            sized: None,
        }
    }
}

/// Overall verdict of the gate pipeline for one decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineOutcome {
    pub approved: bool,
    /// Results of the gates that ran, in order; stops at the first blocking one
    pub results: Vec<GateResult>,
    pub size: Option<PositionSize>,
}

impl PipelineOutcome {
    pub fn blocking_gate(&self) -> Option<&GateResult> {
        if self.approved {
            None
        } else {
            self.results.last()
        }
    }
}

/// One state change of one position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleTransition {
    pub instrument: String,
    pub from: PositionState,
    pub to: PositionState,
    pub reason: Option<ExitReason>,
    pub realized_pnl: Option<Decimal>,
    pub at: DateTime<Utc>,
}
