use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use risk_manager::RiskManager;
use trading_core::{Action, Decision, MarketContext};

use crate::config::{GateConfig, MomentumGateConfig, PipelineConfig};
use crate::types::{GateResult, GateVerdict, PipelineOutcome};

pub const MOMENTUM_GATE: &str = "momentum";
pub const CONFIDENCE_GATE: &str = "confidence";
pub const SENTIMENT_GATE: &str = "sentiment";
pub const RISK_SIZING_GATE: &str = "risk_sizing";

pub const KNOWN_GATES: [&str; 4] = [MOMENTUM_GATE, CONFIDENCE_GATE, SENTIMENT_GATE, RISK_SIZING_GATE];

/// One checkpoint a candidate trade must clear
#[async_trait]
pub trait Gate: Send + Sync {
    fn name(&self) -> &str;

    async fn evaluate(&self, decision: &Decision, market: &MarketContext) -> GateResult;

    /// Undo anything `evaluate` reserved, called when a later gate blocks
    async fn release(&self, _decision: &Decision) {}
}

/// Trend confirmation: momentum, oscillator and volume, N of 3.
pub struct MomentumGate {
    config: MomentumGateConfig,
}

impl MomentumGate {
    pub fn new(config: MomentumGateConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Gate for MomentumGate {
    fn name(&self) -> &str {
        MOMENTUM_GATE
    }

    async fn evaluate(&self, decision: &Decision, market: &MarketContext) -> GateResult {
        let c = &self.config;
        let long = match decision.action {
            Action::Buy => true,
            Action::Sell => false,
            Action::Hold => return GateResult::abstain(MOMENTUM_GATE, "no direction to confirm"),
        };

        // None = no data, Some(held)
        let checks = [
            (
                "momentum",
                market.momentum.map(|m| {
                    if long {
                        m > c.momentum_floor
                    } else {
                        m < -c.momentum_floor
                    }
                }),
            ),
            (
                "oscillator",
                market.oscillator.map(|o| {
                    if long {
                        o < c.overbought_ceiling
                    } else {
                        o > c.oversold_floor
                    }
                }),
            ),
            (
                "volume",
                market.relative_volume.map(|v| v >= c.min_relative_volume),
            ),
        ];

        let with_data = checks.iter().filter(|(_, held)| held.is_some()).count();
        let held: Vec<&str> = checks
            .iter()
            .filter(|(_, held)| *held == Some(true))
            .map(|(name, _)| *name)
            .collect();

        if with_data < c.min_conditions {
            return GateResult::abstain(
                MOMENTUM_GATE,
                format!(
                    "only {} of {} required indicators available",
                    with_data, c.min_conditions
                ),
            );
        }

        let reason = format!(
            "{}/3 confirmations [{}] (need {})",
            held.len(),
            held.join(","),
            c.min_conditions
        );
        if held.len() >= c.min_conditions {
            GateResult::pass(MOMENTUM_GATE, reason)
        } else {
            GateResult::reject(MOMENTUM_GATE, reason)
        }
    }
}

pub struct ConfidenceGate {
    min_confidence: f64,
}

impl ConfidenceGate {
    pub fn new(min_confidence: f64) -> Self {
        Self { min_confidence }
    }
}

#[async_trait]
impl Gate for ConfidenceGate {
    fn name(&self) -> &str {
        CONFIDENCE_GATE
    }

    async fn evaluate(&self, decision: &Decision, _market: &MarketContext) -> GateResult {
        let reason = format!(
            "weighted confidence {:.2} vs minimum {:.2}",
            decision.weighted_confidence, self.min_confidence
        );
        if decision.weighted_confidence < self.min_confidence {
            GateResult::reject(CONFIDENCE_GATE, reason)
        } else {
            GateResult::pass(CONFIDENCE_GATE, reason)
        }
    }
}

/// Keeps trades from running into clearly adverse news
pub struct SentimentGate {
    floor: f64,
}

impl SentimentGate {
    pub fn new(floor: f64) -> Self {
        Self { floor }
    }
}

#[async_trait]
impl Gate for SentimentGate {
    fn name(&self) -> &str {
        SENTIMENT_GATE
    }

    async fn evaluate(&self, decision: &Decision, market: &MarketContext) -> GateResult {
        let Some(sentiment) = market.sentiment else {
            return GateResult::abstain(SENTIMENT_GATE, "no sentiment reading");
        };

        let adverse = match decision.action {
            Action::Buy => sentiment < self.floor,
            Action::Sell => sentiment > -self.floor,
            Action::Hold => return GateResult::abstain(SENTIMENT_GATE, "no direction to check"),
        };

        let reason = format!(
            "sentiment {:+.2} for {} (floor {:+.2})",
            sentiment, decision.action, self.floor
        );
        if adverse {
            GateResult::reject(SENTIMENT_GATE, reason)
        } else {
            GateResult::pass(SENTIMENT_GATE, reason)
        }
    }
}

/// Asks the risk manager for a size. A passing result holds a reservation
/// that `release` gives back.
pub struct RiskSizingGate {
    risk: Arc<RiskManager>,
    config: Arc<PipelineConfig>,
}

impl RiskSizingGate {
    pub fn new(risk: Arc<RiskManager>, config: Arc<PipelineConfig>) -> Self {
        Self { risk, config }
    }
}

#[async_trait]
impl Gate for RiskSizingGate {
    fn name(&self) -> &str {
        RISK_SIZING_GATE
    }

    async fn evaluate(&self, decision: &Decision, market: &MarketContext) -> GateResult {
        let Some(price) = market.last_price else {
            return GateResult::abstain(RISK_SIZING_GATE, "no price to size against");
        };
        let Some((class, profile)) = self.config.exit_profile_for(&decision.instrument) else {
            return GateResult::abstain(RISK_SIZING_GATE, "no exit profile for asset class");
        };

        match self
            .risk
            .size_position(decision, price, profile.stop_loss_pct)
            .await
        {
            Ok(size) => GateResult::pass(
                RISK_SIZING_GATE,
                format!(
                    "{} units (${:.2}) at {:.2}% {} stop",
                    size.quantity,
                    size.notional,
                    profile.stop_loss_pct * 100.0,
                    class
                ),
            )
            .with_size(size),
            Err(e) => GateResult::reject(RISK_SIZING_GATE, e.to_string()),
        }
    }

    async fn release(&self, decision: &Decision) {
        self.risk.release_reservation(&decision.instrument).await;
    }
}

/// Ordered gates evaluated fail-fast
pub struct GatePipeline {
    gates: Vec<Arc<dyn Gate>>,
    abstain_passes: HashSet<String>,
}

impl GatePipeline {
    pub fn new(gates: Vec<Arc<dyn Gate>>, abstain_passes: impl IntoIterator<Item = String>) -> Self {
        Self {
            gates,
            abstain_passes: abstain_passes.into_iter().collect(),
        }
    }

    /// Build the configured gates in configured order. Names are checked by
    /// config validation; unknown ones are skipped here with a warning.
    pub fn from_config(
        gates: &GateConfig,
        risk: Arc<RiskManager>,
        config: Arc<PipelineConfig>,
    ) -> Self {
        let mut built: Vec<Arc<dyn Gate>> = Vec::with_capacity(gates.order.len());
        for name in &gates.order {
            match name.as_str() {
                MOMENTUM_GATE => built.push(Arc::new(MomentumGate::new(gates.momentum.clone()))),
                CONFIDENCE_GATE => built.push(Arc::new(ConfidenceGate::new(gates.min_confidence))),
                SENTIMENT_GATE => built.push(Arc::new(SentimentGate::new(gates.sentiment_floor))),
                RISK_SIZING_GATE => built.push(Arc::new(RiskSizingGate::new(
                    Arc::clone(&risk),
                    Arc::clone(&config),
                ))),
                other => tracing::warn!("Skipping unknown gate '{}'", other),
            }
        }
        Self::new(built, gates.abstain_passes.iter().cloned())
    }

    pub fn gate_names(&self) -> Vec<String> {
        self.gates.iter().map(|g| g.name().to_string()).collect()
    }

    pub async fn evaluate(&self, decision: &Decision, market: &MarketContext) -> PipelineOutcome {
        let mut results = Vec::with_capacity(self.gates.len());
        let mut passed: Vec<&Arc<dyn Gate>> = Vec::new();

        for gate in &self.gates {
            let result = gate.evaluate(decision, market).await;
            let blocks = match result.verdict {
                GateVerdict::Pass => false,
                GateVerdict::Reject => true,
                GateVerdict::Abstain => !self.abstain_passes.contains(gate.name()),
            };

            tracing::debug!(
                "{} gate {}: {:?} ({})",
                decision.instrument,
                result.gate_name,
                result.verdict,
                result.reason
            );
            results.push(result);

            if blocks {
                for earlier in passed.iter().rev() {
                    earlier.release(decision).await;
                }
                return PipelineOutcome {
                    approved: false,
                    results,
                    size: None,
                };
            }
            passed.push(gate);
        }

        let size = results.iter().find_map(|r| r.sized.clone());
        PipelineOutcome {
            approved: true,
            results,
            size,
        }
    }
}
