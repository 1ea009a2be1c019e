use std::collections::{BTreeMap, HashMap};
use std::env;

use anyhow::{Context, Result};
use ensemble_voter::{EnsembleConfig, SourceConfig};
use risk_manager::RiskLimits;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use trading_core::{AssetClass, ExitProfile};

use crate::gates::{CONFIDENCE_GATE, KNOWN_GATES, MOMENTUM_GATE, RISK_SIZING_GATE, SENTIMENT_GATE};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("{field} = {value} is outside {range}")]
    OutOfRange {
        field: String,
        value: f64,
        range: &'static str,
    },

    #[error("unknown gate '{0}'")]
    UnknownGate(String),

    #[error("no exit profile configured for asset class {0}")]
    MissingExitProfile(AssetClass),

    #[error("exit profile for {class} cannot be reached: {detail}")]
    UnreachableExitProfile { class: AssetClass, detail: String },

    #[error("no source configuration for signal source '{0}'")]
    MissingSourceConfig(String),

    #[error("invalid value for {key}: {detail}")]
    Parse { key: String, detail: String },
}

/// Thresholds for the momentum confirmation gate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MomentumGateConfig {
    /// BUY needs momentum above this, SELL below its negation
    pub momentum_floor: f64,
    /// BUY needs the oscillator below this
    pub overbought_ceiling: f64,
    /// SELL needs the oscillator above this
    pub oversold_floor: f64,
    pub min_relative_volume: f64,
    /// Sub-conditions that must hold out of three
    pub min_conditions: usize,
}

impl Default for MomentumGateConfig {
    fn default() -> Self {
        Self {
            momentum_floor: 0.0,
            overbought_ceiling: 70.0,
            oversold_floor: 30.0,
            min_relative_volume: 1.0,
            min_conditions: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Gate names in evaluation order
    pub order: Vec<String>,
    /// Gates whose ABSTAIN counts as PASS; every other abstain rejects
    pub abstain_passes: Vec<String>,
    pub momentum: MomentumGateConfig,
    pub min_confidence: f64,
    /// Most adverse sentiment a trade may run into, in [-1, 0]
    pub sentiment_floor: f64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            order: vec![
                MOMENTUM_GATE.to_string(),
                CONFIDENCE_GATE.to_string(),
                SENTIMENT_GATE.to_string(),
                RISK_SIZING_GATE.to_string(),
            ],
            abstain_passes: Vec::new(),
            momentum: MomentumGateConfig::default(),
            min_confidence: 0.6,
            sentiment_floor: -0.3,
        }
    }
}

/// Typical per-period range and holding horizon of each class
const CLASS_VOLATILITY: [(AssetClass, f64, u32); 4] = [
    (AssetClass::LowVolatility, 0.0016, 6),
    (AssetClass::Equity, 0.006, 20),
    (AssetClass::Commodity, 0.005, 15),
    (AssetClass::Crypto, 0.019, 10),
];

fn default_exit_profiles() -> BTreeMap<AssetClass, ExitProfile> {
    CLASS_VOLATILITY
        .iter()
        .map(|&(class, range, periods)| (class, ExitProfile::calibrated(range, periods)))
        .collect()
}

/// Full configuration of the decision pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub ensemble: EnsembleConfig,
    pub sources: Vec<SourceConfig>,
    /// Overrides every source's own timeout when set
    pub source_timeout_ms: Option<u64>,
    pub gates: GateConfig,
    pub risk: RiskLimits,
    pub exit_profiles: BTreeMap<AssetClass, ExitProfile>,
    /// Instrument → asset class; unlisted instruments use `default_asset_class`
    pub instruments: HashMap<String, AssetClass>,
    pub default_asset_class: AssetClass,
    /// Equity used when no persisted state exists
    pub starting_equity: Decimal,
    pub cycle_deadline_ms: u64,
    pub max_concurrent_decisions: usize,
    pub max_exit_retries: u32,
    pub metrics_log_interval: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ensemble: EnsembleConfig::default(),
            sources: Vec::new(),
            source_timeout_ms: None,
            gates: GateConfig::default(),
            risk: RiskLimits::default(),
            exit_profiles: default_exit_profiles(),
            instruments: HashMap::new(),
            default_asset_class: AssetClass::Equity,
            starting_equity: Decimal::from(100_000),
            cycle_deadline_ms: 30_000,
            max_concurrent_decisions: 8,
            max_exit_retries: 3,
            metrics_log_interval: 10,
        }
    }
}

impl PipelineConfig {
    /// Defaults overridden from the environment (and `.env`), then validated
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let mut config = Self::default();

        if let Ok(mode) = env::var("VOTING_MODE") {
            config.ensemble.mode = mode
                .parse()
                .map_err(|detail| parse_error("VOTING_MODE", detail))?;
        }
        config.ensemble.threshold = env::var("VOTING_THRESHOLD")
            .unwrap_or_else(|_| config.ensemble.threshold.to_string())
            .parse()
            .context("VOTING_THRESHOLD")?;
        config.ensemble.confidence_floor = env::var("CONFIDENCE_FLOOR")
            .unwrap_or_else(|_| config.ensemble.confidence_floor.to_string())
            .parse()
            .context("CONFIDENCE_FLOOR")?;
        if let Ok(weights) = env::var("SOURCE_WEIGHTS") {
            config.ensemble.weights = parse_weights(&weights)?;
        }

        config.risk.max_daily_loss_pct = env::var("MAX_DAILY_LOSS_PCT")
            .unwrap_or_else(|_| config.risk.max_daily_loss_pct.to_string())
            .parse()
            .context("MAX_DAILY_LOSS_PCT")?;
        config.risk.max_drawdown_pct = env::var("MAX_DRAWDOWN_PCT")
            .unwrap_or_else(|_| config.risk.max_drawdown_pct.to_string())
            .parse()
            .context("MAX_DRAWDOWN_PCT")?;
        config.risk.max_position_size_pct = env::var("MAX_POSITION_SIZE_PCT")
            .unwrap_or_else(|_| config.risk.max_position_size_pct.to_string())
            .parse()
            .context("MAX_POSITION_SIZE_PCT")?;
        config.risk.max_risk_per_trade_pct = env::var("MAX_RISK_PER_TRADE_PCT")
            .unwrap_or_else(|_| config.risk.max_risk_per_trade_pct.to_string())
            .parse()
            .context("MAX_RISK_PER_TRADE_PCT")?;
        config.risk.max_portfolio_exposure_pct = env::var("MAX_PORTFOLIO_EXPOSURE_PCT")
            .unwrap_or_else(|_| config.risk.max_portfolio_exposure_pct.to_string())
            .parse()
            .context("MAX_PORTFOLIO_EXPOSURE_PCT")?;
        config.risk.consecutive_loss_warning = env::var("CONSECUTIVE_LOSS_WARNING")
            .unwrap_or_else(|_| config.risk.consecutive_loss_warning.to_string())
            .parse()
            .context("CONSECUTIVE_LOSS_WARNING")?;
        if let Ok(max) = env::var("MAX_CONSECUTIVE_LOSSES") {
            config.risk.max_consecutive_losses =
                Some(max.parse().context("MAX_CONSECUTIVE_LOSSES")?);
        }

        if let Ok(order) = env::var("GATE_ORDER") {
            config.gates.order = split_list(&order);
        }
        if let Ok(passes) = env::var("ABSTAIN_PASSES") {
            config.gates.abstain_passes = split_list(&passes);
        }
        config.gates.min_confidence = env::var("MIN_GATE_CONFIDENCE")
            .unwrap_or_else(|_| config.gates.min_confidence.to_string())
            .parse()
            .context("MIN_GATE_CONFIDENCE")?;
        config.gates.sentiment_floor = env::var("SENTIMENT_FLOOR")
            .unwrap_or_else(|_| config.gates.sentiment_floor.to_string())
            .parse()
            .context("SENTIMENT_FLOOR")?;
        config.gates.momentum.min_conditions = env::var("MOMENTUM_MIN_CONDITIONS")
            .unwrap_or_else(|_| config.gates.momentum.min_conditions.to_string())
            .parse()
            .context("MOMENTUM_MIN_CONDITIONS")?;

        if let Ok(profiles) = env::var("EXIT_PROFILES") {
            for (class, profile) in parse_exit_profiles(&profiles)? {
                // Keep the declared range so reachability is still checked
                let range = config
                    .exit_profiles
                    .get(&class)
                    .and_then(|p| p.typical_daily_range_pct);
                config.exit_profiles.insert(
                    class,
                    ExitProfile {
                        typical_daily_range_pct: range,
                        ..profile
                    },
                );
            }
        }
        if let Ok(classes) = env::var("INSTRUMENT_CLASSES") {
            config.instruments = parse_instrument_classes(&classes)?;
        }
        if let Ok(class) = env::var("DEFAULT_ASSET_CLASS") {
            config.default_asset_class = class
                .parse()
                .map_err(|detail| parse_error("DEFAULT_ASSET_CLASS", detail))?;
        }

        config.starting_equity = env::var("STARTING_EQUITY")
            .unwrap_or_else(|_| config.starting_equity.to_string())
            .parse()
            .context("STARTING_EQUITY")?;
        config.cycle_deadline_ms = env::var("CYCLE_DEADLINE_MS")
            .unwrap_or_else(|_| config.cycle_deadline_ms.to_string())
            .parse()
            .context("CYCLE_DEADLINE_MS")?;
        if let Ok(timeout) = env::var("SOURCE_TIMEOUT_MS") {
            config.source_timeout_ms = Some(timeout.parse().context("SOURCE_TIMEOUT_MS")?);
        }
        config.max_concurrent_decisions = env::var("MAX_CONCURRENT_DECISIONS")
            .unwrap_or_else(|_| config.max_concurrent_decisions.to_string())
            .parse()
            .context("MAX_CONCURRENT_DECISIONS")?;
        config.max_exit_retries = env::var("MAX_EXIT_RETRIES")
            .unwrap_or_else(|_| config.max_exit_retries.to_string())
            .parse()
            .context("MAX_EXIT_RETRIES")?;

        config.validate()?;
        Ok(config)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("parsing pipeline config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn asset_class_of(&self, instrument: &str) -> AssetClass {
        self.instruments
            .get(instrument)
            .copied()
            .unwrap_or(self.default_asset_class)
    }

    pub fn exit_profile_for(&self, instrument: &str) -> Option<(AssetClass, ExitProfile)> {
        let class = self.asset_class_of(instrument);
        self.exit_profiles.get(&class).map(|p| (class, *p))
    }

    /// Source configuration with the global timeout override applied
    pub fn source_config(&self, source_id: &str) -> Option<SourceConfig> {
        self.sources
            .iter()
            .find(|s| s.source_id == source_id)
            .map(|s| match self.source_timeout_ms {
                Some(timeout_ms) => s.clone().with_timeout_ms(timeout_ms),
                None => s.clone(),
            })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        unit("ensemble.threshold", self.ensemble.threshold)?;
        unit("ensemble.confidence_floor", self.ensemble.confidence_floor)?;
        for (source, weight) in &self.ensemble.weights {
            if !weight.is_finite() || *weight < 0.0 {
                return Err(out_of_range(format!("weight.{}", source), *weight, "[0, inf)"));
            }
        }
        for source in &self.sources {
            unit(&format!("{}.confidence_floor", source.source_id), source.confidence_floor)?;
            if source.timeout_ms == 0 {
                return Err(out_of_range(format!("{}.timeout_ms", source.source_id), 0.0, "(0, inf)"));
            }
        }
        if self.source_timeout_ms == Some(0) {
            return Err(out_of_range("source_timeout_ms", 0.0, "(0, inf)"));
        }

        for name in self.gates.order.iter().chain(&self.gates.abstain_passes) {
            if !KNOWN_GATES.contains(&name.as_str()) {
                return Err(ConfigError::UnknownGate(name.clone()));
            }
        }
        unit("gates.min_confidence", self.gates.min_confidence)?;
        if !(-1.0..=0.0).contains(&self.gates.sentiment_floor) {
            return Err(out_of_range("gates.sentiment_floor", self.gates.sentiment_floor, "[-1, 0]"));
        }
        if self.gates.momentum.min_conditions > 3 {
            return Err(out_of_range(
                "gates.momentum.min_conditions",
                self.gates.momentum.min_conditions as f64,
                "[0, 3]",
            ));
        }

        for (field, value) in [
            ("risk.max_daily_loss_pct", self.risk.max_daily_loss_pct),
            ("risk.max_drawdown_pct", self.risk.max_drawdown_pct),
            ("risk.max_position_size_pct", self.risk.max_position_size_pct),
            ("risk.max_risk_per_trade_pct", self.risk.max_risk_per_trade_pct),
            ("risk.max_portfolio_exposure_pct", self.risk.max_portfolio_exposure_pct),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(out_of_range(field, value, "(0, 1]"));
            }
        }

        for (class, profile) in &self.exit_profiles {
            let prefix = format!("exit_profiles.{}", class);
            positive(&format!("{}.take_profit_pct", prefix), profile.take_profit_pct)?;
            positive(&format!("{}.stop_loss_pct", prefix), profile.stop_loss_pct)?;
            if profile.max_holding_periods == 0 {
                return Err(out_of_range(format!("{}.max_holding_periods", prefix), 0.0, "[1, inf)"));
            }
            if !profile.is_reachable() {
                return Err(ConfigError::UnreachableExitProfile {
                    class: *class,
                    detail: format!(
                        "take profit {:.2}% / stop {:.2}% over {} periods with a {:.2}% typical range",
                        profile.take_profit_pct * 100.0,
                        profile.stop_loss_pct * 100.0,
                        profile.max_holding_periods,
                        profile.typical_daily_range_pct.unwrap_or_default() * 100.0
                    ),
                });
            }
        }
        for class in self
            .instruments
            .values()
            .chain(std::iter::once(&self.default_asset_class))
        {
            if !self.exit_profiles.contains_key(class) {
                return Err(ConfigError::MissingExitProfile(*class));
            }
        }

        if self.cycle_deadline_ms == 0 {
            return Err(out_of_range("cycle_deadline_ms", 0.0, "(0, inf)"));
        }
        if self.max_concurrent_decisions == 0 {
            return Err(out_of_range("max_concurrent_decisions", 0.0, "[1, inf)"));
        }

        Ok(())
    }
}

fn out_of_range(field: impl Into<String>, value: f64, range: &'static str) -> ConfigError {
    ConfigError::OutOfRange {
        field: field.into(),
        value,
        range,
    }
}

fn unit(field: &str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(out_of_range(field, value, "[0, 1]"))
    }
}

fn positive(field: &str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(out_of_range(field, value, "(0, inf)"))
    }
}

fn parse_error(key: &str, detail: impl Into<String>) -> ConfigError {
    ConfigError::Parse {
        key: key.to_string(),
        detail: detail.into(),
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// `"momentum=0.4,rl_filter=0.35"`
fn parse_weights(value: &str) -> Result<HashMap<String, f64>, ConfigError> {
    split_list(value)
        .into_iter()
        .map(|pair| -> Result<(String, f64), ConfigError> {
            let (id, weight) = pair
                .split_once('=')
                .ok_or_else(|| parse_error("SOURCE_WEIGHTS", format!("expected id=weight, got '{}'", pair)))?;
            let weight = weight
                .trim()
                .parse::<f64>()
                .map_err(|e| parse_error("SOURCE_WEIGHTS", format!("{}: {}", pair, e)))?;
            Ok((id.trim().to_string(), weight))
        })
        .collect()
}

/// `"low_volatility=0.004/0.003/6;equity=0.03/0.02/20"`
fn parse_exit_profiles(value: &str) -> Result<Vec<(AssetClass, ExitProfile)>, ConfigError> {
    value
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| -> Result<(AssetClass, ExitProfile), ConfigError> {
            let bad = |detail: String| parse_error("EXIT_PROFILES", format!("{}: {}", entry, detail));
            let (class, thresholds) = entry
                .split_once('=')
                .ok_or_else(|| bad("expected class=tp/sl/periods".to_string()))?;
            let class: AssetClass = class.parse().map_err(bad)?;
            let parts: Vec<&str> = thresholds.split('/').map(str::trim).collect();
            let [tp, sl, periods] = parts.as_slice() else {
                return Err(bad("expected tp/sl/periods".to_string()));
            };
            let take_profit = tp.parse::<f64>().map_err(|e| bad(e.to_string()))?;
            let stop_loss = sl.parse::<f64>().map_err(|e| bad(e.to_string()))?;
            let periods = periods.parse::<u32>().map_err(|e| bad(e.to_string()))?;
            Ok((class, ExitProfile::new(take_profit, stop_loss, periods)))
        })
        .collect()
}

/// `"TLT=low_volatility,SPY=equity"`
fn parse_instrument_classes(value: &str) -> Result<HashMap<String, AssetClass>, ConfigError> {
    split_list(value)
        .into_iter()
        .map(|pair| -> Result<(String, AssetClass), ConfigError> {
            let (instrument, class) = pair
                .split_once('=')
                .ok_or_else(|| parse_error("INSTRUMENT_CLASSES", format!("expected SYMBOL=class, got '{}'", pair)))?;
            let class: AssetClass = class
                .parse()
                .map_err(|detail: String| parse_error("INSTRUMENT_CLASSES", detail))?;
            Ok((instrument.trim().to_string(), class))
        })
        .collect()
}
