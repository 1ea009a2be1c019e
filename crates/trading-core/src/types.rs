use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Canonical trade direction shared by every signal source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    Buy,
    Hold,
    Sell,
}

impl Action {
    pub const ALL: [Action; 3] = [Action::Buy, Action::Hold, Action::Sell];

    /// BUY and SELL open exposure, HOLD never does
    pub fn is_directional(&self) -> bool {
        !matches!(self, Action::Hold)
    }

    pub fn opposite(&self) -> Action {
        match self {
            Action::Buy => Action::Sell,
            Action::Sell => Action::Buy,
            Action::Hold => Action::Hold,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Buy => "BUY",
            Action::Hold => "HOLD",
            Action::Sell => "SELL",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One normalized opinion from one source about one instrument.
///
/// Confidence is clamped to `[0, 1]` on construction; a NaN confidence
/// collapses to zero so it can never survive a confidence floor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vote {
    pub source_id: String,
    pub instrument: String,
    pub action: Action,
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
}

impl Vote {
    pub fn new(
        source_id: impl Into<String>,
        instrument: impl Into<String>,
        action: Action,
        confidence: f64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let confidence = if confidence.is_nan() {
            0.0
        } else {
            confidence.clamp(0.0, 1.0)
        };
        Self {
            source_id: source_id.into(),
            instrument: instrument.into(),
            action,
            confidence,
            timestamp,
        }
    }
}

/// Native output of a signal source before normalization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RawVote {
    /// Discrete label such as "long" / "short" / "hold" with its own confidence
    Label { label: String, confidence: f64 },
    /// Signed continuous score, e.g. a sentiment polarity in [-1, 1]
    Score { score: f64 },
    /// Class probabilities from a classifier-style model
    Probabilities { buy: f64, hold: f64, sell: f64 },
}

impl RawVote {
    pub fn kind(&self) -> &'static str {
        match self {
            RawVote::Label { .. } => "label",
            RawVote::Score { .. } => "score",
            RawVote::Probabilities { .. } => "probabilities",
        }
    }
}

/// How a source's native output maps onto `(Action, confidence)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceSchema {
    Discrete {
        /// Lower-cased label → action
        labels: HashMap<String, Action>,
    },
    Continuous {
        min: f64,
        max: f64,
        /// Scores with `|score| <= dead_zone` map to HOLD
        dead_zone: f64,
    },
    Probabilities,
}

impl SourceSchema {
    pub fn kind(&self) -> &'static str {
        match self {
            SourceSchema::Discrete { .. } => "label",
            SourceSchema::Continuous { .. } => "score",
            SourceSchema::Probabilities => "probabilities",
        }
    }

    /// Common long/short/hold vocabulary
    pub fn long_short_labels() -> Self {
        let labels = [
            ("long", Action::Buy),
            ("buy", Action::Buy),
            ("short", Action::Sell),
            ("sell", Action::Sell),
            ("hold", Action::Hold),
            ("flat", Action::Hold),
            ("neutral", Action::Hold),
        ]
        .into_iter()
        .map(|(label, action)| (label.to_string(), action))
        .collect();
        SourceSchema::Discrete { labels }
    }

    /// Signed score in [-1, 1] with a symmetric dead zone around zero
    pub fn signed_unit(dead_zone: f64) -> Self {
        SourceSchema::Continuous {
            min: -1.0,
            max: 1.0,
            dead_zone,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteTally {
    #[serde(rename = "for")]
    pub votes_for: usize,
    pub against: usize,
    pub abstain: usize,
}

impl VoteTally {
    pub fn total(&self) -> usize {
        self.votes_for + self.against + self.abstain
    }
}

/// Consensus of all retained votes for one instrument in one cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub instrument: String,
    pub action: Action,
    /// Fraction of total vote weight agreeing with `action`
    pub consensus_score: f64,
    /// Weight-averaged confidence of the agreeing votes
    pub weighted_confidence: f64,
    pub vote_tally: VoteTally,
    pub unanimous: bool,
    pub per_source_votes: BTreeMap<String, Vote>,
    pub decided_at: DateTime<Utc>,
}

impl Decision {
    /// HOLD with zero consensus, used whenever nothing survives filtering
    pub fn neutral(instrument: impl Into<String>, decided_at: DateTime<Utc>) -> Self {
        Self {
            instrument: instrument.into(),
            action: Action::Hold,
            consensus_score: 0.0,
            weighted_confidence: 0.0,
            vote_tally: VoteTally::default(),
            unanimous: false,
            per_source_votes: BTreeMap::new(),
            decided_at,
        }
    }

    pub fn is_actionable(&self) -> bool {
        self.action.is_directional()
    }
}

/// Market snapshot the gates evaluate a decision against.
/// Every field is optional so gates can abstain on missing data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketContext {
    pub instrument: String,
    pub last_price: Option<Decimal>,
    /// Trend/momentum indicator, e.g. rate of change or MACD histogram
    pub momentum: Option<f64>,
    /// Bounded oscillator, e.g. RSI on a 0-100 scale
    pub oscillator: Option<f64>,
    /// Current volume relative to its average (1.0 = average)
    pub relative_volume: Option<f64>,
    /// Auxiliary news sentiment in [-1, 1]
    pub sentiment: Option<f64>,
    pub as_of: DateTime<Utc>,
}

impl MarketContext {
    pub fn new(instrument: impl Into<String>, as_of: DateTime<Utc>) -> Self {
        Self {
            instrument: instrument.into(),
            last_price: None,
            momentum: None,
            oscillator: None,
            relative_volume: None,
            sentiment: None,
            as_of,
        }
    }

    pub fn with_price(mut self, price: Decimal) -> Self {
        self.last_price = Some(price);
        self
    }

    pub fn with_momentum(mut self, momentum: f64, oscillator: f64, relative_volume: f64) -> Self {
        self.momentum = Some(momentum);
        self.oscillator = Some(oscillator);
        self.relative_volume = Some(relative_volume);
        self
    }

    pub fn with_sentiment(mut self, sentiment: f64) -> Self {
        self.sentiment = Some(sentiment);
        self
    }
}
