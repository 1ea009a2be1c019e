use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use trading_core::{NormalizeError, RawVote, SignalError, SignalSource, SourceSchema, Vote};

use crate::normalizer::normalize;

fn default_timeout_ms() -> u64 {
    2_000
}

/// Registration of one signal source: how to read it and how long to wait
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub schema: SourceSchema,
    /// Per-source floor applied after normalization, on top of the ensemble floor
    #[serde(default)]
    pub confidence_floor: f64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl SourceConfig {
    pub fn new(source_id: impl Into<String>, schema: SourceSchema) -> Self {
        Self {
            source_id: source_id.into(),
            schema,
            confidence_floor: 0.0,
            timeout_ms: default_timeout_ms(),
        }
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_confidence_floor(mut self, floor: f64) -> Self {
        self.confidence_floor = floor;
        self
    }
}

/// Votes gathered for one instrument in one cycle, plus what was lost and why
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectedVotes {
    pub instrument: String,
    pub votes: Vec<Vote>,
    pub timed_out: Vec<String>,
    pub failed: Vec<String>,
    pub malformed: Vec<String>,
    pub below_floor: Vec<String>,
}

impl CollectedVotes {
    /// Sources that produced nothing usable this cycle
    pub fn missing(&self) -> usize {
        self.timed_out.len() + self.failed.len() + self.malformed.len() + self.below_floor.len()
    }
}

enum Outcome {
    Vote(Vote),
    BelowFloor,
    Failed(SignalError),
    Malformed(NormalizeError),
}

/// Polls every registered source concurrently for one instrument.
///
/// A slow, failing or malformed source is excluded from this cycle's votes
/// and never blocks or fails the collection.
#[derive(Clone, Default)]
pub struct SignalCollector {
    sources: Vec<(Arc<dyn SignalSource>, SourceConfig)>,
}

impl SignalCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, source: Arc<dyn SignalSource>, config: SourceConfig) {
        if source.source_id() != config.source_id {
            tracing::warn!(
                "Source reports id {} but is registered as {}; using the registered id",
                source.source_id(),
                config.source_id
            );
        }
        self.sources.push((source, config));
    }

    pub fn with_source(mut self, source: Arc<dyn SignalSource>, config: SourceConfig) -> Self {
        self.register(source, config);
        self
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub async fn collect(&self, instrument: &str, as_of: DateTime<Utc>) -> CollectedVotes {
        let mut tasks = JoinSet::new();

        for (source, config) in &self.sources {
            let source = Arc::clone(source);
            let config = config.clone();
            let instrument = instrument.to_string();
            tasks.spawn(async move {
                let timeout = Duration::from_millis(config.timeout_ms);
                let outcome =
                    match tokio::time::timeout(timeout, source.get_vote(&instrument, as_of)).await {
                        Err(_) => Outcome::Failed(SignalError::SourceTimeout {
                            source_id: config.source_id.clone(),
                            timeout_ms: config.timeout_ms,
                        }),
                        Ok(Err(e)) => Outcome::Failed(e),
                        Ok(Ok(raw)) => read_vote(&config, &instrument, &raw, as_of),
                    };
                (config.source_id, outcome)
            });
        }

        let mut collected = CollectedVotes {
            instrument: instrument.to_string(),
            ..Default::default()
        };

        while let Some(result) = tasks.join_next().await {
            match result {
                Ok((_, Outcome::Vote(vote))) => collected.votes.push(vote),
                Ok((source_id, Outcome::BelowFloor)) => collected.below_floor.push(source_id),
                Ok((source_id, Outcome::Failed(e @ SignalError::SourceTimeout { .. }))) => {
                    tracing::warn!("{}: {}", instrument, e);
                    collected.timed_out.push(source_id);
                }
                Ok((source_id, Outcome::Failed(SignalError::Malformed(e))))
                | Ok((source_id, Outcome::Malformed(e))) => {
                    tracing::warn!("{}: dropping vote: {}", instrument, e);
                    collected.malformed.push(source_id);
                }
                Ok((source_id, Outcome::Failed(e))) => {
                    tracing::warn!("{}: source {} failed: {}", instrument, source_id, e);
                    collected.failed.push(source_id);
                }
                Err(e) => {
                    tracing::error!("Signal task error for {}: {}", instrument, e);
                }
            }
        }

        // Arrival order is nondeterministic; keep downstream output stable
        collected.votes.sort_by(|a, b| a.source_id.cmp(&b.source_id));

        tracing::debug!(
            "{}: collected {}/{} votes",
            instrument,
            collected.votes.len(),
            self.sources.len()
        );

        collected
    }
}

fn read_vote(config: &SourceConfig, instrument: &str, raw: &RawVote, as_of: DateTime<Utc>) -> Outcome {
    match normalize(&config.source_id, instrument, raw, &config.schema, as_of) {
        Ok(vote) if vote.confidence < config.confidence_floor => Outcome::BelowFloor,
        Ok(vote) => Outcome::Vote(vote),
        Err(e) => Outcome::Malformed(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use trading_core::Action;

    struct FixedSource {
        id: String,
        raw: RawVote,
    }

    #[async_trait]
    impl SignalSource for FixedSource {
        fn source_id(&self) -> &str {
            &self.id
        }

        async fn get_vote(&self, _instrument: &str, _as_of: DateTime<Utc>) -> Result<RawVote, SignalError> {
            Ok(self.raw.clone())
        }
    }

    struct SlowSource;

    #[async_trait]
    impl SignalSource for SlowSource {
        fn source_id(&self) -> &str {
            "slow"
        }

        async fn get_vote(&self, _instrument: &str, _as_of: DateTime<Utc>) -> Result<RawVote, SignalError> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(RawVote::Score { score: 0.9 })
        }
    }

    struct BrokenSource;

    #[async_trait]
    impl SignalSource for BrokenSource {
        fn source_id(&self) -> &str {
            "broken"
        }

        async fn get_vote(&self, _instrument: &str, _as_of: DateTime<Utc>) -> Result<RawVote, SignalError> {
            Err(SignalError::Unavailable {
                source_id: "broken".to_string(),
                reason: "model server down".to_string(),
            })
        }
    }

    fn fixed(id: &str, raw: RawVote) -> Arc<dyn SignalSource> {
        Arc::new(FixedSource {
            id: id.to_string(),
            raw,
        })
    }

    #[tokio::test]
    async fn slow_and_failing_sources_are_excluded() {
        let collector = SignalCollector::new()
            .with_source(
                fixed("momentum", RawVote::Score { score: 0.7 }),
                SourceConfig::new("momentum", SourceSchema::signed_unit(0.1)),
            )
            .with_source(
                Arc::new(SlowSource),
                SourceConfig::new("slow", SourceSchema::signed_unit(0.1)).with_timeout_ms(20),
            )
            .with_source(
                Arc::new(BrokenSource),
                SourceConfig::new("broken", SourceSchema::signed_unit(0.1)),
            );

        let collected = collector.collect("AAPL", Utc::now()).await;
        assert_eq!(collected.votes.len(), 1);
        assert_eq!(collected.votes[0].source_id, "momentum");
        assert_eq!(collected.votes[0].action, Action::Buy);
        assert_eq!(collected.timed_out, vec!["slow".to_string()]);
        assert_eq!(collected.failed, vec!["broken".to_string()]);
        assert_eq!(collected.missing(), 2);
    }

    #[tokio::test]
    async fn malformed_and_low_confidence_votes_are_dropped() {
        let collector = SignalCollector::new()
            .with_source(
                fixed(
                    "rl_filter",
                    RawVote::Label {
                        label: "sideways".to_string(),
                        confidence: 0.9,
                    },
                ),
                SourceConfig::new("rl_filter", SourceSchema::long_short_labels()),
            )
            .with_source(
                fixed("sentiment", RawVote::Score { score: 0.3 }),
                SourceConfig::new("sentiment", SourceSchema::signed_unit(0.1))
                    .with_confidence_floor(0.5),
            )
            .with_source(
                fixed(
                    "probs",
                    RawVote::Probabilities {
                        buy: 0.1,
                        hold: 0.2,
                        sell: 0.7,
                    },
                ),
                SourceConfig::new("probs", SourceSchema::Probabilities),
            );

        let collected = collector.collect("QQQ", Utc::now()).await;
        assert_eq!(collected.malformed, vec!["rl_filter".to_string()]);
        assert_eq!(collected.below_floor, vec!["sentiment".to_string()]);
        assert_eq!(collected.votes.len(), 1);
        assert_eq!(collected.votes[0].action, Action::Sell);
        assert_eq!(collected.votes[0].instrument, "QQQ");
    }

    #[tokio::test]
    async fn empty_collector_yields_no_votes() {
        let collected = SignalCollector::new().collect("SPY", Utc::now()).await;
        assert!(collected.votes.is_empty());
        assert_eq!(collected.missing(), 0);
    }
}
