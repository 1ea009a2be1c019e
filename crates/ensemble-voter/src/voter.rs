use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use trading_core::{Action, Decision, Vote, VoteTally};

/// Scores closer than this are treated as a tie
const TIE_EPSILON: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VotingMode {
    Simple,
    #[default]
    Weighted,
    Unanimous,
}

impl VotingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            VotingMode::Simple => "simple",
            VotingMode::Weighted => "weighted",
            VotingMode::Unanimous => "unanimous",
        }
    }
}

impl fmt::Display for VotingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VotingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "simple" | "majority" => Ok(VotingMode::Simple),
            "weighted" => Ok(VotingMode::Weighted),
            "unanimous" => Ok(VotingMode::Unanimous),
            other => Err(format!("unknown voting mode '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnsembleConfig {
    pub mode: VotingMode,
    /// Minimum share of the tally (simple) or weighted score (weighted) the winner needs
    pub threshold: f64,
    /// Votes below this confidence never reach aggregation
    pub confidence_floor: f64,
    /// Raw per-source weights; renormalized over the sources present each cycle
    pub weights: HashMap<String, f64>,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            mode: VotingMode::Weighted,
            threshold: 0.5,
            confidence_floor: 0.0,
            weights: HashMap::new(),
        }
    }
}

/// Per-action scores over the retained votes, before a winner is picked.
///
/// `weights` holds the effective weight of each retained source: 1.0 in
/// simple and unanimous modes, the renormalized source weight in weighted
/// mode. `scores` holds count (simple/unanimous) or Σ weight × confidence
/// (weighted) per action.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreBreakdown {
    pub retained: Vec<Vote>,
    pub weights: BTreeMap<String, f64>,
    pub scores: BTreeMap<Action, f64>,
    pub total: f64,
}

impl ScoreBreakdown {
    pub fn score(&self, action: Action) -> f64 {
        self.scores.get(&action).copied().unwrap_or(0.0)
    }

    fn count(&self, action: Action) -> usize {
        self.retained.iter().filter(|v| v.action == action).count()
    }
}

pub struct EnsembleVoter {
    config: EnsembleConfig,
}

impl EnsembleVoter {
    pub fn new(config: EnsembleConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EnsembleConfig {
        &self.config
    }

    /// Aggregate votes for one instrument into a decision.
    ///
    /// Never fails: when nothing survives the floor and weighting the result
    /// is a neutral HOLD with zero consensus.
    pub fn vote(&self, instrument: &str, votes: &[Vote], decided_at: DateTime<Utc>) -> Decision {
        let breakdown = self.score(instrument, votes);
        if breakdown.retained.is_empty() || breakdown.total <= 0.0 {
            tracing::debug!("{}: no usable votes, holding", instrument);
            return Decision::neutral(instrument, decided_at);
        }

        let action = self.pick_winner(&breakdown);
        let consensus_score = breakdown.score(action) / breakdown.total;

        let (mut agreeing_weight, mut agreeing_conf) = (0.0, 0.0);
        for vote in breakdown.retained.iter().filter(|v| v.action == action) {
            let w = breakdown.weights.get(&vote.source_id).copied().unwrap_or(0.0);
            agreeing_weight += w;
            agreeing_conf += w * vote.confidence;
        }
        let weighted_confidence = if agreeing_weight > 0.0 {
            agreeing_conf / agreeing_weight
        } else {
            0.0
        };

        let votes_for = breakdown.count(action);
        let vote_tally = if action.is_directional() {
            VoteTally {
                votes_for,
                against: breakdown.count(action.opposite()),
                abstain: breakdown.count(Action::Hold),
            }
        } else {
            VoteTally {
                votes_for,
                against: breakdown.retained.len() - votes_for,
                abstain: 0,
            }
        };

        let first = breakdown.retained[0].action;
        let unanimous = breakdown.retained.iter().all(|v| v.action == first);

        let per_source_votes = breakdown
            .retained
            .into_iter()
            .map(|v| (v.source_id.clone(), v))
            .collect();

        tracing::debug!(
            "{}: {} mode -> {} (consensus={:.3}, confidence={:.3}, tally={}/{}/{})",
            instrument,
            self.config.mode,
            action,
            consensus_score,
            weighted_confidence,
            vote_tally.votes_for,
            vote_tally.against,
            vote_tally.abstain
        );

        Decision {
            instrument: instrument.to_string(),
            action,
            consensus_score: consensus_score.clamp(0.0, 1.0),
            weighted_confidence: weighted_confidence.clamp(0.0, 1.0),
            vote_tally,
            unanimous,
            per_source_votes,
            decided_at,
        }
    }

    /// Filter and weight votes, returning per-action scores.
    ///
    /// Votes for another instrument are ignored, a source voting twice keeps
    /// its latest vote, and votes under the confidence floor are dropped. In
    /// weighted mode sources without a configured weight are dropped and the
    /// remaining weights are rescaled to sum to one; an empty weight table
    /// weighs every source equally.
    pub fn score(&self, instrument: &str, votes: &[Vote]) -> ScoreBreakdown {
        let mut latest: BTreeMap<&str, &Vote> = BTreeMap::new();
        for vote in votes.iter().filter(|v| v.instrument == instrument) {
            match latest.get(vote.source_id.as_str()) {
                Some(existing) if existing.timestamp >= vote.timestamp => {}
                _ => {
                    latest.insert(vote.source_id.as_str(), vote);
                }
            }
        }

        let mut retained = Vec::new();
        let mut raw_weights = BTreeMap::new();
        for vote in latest.into_values() {
            if vote.confidence < self.config.confidence_floor {
                continue;
            }
            let weight = match self.config.mode {
                VotingMode::Weighted if self.config.weights.is_empty() => 1.0,
                VotingMode::Weighted => match self.config.weights.get(&vote.source_id) {
                    Some(w) if *w > 0.0 => *w,
                    Some(_) => continue,
                    None => {
                        tracing::warn!(
                            "No weight configured for source {}, dropping its vote",
                            vote.source_id
                        );
                        continue;
                    }
                },
                VotingMode::Simple | VotingMode::Unanimous => 1.0,
            };
            raw_weights.insert(vote.source_id.clone(), weight);
            retained.push(vote.clone());
        }

        let weights: BTreeMap<String, f64> = match self.config.mode {
            VotingMode::Weighted => {
                let sum: f64 = raw_weights.values().sum();
                raw_weights
                    .into_iter()
                    .map(|(id, w)| (id, if sum > 0.0 { w / sum } else { 0.0 }))
                    .collect()
            }
            VotingMode::Simple | VotingMode::Unanimous => raw_weights,
        };

        let mut scores: BTreeMap<Action, f64> = Action::ALL.iter().map(|a| (*a, 0.0)).collect();
        for vote in &retained {
            let w = weights.get(&vote.source_id).copied().unwrap_or(0.0);
            let contribution = match self.config.mode {
                VotingMode::Weighted => w * vote.confidence,
                VotingMode::Simple | VotingMode::Unanimous => w,
            };
            *scores.entry(vote.action).or_insert(0.0) += contribution;
        }
        let total = scores.values().sum();

        ScoreBreakdown {
            retained,
            weights,
            scores,
            total,
        }
    }

    fn pick_winner(&self, breakdown: &ScoreBreakdown) -> Action {
        match self.config.mode {
            VotingMode::Unanimous => {
                let first = breakdown.retained[0].action;
                if breakdown.retained.iter().all(|v| v.action == first) {
                    first
                } else {
                    Action::Hold
                }
            }
            VotingMode::Simple | VotingMode::Weighted => {
                let best = breakdown
                    .scores
                    .values()
                    .copied()
                    .fold(f64::NEG_INFINITY, f64::max);
                let leaders: Vec<Action> = breakdown
                    .scores
                    .iter()
                    .filter(|(_, s)| (best - **s).abs() <= TIE_EPSILON)
                    .map(|(a, _)| *a)
                    .collect();
                match leaders.as_slice() {
                    [winner] if best / breakdown.total >= self.config.threshold => *winner,
                    _ => Action::Hold,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::Duration;

    fn vote(source: &str, action: Action, confidence: f64) -> Vote {
        Vote::new(source, "AAPL", action, confidence, Utc::now())
    }

    fn weighted(weights: &[(&str, f64)]) -> EnsembleVoter {
        EnsembleVoter::new(EnsembleConfig {
            mode: VotingMode::Weighted,
            threshold: 0.5,
            confidence_floor: 0.0,
            weights: weights.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
        })
    }

    fn mode(mode: VotingMode, floor: f64) -> EnsembleVoter {
        EnsembleVoter::new(EnsembleConfig {
            mode,
            threshold: 0.5,
            confidence_floor: floor,
            weights: HashMap::new(),
        })
    }

    #[test]
    fn weighted_scenario_buy_wins() {
        let voter = weighted(&[("momentum", 0.4), ("rl_filter", 0.35), ("sentiment", 0.25)]);
        let votes = vec![
            vote("momentum", Action::Buy, 0.8),
            vote("rl_filter", Action::Buy, 0.7),
            vote("sentiment", Action::Sell, 0.9),
        ];

        let breakdown = voter.score("AAPL", &votes);
        assert_relative_eq!(breakdown.score(Action::Buy), 0.565, epsilon = 1e-9);
        assert_relative_eq!(breakdown.score(Action::Sell), 0.225, epsilon = 1e-9);

        let d = voter.vote("AAPL", &votes, Utc::now());
        assert_eq!(d.action, Action::Buy);
        assert_relative_eq!(d.consensus_score, 0.565 / 0.79, epsilon = 1e-9);
        assert_relative_eq!(d.consensus_score, 0.715, epsilon = 1e-3);
        assert_relative_eq!(d.weighted_confidence, 0.565 / 0.75, epsilon = 1e-9);
        assert_eq!(d.vote_tally.votes_for, 2);
        assert_eq!(d.vote_tally.against, 1);
        assert!(!d.unanimous);
        assert_eq!(d.per_source_votes.len(), 3);
    }

    #[test]
    fn weighted_scores_conserve_weight_times_confidence() {
        let voter = weighted(&[("a", 2.0), ("b", 1.0), ("c", 1.0), ("d", 4.0)]);
        let votes = vec![
            vote("a", Action::Buy, 0.9),
            vote("b", Action::Hold, 0.4),
            vote("c", Action::Sell, 0.6),
            vote("d", Action::Buy, 0.3),
        ];
        let breakdown = voter.score("AAPL", &votes);

        let weight_sum: f64 = breakdown.weights.values().sum();
        assert_relative_eq!(weight_sum, 1.0, epsilon = 1e-12);

        let expected: f64 = breakdown
            .retained
            .iter()
            .map(|v| breakdown.weights[&v.source_id] * v.confidence)
            .sum();
        let per_action: f64 = Action::ALL.iter().map(|a| breakdown.score(*a)).sum();
        assert_relative_eq!(per_action, expected, epsilon = 1e-12);
        assert_relative_eq!(breakdown.total, expected, epsilon = 1e-12);
    }

    #[test]
    fn weights_renormalize_over_active_sources() {
        let voter = weighted(&[("momentum", 0.4), ("rl_filter", 0.35), ("sentiment", 0.25)]);
        // sentiment timed out this cycle
        let votes = vec![
            vote("momentum", Action::Buy, 0.8),
            vote("rl_filter", Action::Buy, 0.7),
        ];
        let breakdown = voter.score("AAPL", &votes);
        assert_relative_eq!(breakdown.weights["momentum"], 0.4 / 0.75, epsilon = 1e-12);
        assert_relative_eq!(breakdown.weights["rl_filter"], 0.35 / 0.75, epsilon = 1e-12);

        let d = voter.vote("AAPL", &votes, Utc::now());
        assert_eq!(d.action, Action::Buy);
        assert!(d.unanimous);
        assert_relative_eq!(d.consensus_score, 1.0);
    }

    #[test]
    fn weighted_winner_below_threshold_holds() {
        let mut voter = weighted(&[("a", 1.0), ("b", 1.0), ("c", 1.0)]);
        voter.config.threshold = 0.6;
        let votes = vec![
            vote("a", Action::Buy, 0.5),
            vote("b", Action::Sell, 0.4),
            vote("c", Action::Hold, 0.3),
        ];
        let d = voter.vote("AAPL", &votes, Utc::now());
        assert_eq!(d.action, Action::Hold);
        assert_eq!(d.vote_tally.votes_for, 1);
        assert_eq!(d.vote_tally.against, 2);
    }

    #[test]
    fn unweighted_source_is_ignored_in_weighted_mode() {
        let voter = weighted(&[("a", 1.0)]);
        let votes = vec![vote("a", Action::Sell, 0.6), vote("rogue", Action::Buy, 1.0)];
        let d = voter.vote("AAPL", &votes, Utc::now());
        assert_eq!(d.action, Action::Sell);
        assert!(!d.per_source_votes.contains_key("rogue"));
    }

    #[test]
    fn empty_weight_table_weighs_sources_equally() {
        let voter = mode(VotingMode::Weighted, 0.0);
        let votes = vec![
            vote("a", Action::Buy, 0.9),
            vote("b", Action::Buy, 0.5),
            vote("c", Action::Sell, 0.4),
        ];
        let breakdown = voter.score("AAPL", &votes);
        assert_relative_eq!(breakdown.weights["a"], 1.0 / 3.0, epsilon = 1e-12);
        assert_relative_eq!(breakdown.score(Action::Buy), 1.4 / 3.0, epsilon = 1e-12);

        let d = voter.vote("AAPL", &votes, Utc::now());
        assert_eq!(d.action, Action::Buy);
        assert_relative_eq!(d.weighted_confidence, 0.7, epsilon = 1e-12);
    }

    #[test]
    fn everything_below_floor_is_neutral() {
        for m in [VotingMode::Simple, VotingMode::Weighted, VotingMode::Unanimous] {
            let mut voter = mode(m, 0.6);
            voter.config.weights = [("a", 1.0), ("b", 1.0)]
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect();
            let votes = vec![vote("a", Action::Buy, 0.59), vote("b", Action::Buy, 0.2)];
            let d = voter.vote("AAPL", &votes, Utc::now());
            assert_eq!(d.action, Action::Hold, "mode {}", m);
            assert_eq!(d.consensus_score, 0.0);
            assert!(d.per_source_votes.is_empty());
        }
    }

    #[test]
    fn empty_vote_set_is_neutral() {
        let d = mode(VotingMode::Simple, 0.0).vote("AAPL", &[], Utc::now());
        assert_eq!(d.action, Action::Hold);
        assert_eq!(d.consensus_score, 0.0);
        assert_eq!(d.vote_tally.total(), 0);
    }

    #[test]
    fn simple_majority_wins_at_threshold() {
        let voter = mode(VotingMode::Simple, 0.0);
        let votes = vec![
            vote("a", Action::Sell, 0.3),
            vote("b", Action::Sell, 0.9),
            vote("c", Action::Buy, 0.8),
            vote("d", Action::Hold, 0.8),
        ];
        let d = voter.vote("AAPL", &votes, Utc::now());
        assert_eq!(d.action, Action::Sell);
        assert_relative_eq!(d.consensus_score, 0.5);
        assert_relative_eq!(d.weighted_confidence, 0.6);
        assert_eq!(
            d.vote_tally,
            VoteTally {
                votes_for: 2,
                against: 1,
                abstain: 1
            }
        );
    }

    #[test]
    fn simple_tie_holds() {
        let voter = mode(VotingMode::Simple, 0.0);
        let votes = vec![vote("a", Action::Buy, 0.9), vote("b", Action::Sell, 0.9)];
        let d = voter.vote("AAPL", &votes, Utc::now());
        assert_eq!(d.action, Action::Hold);
        assert_eq!(d.consensus_score, 0.0);
    }

    #[test]
    fn unanimous_disagreement_holds_regardless_of_confidence() {
        let voter = mode(VotingMode::Unanimous, 0.0);
        let votes = vec![
            vote("a", Action::Buy, 1.0),
            vote("b", Action::Buy, 1.0),
            vote("c", Action::Sell, 0.01),
        ];
        let d = voter.vote("AAPL", &votes, Utc::now());
        assert_eq!(d.action, Action::Hold);
        assert!(!d.unanimous);
    }

    #[test]
    fn unanimous_agreement_passes() {
        let voter = mode(VotingMode::Unanimous, 0.0);
        let votes = vec![vote("a", Action::Buy, 0.7), vote("b", Action::Buy, 0.9)];
        let d = voter.vote("AAPL", &votes, Utc::now());
        assert_eq!(d.action, Action::Buy);
        assert!(d.unanimous);
        assert_relative_eq!(d.consensus_score, 1.0);
        assert_relative_eq!(d.weighted_confidence, 0.8, epsilon = 1e-12);
    }

    #[test]
    fn latest_vote_per_source_wins() {
        let voter = mode(VotingMode::Simple, 0.0);
        let earlier = Vote::new("a", "AAPL", Action::Sell, 0.9, Utc::now() - Duration::seconds(30));
        let later = Vote::new("a", "AAPL", Action::Buy, 0.6, Utc::now());
        let d = voter.vote("AAPL", &[later, earlier], Utc::now());
        assert_eq!(d.action, Action::Buy);
        assert_eq!(d.per_source_votes.len(), 1);
    }

    #[test]
    fn votes_for_other_instruments_are_ignored() {
        let voter = mode(VotingMode::Simple, 0.0);
        let other = Vote::new("a", "MSFT", Action::Sell, 0.9, Utc::now());
        let d = voter.vote("AAPL", &[other], Utc::now());
        assert_eq!(d.action, Action::Hold);
        assert_eq!(d.consensus_score, 0.0);
    }

    #[test]
    fn voting_mode_parses() {
        assert_eq!("Weighted".parse::<VotingMode>(), Ok(VotingMode::Weighted));
        assert_eq!("majority".parse::<VotingMode>(), Ok(VotingMode::Simple));
        assert!("plurality".parse::<VotingMode>().is_err());
    }
}
