use chrono::{DateTime, Utc};
use trading_core::{Action, NormalizeError, RawVote, SourceSchema, Vote};

const PROBABILITY_SUM_TOLERANCE: f64 = 1e-6;

/// Map a source's native output onto a canonical vote.
///
/// Fails closed: unknown labels, out-of-range values, non-finite numbers and
/// outputs that do not match the declared schema produce an error instead of
/// a defaulted vote.
pub fn normalize(
    source_id: &str,
    instrument: &str,
    raw: &RawVote,
    schema: &SourceSchema,
    timestamp: DateTime<Utc>,
) -> Result<Vote, NormalizeError> {
    let (action, confidence) = match (schema, raw) {
        (SourceSchema::Discrete { labels }, RawVote::Label { label, confidence }) => {
            let key = label.trim().to_ascii_lowercase();
            let action = labels.get(&key).copied().ok_or_else(|| {
                NormalizeError::malformed(source_id, format!("unrecognized label '{}'", label))
            })?;
            check_unit(source_id, "confidence", *confidence)?;
            (action, *confidence)
        }
        (SourceSchema::Continuous { min, max, dead_zone }, RawVote::Score { score }) => {
            continuous(source_id, *score, *min, *max, *dead_zone)?
        }
        (SourceSchema::Probabilities, RawVote::Probabilities { buy, hold, sell }) => {
            probabilities(source_id, *buy, *hold, *sell)?
        }
        _ => {
            return Err(NormalizeError::SchemaMismatch {
                source_id: source_id.to_string(),
                expected: schema.kind(),
                got: raw.kind(),
            })
        }
    };

    Ok(Vote::new(source_id, instrument, action, confidence, timestamp))
}

fn check_unit(source_id: &str, field: &str, value: f64) -> Result<(), NormalizeError> {
    if !value.is_finite() || !(0.0..=1.0).contains(&value) {
        return Err(NormalizeError::malformed(
            source_id,
            format!("{} {} outside [0, 1]", field, value),
        ));
    }
    Ok(())
}

fn continuous(
    source_id: &str,
    score: f64,
    min: f64,
    max: f64,
    dead_zone: f64,
) -> Result<(Action, f64), NormalizeError> {
    if min.is_nan() || max.is_nan() || min >= max || !dead_zone.is_finite() || dead_zone < 0.0 {
        return Err(NormalizeError::malformed(
            source_id,
            format!("invalid score schema [{}, {}] dead_zone {}", min, max, dead_zone),
        ));
    }
    if !score.is_finite() || score < min || score > max {
        return Err(NormalizeError::malformed(
            source_id,
            format!("score {} outside [{}, {}]", score, min, max),
        ));
    }

    let magnitude = score.abs();
    if magnitude <= dead_zone {
        let confidence = if dead_zone > 0.0 {
            1.0 - magnitude / dead_zone
        } else {
            1.0
        };
        return Ok((Action::Hold, confidence));
    }

    let scale = min.abs().max(max.abs());
    let action = if score > 0.0 { Action::Buy } else { Action::Sell };
    Ok((action, magnitude / scale))
}

fn probabilities(
    source_id: &str,
    buy: f64,
    hold: f64,
    sell: f64,
) -> Result<(Action, f64), NormalizeError> {
    for (field, value) in [("buy", buy), ("hold", hold), ("sell", sell)] {
        check_unit(source_id, field, value)?;
    }
    let sum = buy + hold + sell;
    if (sum - 1.0).abs() > PROBABILITY_SUM_TOLERANCE {
        return Err(NormalizeError::malformed(
            source_id,
            format!("class probabilities sum to {:.6}", sum),
        ));
    }

    let best = buy.max(hold).max(sell);
    let winners: Vec<Action> = [(Action::Buy, buy), (Action::Hold, hold), (Action::Sell, sell)]
        .into_iter()
        .filter(|(_, p)| (*p - best).abs() < f64::EPSILON)
        .map(|(a, _)| a)
        .collect();

    match winners.as_slice() {
        [single] => Ok((*single, best)),
        _ => Ok((Action::Hold, best)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn discrete_labels_map_case_insensitively() {
        let schema = SourceSchema::long_short_labels();
        let raw = RawVote::Label {
            label: " Short ".to_string(),
            confidence: 0.65,
        };
        let vote = normalize("rl_filter", "AAPL", &raw, &schema, now()).unwrap();
        assert_eq!(vote.action, Action::Sell);
        assert_relative_eq!(vote.confidence, 0.65);
    }

    #[test]
    fn unknown_label_is_dropped() {
        let schema = SourceSchema::long_short_labels();
        let raw = RawVote::Label {
            label: "moon".to_string(),
            confidence: 0.9,
        };
        let err = normalize("rl_filter", "AAPL", &raw, &schema, now()).unwrap_err();
        assert!(matches!(err, NormalizeError::MalformedVote { .. }));
    }

    #[test]
    fn label_confidence_out_of_range_is_dropped() {
        let schema = SourceSchema::long_short_labels();
        let raw = RawVote::Label {
            label: "long".to_string(),
            confidence: 1.4,
        };
        assert!(normalize("rl_filter", "AAPL", &raw, &schema, now()).is_err());
    }

    #[test]
    fn signed_score_infers_action_by_sign() {
        let schema = SourceSchema::signed_unit(0.1);
        let vote = normalize("sentiment", "MSFT", &RawVote::Score { score: -0.6 }, &schema, now())
            .unwrap();
        assert_eq!(vote.action, Action::Sell);
        assert_relative_eq!(vote.confidence, 0.6);

        let vote = normalize("sentiment", "MSFT", &RawVote::Score { score: 0.35 }, &schema, now())
            .unwrap();
        assert_eq!(vote.action, Action::Buy);
        assert_relative_eq!(vote.confidence, 0.35);
    }

    #[test]
    fn dead_zone_maps_to_hold() {
        let schema = SourceSchema::signed_unit(0.2);
        let vote = normalize("sentiment", "MSFT", &RawVote::Score { score: 0.05 }, &schema, now())
            .unwrap();
        assert_eq!(vote.action, Action::Hold);
        assert_relative_eq!(vote.confidence, 0.75, epsilon = 1e-12);
    }

    #[test]
    fn score_outside_declared_range_is_dropped() {
        let schema = SourceSchema::signed_unit(0.1);
        assert!(normalize("sentiment", "MSFT", &RawVote::Score { score: 1.2 }, &schema, now()).is_err());
        assert!(
            normalize("sentiment", "MSFT", &RawVote::Score { score: f64::NAN }, &schema, now()).is_err()
        );
    }

    #[test]
    fn wider_ranges_scale_confidence() {
        let schema = SourceSchema::Continuous {
            min: -100.0,
            max: 100.0,
            dead_zone: 5.0,
        };
        let vote = normalize("momentum", "QQQ", &RawVote::Score { score: 40.0 }, &schema, now())
            .unwrap();
        assert_eq!(vote.action, Action::Buy);
        assert_relative_eq!(vote.confidence, 0.4);
    }

    #[test]
    fn schema_mismatch_is_rejected() {
        let schema = SourceSchema::signed_unit(0.1);
        let raw = RawVote::Label {
            label: "long".to_string(),
            confidence: 0.9,
        };
        let err = normalize("sentiment", "MSFT", &raw, &schema, now()).unwrap_err();
        assert!(matches!(err, NormalizeError::SchemaMismatch { expected: "score", got: "label", .. }));
    }

    #[test]
    fn probabilities_pick_argmax() {
        let raw = RawVote::Probabilities {
            buy: 0.2,
            hold: 0.1,
            sell: 0.7,
        };
        let vote = normalize("rl_filter", "IWM", &raw, &SourceSchema::Probabilities, now()).unwrap();
        assert_eq!(vote.action, Action::Sell);
        assert_relative_eq!(vote.confidence, 0.7);
    }

    #[test]
    fn tied_probabilities_hold() {
        let raw = RawVote::Probabilities {
            buy: 0.4,
            hold: 0.2,
            sell: 0.4,
        };
        let vote = normalize("rl_filter", "IWM", &raw, &SourceSchema::Probabilities, now()).unwrap();
        assert_eq!(vote.action, Action::Hold);
    }

    #[test]
    fn probabilities_must_sum_to_one() {
        let raw = RawVote::Probabilities {
            buy: 0.5,
            hold: 0.5,
            sell: 0.5,
        };
        assert!(normalize("rl_filter", "IWM", &raw, &SourceSchema::Probabilities, now()).is_err());
    }
}
