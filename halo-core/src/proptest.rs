//! Property-based tests for the ensemble numerics using proptest.
//!
//! These tests verify that:
//!
//! - aggregated scores, intervals and uncertainty stay inside [0, 1]
//! - weights renormalize to 1 whichever judges drop out
//! - the sampler's consensus score is the median of its samples
//! - the decision policy only escalates strictly above its threshold

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use crate::aggregate::Aggregator;
    use crate::config::{AggregationConfig, ExplanationSelection, PolicyConfig, UncertaintyConfig};
    use crate::judge::{JudgeDescriptor, JudgeRole, Specialty};
    use crate::policy::DecisionPolicy;
    use crate::sampler::ConsensusResult;
    use crate::stats;
    use crate::types::{ConfidenceInterval, JudgeResult, RecommendedAction};
    use crate::uncertainty::UncertaintyQuantifier;

    const IDS: [&str; 4] = ["statistical", "llm", "grounding", "general"];

    fn roster(weights: &[f64]) -> Vec<(JudgeDescriptor, f64)> {
        vec![
            (JudgeDescriptor::new(IDS[0], JudgeRole::Statistical), weights[0]),
            (JudgeDescriptor::new(IDS[1], JudgeRole::PrimaryLlm), weights[1]),
            (JudgeDescriptor::new(IDS[2], JudgeRole::Grounding), weights[2]),
            (
                JudgeDescriptor::new(IDS[3], JudgeRole::Specialist(Specialty::General)),
                weights[3],
            ),
        ]
    }

    fn unit() -> impl Strategy<Value = f64> {
        prop_oneof![Just(0.0), Just(1.0), 0.0f64..=1.0]
    }

    fn weight() -> impl Strategy<Value = f64> {
        0.01f64..1.0
    }

    /// Up to four judge results with a non-empty presence mask.
    fn present_results() -> impl Strategy<Value = Vec<JudgeResult>> {
        (
            prop::collection::vec(unit(), 4),
            prop::collection::vec(unit(), 4),
            prop::collection::vec(any::<bool>(), 4),
        )
            .prop_filter("at least one judge present", |(_, _, mask)| mask.contains(&true))
            .prop_map(|(scores, confidences, mask)| {
                (0..4)
                    .filter(|&i| mask[i])
                    .map(|i| JudgeResult::new(IDS[i], scores[i], confidences[i]))
                    .collect::<Vec<_>>()
            })
    }

    proptest! {
        /// The final score is a convex combination of present scores.
        #[test]
        fn final_score_is_convex_combination(
            weights in prop::collection::vec(weight(), 4),
            results in present_results(),
        ) {
            let agg = Aggregator::new(&roster(&weights), &AggregationConfig::default()).unwrap();
            let a = agg.aggregate(&results).unwrap();

            let min = results.iter().map(|r| r.score).fold(f64::INFINITY, f64::min);
            let max = results.iter().map(|r| r.score).fold(f64::NEG_INFINITY, f64::max);
            prop_assert!((0.0..=1.0).contains(&a.final_score));
            prop_assert!(a.final_score >= min - 1e-9 && a.final_score <= max + 1e-9);
        }

        /// Effective weights are non-negative and sum to 1 over present judges.
        #[test]
        fn weights_renormalize_after_exclusion(
            weights in prop::collection::vec(weight(), 4),
            results in present_results(),
        ) {
            let agg = Aggregator::new(&roster(&weights), &AggregationConfig::default()).unwrap();
            let a = agg.aggregate(&results).unwrap();

            prop_assert_eq!(a.effective_weights.len(), results.len());
            prop_assert!(a.effective_weights.iter().all(|(_, w)| *w >= 0.0));
            let total: f64 = a.effective_weights.iter().map(|(_, w)| w).sum();
            prop_assert!((total - 1.0).abs() < 1e-9, "weights sum to {}", total);
        }

        /// Interval bounds are ordered and uncertainty stays in [floor, 1].
        #[test]
        fn uncertainty_stays_in_range(
            weights in prop::collection::vec(weight(), 4),
            results in present_results(),
            seed in any::<u64>(),
        ) {
            let agg = Aggregator::new(&roster(&weights), &AggregationConfig::default()).unwrap();
            let a = agg.aggregate(&results).unwrap();
            let q = UncertaintyQuantifier::new(UncertaintyConfig {
                bootstrap_samples: 100,
                seed: Some(seed),
                ..UncertaintyConfig::default()
            });
            let est = q.quantify(&results, &a.draw_weights);

            prop_assert!(est.interval.low <= est.interval.high);
            prop_assert!(est.interval.low >= 0.0 && est.interval.high <= 1.0);
            prop_assert!(est.uncertainty_score >= 0.05 - 1e-12 && est.uncertainty_score <= 1.0);
            prop_assert!(est.consensus_strength >= 0.0 && est.consensus_strength <= 1.0);
        }

        /// Consensus score is the median of sample scores.
        #[test]
        fn consensus_is_median(scores in prop::collection::vec(unit(), 1..12)) {
            let samples: Vec<JudgeResult> =
                scores.iter().map(|s| JudgeResult::new("llm", *s, 0.8)).collect();
            let c = ConsensusResult::from_samples(&samples, ExplanationSelection::MostFrequent).unwrap();
            prop_assert_eq!(c.score, stats::median(&scores));
        }

        /// A single outlier cannot move the median of three agreeing samples.
        #[test]
        fn median_ignores_single_outlier(base in unit(), outlier in unit()) {
            let samples = [
                JudgeResult::new("llm", base, 0.8),
                JudgeResult::new("llm", outlier, 0.8),
                JudgeResult::new("llm", base, 0.8),
            ];
            let c = ConsensusResult::from_samples(&samples, ExplanationSelection::MostFrequent).unwrap();
            prop_assert_eq!(c.score, base);
        }

        /// Intervals are always ordered and clamped.
        #[test]
        fn interval_is_ordered(low in -2.0f64..2.0, high in -2.0f64..2.0) {
            let ci = ConfidenceInterval::new(low, high, 0.95);
            prop_assert!(ci.low <= ci.high);
            prop_assert!(ci.low >= 0.0 && ci.high <= 1.0);
        }

        /// Uncertainty at or below the threshold never escalates to review.
        #[test]
        fn review_only_strictly_above_threshold(
            score in unit(),
            uncertainty in unit(),
            consensus in unit(),
        ) {
            let policy = DecisionPolicy::new(PolicyConfig::default());
            let d = policy.decide(score, uncertainty, consensus);
            prop_assert_eq!(d.needs_review, uncertainty > 0.3 + 1e-12);
            prop_assert_eq!(d.action == RecommendedAction::HumanReview, d.needs_review);
        }
    }
}
