//! Ensemble aggregation.
//!
//! Static weights are configured once for the whole roster and normalized to
//! sum to 1. For each request:
//! 1. weights of absent judges are dropped and the rest renormalized
//! 2. each weight is multiplied by the judge's own confidence
//! 3. the products are renormalized and used for a weighted mean
//!
//! When the deployment has no auxiliary judges and the primary LLM judge is
//! confident, the aggregator switches to [`WeightingMode::ConfidentPrimary`]:
//! the primary gets a fixed weight and the rest share the remainder.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::{AggregationConfig, ConfidentPrimaryConfig};
use crate::error::{Error, Result};
use crate::judge::{JudgeDescriptor, JudgeRole};
use crate::stats;
use crate::types::{JudgeResult, WeightingMode};

/// Aggregated score plus the weights that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregation {
    pub final_score: f64,
    pub mode: WeightingMode,
    /// Normalized weight per judge, aligned with the input results
    pub effective_weights: Vec<(String, f64)>,
    /// Unnormalized per-judge weights; bootstrap draws reuse them so each
    /// draw follows the same weighting rule
    pub draw_weights: Vec<f64>,
    /// Every present judge reported zero confidence, so static weights
    /// were used unscaled
    pub confidence_fallback: bool,
}

/// Weighted combiner over a fixed judge roster.
#[derive(Debug, Clone)]
pub struct Aggregator {
    /// Static weights normalized over the full roster
    static_weights: HashMap<String, f64>,
    primary: Option<String>,
    has_auxiliary: bool,
    confident_primary: Option<ConfidentPrimaryConfig>,
}

impl Aggregator {
    /// Build from `(descriptor, static weight)` pairs.
    ///
    /// Weights must be finite and non-negative with a positive sum.
    pub fn new(roster: &[(JudgeDescriptor, f64)], config: &AggregationConfig) -> Result<Self> {
        if roster.is_empty() {
            return Err(Error::Config("judge roster is empty".to_string()));
        }
        for (d, w) in roster {
            if !w.is_finite() || *w < 0.0 {
                return Err(Error::Config(format!(
                    "weight for judge {} must be finite and non-negative, got {}",
                    d.id, w
                )));
            }
        }
        let raw: Vec<f64> = roster.iter().map(|(_, w)| *w).collect();
        let normalized = stats::normalize(&raw)
            .ok_or_else(|| Error::Config("judge weights sum to zero".to_string()))?;

        Ok(Self {
            static_weights: roster
                .iter()
                .zip(normalized)
                .map(|((d, _), w)| (d.id.clone(), w))
                .collect(),
            primary: roster
                .iter()
                .find(|(d, _)| d.role == JudgeRole::PrimaryLlm)
                .map(|(d, _)| d.id.clone()),
            has_auxiliary: roster.iter().any(|(d, _)| !d.role.is_mandatory()),
            confident_primary: config.confident_primary.clone(),
        })
    }

    /// Static weight of a judge, normalized over the full roster.
    pub fn static_weight(&self, judge: &str) -> Option<f64> {
        self.static_weights.get(judge).copied()
    }

    fn present_weights(&self, results: &[JudgeResult]) -> Result<Vec<f64>> {
        let weights = results
            .iter()
            .map(|r| {
                self.static_weight(&r.judge)
                    .ok_or_else(|| Error::Internal(format!("judge {} is not in the roster", r.judge)))
            })
            .collect::<Result<Vec<f64>>>()?;
        // All present judges had zero static weight: treat them equally.
        Ok(stats::normalize(&weights).unwrap_or_else(|| vec![1.0 / results.len() as f64; results.len()]))
    }

    fn confident_primary_index(&self, results: &[JudgeResult]) -> Option<(usize, &ConfidentPrimaryConfig)> {
        let cp = self.confident_primary.as_ref()?;
        if self.has_auxiliary {
            return None;
        }
        let primary = self.primary.as_deref()?;
        let idx = results.iter().position(|r| r.judge == primary)?;
        (results[idx].confidence >= cp.threshold).then_some((idx, cp))
    }

    /// Combine surviving judge results into one score.
    pub fn aggregate(&self, results: &[JudgeResult]) -> Result<Aggregation> {
        if results.is_empty() {
            return Err(Error::Internal("nothing to aggregate".to_string()));
        }
        let base = self.present_weights(results)?;

        let (mode, draw_weights, confidence_fallback) = match self.confident_primary_index(results) {
            Some((idx, cp)) => {
                let others: f64 = base
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| *i != idx)
                    .map(|(_, w)| *w)
                    .sum();
                let weights = base
                    .iter()
                    .enumerate()
                    .map(|(i, w)| {
                        if i == idx {
                            cp.primary_weight
                        } else if others > 0.0 {
                            (1.0 - cp.primary_weight) * w / others
                        } else {
                            0.0
                        }
                    })
                    .collect();
                (WeightingMode::ConfidentPrimary, weights, false)
            }
            None => {
                let scaled: Vec<f64> = base
                    .iter()
                    .zip(results)
                    .map(|(w, r)| w * r.confidence)
                    .collect();
                if scaled.iter().sum::<f64>() > 0.0 {
                    (WeightingMode::ConfidenceWeighted, scaled, false)
                } else {
                    (WeightingMode::ConfidenceWeighted, base.clone(), true)
                }
            }
        };

        let normalized = stats::normalize(&draw_weights)
            .ok_or_else(|| Error::Internal("effective weights sum to zero".to_string()))?;
        let final_score = results
            .iter()
            .zip(&normalized)
            .map(|(r, w)| r.score * w)
            .sum::<f64>()
            .clamp(0.0, 1.0);

        Ok(Aggregation {
            final_score,
            mode,
            effective_weights: results
                .iter()
                .map(|r| r.judge.clone())
                .zip(normalized)
                .collect(),
            draw_weights,
            confidence_fallback,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::judge::Specialty;

    fn roster(with_aux: bool) -> Vec<(JudgeDescriptor, f64)> {
        let mut r = vec![
            (JudgeDescriptor::new("statistical", JudgeRole::Statistical), 0.3),
            (JudgeDescriptor::new("llm", JudgeRole::PrimaryLlm), 0.5),
        ];
        if with_aux {
            r.push((JudgeDescriptor::new("grounding", JudgeRole::Grounding), 0.2));
        }
        r
    }

    fn weight_sum(a: &Aggregation) -> f64 {
        a.effective_weights.iter().map(|(_, w)| w).sum()
    }

    #[test]
    fn test_confidence_weighting() {
        let agg = Aggregator::new(&roster(true), &AggregationConfig::default()).unwrap();
        let results = [
            JudgeResult::new("statistical", 0.6, 0.5),
            JudgeResult::new("llm", 0.2, 1.0),
            JudgeResult::new("grounding", 0.4, 0.5),
        ];
        let a = agg.aggregate(&results).unwrap();
        // raw: 0.15, 0.5, 0.1 -> total 0.75
        assert_eq!(a.mode, WeightingMode::ConfidenceWeighted);
        assert!((a.final_score - (0.6 * 0.15 + 0.2 * 0.5 + 0.4 * 0.1) / 0.75).abs() < 1e-12);
        assert!((weight_sum(&a) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_renormalizes_over_present_judges() {
        let agg = Aggregator::new(&roster(true), &AggregationConfig::default()).unwrap();
        let a = agg
            .aggregate(&[JudgeResult::new("statistical", 0.7, 0.4)])
            .unwrap();
        assert_eq!(a.effective_weights, vec![("statistical".to_string(), 1.0)]);
        assert!((a.final_score - 0.7).abs() < 1e-12);
    }

    #[test]
    fn test_zero_confidence_falls_back_to_static() {
        let agg = Aggregator::new(&roster(true), &AggregationConfig::default()).unwrap();
        let a = agg
            .aggregate(&[
                JudgeResult::new("statistical", 1.0, 0.0),
                JudgeResult::new("grounding", 0.0, 0.0),
            ])
            .unwrap();
        assert!(a.confidence_fallback);
        assert!((a.final_score - 0.6).abs() < 1e-12);
    }

    #[test]
    fn test_confident_primary_mode() {
        let agg = Aggregator::new(&roster(false), &AggregationConfig::default()).unwrap();
        let a = agg
            .aggregate(&[
                JudgeResult::new("statistical", 0.6, 0.3),
                JudgeResult::new("llm", 0.1, 0.9),
            ])
            .unwrap();
        assert_eq!(a.mode, WeightingMode::ConfidentPrimary);
        assert!((a.final_score - (0.85 * 0.1 + 0.15 * 0.6)).abs() < 1e-12);
        assert!((weight_sum(&a) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_confident_primary_requires_no_auxiliary_and_threshold() {
        let with_aux = Aggregator::new(&roster(true), &AggregationConfig::default()).unwrap();
        let results = [
            JudgeResult::new("statistical", 0.6, 0.3),
            JudgeResult::new("llm", 0.1, 0.9),
        ];
        assert_eq!(
            with_aux.aggregate(&results).unwrap().mode,
            WeightingMode::ConfidenceWeighted
        );

        let plain = Aggregator::new(&roster(false), &AggregationConfig::default()).unwrap();
        let results = [
            JudgeResult::new("statistical", 0.6, 0.3),
            JudgeResult::new("llm", 0.1, 0.69),
        ];
        assert_eq!(plain.aggregate(&results).unwrap().mode, WeightingMode::ConfidenceWeighted);

        let disabled = Aggregator::new(
            &roster(false),
            &AggregationConfig {
                confident_primary: None,
            },
        )
        .unwrap();
        let results = [JudgeResult::new("llm", 0.1, 0.95)];
        assert_eq!(
            disabled.aggregate(&results).unwrap().mode,
            WeightingMode::ConfidenceWeighted
        );
    }

    #[test]
    fn test_primary_alone_in_confident_mode() {
        let agg = Aggregator::new(&roster(false), &AggregationConfig::default()).unwrap();
        let a = agg.aggregate(&[JudgeResult::new("llm", 0.3, 0.8)]).unwrap();
        assert_eq!(a.mode, WeightingMode::ConfidentPrimary);
        assert!((a.final_score - 0.3).abs() < 1e-12);
    }

    #[test]
    fn test_invalid_rosters() {
        let config = AggregationConfig::default();
        assert!(Aggregator::new(&[], &config).is_err());
        let bad = vec![(
            JudgeDescriptor::new("x", JudgeRole::Specialist(Specialty::General)),
            -1.0,
        )];
        assert!(matches!(Aggregator::new(&bad, &config), Err(Error::Config(_))));
        let zero = vec![(JudgeDescriptor::new("x", JudgeRole::Statistical), 0.0)];
        assert!(Aggregator::new(&zero, &config).is_err());
    }

    #[test]
    fn test_unknown_judge_rejected() {
        let agg = Aggregator::new(&roster(false), &AggregationConfig::default()).unwrap();
        assert!(agg.aggregate(&[JudgeResult::new("ghost", 0.5, 0.5)]).is_err());
        assert!(agg.aggregate(&[]).is_err());
    }
}
