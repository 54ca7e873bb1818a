//! Bootstrap uncertainty quantification.
//!
//! The per-judge `(score, weight)` pairs are resampled with replacement B
//! times. Each draw is aggregated with the same weights the aggregator used,
//! and the empirical `alpha/2` and `1 - alpha/2` percentiles of the draws
//! form the confidence interval. Fewer judges give a coarser bootstrap
//! distribution and therefore a wider interval.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::config::UncertaintyConfig;
use crate::stats;
use crate::types::{ConfidenceInterval, JudgeResult};

/// Interval, scalar uncertainty and inter-judge agreement for one request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UncertaintyEstimate {
    pub interval: ConfidenceInterval,
    /// `max(width / 2, floor)`, clamped into [0, 1]
    pub uncertainty_score: f64,
    /// `1 - stdev` of raw per-judge scores
    pub consensus_strength: f64,
    /// Number of bootstrap draws; 0 when the interval came from a single judge
    pub draws: usize,
}

/// Computes [`UncertaintyEstimate`]s.
#[derive(Debug, Clone)]
pub struct UncertaintyQuantifier {
    config: UncertaintyConfig,
}

impl UncertaintyQuantifier {
    pub fn new(config: UncertaintyConfig) -> Self {
        Self { config }
    }

    /// Quantify with the configured seed, or fresh entropy when unset.
    pub fn quantify(&self, results: &[JudgeResult], weights: &[f64]) -> UncertaintyEstimate {
        let mut rng = match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        self.quantify_with_rng(results, weights, &mut rng)
    }

    /// Quantify using the given RNG.
    ///
    /// `weights` are the unnormalized per-judge weights from aggregation,
    /// aligned with `results`.
    pub fn quantify_with_rng<R: Rng>(
        &self,
        results: &[JudgeResult],
        weights: &[f64],
        rng: &mut R,
    ) -> UncertaintyEstimate {
        let level = self.config.confidence_level;
        let floor = self.config.uncertainty_floor;
        let scores: Vec<f64> = results.iter().map(|r| r.score).collect();

        let (interval, half_width, draws) = match results {
            [] => (ConfidenceInterval::new(0.0, 1.0, level), 0.5, 0),
            // One judge: the bootstrap collapses to a point, so use the
            // judge's self-reported spread instead.
            [only] => {
                let half_width = (1.0 - only.confidence) / 2.0;
                (
                    ConfidenceInterval::new(only.score - half_width, only.score + half_width, level),
                    half_width,
                    0,
                )
            }
            _ => {
                let b = self.config.bootstrap_samples.max(1);
                let mut distribution = bootstrap(&scores, weights, b, rng);
                distribution.sort_by(|x, y| x.total_cmp(y));

                let alpha = 1.0 - level;
                let low = stats::percentile_sorted(&distribution, alpha / 2.0);
                let high = stats::percentile_sorted(&distribution, 1.0 - alpha / 2.0);
                let interval = ConfidenceInterval::new(low, high, level);
                (interval, interval.width() / 2.0, b)
            }
        };

        UncertaintyEstimate {
            interval,
            uncertainty_score: half_width.max(floor).clamp(0.0, 1.0),
            consensus_strength: stats::agreement(&scores),
            draws,
        }
    }
}

/// Draw `b` bootstrap replicates of the weighted mean.
fn bootstrap<R: Rng>(scores: &[f64], weights: &[f64], b: usize, rng: &mut R) -> Vec<f64> {
    let n = scores.len();
    let mut drawn = Vec::with_capacity(n);
    (0..b)
        .map(|_| {
            drawn.clear();
            drawn.extend((0..n).map(|_| rng.gen_range(0..n)));
            let pairs = drawn
                .iter()
                .map(|&i| (scores[i], weights.get(i).copied().unwrap_or(1.0).max(0.0)));
            // A draw made only of zero-weight judges falls back to a plain mean.
            stats::weighted_mean(pairs).unwrap_or_else(|| {
                drawn.iter().map(|&i| scores[i]).sum::<f64>() / n as f64
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded(b: usize) -> UncertaintyQuantifier {
        UncertaintyQuantifier::new(UncertaintyConfig {
            bootstrap_samples: b,
            seed: Some(7),
            ..UncertaintyConfig::default()
        })
    }

    #[test]
    fn test_agreeing_judges_are_certain() {
        let results = [
            JudgeResult::new("a", 0.8, 0.9),
            JudgeResult::new("b", 0.8, 0.9),
            JudgeResult::new("c", 0.8, 0.9),
        ];
        let est = seeded(500).quantify(&results, &[1.0, 1.0, 1.0]);
        assert!((est.interval.low - 0.8).abs() < 1e-12);
        assert!((est.interval.high - 0.8).abs() < 1e-12);
        assert_eq!(est.uncertainty_score, 0.05);
        assert!((est.consensus_strength - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_disagreeing_judges_are_uncertain() {
        let results = [JudgeResult::new("a", 0.0, 0.9), JudgeResult::new("b", 1.0, 0.9)];
        let est = seeded(1000).quantify(&results, &[1.0, 1.0]);
        assert_eq!(est.interval.low, 0.0);
        assert_eq!(est.interval.high, 1.0);
        assert_eq!(est.uncertainty_score, 0.5);
        assert!((est.consensus_strength - 0.5).abs() < 1e-12);
        assert_eq!(est.draws, 1000);
    }

    #[test]
    fn test_single_judge_uses_self_reported_spread() {
        let est = seeded(1000).quantify(&[JudgeResult::new("s", 0.6, 0.5)], &[1.0]);
        assert!((est.interval.low - 0.35).abs() < 1e-12);
        assert!((est.interval.high - 0.85).abs() < 1e-12);
        assert!((est.uncertainty_score - 0.25).abs() < 1e-12);
        assert_eq!(est.draws, 0);
    }

    #[test]
    fn test_fewer_judges_widen_the_interval() {
        let two = [JudgeResult::new("a", 0.4, 0.8), JudgeResult::new("b", 0.6, 0.8)];
        let one = [JudgeResult::new("a", 0.4, 0.8)];
        let q = seeded(1000);
        assert!(q.quantify(&one, &[1.0]).uncertainty_score >= 0.1 - 1e-12);
        assert!(q.quantify(&two, &[1.0, 1.0]).uncertainty_score <= 0.1 + 1e-12);
    }

    #[test]
    fn test_seed_is_reproducible() {
        let results = [
            JudgeResult::new("a", 0.2, 0.9),
            JudgeResult::new("b", 0.5, 0.6),
            JudgeResult::new("c", 0.9, 0.3),
        ];
        let w = [0.3, 0.3, 0.1];
        assert_eq!(seeded(300).quantify(&results, &w), seeded(300).quantify(&results, &w));
    }

    #[test]
    fn test_zero_weight_draws_fall_back_to_mean() {
        let mut rng = StdRng::seed_from_u64(1);
        let draws = bootstrap(&[0.2, 0.4], &[0.0, 0.0], 50, &mut rng);
        assert!(draws.iter().all(|d| (0.2..=0.4).contains(d)));
    }
}
