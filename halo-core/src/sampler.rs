//! Self-consistency sampling.
//!
//! A stochastic judge is asked K times concurrently and the surviving
//! samples are folded into one [`ConsensusResult`]:
//! - score: median of sample scores (robust to a single outlier)
//! - confidence: mean of sample confidences
//! - explanation: most repeated explanation, first occurrence wins ties
//! - flagged segments: union across samples
//!
//! A sample that errors or outlives its own timeout is dropped; the judge
//! fails only when every sample fails.

use async_trait::async_trait;
use futures::future::join_all;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

use crate::config::{ExplanationSelection, SamplingConfig};
use crate::error::{Error, Result};
use crate::judge::{Judge, JudgeDescriptor};
use crate::stats;
use crate::types::{EvaluationRequest, JudgeResult};

/// Consensus folded from K samples of one judge.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsensusResult {
    pub score: f64,
    pub confidence: f64,
    pub explanation: String,
    pub flagged_segments: BTreeSet<String>,
    /// `1 - stdev(sample scores)`
    pub consistency_score: f64,
    pub sample_scores: Vec<f64>,
}

impl ConsensusResult {
    /// Fold samples into a consensus. Returns `None` for an empty slice.
    pub fn from_samples(samples: &[JudgeResult], selection: ExplanationSelection) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }

        let scores: Vec<f64> = samples.iter().map(|s| s.score).collect();
        let confidences: Vec<f64> = samples.iter().map(|s| s.confidence).collect();
        let explanations: Vec<&str> = samples.iter().map(|s| s.explanation.as_str()).collect();

        Some(Self {
            score: stats::median(&scores),
            confidence: stats::mean(&confidences),
            explanation: select_explanation(&explanations, selection).to_string(),
            flagged_segments: samples
                .iter()
                .flat_map(|s| s.flagged_segments.iter().cloned())
                .collect(),
            consistency_score: stats::agreement(&scores),
            sample_scores: scores,
        })
    }

    /// Convert into a judge result attributed to `judge`.
    pub fn into_judge_result(self, judge: &str, requested: usize, elapsed_ms: f64) -> JudgeResult {
        let succeeded = self.sample_scores.len();
        JudgeResult::new(judge, self.score, self.confidence)
            .with_explanation(self.explanation)
            .with_flagged_segments(self.flagged_segments)
            .with_processing_time_ms(elapsed_ms)
            .with_metadata("consistency_score", self.consistency_score)
            .with_metadata("samples_requested", requested)
            .with_metadata("samples_succeeded", succeeded)
            .with_metadata("sample_scores", self.sample_scores)
    }
}

/// Pick one explanation out of the samples.
fn select_explanation<'a>(explanations: &[&'a str], selection: ExplanationSelection) -> &'a str {
    // (explanation, count) in order of first occurrence
    let mut counts: Vec<(&str, usize)> = Vec::new();
    for e in explanations.iter().copied().filter(|e| !e.trim().is_empty()) {
        match counts.iter_mut().find(|(seen, _)| *seen == e) {
            Some((_, n)) => *n += 1,
            None => counts.push((e, 1)),
        }
    }

    let Some(max) = counts.iter().map(|(_, n)| *n).max() else {
        return "";
    };

    if max == 1 && selection == ExplanationSelection::PreferLongest {
        // max_by_key returns the last maximum; fold keeps the first.
        return counts
            .iter()
            .fold(None::<&str>, |best, (e, _)| match best {
                Some(b) if b.len() >= e.len() => Some(b),
                _ => Some(*e),
            })
            .unwrap_or("");
    }

    counts
        .iter()
        .find(|(_, n)| *n == max)
        .map(|(e, _)| *e)
        .unwrap_or("")
}

/// Decorator that runs self-consistency sampling over a stochastic judge.
pub struct SelfConsistentJudge {
    inner: Arc<dyn Judge>,
    config: SamplingConfig,
    sample_timeout: Option<Duration>,
}

impl SelfConsistentJudge {
    pub fn new(inner: Arc<dyn Judge>, config: SamplingConfig) -> Self {
        Self {
            inner,
            config,
            sample_timeout: None,
        }
    }

    /// Bound each sample individually. Samples that exceed it count as failed.
    pub fn with_sample_timeout(mut self, timeout: Duration) -> Self {
        self.sample_timeout = Some(timeout);
        self
    }

    async fn draw(&self, request: &EvaluationRequest) -> Result<JudgeResult> {
        let sample = self.inner.sample(request, self.config.temperature);
        match self.sample_timeout {
            Some(limit) => match tokio::time::timeout(limit, sample).await {
                Ok(outcome) => outcome,
                Err(_) => Err(Error::judge_timeout(
                    self.inner.id(),
                    limit.as_millis() as u64,
                )),
            },
            None => sample.await,
        }
    }

    pub fn samples(&self) -> usize {
        self.config.samples.max(1)
    }
}

#[async_trait]
impl Judge for SelfConsistentJudge {
    fn descriptor(&self) -> &JudgeDescriptor {
        self.inner.descriptor()
    }

    #[instrument(skip(self, request), fields(judge = %self.inner.id(), k = self.samples()))]
    async fn evaluate(&self, request: &EvaluationRequest) -> Result<JudgeResult> {
        let start = Instant::now();
        let k = self.samples();

        let outcomes = join_all((0..k).map(|_| self.draw(request))).await;

        let mut samples = Vec::with_capacity(k);
        let mut errors = Vec::new();
        for outcome in outcomes {
            match outcome {
                Ok(sample) => samples.push(sample),
                Err(e) => errors.push(e),
            }
        }
        if !errors.is_empty() {
            warn!(failed = errors.len(), "dropping failed samples");
        }

        let Some(consensus) = ConsensusResult::from_samples(&samples, self.config.explanation) else {
            let first = errors
                .first()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no samples".to_string());
            return Err(Error::judge_backend(
                self.inner.id(),
                format!("all {} samples failed: {}", k, first),
            ));
        };

        debug!(
            score = consensus.score,
            consistency = consensus.consistency_score,
            "consensus built"
        );
        Ok(consensus.into_judge_result(
            self.inner.id(),
            k,
            start.elapsed().as_secs_f64() * 1000.0,
        ))
    }
}
