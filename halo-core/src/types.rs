//! Core types for ensemble evaluation.
//!
//! A request flows through the engine as an immutable [`EvaluationRequest`].
//! Every judge answers with a [`JudgeResult`], and the engine folds the
//! surviving results into one [`EnsembleResult`].

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use crate::error::{Error, Result};

/// Clamp a value into `[0, 1]`, mapping NaN to `fallback`.
pub(crate) fn unit_interval(value: f64, fallback: f64) -> f64 {
    if value.is_nan() {
        fallback
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// One agent output to be scored, with optional reference material.
///
/// Requests are immutable once built; the engine only ever borrows them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationRequest {
    agent_output: String,
    ground_truth: Option<String>,
    conversation_history: Vec<String>,
}

impl EvaluationRequest {
    /// Create a request for an agent output.
    pub fn new(agent_output: impl Into<String>) -> Self {
        Self {
            agent_output: agent_output.into(),
            ground_truth: None,
            conversation_history: Vec::new(),
        }
    }

    /// Attach ground truth.
    pub fn with_ground_truth(mut self, ground_truth: impl Into<String>) -> Self {
        self.ground_truth = Some(ground_truth.into());
        self
    }

    /// Attach prior conversation turns, oldest first.
    pub fn with_history<I, S>(mut self, history: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.conversation_history = history.into_iter().map(Into::into).collect();
        self
    }

    pub fn agent_output(&self) -> &str {
        &self.agent_output
    }

    pub fn ground_truth(&self) -> Option<&str> {
        self.ground_truth.as_deref()
    }

    pub fn conversation_history(&self) -> &[String] {
        &self.conversation_history
    }

    /// Word count of the agent output.
    pub fn word_count(&self) -> usize {
        self.agent_output.split_whitespace().count()
    }

    /// Reject requests no judge can score.
    pub fn validate(&self) -> Result<()> {
        if self.agent_output.trim().is_empty() {
            return Err(Error::invalid_request("agent_output must not be empty"));
        }
        Ok(())
    }
}

/// Result of a single judge invocation.
///
/// `score` is normalized to accuracy polarity: 1.0 means the judge believes
/// the output is accurate, 0.0 means it believes the output is hallucinated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeResult {
    /// Identifier of the judge that produced this result
    pub judge: String,
    /// Accuracy score in [0, 1]
    pub score: f64,
    /// Judge's confidence in its own score, in [0, 1]
    pub confidence: f64,
    /// Free-form explanation
    pub explanation: String,
    /// Verbatim substrings the judge considers suspect
    pub flagged_segments: BTreeSet<String>,
    /// Wall-clock time spent by the judge
    pub processing_time_ms: f64,
    /// Judge-specific extras
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl JudgeResult {
    /// Create a result; score and confidence are clamped into [0, 1].
    pub fn new(judge: impl Into<String>, score: f64, confidence: f64) -> Self {
        Self {
            judge: judge.into(),
            score: unit_interval(score, 0.5),
            confidence: unit_interval(confidence, 0.0),
            explanation: String::new(),
            flagged_segments: BTreeSet::new(),
            processing_time_ms: 0.0,
            metadata: HashMap::new(),
        }
    }

    pub fn with_explanation(mut self, explanation: impl Into<String>) -> Self {
        self.explanation = explanation.into();
        self
    }

    pub fn with_flagged_segments<I, S>(mut self, segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.flagged_segments = segments
            .into_iter()
            .map(Into::into)
            .filter(|s: &String| !s.trim().is_empty())
            .collect();
        self
    }

    pub fn with_processing_time_ms(mut self, ms: f64) -> Self {
        self.processing_time_ms = ms.max(0.0);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Get a metadata value.
    pub fn get_metadata(&self, key: &str) -> Option<&serde_json::Value> {
        self.metadata.get(key)
    }

    /// Hallucination risk implied by this result.
    pub fn risk(&self) -> f64 {
        1.0 - self.score
    }
}

/// Two-sided confidence interval on the ensemble score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceInterval {
    pub low: f64,
    pub high: f64,
    /// Nominal coverage, e.g. 0.95
    pub level: f64,
}

impl ConfidenceInterval {
    /// Build an interval, clamping both bounds into [0, 1] and ordering them.
    pub fn new(low: f64, high: f64, level: f64) -> Self {
        let low = unit_interval(low, 0.0);
        let high = unit_interval(high, 1.0);
        let (low, high) = if low <= high { (low, high) } else { (high, low) };
        Self { low, high, level }
    }

    pub fn width(&self) -> f64 {
        self.high - self.low
    }

    pub fn contains(&self, value: f64) -> bool {
        (self.low..=self.high).contains(&value)
    }
}

/// Action recommended to downstream consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    /// Output looks accurate
    Accept,
    /// Moderate risk; surface for review
    FlagForReview,
    /// High risk; do not ship the output
    RejectHighRisk,
    /// Judges are too uncertain to decide automatically
    HumanReview,
}

impl std::fmt::Display for RecommendedAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Accept => write!(f, "accept"),
            Self::FlagForReview => write!(f, "flag_for_review"),
            Self::RejectHighRisk => write!(f, "reject_high_risk"),
            Self::HumanReview => write!(f, "human_review"),
        }
    }
}

/// How the aggregator weighted the judges for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightingMode {
    /// Static weights renormalized over present judges, scaled by confidence
    ConfidenceWeighted,
    /// Primary LLM judge confidently answered with no auxiliary judges deployed
    ConfidentPrimary,
}

impl std::fmt::Display for WeightingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConfidenceWeighted => write!(f, "confidence_weighted"),
            Self::ConfidentPrimary => write!(f, "confident_primary"),
        }
    }
}

/// Why a judge did not contribute to an ensemble result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ExclusionReason {
    /// The router did not select the judge for this request
    NotRouted,
    /// The judge exceeded its own timeout
    TimedOut,
    /// The overall request deadline cancelled the judge
    Cancelled,
    /// The judge reported an error
    Failed(String),
}

impl std::fmt::Display for ExclusionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotRouted => write!(f, "not_routed"),
            Self::TimedOut => write!(f, "timed_out"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Failed(msg) => write!(f, "failed: {}", msg),
        }
    }
}

/// A judge left out of the ensemble, recorded for auditability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExcludedJudge {
    pub judge: String,
    pub reason: ExclusionReason,
}

impl ExcludedJudge {
    pub fn new(judge: impl Into<String>, reason: ExclusionReason) -> Self {
        Self {
            judge: judge.into(),
            reason,
        }
    }

    /// Whether the judge was selected but failed to deliver.
    pub fn is_failure(&self) -> bool {
        !matches!(self.reason, ExclusionReason::NotRouted)
    }
}

/// Final ensemble verdict for one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleResult {
    /// Aggregated accuracy score in [0, 1]
    pub final_score: f64,
    /// Bootstrap interval around the aggregated score
    pub confidence_interval: ConfidenceInterval,
    /// 1 - stdev of per-judge scores
    pub consensus_strength: f64,
    /// Scalar uncertainty derived from interval width
    pub uncertainty_score: f64,
    /// Recommended action for downstream consumers
    pub recommended_action: RecommendedAction,
    /// Whether uncertainty exceeded the review threshold
    pub needs_review: bool,
    /// Weighting mode used by the aggregator
    pub weighting_mode: WeightingMode,
    /// Normalized weight applied to each contributing judge
    pub effective_weights: Vec<(String, f64)>,
    /// One result per judge that responded
    pub judge_results: Vec<JudgeResult>,
    /// Judges that were routed out or failed
    pub excluded_judges: Vec<ExcludedJudge>,
}

impl EnsembleResult {
    /// Hallucination risk, the externally reported metric.
    pub fn hallucination_risk(&self) -> f64 {
        1.0 - self.final_score
    }

    /// Effective weight of a judge, if it contributed.
    pub fn weight_of(&self, judge: &str) -> Option<f64> {
        self.effective_weights
            .iter()
            .find(|(id, _)| id == judge)
            .map(|(_, w)| *w)
    }

    /// Result of a judge, if it contributed.
    pub fn result_of(&self, judge: &str) -> Option<&JudgeResult> {
        self.judge_results.iter().find(|r| r.judge == judge)
    }

    /// Union of flagged segments across all contributing judges.
    pub fn flagged_segments(&self) -> BTreeSet<String> {
        self.judge_results
            .iter()
            .flat_map(|r| r.flagged_segments.iter().cloned())
            .collect()
    }
}
