//! Statistical/attention judge.
//!
//! Scores an output from intrinsic properties of its tokens without any
//! network call. A [`ScoringModel`] supplies per-token probabilities,
//! entropies and an optional attention profile; the judge folds them into
//! four components with fixed weights:
//!
//! | component | weight |
//! |-----------|--------|
//! | entropy-based confidence | 0.4 |
//! | first/average token confidence | 0.3 |
//! | attention score | 0.2 |
//! | context overlap with ground truth | 0.1 |
//!
//! The judge is always available: model errors, panics, overruns and
//! degenerate input yield a neutral result instead of an error. The model
//! runs on tokio's blocking pool so the engine's timeouts stay effective.

use async_trait::async_trait;
use regex::Regex;
use std::collections::HashSet;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::{Error, Result};
use crate::stats;
use crate::types::{EvaluationRequest, JudgeResult};

use super::{Judge, JudgeCapabilities, JudgeDescriptor, JudgeRole, ScorePolarity};

/// Attention mass distribution over the generated tokens.
#[derive(Debug, Clone, PartialEq)]
pub struct AttentionProfile {
    /// Attention weight per generated token (non-negative, any scale)
    pub weights: Vec<f64>,
    /// Share of attention spent on the context
    pub context_mass: f64,
    /// Share of attention spent on previously generated tokens
    pub generated_mass: f64,
}

impl AttentionProfile {
    /// Context-vs-generated ratio in [0, 1]; 0.5 when both masses are zero.
    pub fn context_ratio(&self) -> f64 {
        let total = self.context_mass.max(0.0) + self.generated_mass.max(0.0);
        if total <= 0.0 {
            0.5
        } else {
            (self.context_mass.max(0.0) / total).clamp(0.0, 1.0)
        }
    }
}

/// Per-token output of a scoring model.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenScores {
    /// Surface form of each token as it appears in the output
    pub tokens: Vec<String>,
    /// Model probability of each token
    pub token_probs: Vec<f64>,
    /// Entropy of each token's predictive distribution, in bits
    pub token_entropies: Vec<f64>,
    pub attention: Option<AttentionProfile>,
    /// Tokens the model considers unsupported by the context
    pub unsupported: Vec<String>,
}

/// Local model backing the statistical judge.
///
/// Implementations must be read-only over their backing model. Scoring may
/// block; it is called from a blocking-pool thread.
pub trait ScoringModel: Send + Sync {
    /// Name reported in judge metadata.
    fn name(&self) -> &str;

    /// Score the tokens of the request's agent output.
    fn score(&self, request: &EvaluationRequest) -> Result<TokenScores>;
}

fn word_token() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[\p{L}\p{N}']+").expect("valid token regex"))
}

const STOPWORDS: &[&str] = &[
    "a", "an", "the", "is", "are", "was", "were", "be", "been", "in", "on", "at", "of", "to",
    "for", "and", "or", "but", "it", "its", "this", "that", "with", "as", "by", "from", "has",
    "have", "had", "not", "no", "do", "does", "did", "so", "if", "then", "than", "there",
];

fn is_stopword(word: &str) -> bool {
    STOPWORDS.contains(&word)
}

fn vocabulary<'a>(texts: impl IntoIterator<Item = &'a str>) -> HashSet<String> {
    texts
        .into_iter()
        .flat_map(|t| word_token().find_iter(t).map(|m| m.as_str().to_lowercase()))
        .collect()
}

/// Lexical stand-in for a language model.
///
/// Tokens found in the ground truth or conversation history are treated as
/// highly probable, stopwords as moderately probable and novel content words
/// as improbable. Attention concentrates on improbable tokens, and the
/// context mass is the grounded share of content tokens.
#[derive(Debug, Clone)]
pub struct LexicalScoringModel {
    grounded_prob: f64,
    stopword_prob: f64,
    novel_prob: f64,
    unconditioned_prob: f64,
}

impl Default for LexicalScoringModel {
    fn default() -> Self {
        Self {
            grounded_prob: 0.85,
            stopword_prob: 0.7,
            novel_prob: 0.35,
            unconditioned_prob: 0.55,
        }
    }
}

impl LexicalScoringModel {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ScoringModel for LexicalScoringModel {
    fn name(&self) -> &str {
        "lexical"
    }

    fn score(&self, request: &EvaluationRequest) -> Result<TokenScores> {
        let context = vocabulary(
            request
                .ground_truth()
                .into_iter()
                .chain(request.conversation_history().iter().map(String::as_str)),
        );
        let has_context = !context.is_empty();

        let mut tokens = Vec::new();
        let mut probs = Vec::new();
        let mut unsupported = Vec::new();
        let mut content = 0usize;
        let mut grounded = 0usize;

        for m in word_token().find_iter(request.agent_output()) {
            let surface = m.as_str();
            let lower = surface.to_lowercase();
            let p = if context.contains(&lower) {
                if !is_stopword(&lower) {
                    content += 1;
                    grounded += 1;
                }
                self.grounded_prob
            } else if is_stopword(&lower) {
                self.stopword_prob
            } else {
                content += 1;
                if has_context {
                    unsupported.push(surface.to_string());
                    self.novel_prob
                } else {
                    self.unconditioned_prob
                }
            };
            tokens.push(surface.to_string());
            probs.push(p);
        }

        let entropies = probs.iter().map(|p| stats::binary_entropy_bits(*p)).collect();
        let context_mass = if has_context && content > 0 {
            grounded as f64 / content as f64
        } else {
            0.5
        };
        let attention = AttentionProfile {
            weights: probs.iter().map(|p| 1.0 - p).collect(),
            context_mass,
            generated_mass: 1.0 - context_mass,
        };

        Ok(TokenScores {
            tokens,
            token_probs: probs,
            token_entropies: entropies,
            attention: Some(attention),
            unsupported,
        })
    }
}

/// Component weights of the statistical judge.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatisticalWeights {
    pub entropy: f64,
    pub token: f64,
    pub attention: f64,
    pub overlap: f64,
}

impl Default for StatisticalWeights {
    fn default() -> Self {
        Self {
            entropy: 0.4,
            token: 0.3,
            attention: 0.2,
            overlap: 0.1,
        }
    }
}

/// Component scores computed from one [`TokenScores`].
#[derive(Debug, Clone, Copy, PartialEq)]
struct Components {
    entropy: f64,
    token: f64,
    attention: f64,
    overlap: f64,
}

impl Components {
    fn as_array(&self) -> [f64; 4] {
        [self.entropy, self.token, self.attention, self.overlap]
    }

    fn combine(&self, w: &StatisticalWeights) -> f64 {
        self.entropy * w.entropy
            + self.token * w.token
            + self.attention * w.attention
            + self.overlap * w.overlap
    }
}

/// Inverted attention entropy (40%), context ratio (40%) and inverted
/// attention dispersion (20%).
fn attention_score(profile: &AttentionProfile) -> f64 {
    let inv_entropy = 1.0 - stats::normalized_entropy(&profile.weights);
    let inv_dispersion = 1.0 - stats::normalized_dispersion(&profile.weights);
    (0.4 * inv_entropy + 0.4 * profile.context_ratio() + 0.2 * inv_dispersion).clamp(0.0, 1.0)
}

/// Share of the output's content words that occur in the ground truth;
/// neutral 1.0 without ground truth.
fn context_overlap(request: &EvaluationRequest) -> f64 {
    let Some(truth) = request.ground_truth() else {
        return 1.0;
    };
    let truth_words = vocabulary([truth]);
    let content: Vec<String> = word_token()
        .find_iter(request.agent_output())
        .map(|m| m.as_str().to_lowercase())
        .filter(|w| !is_stopword(w))
        .collect();
    if content.is_empty() {
        return 1.0;
    }
    content.iter().filter(|w| truth_words.contains(*w)).count() as f64 / content.len() as f64
}

/// Default bound on one scoring-model call.
pub const DEFAULT_MODEL_TIMEOUT: Duration = Duration::from_secs(2);

/// Judge backed by a local [`ScoringModel`].
pub struct StatisticalJudge {
    descriptor: JudgeDescriptor,
    model: Arc<dyn ScoringModel>,
    weights: StatisticalWeights,
    min_tokens: usize,
    model_timeout: Duration,
}

impl StatisticalJudge {
    pub fn new(id: impl Into<String>, model: Arc<dyn ScoringModel>) -> Self {
        Self {
            descriptor: JudgeDescriptor::new(id, JudgeRole::Statistical)
                .with_polarity(ScorePolarity::Accuracy)
                .with_capabilities(JudgeCapabilities {
                    stochastic: false,
                    always_available: true,
                    network: false,
                }),
            model,
            weights: StatisticalWeights::default(),
            min_tokens: 3,
            model_timeout: DEFAULT_MODEL_TIMEOUT,
        }
    }

    /// Judge backed by [`LexicalScoringModel`].
    pub fn lexical(id: impl Into<String>) -> Self {
        Self::new(id, Arc::new(LexicalScoringModel::new()))
    }

    /// Outputs with fewer tokens are treated as degenerate.
    pub fn with_min_tokens(mut self, min_tokens: usize) -> Self {
        self.min_tokens = min_tokens.max(1);
        self
    }

    /// Model calls running longer than this yield a neutral result.
    ///
    /// Keep it below the engine's per-judge timeout for the judge to stay
    /// present when the model stalls.
    pub fn with_model_timeout(mut self, timeout: Duration) -> Self {
        self.model_timeout = timeout;
        self
    }

    /// Run the model off the async workers.
    async fn run_model(&self, request: &EvaluationRequest) -> std::result::Result<TokenScores, String> {
        let model = Arc::clone(&self.model);
        let owned = request.clone();
        let task = tokio::task::spawn_blocking(move || model.score(&owned));

        match tokio::time::timeout(self.model_timeout, task).await {
            Ok(Ok(Ok(scores))) => Ok(scores),
            Ok(Ok(Err(e))) => Err(e.to_string()),
            Ok(Err(e)) if e.is_panic() => Err("scoring model panicked".to_string()),
            Ok(Err(e)) => Err(format!("scoring model task failed: {}", e)),
            Err(_) => Err(format!(
                "scoring model exceeded {}ms",
                self.model_timeout.as_millis()
            )),
        }
    }

    fn components(&self, request: &EvaluationRequest, scores: &TokenScores) -> Result<Components> {
        let n = scores.token_probs.len();
        if n < self.min_tokens {
            return Err(Error::Internal(format!(
                "only {} tokens, need at least {}",
                n, self.min_tokens
            )));
        }
        if scores.token_entropies.len() != n {
            return Err(Error::Internal(
                "token probabilities and entropies differ in length".to_string(),
            ));
        }
        let finite = scores
            .token_probs
            .iter()
            .chain(scores.token_entropies.iter())
            .all(|v| v.is_finite());
        if !finite {
            return Err(Error::Internal("non-finite token statistics".to_string()));
        }

        let probs: Vec<f64> = scores.token_probs.iter().map(|p| p.clamp(0.0, 1.0)).collect();
        // Binary entropy is at most one bit.
        let entropies: Vec<f64> = scores
            .token_entropies
            .iter()
            .map(|h| h.clamp(0.0, 1.0))
            .collect();

        Ok(Components {
            entropy: 1.0 - stats::mean(&entropies),
            token: 0.5 * probs[0] + 0.5 * stats::mean(&probs),
            attention: scores.attention.as_ref().map(attention_score).unwrap_or(0.5),
            overlap: context_overlap(request),
        })
    }

    fn degenerate(&self, reason: &str, elapsed_ms: f64) -> JudgeResult {
        debug!(judge = %self.descriptor.id, reason, "statistical judge degenerate input");
        JudgeResult::new(&self.descriptor.id, 0.5, 0.1)
            .with_explanation(format!("Neutral score: {}", reason))
            .with_processing_time_ms(elapsed_ms)
            .with_metadata("degenerate", true)
            .with_metadata("interval", serde_json::json!([0.0, 1.0]))
            .with_metadata("scoring_model", self.model.name())
    }
}

#[async_trait]
impl Judge for StatisticalJudge {
    fn descriptor(&self) -> &JudgeDescriptor {
        &self.descriptor
    }

    async fn evaluate(&self, request: &EvaluationRequest) -> Result<JudgeResult> {
        let start = Instant::now();
        let elapsed = |s: Instant| s.elapsed().as_secs_f64() * 1000.0;

        let scores = match self.run_model(request).await {
            Ok(scores) => scores,
            Err(reason) => return Ok(self.degenerate(&reason, elapsed(start))),
        };
        let components = match self.components(request, &scores) {
            Ok(c) => c,
            Err(e) => return Ok(self.degenerate(&e.to_string(), elapsed(start))),
        };

        let score = components.combine(&self.weights);
        let confidence = (1.0 - 2.0 * stats::std_dev(&components.as_array())).clamp(0.2, 0.9);

        let explanation = format!(
            "entropy {:.2}, token {:.2}, attention {:.2}, overlap {:.2}",
            components.entropy, components.token, components.attention, components.overlap
        );

        Ok(JudgeResult::new(&self.descriptor.id, score, confidence)
            .with_explanation(explanation)
            .with_flagged_segments(scores.unsupported)
            .with_processing_time_ms(elapsed(start))
            .with_metadata("entropy_confidence", components.entropy)
            .with_metadata("token_confidence", components.token)
            .with_metadata("attention_score", components.attention)
            .with_metadata("context_overlap", components.overlap)
            .with_metadata("token_count", scores.token_probs.len())
            .with_metadata("scoring_model", self.model.name()))
    }
}
