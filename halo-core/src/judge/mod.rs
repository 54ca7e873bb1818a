//! Judge capability contract and concrete judges.
//!
//! Every scorer the engine can consult implements [`Judge`]. The engine never
//! special-cases a concrete judge type; it only reads the declared
//! [`JudgeDescriptor`] (role, score polarity, capabilities).
//!
//! Concrete judges:
//! - [`StatisticalJudge`]: local entropy/attention metrics, never fails
//! - [`LlmJudge`]: prompts an external LLM for a JSON verdict
//! - [`GroundingJudge`]: checks extracted claims against a knowledge source
//! - [`ModelJudge`]: adapts any [`ExternalScorer`]

pub mod claims;
mod grounding;
mod llm;
mod model;
mod statistical;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{unit_interval, EvaluationRequest, JudgeResult};

pub use claims::{Claim, ClaimExtractor};
pub use grounding::{
    ClaimEvidence, GroundingBackend, GroundingJudge, HttpGroundingBackend,
};
pub use llm::{parse_verdict, LlmJudge, LlmVerdict};
pub use model::{ExternalScore, ExternalScorer, ModelJudge};
pub use statistical::{
    AttentionProfile, LexicalScoringModel, ScoringModel, StatisticalJudge, StatisticalWeights,
    TokenScores,
};

/// Direction of a judge's raw score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScorePolarity {
    /// 1.0 means accurate
    Accuracy,
    /// 1.0 means hallucinated
    Risk,
}

/// Domain a specialist judge focuses on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Specialty {
    /// Technical jargon, code, APIs
    Technical,
    /// Multi-step causal or hedged reasoning
    Reasoning,
    /// General-purpose second opinion
    General,
}

impl std::fmt::Display for Specialty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Technical => write!(f, "technical"),
            Self::Reasoning => write!(f, "reasoning"),
            Self::General => write!(f, "general"),
        }
    }
}

/// Role a judge plays in the ensemble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JudgeRole {
    /// Mandatory always-available baseline
    Statistical,
    /// Mandatory LLM judge
    PrimaryLlm,
    /// Optional claim-level fact checking
    Grounding,
    /// Optional specialist selected by the router
    Specialist(Specialty),
}

impl JudgeRole {
    /// Whether the router must always include this judge.
    pub fn is_mandatory(&self) -> bool {
        matches!(self, Self::Statistical | Self::PrimaryLlm)
    }
}

impl std::fmt::Display for JudgeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Statistical => write!(f, "statistical"),
            Self::PrimaryLlm => write!(f, "primary_llm"),
            Self::Grounding => write!(f, "grounding"),
            Self::Specialist(s) => write!(f, "specialist:{}", s),
        }
    }
}

/// Declared capabilities, read by the engine and router.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JudgeCapabilities {
    /// Output varies between calls; wrap with self-consistency sampling
    pub stochastic: bool,
    /// Never fails; returns a neutral result on degenerate input
    pub always_available: bool,
    /// Performs outbound network calls
    pub network: bool,
}

/// Static description of a judge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JudgeDescriptor {
    /// Unique identifier within one engine
    pub id: String,
    pub role: JudgeRole,
    pub polarity: ScorePolarity,
    pub capabilities: JudgeCapabilities,
}

impl JudgeDescriptor {
    pub fn new(id: impl Into<String>, role: JudgeRole) -> Self {
        Self {
            id: id.into(),
            role,
            polarity: ScorePolarity::Accuracy,
            capabilities: JudgeCapabilities::default(),
        }
    }

    pub fn with_polarity(mut self, polarity: ScorePolarity) -> Self {
        self.polarity = polarity;
        self
    }

    pub fn with_capabilities(mut self, capabilities: JudgeCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }
}

/// A unit that independently scores one evaluation request.
///
/// Implementations return `Err` on timeout or internal failure instead of a
/// partial result, so the engine can exclude the judge and renormalize.
#[async_trait]
pub trait Judge: Send + Sync {
    /// Static description of this judge.
    fn descriptor(&self) -> &JudgeDescriptor;

    /// Score one request.
    async fn evaluate(&self, request: &EvaluationRequest) -> Result<JudgeResult>;

    /// Draw one self-consistency sample at the given temperature.
    ///
    /// Judges without a temperature knob ignore it.
    async fn sample(&self, request: &EvaluationRequest, temperature: f64) -> Result<JudgeResult> {
        let _ = temperature;
        self.evaluate(request).await
    }

    /// Identifier shorthand.
    fn id(&self) -> &str {
        &self.descriptor().id
    }
}

/// Convert a raw judge result into accuracy polarity.
///
/// Score and confidence are clamped into `[0, 1]` first; judges can write
/// the public fields directly.
pub fn normalize_polarity(mut result: JudgeResult, polarity: ScorePolarity) -> JudgeResult {
    result.score = unit_interval(result.score, 0.5);
    result.confidence = unit_interval(result.confidence, 0.0);
    if polarity == ScorePolarity::Risk {
        result.score = 1.0 - result.score;
        result
            .metadata
            .insert("polarity_flipped".to_string(), serde_json::Value::Bool(true));
    }
    result
}
