//! Generic model judge for multi-model deployments.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;

use crate::error::{Error, Result};
use crate::types::{EvaluationRequest, JudgeResult};

use super::{Judge, JudgeCapabilities, JudgeDescriptor, JudgeRole, ScorePolarity, Specialty};

/// Raw output of an external scorer, in the scorer's own polarity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExternalScore {
    pub score: f64,
    /// Self-reported confidence; derived from the score's distance to 0.5
    /// when absent
    pub confidence: Option<f64>,
    pub explanation: Option<String>,
    pub flagged_segments: Vec<String>,
}

impl ExternalScore {
    pub fn new(score: f64) -> Self {
        Self {
            score,
            ..Self::default()
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }
}

/// Any additional scorer, e.g. a classifier served in-process or remotely.
#[async_trait]
pub trait ExternalScorer: Send + Sync {
    async fn score(&self, request: &EvaluationRequest) -> Result<ExternalScore>;
}

/// Adapts an [`ExternalScorer`] to the [`Judge`] contract.
pub struct ModelJudge {
    descriptor: JudgeDescriptor,
    scorer: Arc<dyn ExternalScorer>,
}

impl ModelJudge {
    /// A general specialist; override role and polarity with the builders.
    pub fn new(id: impl Into<String>, scorer: Arc<dyn ExternalScorer>) -> Self {
        Self {
            descriptor: JudgeDescriptor::new(id, JudgeRole::Specialist(Specialty::General))
                .with_capabilities(JudgeCapabilities {
                    network: true,
                    ..JudgeCapabilities::default()
                }),
            scorer,
        }
    }

    pub fn with_role(mut self, role: JudgeRole) -> Self {
        self.descriptor.role = role;
        self
    }

    pub fn with_polarity(mut self, polarity: ScorePolarity) -> Self {
        self.descriptor.polarity = polarity;
        self
    }

    /// Mark the scorer as stochastic so the engine samples it.
    pub fn stochastic(mut self) -> Self {
        self.descriptor.capabilities.stochastic = true;
        self
    }
}

#[async_trait]
impl Judge for ModelJudge {
    fn descriptor(&self) -> &JudgeDescriptor {
        &self.descriptor
    }

    async fn evaluate(&self, request: &EvaluationRequest) -> Result<JudgeResult> {
        let start = Instant::now();
        let id = &self.descriptor.id;

        let raw = self.scorer.score(request).await.map_err(|e| {
            if e.is_judge_failure() {
                e
            } else {
                Error::judge_backend(id, e.to_string())
            }
        })?;

        if !raw.score.is_finite() {
            return Err(Error::judge_backend(id, "scorer returned a non-finite score"));
        }
        let confidence = raw
            .confidence
            .unwrap_or_else(|| 0.5 + (raw.score.clamp(0.0, 1.0) - 0.5).abs());

        Ok(JudgeResult::new(id, raw.score, confidence)
            .with_explanation(raw.explanation.unwrap_or_default())
            .with_flagged_segments(raw.flagged_segments)
            .with_processing_time_ms(start.elapsed().as_secs_f64() * 1000.0))
    }
}
