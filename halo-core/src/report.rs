//! Externally visible hallucination report.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::config::PolicyConfig;
use crate::error::Result;
use crate::types::{
    ConfidenceInterval, EnsembleResult, ExcludedJudge, RecommendedAction, WeightingMode,
};

/// Coarse risk band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

/// Per-judge line in a report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeSummary {
    pub judge: String,
    /// Accuracy score
    pub score: f64,
    pub confidence: f64,
    /// Normalized weight the judge received
    pub weight: f64,
    pub explanation: String,
    pub flagged_segments: BTreeSet<String>,
    pub processing_time_ms: f64,
}

/// Final report for one evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HallucinationReport {
    pub evaluation_id: Uuid,
    /// `1 - final_score`
    pub hallucination_risk: f64,
    pub risk_level: RiskLevel,
    pub final_score: f64,
    pub confidence_interval: ConfidenceInterval,
    pub uncertainty_score: f64,
    pub consensus_strength: f64,
    pub recommended_action: RecommendedAction,
    pub needs_review: bool,
    pub weighting_mode: WeightingMode,
    pub judges: Vec<JudgeSummary>,
    pub excluded_judges: Vec<ExcludedJudge>,
    pub flagged_segments: BTreeSet<String>,
    /// Served from the result cache
    pub cached: bool,
    pub latency_ms: f64,
    pub timestamp: DateTime<Utc>,
}

impl HallucinationReport {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Whether any judge failed or timed out.
    pub fn is_degraded(&self) -> bool {
        self.excluded_judges.iter().any(ExcludedJudge::is_failure)
    }
}

/// Builds [`HallucinationReport`]s from ensemble results.
#[derive(Debug, Clone)]
pub struct ReportBuilder {
    high_risk: f64,
    medium_risk: f64,
}

impl ReportBuilder {
    /// Risk bands follow the decision policy thresholds.
    pub fn new(policy: &PolicyConfig) -> Self {
        Self {
            high_risk: policy.reject_risk,
            medium_risk: policy.flag_risk,
        }
    }

    pub fn risk_level(&self, risk: f64) -> RiskLevel {
        if risk > self.high_risk {
            RiskLevel::High
        } else if risk > self.medium_risk {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }

    pub fn build(&self, result: &EnsembleResult, cached: bool, latency_ms: f64) -> HallucinationReport {
        let risk = result.hallucination_risk();
        let judges = result
            .judge_results
            .iter()
            .map(|r| JudgeSummary {
                judge: r.judge.clone(),
                score: r.score,
                confidence: r.confidence,
                weight: result.weight_of(&r.judge).unwrap_or(0.0),
                explanation: r.explanation.clone(),
                flagged_segments: r.flagged_segments.clone(),
                processing_time_ms: r.processing_time_ms,
            })
            .collect();

        HallucinationReport {
            evaluation_id: Uuid::new_v4(),
            hallucination_risk: risk,
            risk_level: self.risk_level(risk),
            final_score: result.final_score,
            confidence_interval: result.confidence_interval,
            uncertainty_score: result.uncertainty_score,
            consensus_strength: result.consensus_strength,
            recommended_action: result.recommended_action,
            needs_review: result.needs_review,
            weighting_mode: result.weighting_mode,
            judges,
            excluded_judges: result.excluded_judges.clone(),
            flagged_segments: result.flagged_segments(),
            cached,
            latency_ms: latency_ms.max(0.0),
            timestamp: Utc::now(),
        }
    }
}

impl Default for ReportBuilder {
    fn default() -> Self {
        Self::new(&PolicyConfig::default())
    }
}
