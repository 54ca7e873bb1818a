//! External-grounding judge.
//!
//! Extracts factual claims from the output and looks each one up in a
//! knowledge source. Per-claim support is the Laplace-smoothed share of
//! supporting evidence, `(s + 1) / (s + c + 2)`, so a claim with no evidence
//! either way scores a neutral 0.5.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

use crate::error::{Error, Result};
use crate::llm::build_http_client;
use crate::stats;
use crate::types::{EvaluationRequest, JudgeResult};

use super::claims::{Claim, ClaimExtractor};
use super::{Judge, JudgeCapabilities, JudgeDescriptor, JudgeRole, ScorePolarity};

/// Evidence counts returned for one claim.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClaimEvidence {
    pub supporting: u32,
    pub contradicting: u32,
    /// Backend confidence in its own lookup, in [0, 1]
    pub confidence: f64,
}

impl ClaimEvidence {
    /// Laplace-smoothed support ratio.
    pub fn support(&self) -> f64 {
        let s = self.supporting as f64;
        let c = self.contradicting as f64;
        (s + 1.0) / (s + c + 2.0)
    }

    pub fn is_contradicted(&self) -> bool {
        self.contradicting > self.supporting
    }
}

/// Fact-lookup service queried per claim.
#[async_trait]
pub trait GroundingBackend: Send + Sync {
    /// Name reported in judge metadata.
    fn name(&self) -> &str;

    /// Look up evidence for one claim.
    async fn lookup(&self, claim: &Claim) -> Result<ClaimEvidence>;
}

#[derive(Debug, Serialize)]
struct LookupRequest<'a> {
    claim: &'a str,
}

/// Grounding backend reached over HTTP.
///
/// Each claim is POSTed as `{"claim": "..."}`; the service answers with
/// `{"supporting": n, "contradicting": n, "confidence": x}`.
pub struct HttpGroundingBackend {
    endpoint: String,
    api_key: Option<String>,
    /// Judge id lookup errors are attributed to
    judge: String,
    http: reqwest::Client,
}

impl HttpGroundingBackend {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = build_http_client(timeout)
            .map_err(|e| Error::Config(format!("grounding HTTP client: {}", e)))?;
        Ok(Self {
            endpoint: endpoint.into(),
            api_key: None,
            judge: "grounding".to_string(),
            http,
        })
    }

    /// Attribute lookup errors to the owning judge.
    pub fn with_judge_id(mut self, judge: impl Into<String>) -> Self {
        self.judge = judge.into();
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }
}

#[async_trait]
impl GroundingBackend for HttpGroundingBackend {
    fn name(&self) -> &str {
        "http"
    }

    async fn lookup(&self, claim: &Claim) -> Result<ClaimEvidence> {
        let mut req = self
            .http
            .post(&self.endpoint)
            .json(&LookupRequest { claim: &claim.text });
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let response = req
            .send()
            .await
            .map_err(|e| Error::judge_backend(&self.judge, format!("lookup failed: {}", e)))?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::judge_backend(
                &self.judge,
                format!("lookup returned {}", status),
            ));
        }
        response
            .json::<ClaimEvidence>()
            .await
            .map_err(|e| Error::judge_backend(&self.judge, format!("bad lookup body: {}", e)))
    }
}

/// Judge that cross-checks extracted claims against a [`GroundingBackend`].
pub struct GroundingJudge {
    descriptor: JudgeDescriptor,
    backend: Arc<dyn GroundingBackend>,
    extractor: ClaimExtractor,
    max_concurrency: usize,
}

impl GroundingJudge {
    pub fn new(id: impl Into<String>, backend: Arc<dyn GroundingBackend>) -> Self {
        Self {
            descriptor: JudgeDescriptor::new(id, JudgeRole::Grounding)
                .with_polarity(ScorePolarity::Accuracy)
                .with_capabilities(JudgeCapabilities {
                    stochastic: false,
                    always_available: false,
                    network: true,
                }),
            backend,
            extractor: ClaimExtractor::new(),
            max_concurrency: 4,
        }
    }

    pub fn with_extractor(mut self, extractor: ClaimExtractor) -> Self {
        self.extractor = extractor;
        self
    }

    /// Maximum number of concurrent lookups.
    pub fn with_max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = n.max(1);
        self
    }
}

#[async_trait]
impl Judge for GroundingJudge {
    fn descriptor(&self) -> &JudgeDescriptor {
        &self.descriptor
    }

    #[instrument(skip(self, request), fields(judge = %self.descriptor.id))]
    async fn evaluate(&self, request: &EvaluationRequest) -> Result<JudgeResult> {
        let start = Instant::now();
        let id = &self.descriptor.id;

        let claims = self.extractor.extract(request.agent_output());
        if claims.is_empty() {
            return Err(Error::judge_backend(id, "no checkable claims"));
        }

        let lookups: Vec<(Claim, Result<ClaimEvidence>)> = stream::iter(claims.iter().cloned())
            .map(|claim| async move {
                let evidence = self.backend.lookup(&claim).await;
                (claim, evidence)
            })
            .buffered(self.max_concurrency)
            .collect()
            .await;

        let total = lookups.len();
        let mut weighted = Vec::new();
        let mut confidences = Vec::new();
        let mut contradicted = Vec::new();
        let mut first_error: Option<String> = None;
        for (claim, evidence) in lookups {
            match evidence {
                Ok(ev) => {
                    weighted.push((ev.support(), claim.specificity));
                    confidences.push(ev.confidence.clamp(0.0, 1.0));
                    if ev.is_contradicted() {
                        contradicted.push(claim.text);
                    }
                }
                Err(e) => {
                    warn!(claim = %claim.text, error = %e, "claim lookup failed");
                    first_error.get_or_insert_with(|| match e {
                        Error::JudgeBackend { message, .. } => message,
                        other => other.to_string(),
                    });
                }
            }
        }

        let checked = weighted.len();
        if checked == 0 {
            return Err(Error::judge_backend(
                id,
                format!(
                    "all {} claim lookups failed: {}",
                    total,
                    first_error.unwrap_or_default()
                ),
            ));
        }

        let score = stats::weighted_mean(weighted.iter().copied())
            .unwrap_or_else(|| stats::mean(&weighted.iter().map(|(s, _)| *s).collect::<Vec<_>>()));
        let coverage = checked as f64 / total as f64;
        let confidence = stats::mean(&confidences) * coverage;
        debug!(checked, total, contradicted = contradicted.len(), "grounding complete");

        let explanation = if contradicted.is_empty() {
            format!("{} of {} claims checked, none contradicted", checked, total)
        } else {
            format!(
                "{} of {} claims checked, {} contradicted by the knowledge source",
                checked,
                total,
                contradicted.len()
            )
        };

        Ok(JudgeResult::new(id, score, confidence)
            .with_explanation(explanation)
            .with_metadata("claims_total", total)
            .with_metadata("claims_checked", checked)
            .with_metadata("claims_contradicted", contradicted.len())
            .with_metadata("backend", self.backend.name())
            .with_flagged_segments(contradicted)
            .with_processing_time_ms(start.elapsed().as_secs_f64() * 1000.0))
    }
}
