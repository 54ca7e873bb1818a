//! # halo-core
//!
//! Ensemble hallucination detection with uncertainty quantification.
//!
//! Several independent judges score an agent's output. Their results are
//! combined with confidence weights, a bootstrap over the per-judge scores
//! yields a confidence interval, and a decision policy maps the outcome to a
//! recommended action.
//!
//! ## Core Components
//!
//! - **Judges**: statistical, LLM (with self-consistency sampling),
//!   grounding and generic model judges behind one [`Judge`] trait
//! - **Router**: picks optional judges from cheap local signals
//! - **Aggregator / Uncertainty**: confidence-weighted mean plus bootstrap
//!   interval
//! - **Policy**: maps score and uncertainty to a [`RecommendedAction`]
//! - **Cache**: bounded FIFO of ensemble results keyed by content fingerprint
//! - **Metrics**: fire-and-forget [`EngineEvent`] stream
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use halo_core::{
//!     AnthropicClient, ClientConfig, Engine, EngineConfig, EvaluationRequest, LlmJudge,
//!     Provider, StatisticalJudge,
//! };
//!
//! let client = Arc::new(AnthropicClient::new(ClientConfig::from_env(Provider::Anthropic)?)?);
//! let engine = Engine::builder(EngineConfig::default())
//!     .with_judge(Arc::new(StatisticalJudge::lexical("statistical")), 0.3)
//!     .with_judge(Arc::new(LlmJudge::primary("llm", client)), 0.7)
//!     .build()?;
//!
//! let request = EvaluationRequest::new("The Eiffel Tower is in Berlin.")
//!     .with_ground_truth("The Eiffel Tower is in Paris.");
//! let report = engine.evaluate_report(&request).await?;
//! println!("risk {:.2}: {}", report.hallucination_risk, report.recommended_action);
//! ```

pub mod aggregate;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod judge;
pub mod llm;
pub mod metrics;
pub mod policy;
mod proptest;
pub mod report;
pub mod router;
pub mod sampler;
pub mod stats;
pub mod types;
pub mod uncertainty;

// Re-exports for convenience
pub use aggregate::{Aggregation, Aggregator};
pub use cache::{CacheStats, Fingerprint, ResultCache};
pub use config::{
    AggregationConfig, CacheConfig, ConfidentPrimaryConfig, EngineConfig, ExplanationSelection,
    PolicyConfig, RoutingConfig, SamplingConfig, UncertaintyConfig,
};
pub use engine::{Engine, EngineBuilder};
pub use error::{Error, JudgeFailure, Result};
pub use judge::{
    normalize_polarity, Claim, ClaimEvidence, ClaimExtractor, ExternalScore, ExternalScorer,
    GroundingBackend, GroundingJudge, HttpGroundingBackend, Judge, JudgeCapabilities,
    JudgeDescriptor, JudgeRole, LexicalScoringModel, LlmJudge, ModelJudge, ScorePolarity,
    ScoringModel, Specialty, StatisticalJudge,
};
pub use llm::{
    AnthropicClient, ClientConfig, CompletionRequest, CompletionResponse, LLMClient,
    OpenAIClient, Provider,
};
pub use metrics::{
    BroadcastSink, CollectingSink, EngineEvent, EngineEventType, MetricsSink, NullSink,
    TracingSink,
};
pub use policy::{Decision, DecisionPolicy};
pub use report::{HallucinationReport, JudgeSummary, ReportBuilder, RiskLevel};
pub use router::{Router, RoutingDecision, RoutingSignals};
pub use sampler::{ConsensusResult, SelfConsistentJudge};
pub use types::{
    ConfidenceInterval, EnsembleResult, EvaluationRequest, ExcludedJudge, ExclusionReason,
    JudgeResult, RecommendedAction, WeightingMode,
};
pub use uncertainty::{UncertaintyEstimate, UncertaintyQuantifier};
