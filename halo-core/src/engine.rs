//! Ensemble evaluation engine.
//!
//! One [`Engine`] owns its judge roster, weights, result cache and metrics
//! sink. Evaluating a request runs:
//! 1. validation (an empty output is rejected before any judge runs)
//! 2. cache lookup
//! 3. routing over the roster
//! 4. concurrent fan-out to the selected judges, each under the per-judge
//!    timeout, with the whole fan-in bounded by the request timeout
//! 5. aggregation, bootstrap uncertainty and the decision policy
//! 6. cache insert
//!
//! Individual judge failures only exclude that judge. The caller sees an
//! error only when no judge answered.

use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::aggregate::Aggregator;
use crate::cache::{CacheStats, Fingerprint, ResultCache};
use crate::config::EngineConfig;
use crate::error::{Error, JudgeFailure, Result};
use crate::judge::{normalize_polarity, Judge, JudgeDescriptor, JudgeRole};
use crate::metrics::{record_safely, EngineEvent, EngineEventType, MetricsSink, NullSink};
use crate::policy::DecisionPolicy;
use crate::report::{HallucinationReport, ReportBuilder};
use crate::router::Router;
use crate::sampler::SelfConsistentJudge;
use crate::types::{EnsembleResult, EvaluationRequest, ExcludedJudge, ExclusionReason, JudgeResult};
use crate::uncertainty::UncertaintyQuantifier;

/// Builder for [`Engine`].
pub struct EngineBuilder {
    config: EngineConfig,
    judges: Vec<(Arc<dyn Judge>, f64)>,
    metrics: Option<Arc<dyn MetricsSink>>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            judges: Vec::new(),
            metrics: None,
        }
    }

    /// Add a judge with its static weight.
    ///
    /// Weights are normalized over the whole roster at build time.
    pub fn with_judge(mut self, judge: Arc<dyn Judge>, weight: f64) -> Self {
        self.judges.push((judge, weight));
        self
    }

    pub fn with_metrics(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(sink);
        self
    }

    /// Validate the configuration and roster and build the engine.
    ///
    /// The roster needs exactly one statistical and one primary LLM judge.
    /// Stochastic judges are wrapped in self-consistency sampling when
    /// `sampling.samples > 1`.
    pub fn build(self) -> Result<Engine> {
        self.config.validate()?;

        let mut seen = HashSet::new();
        for (judge, _) in &self.judges {
            if !seen.insert(judge.id().to_string()) {
                return Err(Error::Config(format!("duplicate judge id: {}", judge.id())));
            }
        }
        for role in [JudgeRole::Statistical, JudgeRole::PrimaryLlm] {
            let count = self
                .judges
                .iter()
                .filter(|(j, _)| j.descriptor().role == role)
                .count();
            if count != 1 {
                return Err(Error::Config(format!(
                    "roster needs exactly one {} judge, found {}",
                    role, count
                )));
            }
        }

        let roster: Vec<(JudgeDescriptor, f64)> = self
            .judges
            .iter()
            .map(|(j, w)| (j.descriptor().clone(), *w))
            .collect();
        let aggregator = Aggregator::new(&roster, &self.config.aggregation)?;

        let samples = self.config.sampling.samples;
        // Leave headroom under the judge budget so surviving samples are kept.
        let sample_timeout = self.config.judge_timeout().mul_f64(0.9);
        let judges = self
            .judges
            .into_iter()
            .map(|(judge, _)| {
                if judge.descriptor().capabilities.stochastic && samples > 1 {
                    Arc::new(
                        SelfConsistentJudge::new(judge, self.config.sampling.clone())
                            .with_sample_timeout(sample_timeout),
                    ) as Arc<dyn Judge>
                } else {
                    judge
                }
            })
            .collect();

        let cache = self
            .config
            .cache
            .enabled
            .then(|| ResultCache::from_config(&self.config.cache));

        Ok(Engine {
            router: Router::new(self.config.routing.clone()),
            quantifier: UncertaintyQuantifier::new(self.config.uncertainty.clone()),
            policy: DecisionPolicy::new(self.config.policy.clone()),
            reports: ReportBuilder::new(&self.config.policy),
            roster: roster.into_iter().map(|(d, _)| d).collect(),
            judges,
            aggregator,
            cache,
            metrics: self.metrics.unwrap_or_else(|| Arc::new(NullSink)),
            config: self.config,
        })
    }
}

/// Outcome of one judge invocation inside the fan-out.
enum JudgeOutcome {
    Answered(JudgeResult),
    Failed(Error),
    TimedOut,
}

/// Ensemble hallucination detector.
pub struct Engine {
    config: EngineConfig,
    /// Judges in roster order, already wrapped for sampling
    judges: Vec<Arc<dyn Judge>>,
    roster: Vec<JudgeDescriptor>,
    router: Router,
    aggregator: Aggregator,
    quantifier: UncertaintyQuantifier,
    policy: DecisionPolicy,
    reports: ReportBuilder,
    cache: Option<ResultCache>,
    metrics: Arc<dyn MetricsSink>,
}

impl Engine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Descriptors of every judge, in roster order.
    pub fn roster(&self) -> &[JudgeDescriptor] {
        &self.roster
    }

    pub async fn cache_stats(&self) -> Option<CacheStats> {
        match &self.cache {
            Some(cache) => Some(cache.stats().await),
            None => None,
        }
    }

    pub async fn clear_cache(&self) {
        if let Some(cache) = &self.cache {
            cache.clear().await;
        }
    }

    fn emit(&self, event: EngineEvent) {
        record_safely(self.metrics.as_ref(), &event);
    }

    /// Evaluate one request within the configured request timeout.
    pub async fn evaluate(&self, request: &EvaluationRequest) -> Result<EnsembleResult> {
        self.evaluate_with_timeout(request, self.config.request_timeout())
            .await
    }

    /// Evaluate one request within a caller-supplied overall timeout.
    pub async fn evaluate_with_timeout(
        &self,
        request: &EvaluationRequest,
        timeout: Duration,
    ) -> Result<EnsembleResult> {
        self.run(request, timeout).await.map(|(result, _)| result)
    }

    /// Evaluate one request and build the external report.
    pub async fn evaluate_report(&self, request: &EvaluationRequest) -> Result<HallucinationReport> {
        let start = Instant::now();
        let (result, cached) = self.run(request, self.config.request_timeout()).await?;
        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
        Ok(self.reports.build(&result, cached, latency_ms))
    }

    /// Evaluate many requests with at most `max_parallel` in flight.
    ///
    /// Results come back in input order; one failed request does not
    /// affect the others.
    pub async fn evaluate_batch(
        &self,
        requests: &[EvaluationRequest],
        max_parallel: usize,
    ) -> Vec<Result<EnsembleResult>> {
        let semaphore = Semaphore::new(max_parallel.max(1));
        let semaphore = &semaphore;
        let tasks = requests.iter().map(|request| async move {
            let _permit = semaphore
                .acquire()
                .await
                .map_err(|e| Error::Internal(format!("batch semaphore closed: {}", e)))?;
            self.evaluate(request).await
        });
        join_all(tasks).await
    }

    /// Returns the result and whether it came from the cache.
    #[instrument(skip(self, request), fields(words = request.word_count()))]
    async fn run(&self, request: &EvaluationRequest, timeout: Duration) -> Result<(EnsembleResult, bool)> {
        request.validate()?;
        self.emit(
            EngineEvent::new(EngineEventType::EvaluationStart, "evaluation started")
                .with_metadata("words", request.word_count()),
        );

        let fingerprint = Fingerprint::of(request);
        if let Some(cache) = &self.cache {
            if let Some(hit) = cache.get(&fingerprint).await {
                debug!(key = %fingerprint, "cache hit");
                self.emit(EngineEvent::new(EngineEventType::CacheHit, fingerprint.to_string()));
                return Ok((hit, true));
            }
            self.emit(EngineEvent::new(EngineEventType::CacheMiss, fingerprint.to_string()));
        }

        let result = match self.compute(request, timeout).await {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "evaluation failed");
                self.emit(EngineEvent::new(EngineEventType::EvaluationFailed, e.to_string()));
                return Err(e);
            }
        };

        if let Some(cache) = &self.cache {
            cache.insert(fingerprint, result.clone()).await;
        }
        info!(
            final_score = result.final_score,
            uncertainty = result.uncertainty_score,
            action = %result.recommended_action,
            "evaluation complete"
        );
        self.emit(EngineEvent::ensemble_complete(
            result.final_score,
            result.uncertainty_score,
            result.recommended_action.to_string(),
        ));
        Ok((result, false))
    }

    async fn compute(&self, request: &EvaluationRequest, timeout: Duration) -> Result<EnsembleResult> {
        let decision = self.router.route(request, &self.roster);
        self.emit(
            EngineEvent::new(EngineEventType::RouteDecided, decision.reasons.join("; "))
                .with_metadata("selected", decision.selected.clone())
                .with_metadata("skipped", decision.skipped.clone()),
        );

        let selected: Vec<usize> = (0..self.judges.len())
            .filter(|&i| decision.is_selected(&self.roster[i].id))
            .collect();
        let mut excluded: Vec<ExcludedJudge> = decision
            .skipped
            .iter()
            .map(|id| ExcludedJudge::new(id.clone(), ExclusionReason::NotRouted))
            .collect();

        let outcomes = self.fan_out(request, &selected, timeout).await;

        let mut results: Vec<(usize, JudgeResult)> = Vec::new();
        let mut failures = Vec::new();
        for &idx in &selected {
            let descriptor = &self.roster[idx];
            let id = descriptor.id.as_str();
            let (outcome, elapsed) = match outcomes.iter().find(|(i, _, _)| *i == idx) {
                Some((_, outcome, elapsed)) => (Some(outcome), *elapsed),
                None => (None, Duration::ZERO),
            };
            let elapsed_ms = elapsed.as_secs_f64() * 1000.0;

            match outcome {
                Some(JudgeOutcome::Answered(result)) => {
                    let mut result = result.clone();
                    if result.judge != descriptor.id {
                        debug!(judge = id, reported = %result.judge, "judge reported a foreign id");
                        result.judge = descriptor.id.clone();
                    }
                    let mut result = normalize_polarity(result, descriptor.polarity);
                    if result.processing_time_ms == 0.0 {
                        result.processing_time_ms = elapsed_ms;
                    }
                    self.emit(EngineEvent::judge_completed(
                        id,
                        result.score,
                        result.confidence,
                        elapsed_ms,
                    ));
                    results.push((idx, result));
                }
                Some(JudgeOutcome::Failed(e)) => {
                    if !e.is_judge_failure() {
                        warn!(judge = id, error = %e, "judge returned a non-judge error");
                    }
                    self.emit(EngineEvent::judge_failed(id, e.to_string(), elapsed_ms));
                    failures.push(JudgeFailure {
                        judge: id.to_string(),
                        message: e.to_string(),
                    });
                    excluded.push(ExcludedJudge::new(id, ExclusionReason::Failed(e.to_string())));
                }
                Some(JudgeOutcome::TimedOut) => {
                    let err = Error::judge_timeout(id, self.config.judge_timeout_ms);
                    self.emit(EngineEvent::judge_timed_out(id, self.config.judge_timeout_ms));
                    failures.push(JudgeFailure {
                        judge: id.to_string(),
                        message: err.to_string(),
                    });
                    excluded.push(ExcludedJudge::new(id, ExclusionReason::TimedOut));
                }
                None => {
                    self.emit(EngineEvent::judge_cancelled(id, timeout.as_millis() as u64));
                    failures.push(JudgeFailure {
                        judge: id.to_string(),
                        message: "cancelled by request deadline".to_string(),
                    });
                    excluded.push(ExcludedJudge::new(id, ExclusionReason::Cancelled));
                }
            }
        }

        if results.is_empty() {
            return Err(Error::all_judges_failed(selected.len(), failures));
        }

        results.sort_by_key(|(idx, _)| *idx);
        let judge_results: Vec<JudgeResult> = results.into_iter().map(|(_, r)| r).collect();

        let aggregation = self.aggregator.aggregate(&judge_results)?;
        let estimate = self
            .quantifier
            .quantify(&judge_results, &aggregation.draw_weights);
        let verdict = self.policy.decide(
            aggregation.final_score,
            estimate.uncertainty_score,
            estimate.consensus_strength,
        );
        debug!(
            mode = %aggregation.mode,
            reason = %verdict.reason,
            excluded = excluded.len(),
            "ensemble decided"
        );

        Ok(EnsembleResult {
            final_score: aggregation.final_score,
            confidence_interval: estimate.interval,
            consensus_strength: estimate.consensus_strength,
            uncertainty_score: estimate.uncertainty_score,
            recommended_action: verdict.action,
            needs_review: verdict.needs_review,
            weighting_mode: aggregation.mode,
            effective_weights: aggregation.effective_weights,
            judge_results,
            excluded_judges: excluded,
        })
    }

    /// Run the selected judges concurrently.
    ///
    /// Judges still running when the request deadline passes are dropped
    /// and have no entry in the returned list.
    async fn fan_out(
        &self,
        request: &EvaluationRequest,
        selected: &[usize],
        timeout: Duration,
    ) -> Vec<(usize, JudgeOutcome, Duration)> {
        let deadline = Instant::now() + timeout;
        let judge_timeout = self.config.judge_timeout();

        let mut pending: FuturesUnordered<_> = selected
            .iter()
            .map(|&idx| {
                let judge = Arc::clone(&self.judges[idx]);
                async move {
                    let start = Instant::now();
                    let outcome = match tokio::time::timeout(judge_timeout, judge.evaluate(request)).await {
                        Ok(Ok(result)) => JudgeOutcome::Answered(result),
                        Ok(Err(e)) => JudgeOutcome::Failed(e),
                        Err(_) => JudgeOutcome::TimedOut,
                    };
                    (idx, outcome, start.elapsed())
                }
            })
            .collect();

        let mut outcomes = Vec::with_capacity(selected.len());
        loop {
            match tokio::time::timeout_at(deadline, pending.next()).await {
                Ok(Some(outcome)) => outcomes.push(outcome),
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        pending = pending.len(),
                        timeout_ms = timeout.as_millis() as u64,
                        "request deadline reached; cancelling remaining judges"
                    );
                    break;
                }
            }
        }
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheConfig, UncertaintyConfig};
    use crate::judge::{
        JudgeCapabilities, LlmJudge, ScorePolarity, ScoringModel, Specialty, StatisticalJudge,
        TokenScores,
    };
    use crate::llm::{CompletionRequest, CompletionResponse, LLMClient, Provider};
    use crate::metrics::CollectingSink;
    use crate::types::{RecommendedAction, WeightingMode};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone)]
    enum Behavior {
        Score(f64, f64),
        Fail,
        Sleep(Duration),
        /// Returned exactly as given
        Raw(JudgeResult),
    }

    struct FixedJudge {
        descriptor: JudgeDescriptor,
        behavior: Behavior,
        calls: AtomicUsize,
    }

    impl FixedJudge {
        fn new(id: &str, role: JudgeRole, behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                descriptor: JudgeDescriptor::new(id, role),
                behavior,
                calls: AtomicUsize::new(0),
            })
        }

        fn with_descriptor(descriptor: JudgeDescriptor, behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                descriptor,
                behavior,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Judge for FixedJudge {
        fn descriptor(&self) -> &JudgeDescriptor {
            &self.descriptor
        }

        async fn evaluate(&self, _request: &EvaluationRequest) -> Result<JudgeResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.behavior {
                Behavior::Score(score, confidence) => {
                    Ok(JudgeResult::new(self.id(), *score, *confidence))
                }
                Behavior::Fail => Err(Error::judge_backend(self.id(), "backend down")),
                Behavior::Sleep(d) => {
                    tokio::time::sleep(*d).await;
                    Ok(JudgeResult::new(self.id(), 0.5, 0.5))
                }
                Behavior::Raw(result) => Ok(result.clone()),
            }
        }
    }

    struct ScriptedClient {
        reply: String,
    }

    #[async_trait]
    impl LLMClient for ScriptedClient {
        async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse> {
            Ok(CompletionResponse::text("scripted", self.reply.clone()))
        }

        fn provider(&self) -> Provider {
            Provider::Anthropic
        }
    }

    fn config() -> EngineConfig {
        EngineConfig {
            uncertainty: UncertaintyConfig {
                seed: Some(42),
                ..UncertaintyConfig::default()
            },
            ..EngineConfig::default()
        }
    }

    fn engine(stat: Arc<FixedJudge>, llm: Arc<FixedJudge>) -> Engine {
        engine_with(stat, llm)
    }

    fn engine_with(stat: Arc<dyn Judge>, llm: Arc<dyn Judge>) -> Engine {
        Engine::builder(config())
            .with_judge(stat, 0.3)
            .with_judge(llm, 0.7)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_cache_hit_skips_judges() {
        let stat = FixedJudge::new("statistical", JudgeRole::Statistical, Behavior::Score(0.7, 0.6));
        let llm = FixedJudge::new("llm", JudgeRole::PrimaryLlm, Behavior::Score(0.6, 0.5));
        let engine = engine(stat.clone(), llm.clone());
        let request = EvaluationRequest::new("Water boils at 100 degrees at sea level.");

        let first = engine.evaluate(&request).await.unwrap();
        let second = engine
            .evaluate(&request.clone().with_history(["a different turn"]))
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(stat.calls(), 1);
        assert_eq!(llm.calls(), 1);
        assert_eq!(engine.cache_stats().await.unwrap().hits, 1);
    }

    #[tokio::test]
    async fn test_graceful_degradation() {
        let stat = FixedJudge::new("statistical", JudgeRole::Statistical, Behavior::Score(0.8, 0.6));
        let llm = FixedJudge::new("llm", JudgeRole::PrimaryLlm, Behavior::Fail);
        let engine = engine(stat, llm);

        let result = engine
            .evaluate(&EvaluationRequest::new("The report lists three findings."))
            .await
            .unwrap();

        assert_eq!(result.judge_results.len(), 1);
        assert_eq!(result.weight_of("statistical"), Some(1.0));
        assert!((result.final_score - 0.8).abs() < 1e-12);
        let llm = result.excluded_judges.iter().find(|e| e.judge == "llm").unwrap();
        assert!(matches!(llm.reason, ExclusionReason::Failed(_)));
    }

    #[tokio::test]
    async fn test_total_failure_is_not_cached() {
        let stat = FixedJudge::new("statistical", JudgeRole::Statistical, Behavior::Fail);
        let llm = FixedJudge::new("llm", JudgeRole::PrimaryLlm, Behavior::Fail);
        let sink = CollectingSink::new();
        let engine = Engine::builder(config())
            .with_judge(stat, 0.3)
            .with_judge(llm, 0.7)
            .with_metrics(Arc::new(sink.clone()))
            .build()
            .unwrap();

        let err = engine
            .evaluate(&EvaluationRequest::new("Something was said."))
            .await
            .unwrap_err();
        match err {
            Error::AllJudgesFailed { attempted, failures } => {
                assert_eq!(attempted, 2);
                assert_eq!(failures.len(), 2);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(engine.cache_stats().await.unwrap().entry_count, 0);
        assert_eq!(sink.events_of(EngineEventType::EvaluationFailed).len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_request_runs_no_judges() {
        let stat = FixedJudge::new("statistical", JudgeRole::Statistical, Behavior::Score(0.5, 0.5));
        let llm = FixedJudge::new("llm", JudgeRole::PrimaryLlm, Behavior::Score(0.5, 0.5));
        let engine = engine(stat.clone(), llm);

        let err = engine.evaluate(&EvaluationRequest::new("  ")).await.unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
        assert_eq!(stat.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_judge_timeout_excludes_judge() {
        let stat = FixedJudge::new("statistical", JudgeRole::Statistical, Behavior::Score(0.9, 0.8));
        let llm = FixedJudge::new(
            "llm",
            JudgeRole::PrimaryLlm,
            Behavior::Sleep(Duration::from_secs(60)),
        );
        let engine = Engine::builder(EngineConfig {
            judge_timeout_ms: 300,
            request_timeout_ms: 500,
            ..config()
        })
        .with_judge(stat, 0.3)
        .with_judge(llm, 0.7)
        .build()
        .unwrap();

        let result = engine
            .evaluate(&EvaluationRequest::new("The build passed on the first try."))
            .await
            .unwrap();
        assert_eq!(result.weight_of("statistical"), Some(1.0));
        assert!(result
            .excluded_judges
            .contains(&ExcludedJudge::new("llm", ExclusionReason::TimedOut)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_deadline_cancels_slow_judges() {
        let stat = FixedJudge::new("statistical", JudgeRole::Statistical, Behavior::Score(0.4, 0.8));
        let llm = FixedJudge::new(
            "llm",
            JudgeRole::PrimaryLlm,
            Behavior::Sleep(Duration::from_secs(5)),
        );
        let engine = engine(stat, llm);

        let result = engine
            .evaluate_with_timeout(
                &EvaluationRequest::new("The build passed on the first try."),
                Duration::from_millis(200),
            )
            .await
            .unwrap();
        assert_eq!(result.judge_results.len(), 1);
        assert!(result
            .excluded_judges
            .contains(&ExcludedJudge::new("llm", ExclusionReason::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_judges_emit_cancel_event() {
        let stat = FixedJudge::new("statistical", JudgeRole::Statistical, Behavior::Score(0.4, 0.8));
        let llm = FixedJudge::new(
            "llm",
            JudgeRole::PrimaryLlm,
            Behavior::Sleep(Duration::from_secs(5)),
        );
        let sink = CollectingSink::new();
        let engine = Engine::builder(config())
            .with_judge(stat, 0.3)
            .with_judge(llm, 0.7)
            .with_metrics(Arc::new(sink.clone()))
            .build()
            .unwrap();

        engine
            .evaluate_with_timeout(
                &EvaluationRequest::new("The build passed on the first try."),
                Duration::from_millis(200),
            )
            .await
            .unwrap();
        let cancelled = sink.events_of(EngineEventType::JudgeCancelled);
        assert_eq!(cancelled.len(), 1);
        assert_eq!(cancelled[0].judge.as_deref(), Some("llm"));
        assert!(sink.events_of(EngineEventType::JudgeTimedOut).is_empty());
    }

    #[tokio::test]
    async fn test_foreign_judge_id_is_reattributed() {
        let stat = FixedJudge::new("statistical", JudgeRole::Statistical, Behavior::Score(0.8, 0.6));
        let llm = FixedJudge::new(
            "llm",
            JudgeRole::PrimaryLlm,
            Behavior::Raw(JudgeResult::new("gpt-judge", 0.6, 0.5)),
        );
        let engine = engine(stat, llm);

        let result = engine
            .evaluate(&EvaluationRequest::new("The report lists three findings."))
            .await
            .unwrap();
        assert_eq!(result.judge_results.len(), 2);
        assert_eq!(result.result_of("llm").map(|r| r.score), Some(0.6));
        assert!(result.result_of("gpt-judge").is_none());
        assert!(result.weight_of("llm").is_some());
    }

    #[tokio::test]
    async fn test_out_of_range_results_are_clamped() {
        let mut raw = JudgeResult::new("llm", 0.5, 0.5);
        raw.score = 1.5;
        raw.confidence = 4.0;
        let stat = FixedJudge::new("statistical", JudgeRole::Statistical, Behavior::Score(0.8, 0.6));
        let llm = FixedJudge::with_descriptor(
            JudgeDescriptor::new("llm", JudgeRole::PrimaryLlm).with_polarity(ScorePolarity::Risk),
            Behavior::Raw(raw),
        );
        let engine = engine(stat, llm);

        let result = engine
            .evaluate(&EvaluationRequest::new("The report lists three findings."))
            .await
            .unwrap();
        let llm = result.result_of("llm").unwrap();
        assert_eq!(llm.score, 0.0);
        assert_eq!(llm.confidence, 1.0);
        assert!(result.judge_results.iter().all(|r| {
            (0.0..=1.0).contains(&r.score) && (0.0..=1.0).contains(&r.confidence)
        }));
        assert!(result.effective_weights.iter().all(|(_, w)| (0.0..=1.0).contains(w)));
        assert!((0.0..=1.0).contains(&result.final_score));
    }

    struct StallingModel(Duration);

    impl ScoringModel for StallingModel {
        fn name(&self) -> &str {
            "stalling"
        }

        fn score(&self, _request: &EvaluationRequest) -> Result<TokenScores> {
            std::thread::sleep(self.0);
            Err(Error::Internal("unreachable in time".to_string()))
        }
    }

    #[tokio::test]
    async fn test_stalled_scoring_model_honours_timeouts() {
        let stat = StatisticalJudge::new(
            "statistical",
            Arc::new(StallingModel(Duration::from_millis(1500))),
        )
        .with_model_timeout(Duration::from_secs(30));
        let llm = FixedJudge::new("llm", JudgeRole::PrimaryLlm, Behavior::Score(0.6, 0.5));
        let engine = Engine::builder(EngineConfig {
            judge_timeout_ms: 300,
            request_timeout_ms: 500,
            ..config()
        })
        .with_judge(Arc::new(stat), 0.3)
        .with_judge(llm, 0.7)
        .build()
        .unwrap();

        let start = std::time::Instant::now();
        let result = engine
            .evaluate(&EvaluationRequest::new("The build passed on the first try."))
            .await
            .unwrap();
        assert!(start.elapsed() < Duration::from_millis(1000));
        assert!(result
            .excluded_judges
            .contains(&ExcludedJudge::new("statistical", ExclusionReason::TimedOut)));
    }

    #[tokio::test]
    async fn test_stalled_scoring_model_degrades_to_neutral() {
        let stat = StatisticalJudge::new(
            "statistical",
            Arc::new(StallingModel(Duration::from_millis(1500))),
        )
        .with_model_timeout(Duration::from_millis(100));
        let llm = FixedJudge::new("llm", JudgeRole::PrimaryLlm, Behavior::Score(0.6, 0.5));
        let engine = Engine::builder(EngineConfig {
            judge_timeout_ms: 300,
            request_timeout_ms: 500,
            ..config()
        })
        .with_judge(Arc::new(stat), 0.3)
        .with_judge(llm, 0.7)
        .build()
        .unwrap();

        let result = engine
            .evaluate(&EvaluationRequest::new("The build passed on the first try."))
            .await
            .unwrap();
        let stat = result.result_of("statistical").unwrap();
        assert_eq!(stat.score, 0.5);
        assert_eq!(stat.get_metadata("degenerate"), Some(&serde_json::json!(true)));
    }

    #[tokio::test]
    async fn test_panicking_scoring_model_does_not_crash_caller() {
        struct Exploding;

        impl ScoringModel for Exploding {
            fn name(&self) -> &str {
                "exploding"
            }

            fn score(&self, _request: &EvaluationRequest) -> Result<TokenScores> {
                panic!("model blew up");
            }
        }

        let stat = StatisticalJudge::new("statistical", Arc::new(Exploding));
        let llm = FixedJudge::new("llm", JudgeRole::PrimaryLlm, Behavior::Score(0.6, 0.5));
        let engine = engine_with(Arc::new(stat), llm);

        let result = engine
            .evaluate(&EvaluationRequest::new("The build passed on the first try."))
            .await
            .unwrap();
        let stat = result.result_of("statistical").unwrap();
        assert!(stat.explanation.contains("panicked"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_sample_keeps_judge_present() {
        struct FirstSampleHangs {
            descriptor: JudgeDescriptor,
            calls: AtomicUsize,
        }

        #[async_trait]
        impl Judge for FirstSampleHangs {
            fn descriptor(&self) -> &JudgeDescriptor {
                &self.descriptor
            }

            async fn evaluate(&self, _request: &EvaluationRequest) -> Result<JudgeResult> {
                if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                }
                Ok(JudgeResult::new("llm", 0.3, 0.8))
            }
        }

        let stat = FixedJudge::new("statistical", JudgeRole::Statistical, Behavior::Score(0.8, 0.6));
        let llm = Arc::new(FirstSampleHangs {
            descriptor: JudgeDescriptor::new("llm", JudgeRole::PrimaryLlm).with_capabilities(
                JudgeCapabilities {
                    stochastic: true,
                    ..JudgeCapabilities::default()
                },
            ),
            calls: AtomicUsize::new(0),
        });
        let mut cfg = EngineConfig {
            judge_timeout_ms: 1000,
            request_timeout_ms: 2000,
            ..config()
        };
        cfg.sampling.samples = 5;
        let engine = Engine::builder(cfg)
            .with_judge(stat, 0.3)
            .with_judge(llm.clone(), 0.7)
            .build()
            .unwrap();

        let result = engine
            .evaluate(&EvaluationRequest::new("The build passed on the first try."))
            .await
            .unwrap();
        assert_eq!(llm.calls.load(Ordering::SeqCst), 5);
        let llm = result.result_of("llm").unwrap();
        assert_eq!(llm.get_metadata("samples_succeeded"), Some(&serde_json::json!(4)));
        assert!(!result.excluded_judges.iter().any(|e| e.judge == "llm"));
    }

    #[tokio::test]
    async fn test_routing_and_polarity() {
        let stat = FixedJudge::new("statistical", JudgeRole::Statistical, Behavior::Score(0.5, 0.5));
        let llm = FixedJudge::new("llm", JudgeRole::PrimaryLlm, Behavior::Score(0.5, 0.5));
        let grounding = FixedJudge::new("grounding", JudgeRole::Grounding, Behavior::Score(0.5, 0.5));
        let risk_model = FixedJudge::with_descriptor(
            JudgeDescriptor::new("risk-model", JudgeRole::Specialist(Specialty::General))
                .with_polarity(ScorePolarity::Risk),
            Behavior::Score(0.9, 0.8),
        );
        let engine = Engine::builder(config())
            .with_judge(stat, 0.3)
            .with_judge(llm, 0.4)
            .with_judge(grounding.clone(), 0.2)
            .with_judge(risk_model, 0.1)
            .build()
            .unwrap();

        let result = engine.evaluate(&EvaluationRequest::new("ok then")).await.unwrap();
        assert_eq!(grounding.calls(), 0);
        assert!(result
            .excluded_judges
            .contains(&ExcludedJudge::new("grounding", ExclusionReason::NotRouted)));
        let flipped = result.result_of("risk-model").unwrap();
        assert!((flipped.score - 0.1).abs() < 1e-12);
        assert_eq!(result.weighting_mode, WeightingMode::ConfidenceWeighted);
        let total: f64 = result.effective_weights.iter().map(|(_, w)| w).sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_metrics_events() {
        let stat = FixedJudge::new("statistical", JudgeRole::Statistical, Behavior::Score(0.9, 0.9));
        let llm = FixedJudge::new("llm", JudgeRole::PrimaryLlm, Behavior::Score(0.9, 0.9));
        let sink = CollectingSink::new();
        let engine = Engine::builder(config())
            .with_judge(stat, 0.5)
            .with_judge(llm, 0.5)
            .with_metrics(Arc::new(sink.clone()))
            .build()
            .unwrap();

        engine
            .evaluate(&EvaluationRequest::new("Tests pass."))
            .await
            .unwrap();
        let types: Vec<EngineEventType> = sink.events().iter().map(|e| e.event_type).collect();
        assert_eq!(types[0], EngineEventType::EvaluationStart);
        assert_eq!(types[1], EngineEventType::CacheMiss);
        assert_eq!(types[2], EngineEventType::RouteDecided);
        assert_eq!(sink.events_of(EngineEventType::JudgeCompleted).len(), 2);
        assert_eq!(types.last(), Some(&EngineEventType::EnsembleComplete));
    }

    #[test]
    fn test_builder_validation() {
        let stat = FixedJudge::new("statistical", JudgeRole::Statistical, Behavior::Score(0.5, 0.5));
        let llm = FixedJudge::new("llm", JudgeRole::PrimaryLlm, Behavior::Score(0.5, 0.5));

        let missing_primary = Engine::builder(config()).with_judge(stat.clone(), 1.0).build();
        assert!(matches!(missing_primary, Err(Error::Config(_))));

        let duplicate = Engine::builder(config())
            .with_judge(stat.clone(), 0.5)
            .with_judge(llm.clone(), 0.5)
            .with_judge(
                FixedJudge::new("llm", JudgeRole::Grounding, Behavior::Fail),
                0.1,
            )
            .build();
        assert!(matches!(duplicate, Err(Error::Config(_))));

        let mut bad = config();
        bad.policy.uncertainty_threshold = 2.0;
        assert!(Engine::builder(bad)
            .with_judge(stat, 0.5)
            .with_judge(llm, 0.5)
            .build()
            .is_err());
    }

    #[tokio::test]
    async fn test_batch_preserves_order() {
        let stat = FixedJudge::new("statistical", JudgeRole::Statistical, Behavior::Score(0.9, 0.9));
        let llm = FixedJudge::new("llm", JudgeRole::PrimaryLlm, Behavior::Score(0.9, 0.9));
        let engine = engine(stat, llm);

        let requests = vec![
            EvaluationRequest::new("First answer."),
            EvaluationRequest::new(""),
            EvaluationRequest::new("Third answer."),
        ];
        let results = engine.evaluate_batch(&requests, 2).await;
        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(Error::InvalidRequest(_))));
        assert!(results[2].is_ok());
    }

    #[tokio::test]
    async fn test_sampling_wraps_stochastic_judges() {
        let stat = FixedJudge::new("statistical", JudgeRole::Statistical, Behavior::Score(0.5, 0.5));
        let llm = FixedJudge::with_descriptor(
            JudgeDescriptor::new("llm", JudgeRole::PrimaryLlm).with_capabilities(JudgeCapabilities {
                stochastic: true,
                ..JudgeCapabilities::default()
            }),
            Behavior::Score(0.2, 0.9),
        );
        let engine = Engine::builder(EngineConfig {
            cache: CacheConfig {
                enabled: false,
                ..CacheConfig::default()
            },
            ..config()
        })
        .with_judge(stat.clone(), 0.3)
        .with_judge(llm.clone(), 0.7)
        .build()
        .unwrap();

        let result = engine.evaluate(&EvaluationRequest::new("Some output text.")).await.unwrap();
        assert_eq!(llm.calls(), 5);
        assert_eq!(stat.calls(), 1);
        assert_eq!(
            result.result_of("llm").unwrap().get_metadata("samples_succeeded"),
            Some(&serde_json::json!(5))
        );
        assert!(engine.cache_stats().await.is_none());
    }

    #[tokio::test]
    async fn test_eiffel_tower_end_to_end() {
        let reply = "```json\n{\"score\": 0.1, \"explanation\": \"The Eiffel Tower is in Paris, not Berlin.\", \"hallucinated_segments\": [\"Berlin\"]}\n```";
        let client = Arc::new(ScriptedClient {
            reply: reply.to_string(),
        });
        let engine = Engine::builder(config())
            .with_judge(Arc::new(StatisticalJudge::lexical("statistical")), 0.3)
            .with_judge(Arc::new(LlmJudge::primary("llm", client)), 0.7)
            .build()
            .unwrap();

        let request = EvaluationRequest::new("The Eiffel Tower is in Berlin.")
            .with_ground_truth("The Eiffel Tower is in Paris.");
        let report = engine.evaluate_report(&request).await.unwrap();

        assert!(report.hallucination_risk > 0.5, "risk {}", report.hallucination_risk);
        assert!(report.final_score > 0.1 && report.final_score < 0.25);
        assert_eq!(report.weighting_mode, WeightingMode::ConfidentPrimary);
        assert_eq!(report.recommended_action, RecommendedAction::RejectHighRisk);
        assert!(report.flagged_segments.contains("Berlin"));
        assert!(report.confidence_interval.low <= report.confidence_interval.high);
        assert!(!report.cached);

        let again = engine.evaluate_report(&request).await.unwrap();
        assert!(again.cached);
        assert_eq!(again.final_score, report.final_score);
    }
}
