//! Engine events and metrics sinks.
//!
//! The engine reports per-judge latency, success/failure and ensemble-level
//! score/uncertainty as [`EngineEvent`]s. Sinks are fire-and-forget: a sink
//! that panics is caught and logged, and the evaluation carries on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Kind of engine event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineEventType {
    EvaluationStart,
    CacheHit,
    CacheMiss,
    RouteDecided,
    JudgeCompleted,
    JudgeFailed,
    JudgeTimedOut,
    /// Dropped when the request deadline passed
    JudgeCancelled,
    EnsembleComplete,
    EvaluationFailed,
}

impl EngineEventType {
    /// Whether this event reports a failure.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::JudgeFailed
                | Self::JudgeTimedOut
                | Self::JudgeCancelled
                | Self::EvaluationFailed
        )
    }
}

impl std::fmt::Display for EngineEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::EvaluationStart => "EVALUATION_START",
            Self::CacheHit => "CACHE_HIT",
            Self::CacheMiss => "CACHE_MISS",
            Self::RouteDecided => "ROUTE_DECIDED",
            Self::JudgeCompleted => "JUDGE_COMPLETED",
            Self::JudgeFailed => "JUDGE_FAILED",
            Self::JudgeTimedOut => "JUDGE_TIMED_OUT",
            Self::JudgeCancelled => "JUDGE_CANCELLED",
            Self::EnsembleComplete => "ENSEMBLE_COMPLETE",
            Self::EvaluationFailed => "EVALUATION_FAILED",
        };
        write!(f, "{}", s)
    }
}

/// One observable step of an evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineEvent {
    pub event_type: EngineEventType,
    /// Judge the event is about, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub judge: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl EngineEvent {
    pub fn new(event_type: EngineEventType, message: impl Into<String>) -> Self {
        Self {
            event_type,
            judge: None,
            message: message.into(),
            metadata: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_judge(mut self, judge: impl Into<String>) -> Self {
        self.judge = Some(judge.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn get_metadata(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    pub fn judge_completed(judge: &str, score: f64, confidence: f64, latency_ms: f64) -> Self {
        Self::new(EngineEventType::JudgeCompleted, format!("score {:.3}", score))
            .with_judge(judge)
            .with_metadata("score", score)
            .with_metadata("confidence", confidence)
            .with_metadata("latency_ms", latency_ms)
    }

    pub fn judge_failed(judge: &str, error: impl Into<String>, latency_ms: f64) -> Self {
        Self::new(EngineEventType::JudgeFailed, error)
            .with_judge(judge)
            .with_metadata("latency_ms", latency_ms)
    }

    pub fn judge_timed_out(judge: &str, timeout_ms: u64) -> Self {
        Self::new(
            EngineEventType::JudgeTimedOut,
            format!("no answer within {}ms", timeout_ms),
        )
        .with_judge(judge)
        .with_metadata("timeout_ms", timeout_ms)
    }

    pub fn judge_cancelled(judge: &str, deadline_ms: u64) -> Self {
        Self::new(
            EngineEventType::JudgeCancelled,
            format!("cancelled by {}ms request deadline", deadline_ms),
        )
        .with_judge(judge)
        .with_metadata("deadline_ms", deadline_ms)
    }

    pub fn ensemble_complete(final_score: f64, uncertainty: f64, action: impl Into<String>) -> Self {
        let action = action.into();
        Self::new(EngineEventType::EnsembleComplete, action.clone())
            .with_metadata("final_score", final_score)
            .with_metadata("uncertainty_score", uncertainty)
            .with_metadata("recommended_action", action)
    }

    /// Compact single-line rendering.
    pub fn as_log_line(&self) -> String {
        match &self.judge {
            Some(judge) => format!("[{}] {}: {}", self.event_type, judge, self.message),
            None => format!("[{}] {}", self.event_type, self.message),
        }
    }
}

/// Receiver of engine events.
pub trait MetricsSink: Send + Sync {
    fn record(&self, event: &EngineEvent);
}

/// Forward an event to a sink, swallowing panics.
pub(crate) fn record_safely(sink: &dyn MetricsSink, event: &EngineEvent) {
    if catch_unwind(AssertUnwindSafe(|| sink.record(event))).is_err() {
        warn!(event = %event.event_type, "metrics sink panicked; event dropped");
    }
}

/// Sink that discards all events.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl MetricsSink for NullSink {
    fn record(&self, _event: &EngineEvent) {}
}

/// Sink that stores events in memory.
#[derive(Debug, Default, Clone)]
pub struct CollectingSink {
    events: Arc<RwLock<Vec<EngineEvent>>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get collected events.
    pub fn events(&self) -> Vec<EngineEvent> {
        self.events
            .read()
            .map(|e| e.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// Collected events of one type.
    pub fn events_of(&self, event_type: EngineEventType) -> Vec<EngineEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.event_type == event_type)
            .collect()
    }

    pub fn clear(&self) {
        match self.events.write() {
            Ok(mut events) => events.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
    }
}

impl MetricsSink for CollectingSink {
    fn record(&self, event: &EngineEvent) {
        match self.events.write() {
            Ok(mut events) => events.push(event.clone()),
            Err(poisoned) => poisoned.into_inner().push(event.clone()),
        }
    }
}

/// Fan-out sink backed by a broadcast channel.
pub struct BroadcastSink {
    sender: broadcast::Sender<EngineEvent>,
}

impl BroadcastSink {
    /// Create a broadcast sink with channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl MetricsSink for BroadcastSink {
    fn record(&self, event: &EngineEvent) {
        // No subscribers is not an error.
        let _ = self.sender.send(event.clone());
    }
}

/// Sink that re-emits events as `tracing` records.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn record(&self, event: &EngineEvent) {
        let judge = event.judge.as_deref().unwrap_or("-");
        match event.event_type {
            t if t.is_failure() => warn!(event = %t, judge, message = %event.message, "engine event"),
            EngineEventType::EnsembleComplete => {
                info!(event = %event.event_type, message = %event.message, "engine event")
            }
            t => debug!(event = %t, judge, message = %event.message, "engine event"),
        }
    }
}
