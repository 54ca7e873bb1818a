//! LLM-backed judges.
//!
//! The judge encodes `(agent_output, ground_truth, history)` into a prompt
//! and expects a JSON verdict back. Replies wrapped in Markdown code fences
//! or surrounded by prose are tolerated.

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, instrument};

use crate::error::{Error, Result};
use crate::llm::{ChatMessage, CompletionRequest, LLMClient};
use crate::types::{EvaluationRequest, JudgeResult};

use super::{Judge, JudgeCapabilities, JudgeDescriptor, JudgeRole, ScorePolarity, Specialty};

/// Number of most recent history turns included in the prompt.
const HISTORY_TURNS: usize = 6;

/// Verdict returned by the LLM.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LlmVerdict {
    pub score: f64,
    #[serde(default)]
    pub explanation: String,
    #[serde(default, alias = "flagged_segments")]
    pub hallucinated_segments: Vec<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
}

/// Locate the JSON object inside an LLM reply.
fn extract_json(content: &str) -> &str {
    let block = if let Some(rest) = content.split("```json").nth(1) {
        rest.split("```").next().unwrap_or("")
    } else if let Some(rest) = content.split("```").nth(1) {
        rest
    } else {
        content
    };

    match (block.find('{'), block.rfind('}')) {
        (Some(start), Some(end)) if end > start => &block[start..=end],
        _ => block.trim(),
    }
}

/// Parse an LLM reply into a verdict.
///
/// Fails with [`Error::JudgeBackend`] when no JSON object can be parsed or
/// the score is not a finite number.
pub fn parse_verdict(judge: &str, content: &str) -> Result<LlmVerdict> {
    let json = extract_json(content);
    let verdict: LlmVerdict = serde_json::from_str(json)
        .map_err(|e| Error::judge_backend(judge, format!("unparseable verdict: {}", e)))?;

    if !verdict.score.is_finite() {
        return Err(Error::judge_backend(judge, "verdict score is not finite"));
    }
    if let Some(c) = verdict.confidence {
        if !c.is_finite() {
            return Err(Error::judge_backend(judge, "verdict confidence is not finite"));
        }
    }
    Ok(verdict)
}

const PRIMARY_SYSTEM: &str = "You are a meticulous fact-checker. You assess whether an AI \
agent's answer contains hallucinations: claims that are false, unsupported by the reference \
material, or inconsistent with the conversation.";

fn specialist_system(specialty: Specialty) -> &'static str {
    match specialty {
        Specialty::Technical => {
            "You are a senior engineer reviewing an AI agent's answer for technical \
             hallucinations: invented APIs, wrong versions, incorrect commands, impossible \
             configurations and misused terminology."
        }
        Specialty::Reasoning => {
            "You are a careful logician reviewing an AI agent's answer for reasoning \
             hallucinations: unsupported causal claims, invalid inference steps, overconfident \
             conclusions and internal contradictions."
        }
        Specialty::General => PRIMARY_SYSTEM,
    }
}

fn build_prompt(request: &EvaluationRequest) -> String {
    let mut prompt = String::new();

    let history = request.conversation_history();
    if !history.is_empty() {
        prompt.push_str("## Conversation so far\n");
        let skip = history.len().saturating_sub(HISTORY_TURNS);
        for turn in &history[skip..] {
            prompt.push_str("- ");
            prompt.push_str(turn);
            prompt.push('\n');
        }
        prompt.push('\n');
    }

    if let Some(truth) = request.ground_truth() {
        prompt.push_str("## Reference (ground truth)\n");
        prompt.push_str(truth);
        prompt.push_str("\n\n");
    }

    prompt.push_str("## Agent answer\n");
    prompt.push_str(request.agent_output());
    prompt.push_str(
        "\n\n## Task\n\
         Rate how accurate the agent answer is. Respond ONLY with JSON:\n\
         {\"score\": <0.0 = fully hallucinated, 1.0 = fully accurate>, \
         \"confidence\": <0.0-1.0>, \
         \"explanation\": \"<one or two sentences>\", \
         \"hallucinated_segments\": [\"<exact substrings of the agent answer>\"]}",
    );
    prompt
}

/// Judge that asks an LLM for a hallucination verdict.
///
/// Declared stochastic, so the engine wraps it in self-consistency sampling
/// when more than one sample is configured.
pub struct LlmJudge {
    descriptor: JudgeDescriptor,
    client: Arc<dyn LLMClient>,
    system: &'static str,
    model: Option<String>,
    temperature: f64,
    max_tokens: u32,
}

impl LlmJudge {
    fn with_role(id: impl Into<String>, role: JudgeRole, client: Arc<dyn LLMClient>) -> Self {
        let system = match role {
            JudgeRole::Specialist(s) => specialist_system(s),
            _ => PRIMARY_SYSTEM,
        };
        Self {
            descriptor: JudgeDescriptor::new(id, role)
                .with_polarity(ScorePolarity::Accuracy)
                .with_capabilities(JudgeCapabilities {
                    stochastic: true,
                    always_available: false,
                    network: true,
                }),
            client,
            system,
            model: None,
            temperature: 0.7,
            max_tokens: 512,
        }
    }

    /// The mandatory primary LLM judge.
    pub fn primary(id: impl Into<String>, client: Arc<dyn LLMClient>) -> Self {
        Self::with_role(id, JudgeRole::PrimaryLlm, client)
    }

    /// A specialist judge the router includes when its signal fires.
    pub fn specialist(id: impl Into<String>, specialty: Specialty, client: Arc<dyn LLMClient>) -> Self {
        Self::with_role(id, JudgeRole::Specialist(specialty), client)
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature.clamp(0.0, 1.0);
        self
    }

    /// Declare that the backing prompt returns risk instead of accuracy.
    pub fn with_polarity(mut self, polarity: ScorePolarity) -> Self {
        self.descriptor.polarity = polarity;
        self
    }

    fn completion_request(&self, request: &EvaluationRequest, temperature: f64) -> CompletionRequest {
        let mut req = CompletionRequest::new()
            .with_system(self.system)
            .with_message(ChatMessage::user(build_prompt(request)))
            .with_max_tokens(self.max_tokens)
            .with_temperature(temperature);
        if let Some(model) = &self.model {
            req = req.with_model(model);
        }
        req
    }

    #[instrument(skip(self, request), fields(judge = %self.descriptor.id))]
    async fn run(&self, request: &EvaluationRequest, temperature: f64) -> Result<JudgeResult> {
        let start = Instant::now();
        let id = &self.descriptor.id;

        let response = self
            .client
            .complete(self.completion_request(request, temperature))
            .await
            .map_err(|e| match e {
                Error::JudgeBackend { .. } | Error::JudgeTimeout { .. } => e,
                other => Error::judge_backend(id, other.to_string()),
            })?;

        let verdict = parse_verdict(id, &response.content)?;

        // Only verbatim substrings of the output count as flagged segments.
        let output = request.agent_output();
        let (verbatim, paraphrased): (Vec<String>, Vec<String>) = verdict
            .hallucinated_segments
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .partition(|s| output.contains(s.as_str()));
        if !paraphrased.is_empty() {
            debug!(count = paraphrased.len(), "dropping non-verbatim segments");
        }

        let score = verdict.score.clamp(0.0, 1.0);
        let confidence = verdict
            .confidence
            .unwrap_or_else(|| 0.5 + (score - 0.5).abs());

        Ok(JudgeResult::new(id, score, confidence)
            .with_explanation(verdict.explanation)
            .with_flagged_segments(verbatim)
            .with_processing_time_ms(start.elapsed().as_secs_f64() * 1000.0)
            .with_metadata("model", response.model)
            .with_metadata("output_tokens", response.usage.output_tokens)
            .with_metadata("dropped_segments", paraphrased.len())
            .with_metadata("temperature", temperature))
    }
}

#[async_trait]
impl Judge for LlmJudge {
    fn descriptor(&self) -> &JudgeDescriptor {
        &self.descriptor
    }

    async fn evaluate(&self, request: &EvaluationRequest) -> Result<JudgeResult> {
        self.run(request, self.temperature).await
    }

    async fn sample(&self, request: &EvaluationRequest, temperature: f64) -> Result<JudgeResult> {
        self.run(request, temperature).await
    }
}
