//! Per-request judge selection.
//!
//! The router looks only at cheap local signals (word count, keyword sets,
//! whether any checkable claim exists) and decides which optional judges to
//! run. The statistical and primary LLM judges are always selected.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::OnceLock;
use tracing::debug;

use crate::config::RoutingConfig;
use crate::judge::{ClaimExtractor, JudgeDescriptor, JudgeRole, Specialty};
use crate::types::EvaluationRequest;

/// Compiled keyword patterns.
struct SignalPatterns {
    technical: Regex,
    reasoning: Regex,
}

impl SignalPatterns {
    fn get() -> &'static Self {
        static PATTERNS: OnceLock<SignalPatterns> = OnceLock::new();
        PATTERNS.get_or_init(|| Self {
            technical: Regex::new(
                r"(?x)
                \b(
                api|sdk|http|https|json|yaml|sql|database|schema|
                kubernetes|docker|container|compiler|runtime|algorithm|
                function|method|endpoint|protocol|tcp|udp|dns|
                cpu|gpu|kernel|thread|mutex|async|latency|throughput|
                regex|encryption|hash|cache|server|library|framework|
                dependency|version|python|rust|javascript|typescript|java
                )\b
                ",
            )
            .expect("valid technical pattern"),
            reasoning: Regex::new(
                r"(?x)
                \b(
                because|therefore|thus|hence|consequently|
                as\s+a\s+result|due\s+to|leads?\s+to|caused?\s+by|
                implies|which\s+means|so\s+that|
                might|could|possibly|probably|likely|perhaps|suggests?
                )\b
                ",
            )
            .expect("valid reasoning pattern"),
        })
    }
}

fn regex_hits(re: &Regex, text: &str) -> BTreeSet<String> {
    re.find_iter(text).map(|m| m.as_str().to_string()).collect()
}

fn keyword_hits(keywords: &[String], text: &str) -> BTreeSet<String> {
    let words: BTreeSet<&str> = text
        .split(|c: char| !c.is_alphanumeric() && c != '-' && c != '_')
        .filter(|w| !w.is_empty())
        .collect();
    keywords
        .iter()
        .map(|k| k.trim().to_lowercase())
        .filter(|k| !k.is_empty())
        .filter(|k| {
            if k.contains(char::is_whitespace) {
                text.contains(k.as_str())
            } else {
                words.contains(k.as_str())
            }
        })
        .collect()
}

/// Local signals computed before any judge runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingSignals {
    pub word_count: usize,
    pub is_long: bool,
    /// Technical keywords found in the output
    pub technical_terms: BTreeSet<String>,
    /// Hedge and causal keywords found in the output
    pub reasoning_terms: BTreeSet<String>,
    /// Whether the output contains at least one checkable claim
    pub has_claims: bool,
}

impl RoutingSignals {
    pub fn has_technical(&self) -> bool {
        !self.technical_terms.is_empty()
    }

    pub fn needs_reasoning(&self) -> bool {
        self.is_long || !self.reasoning_terms.is_empty()
    }
}

/// Outcome of routing one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingDecision {
    /// Judge ids to invoke, in roster order
    pub selected: Vec<String>,
    /// Judge ids left out
    pub skipped: Vec<String>,
    pub signals: RoutingSignals,
    /// One human-readable reason per selected judge
    pub reasons: Vec<String>,
}

impl RoutingDecision {
    pub fn is_selected(&self, judge: &str) -> bool {
        self.selected.iter().any(|id| id == judge)
    }
}

/// Heuristic router over a judge roster.
#[derive(Debug, Clone)]
pub struct Router {
    config: RoutingConfig,
    extractor: ClaimExtractor,
}

impl Router {
    pub fn new(config: RoutingConfig) -> Self {
        Self {
            config,
            extractor: ClaimExtractor::new(),
        }
    }

    /// Compute routing signals for a request.
    pub fn signals(&self, request: &EvaluationRequest) -> RoutingSignals {
        let patterns = SignalPatterns::get();
        let lower = request.agent_output().to_lowercase();
        let word_count = request.word_count();

        let mut technical_terms = regex_hits(&patterns.technical, &lower);
        technical_terms.extend(keyword_hits(&self.config.technical_keywords, &lower));
        let mut reasoning_terms = regex_hits(&patterns.reasoning, &lower);
        reasoning_terms.extend(keyword_hits(&self.config.reasoning_keywords, &lower));

        RoutingSignals {
            word_count,
            is_long: word_count >= self.config.long_input_words,
            technical_terms,
            reasoning_terms,
            has_claims: self.extractor.has_claims(request.agent_output()),
        }
    }

    /// Select judges from `roster` for this request.
    ///
    /// Mandatory judges are always selected regardless of signals.
    pub fn route(&self, request: &EvaluationRequest, roster: &[JudgeDescriptor]) -> RoutingDecision {
        let signals = self.signals(request);
        let mut selected = Vec::new();
        let mut skipped = Vec::new();
        let mut reasons = Vec::new();

        for judge in roster {
            let reason = match judge.role {
                JudgeRole::Statistical | JudgeRole::PrimaryLlm => Some("mandatory".to_string()),
                JudgeRole::Grounding => signals
                    .has_claims
                    .then(|| "output contains checkable claims".to_string()),
                JudgeRole::Specialist(Specialty::Technical) => signals.has_technical().then(|| {
                    let terms: Vec<&str> =
                        signals.technical_terms.iter().map(String::as_str).collect();
                    format!("technical terms: {}", terms.join(", "))
                }),
                JudgeRole::Specialist(Specialty::Reasoning) => {
                    if signals.is_long {
                        Some(format!("long output ({} words)", signals.word_count))
                    } else if signals.needs_reasoning() {
                        let terms: Vec<&str> =
                            signals.reasoning_terms.iter().map(String::as_str).collect();
                        Some(format!("hedge/causal terms: {}", terms.join(", ")))
                    } else {
                        None
                    }
                }
                JudgeRole::Specialist(Specialty::General) => Some("general specialist".to_string()),
            };

            match reason {
                Some(reason) => {
                    selected.push(judge.id.clone());
                    reasons.push(format!("{}: {}", judge.id, reason));
                }
                None => skipped.push(judge.id.clone()),
            }
        }

        debug!(?selected, ?skipped, "routing decided");
        RoutingDecision {
            selected,
            skipped,
            signals,
            reasons,
        }
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new(RoutingConfig::default())
    }
}
