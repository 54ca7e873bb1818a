//! Claim extraction from agent outputs.
//!
//! Splits an output into sentence-level factual assertions that can be
//! checked independently. Questions, hedged sentences and meta-commentary
//! are skipped since they assert nothing a knowledge source could refute.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// One atomic factual assertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    /// Sentence text, trimmed
    pub text: String,
    /// Byte span in the source output, when it could be located
    pub span: Option<(usize, usize)>,
    /// How concrete the claim is (0.1 - 0.95)
    pub specificity: f64,
}

fn sentence_boundary() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[.!?]+\s+|\n\n+").expect("valid sentence regex"))
}

fn capitalized_word() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b[A-Z][a-zA-Z0-9_]*\b").expect("valid identifier regex"))
}

fn number() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b\d+(?:[.,]\d+)?\b").expect("valid number regex"))
}

const ABBREVIATIONS: &[(&str, &str)] = &[
    ("e.g.", "e\u{1}g\u{1}"),
    ("i.e.", "i\u{1}e\u{1}"),
    ("etc.", "etc\u{1}"),
    ("vs.", "vs\u{1}"),
    ("Mr.", "Mr\u{1}"),
    ("Ms.", "Ms\u{1}"),
    ("Dr.", "Dr\u{1}"),
];

const HEDGES: &[&str] = &[
    "might", "could", "possibly", "perhaps", "probably", "likely", "seems", "appears",
    "i think", "i believe", "may",
];

const META_PREFIXES: &[&str] = &[
    "let me", "i'll", "i will", "here's", "here is", "to summarize", "in summary",
    "as you can see", "note that", "keep in mind",
];

const FACTUAL_VERBS: &[&str] = &[
    "is", "are", "was", "were", "has", "have", "had", "does", "did", "contains", "returns",
    "uses", "requires", "built", "founded", "located", "born", "died", "won",
];

/// Extract atomic claims from an agent output.
#[derive(Debug, Clone)]
pub struct ClaimExtractor {
    min_length: usize,
    max_length: usize,
    max_claims: usize,
}

impl Default for ClaimExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl ClaimExtractor {
    pub fn new() -> Self {
        Self {
            min_length: 10,
            max_length: 500,
            max_claims: 16,
        }
    }

    /// Set minimum claim length in bytes.
    pub fn with_min_length(mut self, len: usize) -> Self {
        self.min_length = len;
        self
    }

    /// Set maximum claim length in bytes.
    pub fn with_max_length(mut self, len: usize) -> Self {
        self.max_length = len;
        self
    }

    /// Cap the number of claims returned, most specific first.
    pub fn with_max_claims(mut self, max: usize) -> Self {
        self.max_claims = max;
        self
    }

    /// Extract claims, ordered by position in the output.
    pub fn extract(&self, output: &str) -> Vec<Claim> {
        let mut claims: Vec<Claim> = split_sentences(output)
            .into_iter()
            .filter(|s| s.len() >= self.min_length && s.len() <= self.max_length)
            .filter(|s| !s.ends_with('?'))
            .filter(|s| !is_meta_commentary(s) && !is_hedged(s) && has_factual_verb(s))
            .map(|s| {
                let span = output
                    .find(s.as_str())
                    .map(|start| (start, start + s.len()));
                Claim {
                    specificity: estimate_specificity(&s),
                    span,
                    text: s,
                }
            })
            .collect();

        if claims.len() > self.max_claims {
            claims.sort_by(|a, b| b.specificity.total_cmp(&a.specificity));
            claims.truncate(self.max_claims);
            claims.sort_by_key(|c| c.span.map(|(start, _)| start).unwrap_or(usize::MAX));
        }
        claims
    }

    /// Whether the output contains at least one checkable claim.
    pub fn has_claims(&self, output: &str) -> bool {
        !self.extract(output).is_empty()
    }
}

/// Split text into trimmed sentences. Question marks are kept so callers
/// can recognise questions; other terminators are dropped.
fn split_sentences(text: &str) -> Vec<String> {
    let mut protected = text.to_string();
    for (abbr, mask) in ABBREVIATIONS {
        protected = protected.replace(abbr, mask);
    }

    let mut pieces = Vec::new();
    let mut last = 0;
    for m in sentence_boundary().find_iter(&protected) {
        pieces.push(&protected[last..m.end()]);
        last = m.end();
    }
    pieces.push(&protected[last..]);

    pieces
        .into_iter()
        .map(|piece| {
            let mut s = piece.trim().to_string();
            for (abbr, mask) in ABBREVIATIONS {
                s = s.replace(mask, abbr);
            }
            if s.ends_with('?') {
                s
            } else {
                s.trim_end_matches(['.', '!']).trim_end().to_string()
            }
        })
        .filter(|s| !s.is_empty())
        .collect()
}

fn words_lower(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric() && c != '\'')
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

fn is_hedged(text: &str) -> bool {
    let lower = text.to_lowercase();
    let words = words_lower(text);
    HEDGES.iter().any(|h| {
        if h.contains(' ') {
            lower.contains(h)
        } else {
            words.iter().any(|w| w == h)
        }
    })
}

fn is_meta_commentary(text: &str) -> bool {
    let lower = text.to_lowercase();
    META_PREFIXES.iter().any(|p| lower.starts_with(p))
}

fn has_factual_verb(text: &str) -> bool {
    words_lower(text)
        .iter()
        .any(|w| FACTUAL_VERBS.contains(&w.as_str()))
}

/// Estimate how concrete a claim is.
fn estimate_specificity(text: &str) -> f64 {
    let words = words_lower(text);
    let mut specificity = 0.5;

    // Skip the sentence-initial capital.
    let names = capitalized_word().find_iter(text).count().saturating_sub(1);
    specificity += (names as f64 * 0.05).min(0.2);
    specificity += (number().find_iter(text).count() as f64 * 0.1).min(0.2);

    let has = |set: &[&str]| words.iter().any(|w| set.contains(&w.as_str()));
    if has(&["some", "many", "few", "several"]) {
        specificity -= 0.1;
    }
    if has(&["all", "every", "always", "never"]) {
        specificity += 0.15;
    }

    specificity.clamp(0.1, 0.95)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_extraction() {
        let claims = ClaimExtractor::new()
            .extract("The Eiffel Tower is in Berlin. It was completed in 1889.");
        assert_eq!(claims.len(), 2);
        assert_eq!(claims[0].text, "The Eiffel Tower is in Berlin");
        assert_eq!(claims[1].text, "It was completed in 1889");
    }

    #[test]
    fn test_skips_questions_hedges_and_meta() {
        let claims = ClaimExtractor::new().extract(
            "Is the tower in Paris? It might be made of wood. Let me explain the history. \
             The tower is made of iron.",
        );
        assert_eq!(claims.len(), 1);
        assert_eq!(claims[0].text, "The tower is made of iron");
    }

    #[test]
    fn test_span_points_into_source() {
        let output = "Preamble text here. The boiling point of water is 100 degrees.";
        let claims = ClaimExtractor::new().extract(output);
        let claim = claims.last().unwrap();
        let (start, end) = claim.span.unwrap();
        assert_eq!(&output[start..end], claim.text);
    }

    #[test]
    fn test_specificity_rewards_numbers_and_names() {
        let vague = estimate_specificity("Some towers are tall");
        let concrete = estimate_specificity("The Eiffel Tower is 330 metres tall");
        assert!(concrete > vague);
    }

    #[test]
    fn test_abbreviations_do_not_split() {
        let sentences = split_sentences("Metals, e.g. iron, are dense. Dr. Smith agrees.");
        assert_eq!(sentences.len(), 2);
        assert!(sentences[0].contains("e.g. iron"));
    }

    #[test]
    fn test_empty_input() {
        assert!(ClaimExtractor::new().extract("").is_empty());
        assert!(!ClaimExtractor::new().has_claims("ok"));
    }
}
