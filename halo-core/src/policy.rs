//! Decision policy.
//!
//! A pure function of `(final_score, uncertainty_score, consensus_strength)`:
//!
//! ```text
//! uncertainty > threshold   -> human_review
//! risk > reject_risk        -> reject_high_risk
//! risk > flag_risk          -> flag_for_review
//! otherwise                 -> accept
//! ```
//!
//! All comparisons are strictly greater, so a value exactly at a threshold
//! stays on the lower branch.

use serde::{Deserialize, Serialize};

use crate::config::PolicyConfig;
use crate::types::RecommendedAction;

/// Values closer than this to a threshold count as equal to it, so
/// `1.0 - 0.7` still sits exactly on the 0.3 boundary.
const BOUNDARY_EPSILON: f64 = 1e-12;

fn exceeds(value: f64, threshold: f64) -> bool {
    value - threshold > BOUNDARY_EPSILON
}

/// Outcome of the policy for one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub action: RecommendedAction,
    /// `uncertainty_score > threshold`
    pub needs_review: bool,
    pub reason: String,
}

/// Stateless mapping from ensemble statistics to an action.
#[derive(Debug, Clone, Default)]
pub struct DecisionPolicy {
    config: PolicyConfig,
}

impl DecisionPolicy {
    pub fn new(config: PolicyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    /// Decide on an action. `final_score` is accuracy; risk is `1 - final_score`.
    pub fn decide(&self, final_score: f64, uncertainty_score: f64, consensus_strength: f64) -> Decision {
        let c = &self.config;
        let risk = 1.0 - final_score;
        let needs_review = exceeds(uncertainty_score, c.uncertainty_threshold);
        let low_agreement = c
            .min_agreement
            .map(|min| exceeds(min, consensus_strength))
            .unwrap_or(false);

        let (action, reason) = if needs_review {
            (
                RecommendedAction::HumanReview,
                format!(
                    "uncertainty {:.3} exceeds {:.3}",
                    uncertainty_score, c.uncertainty_threshold
                ),
            )
        } else if low_agreement {
            (
                RecommendedAction::HumanReview,
                format!("judge agreement {:.3} is below the minimum", consensus_strength),
            )
        } else if exceeds(risk, c.reject_risk) {
            (
                RecommendedAction::RejectHighRisk,
                format!("risk {:.3} exceeds {:.3}", risk, c.reject_risk),
            )
        } else if exceeds(risk, c.flag_risk) {
            (
                RecommendedAction::FlagForReview,
                format!("risk {:.3} exceeds {:.3}", risk, c.flag_risk),
            )
        } else {
            (RecommendedAction::Accept, format!("risk {:.3} is acceptable", risk))
        };

        Decision {
            action,
            needs_review,
            reason,
        }
    }
}
