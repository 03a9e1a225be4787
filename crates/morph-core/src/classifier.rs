//! Identity agent: deterministic mapping from a behavioral vector to one of
//! seven psychological states.
//!
//! The rule cascade below is the source of truth and covers every input. An
//! optional language-model hint can nudge confidence, never the state.

use crate::analytics::SessionSignals;
use crate::shared::{BehavioralVector, IdentityState};

/// Session duration (seconds) past which sustained hesitation without a
/// conversion reads as caution rather than noise.
const CAUTIOUS_SESSION_SECS: f64 = 120.0;

/// A classified state with its confidence in [0.5, 0.95].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Classification {
    pub state: IdentityState,
    pub confidence: f64,
}

/// The identity agent. Stateless and pure.
pub struct IdentityClassifier;

impl IdentityClassifier {
    /// Classifies a vector. Rules are checked highest-priority first; the
    /// first match wins, `exploratory` is the default.
    pub fn classify(vector: &BehavioralVector, signals: &SessionSignals) -> Classification {
        let v = vector;

        if v.decision_velocity >= 0.8 && v.hesitation_score <= 0.2 {
            return Self::scored(
                IdentityState::ImpulseBuyer,
                &[(v.decision_velocity, 0.8), (0.2, v.hesitation_score)],
            );
        }
        if v.decision_velocity >= 0.6 && signals.conversion_present {
            return Self::scored(IdentityState::ReadyToDecide, &[(v.decision_velocity, 0.6)]);
        }
        if v.decision_velocity >= 0.5 && v.exploration_score <= 0.4 {
            return Self::scored(
                IdentityState::Confident,
                &[(v.decision_velocity, 0.5), (0.4, v.exploration_score)],
            );
        }
        if v.hesitation_score >= 0.5 && v.content_focus_ratio <= 0.5 {
            return Self::scored(
                IdentityState::Overwhelmed,
                &[(v.hesitation_score, 0.5), (0.5, v.content_focus_ratio)],
            );
        }
        if v.hesitation_score >= 0.5
            && signals.session_duration_secs >= CAUTIOUS_SESSION_SECS
            && !signals.conversion_present
        {
            return Self::scored(IdentityState::Cautious, &[(v.hesitation_score, 0.5)]);
        }
        if v.engagement_depth >= 0.5 && signals.revisit_count >= 2 {
            return Self::scored(IdentityState::ComparisonFocused, &[(v.engagement_depth, 0.5)]);
        }

        Classification {
            state: IdentityState::Exploratory,
            confidence: 0.5,
        }
    }

    /// Confidence from the winning rule's margin over its thresholds: the
    /// tightest `(value, threshold)` distance, rescaled into [0.5, 0.95].
    fn scored(state: IdentityState, margins: &[(f64, f64)]) -> Classification {
        let margin = margins
            .iter()
            .map(|(value, threshold)| (value - threshold).max(0.0))
            .fold(f64::INFINITY, f64::min);
        let margin = if margin.is_finite() { margin } else { 0.0 };
        Classification {
            state,
            confidence: (0.5 + (margin / 0.5) * 0.45).clamp(0.5, 0.95),
        }
    }

    /// Optional refinement: an external hint (e.g. a model's read of the same
    /// window) that agrees with the deterministic state raises confidence.
    /// Disagreement is ignored; the cascade above decides.
    pub fn refine(classification: Classification, hint: Option<&str>) -> Classification {
        match hint {
            Some(h) if h == classification.state.as_str() => Classification {
                confidence: (classification.confidence + 0.1).min(0.95),
                ..classification
            },
            _ => classification,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vector(
        exploration: f64,
        hesitation: f64,
        engagement: f64,
        velocity: f64,
        focus: f64,
    ) -> BehavioralVector {
        BehavioralVector {
            exploration_score: exploration,
            hesitation_score: hesitation,
            engagement_depth: engagement,
            decision_velocity: velocity,
            content_focus_ratio: focus,
        }
    }

    #[test]
    fn neutral_vector_defaults_to_exploratory() {
        let c = IdentityClassifier::classify(
            &BehavioralVector::neutral(),
            &SessionSignals::default(),
        );
        assert_eq!(c.state, IdentityState::Exploratory);
        assert_eq!(c.confidence, 0.5);
    }

    #[test]
    fn fast_and_frictionless_is_impulse_buyer() {
        let c = IdentityClassifier::classify(
            &vector(0.5, 0.1, 0.5, 0.9, 0.5),
            &SessionSignals::default(),
        );
        assert_eq!(c.state, IdentityState::ImpulseBuyer);
        assert!(c.confidence > 0.5);
    }

    #[test]
    fn impulse_buyer_outranks_ready_to_decide() {
        let signals = SessionSignals {
            conversion_present: true,
            ..Default::default()
        };
        let c = IdentityClassifier::classify(&vector(0.5, 0.1, 0.5, 0.9, 0.5), &signals);
        assert_eq!(c.state, IdentityState::ImpulseBuyer);
    }

    #[test]
    fn conversion_signal_with_velocity_is_ready_to_decide() {
        let signals = SessionSignals {
            conversion_present: true,
            ..Default::default()
        };
        let c = IdentityClassifier::classify(&vector(0.5, 0.4, 0.5, 0.7, 0.5), &signals);
        assert_eq!(c.state, IdentityState::ReadyToDecide);
    }

    #[test]
    fn scattered_friction_is_overwhelmed() {
        let c = IdentityClassifier::classify(
            &vector(0.6, 0.7, 0.4, 0.3, 0.3),
            &SessionSignals::default(),
        );
        assert_eq!(c.state, IdentityState::Overwhelmed);
    }

    #[test]
    fn long_hesitant_session_without_conversion_is_cautious() {
        let signals = SessionSignals {
            conversion_present: false,
            session_duration_secs: 300.0,
            revisit_count: 0,
        };
        let c = IdentityClassifier::classify(&vector(0.6, 0.7, 0.4, 0.3, 0.8), &signals);
        assert_eq!(c.state, IdentityState::Cautious);
    }

    #[test]
    fn deep_revisits_are_comparison_focused() {
        let signals = SessionSignals {
            conversion_present: false,
            session_duration_secs: 60.0,
            revisit_count: 3,
        };
        let c = IdentityClassifier::classify(&vector(0.6, 0.2, 0.7, 0.3, 0.8), &signals);
        assert_eq!(c.state, IdentityState::ComparisonFocused);
    }

    #[test]
    fn confidence_stays_in_band() {
        let c = IdentityClassifier::classify(
            &vector(0.0, 0.0, 0.5, 1.0, 0.5),
            &SessionSignals::default(),
        );
        assert!(c.confidence >= 0.5 && c.confidence <= 0.95);
    }

    #[test]
    fn agreeing_hint_raises_confidence_only() {
        let base = IdentityClassifier::classify(
            &vector(0.5, 0.1, 0.5, 0.9, 0.5),
            &SessionSignals::default(),
        );
        let refined = IdentityClassifier::refine(base, Some("impulse_buyer"));
        assert_eq!(refined.state, base.state);
        assert!(refined.confidence >= base.confidence);

        let ignored = IdentityClassifier::refine(base, Some("cautious"));
        assert_eq!(ignored, base);
    }
}
