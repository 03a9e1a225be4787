//! Analytics agent: folds a user's recent event stream into the
//! five-component behavioral vector.
//!
//! The fold is pure given its input window. Every component falls back to the
//! neutral 0.5 when its signal is absent, so an empty window yields the
//! all-neutral vector.

use crate::shared::{BehavioralVector, EventRecord};
use chrono::{DateTime, Utc};

/// Event names that count as explicit conversion signals.
pub const CONVERSION_EVENTS: &[&str] = &["click", "add_to_cart", "purchase", "checkout_start"];

/// Per-event cap on `time_on_component` so one long dwell cannot saturate
/// engagement on its own.
const DWELL_CAP_MS: f64 = 30_000.0;

/// Median view-to-action gap (seconds) at which decision velocity reaches zero.
const VELOCITY_FLOOR_SECS: f64 = 30.0;

/// Session-level facts derived alongside the vector, consumed by the
/// identity classifier.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionSignals {
    /// An explicit conversion event is present in the window.
    pub conversion_present: bool,
    /// Elapsed time between the oldest and newest event in the window.
    pub session_duration_secs: f64,
    /// Components viewed more than once (revisits).
    pub revisit_count: u64,
}

/// The analytics agent. Stateless; one call per optimize request.
pub struct BehavioralAggregator;

impl BehavioralAggregator {
    /// Folds the window into `(vector, signals)`. `events` may arrive in any
    /// order; the fold sorts them oldest-first. Tolerant of the best-effort
    /// reordering window: ordering only matters at whole-second granularity.
    pub fn aggregate(events: &[EventRecord]) -> (BehavioralVector, SessionSignals) {
        if events.is_empty() {
            return (BehavioralVector::neutral(), SessionSignals::default());
        }

        let mut ordered: Vec<&EventRecord> = events.iter().collect();
        ordered.sort_by_key(|e| e.timestamp);

        let first = ordered[0].timestamp;
        let last = ordered[ordered.len() - 1].timestamp;
        let elapsed_ms = (last - first).num_milliseconds().max(0) as f64;

        let mut vector = BehavioralVector {
            exploration_score: Self::exploration(&ordered),
            hesitation_score: Self::hesitation(&ordered),
            engagement_depth: Self::engagement(&ordered, elapsed_ms),
            decision_velocity: Self::velocity(&ordered),
            content_focus_ratio: Self::focus(&ordered, elapsed_ms),
        };
        vector.clamp();

        let signals = SessionSignals {
            conversion_present: ordered
                .iter()
                .any(|e| CONVERSION_EVENTS.contains(&e.event_name.as_str())),
            session_duration_secs: elapsed_ms / 1_000.0,
            revisit_count: Self::revisits(&ordered),
        };

        (vector, signals)
    }

    /// Unique components viewed over total component views.
    fn exploration(events: &[&EventRecord]) -> f64 {
        let views: Vec<&str> = events
            .iter()
            .filter(|e| e.event_name == "component_viewed")
            .filter_map(|e| e.component_id.as_deref())
            .collect();
        if views.is_empty() {
            return 0.5;
        }
        let unique: std::collections::HashSet<&str> = views.iter().copied().collect();
        (unique.len() as f64 / views.len() as f64).clamp(0.0, 1.0)
    }

    /// Weighted friction count, saturating toward 1. Coalesced events weigh
    /// by their folded occurrence count.
    fn hesitation(events: &[&EventRecord]) -> f64 {
        let signal_present = events.iter().any(|e| {
            e.event_name.starts_with("mouse_")
                || e.event_name.starts_with("scroll_")
                || e.event_name.starts_with("hover")
        });
        if !signal_present {
            return 0.5;
        }
        let mut weighted = 0.0;
        for e in events {
            let multiplier = e.prop_f64("coalesced_count").unwrap_or(1.0).max(1.0);
            let weight = match e.event_name.as_str() {
                "mouse_hesitation" => 1.0,
                "mouse_idle_start" => 0.6,
                "scroll_direction_change" => 0.4,
                "hover" if e.prop_f64("duration_ms").unwrap_or(0.0) >= 2_000.0 => 0.8,
                _ => 0.0,
            };
            weighted += weight * multiplier;
        }
        (weighted / 8.0).clamp(0.0, 1.0)
    }

    /// Capped aggregate dwell over elapsed session time.
    fn engagement(events: &[&EventRecord], elapsed_ms: f64) -> f64 {
        let dwell: f64 = events
            .iter()
            .filter(|e| e.event_name == "time_on_component")
            .filter_map(|e| e.prop_f64("duration_ms"))
            .map(|d| d.min(DWELL_CAP_MS))
            .sum();
        if dwell <= 0.0 || elapsed_ms <= 0.0 {
            return 0.5;
        }
        (dwell / elapsed_ms).clamp(0.0, 1.0)
    }

    /// Inverse of the median gap between viewing a component and the first
    /// subsequent conversion-shaped action.
    fn velocity(events: &[&EventRecord]) -> f64 {
        let mut gaps: Vec<f64> = Vec::new();
        for (i, e) in events.iter().enumerate() {
            if e.event_name != "component_viewed" {
                continue;
            }
            if let Some(action) = events[i + 1..]
                .iter()
                .find(|n| matches!(n.event_name.as_str(), "click" | "add_to_cart"))
            {
                let gap = (action.timestamp - e.timestamp).num_milliseconds().max(0) as f64 / 1_000.0;
                gaps.push(gap);
            }
        }
        if gaps.is_empty() {
            return 0.5;
        }
        gaps.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let median = gaps[gaps.len() / 2];
        (1.0 - median / VELOCITY_FLOOR_SECS).clamp(0.0, 1.0)
    }

    /// 1 minus direction churn and tab-hidden fraction.
    fn focus(events: &[&EventRecord], elapsed_ms: f64) -> f64 {
        let has_scroll = events.iter().any(|e| e.event_name.starts_with("scroll_"));
        let has_visibility = events
            .iter()
            .any(|e| matches!(e.event_name.as_str(), "tab_hidden" | "tab_visible"));
        if !has_scroll && !has_visibility {
            return 0.5;
        }

        let direction_changes: f64 = events
            .iter()
            .filter(|e| e.event_name == "scroll_direction_change")
            .map(|e| e.prop_f64("coalesced_count").unwrap_or(1.0).max(1.0))
            .sum();
        let change_rate = direction_changes / events.len() as f64;

        let hidden_ms: f64 = events
            .iter()
            .filter(|e| e.event_name == "tab_hidden")
            .filter_map(|e| e.prop_f64("duration_ms"))
            .sum();
        let hidden_fraction = if elapsed_ms > 0.0 {
            hidden_ms / elapsed_ms
        } else {
            0.0
        };

        (1.0 - (change_rate + hidden_fraction)).clamp(0.0, 1.0)
    }

    fn revisits(events: &[&EventRecord]) -> u64 {
        let mut views: std::collections::HashMap<&str, u64> = std::collections::HashMap::new();
        for e in events {
            if e.event_name == "component_viewed" {
                if let Some(cid) = e.component_id.as_deref() {
                    *views.entry(cid).or_insert(0) += 1;
                }
            }
        }
        views.values().filter(|&&n| n >= 2).count() as u64
    }
}

/// Builds an event for tests and the orchestrator's synthetic context event.
pub fn synthetic_event(
    business_id: &str,
    user_id: &str,
    session_id: &str,
    event_name: &str,
    component_id: Option<&str>,
    timestamp: DateTime<Utc>,
) -> EventRecord {
    EventRecord {
        business_id: business_id.to_string(),
        user_id: user_id.to_string(),
        session_id: session_id.to_string(),
        global_uid: None,
        event_name: event_name.to_string(),
        component_id: component_id.map(str::to_string),
        properties: Default::default(),
        timestamp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn ev(name: &str, component: Option<&str>, offset_secs: i64) -> EventRecord {
        synthetic_event(
            "biz",
            "user",
            "sess",
            name,
            component,
            Utc::now() + Duration::seconds(offset_secs),
        )
    }

    #[test]
    fn empty_window_is_all_neutral() {
        let (vector, signals) = BehavioralAggregator::aggregate(&[]);
        assert_eq!(vector, BehavioralVector::neutral());
        assert!(!signals.conversion_present);
        assert_eq!(signals.revisit_count, 0);
    }

    #[test]
    fn exploration_is_unique_over_total_views() {
        let events = vec![
            ev("component_viewed", Some("hero"), 0),
            ev("component_viewed", Some("hero"), 1),
            ev("component_viewed", Some("pricing"), 2),
            ev("component_viewed", Some("faq"), 3),
        ];
        let (vector, signals) = BehavioralAggregator::aggregate(&events);
        assert!((vector.exploration_score - 0.75).abs() < 1e-9);
        assert_eq!(signals.revisit_count, 1);
    }

    #[test]
    fn fast_view_to_click_maxes_velocity() {
        let events = vec![
            ev("component_viewed", Some("hero"), 0),
            ev("click", Some("hero"), 1),
        ];
        let (vector, signals) = BehavioralAggregator::aggregate(&events);
        assert!(vector.decision_velocity > 0.9);
        assert!(signals.conversion_present);
    }

    #[test]
    fn coalesced_hesitation_counts_every_occurrence() {
        let mut burst = ev("mouse_hesitation", None, 0);
        burst
            .properties
            .insert("coalesced_count".to_string(), serde_json::Value::from(8));
        let events = vec![burst, ev("component_viewed", Some("hero"), 1)];
        let (vector, _) = BehavioralAggregator::aggregate(&events);
        assert_eq!(vector.hesitation_score, 1.0);
    }

    #[test]
    fn no_pointer_signal_keeps_hesitation_neutral() {
        let events = vec![
            ev("component_viewed", Some("hero"), 0),
            ev("click", Some("hero"), 5),
        ];
        let (vector, _) = BehavioralAggregator::aggregate(&events);
        assert_eq!(vector.hesitation_score, 0.5);
    }
}
