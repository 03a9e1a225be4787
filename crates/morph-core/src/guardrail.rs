//! Guardrail agent: content-policy gate on candidate markup.
//!
//! Pure function over `(candidate, seed)`. A rejection never reaches the
//! client as an error; the orchestrator substitutes the other slot or the
//! seed and the rejection lands in the audit trail. Rejections do not count
//! trials.

use crate::config::CoreConfig;
use regex::RegexSet;
use scraper::Html;
use std::collections::HashSet;

/// Outcome of a guardrail check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardrailVerdict {
    Approve,
    Reject { reason: String },
}

impl GuardrailVerdict {
    #[inline]
    pub fn approved(&self) -> bool {
        matches!(self, Self::Approve)
    }
}

/// Configured policy checks for candidate markup.
#[derive(Debug, Clone)]
pub struct Guardrail {
    max_bytes: usize,
    /// Configured phrases, kept for rejection messages.
    blocked_phrases: Vec<String>,
    /// The phrases compiled into one case-insensitive matcher.
    phrase_set: RegexSet,
    /// Event-handler attributes tolerated despite the general ban.
    allowed_handlers: HashSet<String>,
}

impl Guardrail {
    pub fn from_config(config: &CoreConfig) -> Self {
        let patterns: Vec<String> = config
            .blocked_phrases
            .iter()
            .map(|p| format!("(?i){}", regex::escape(p)))
            .collect();
        Self {
            max_bytes: config.guardrail_max_bytes,
            blocked_phrases: config.blocked_phrases.clone(),
            // Phrases are escaped, so the set always builds; an empty set
            // matches nothing.
            phrase_set: RegexSet::new(&patterns).unwrap_or_else(|_| RegexSet::empty()),
            allowed_handlers: HashSet::new(),
        }
    }

    /// Checks a candidate against the policy. `seed` supplies the required
    /// `data-ai-*` markers the client depends on.
    pub fn check(&self, candidate: &str, seed: &str) -> GuardrailVerdict {
        if candidate.len() > self.max_bytes {
            return GuardrailVerdict::Reject {
                reason: format!(
                    "markup size {} exceeds bound {}",
                    candidate.len(),
                    self.max_bytes
                ),
            };
        }

        if let Some(hit) = self.phrase_set.matches(candidate).iter().next() {
            let phrase = self
                .blocked_phrases
                .get(hit)
                .map(String::as_str)
                .unwrap_or("policy phrase");
            return GuardrailVerdict::Reject {
                reason: format!("flagged phrase: {phrase:?}"),
            };
        }

        let fragment = Html::parse_fragment(candidate);
        for node in fragment.root_element().descendants() {
            let Some(element) = scraper::ElementRef::wrap(node) else {
                continue;
            };
            let name = element.value().name();
            if name.eq_ignore_ascii_case("script") {
                return GuardrailVerdict::Reject {
                    reason: "script element".to_string(),
                };
            }
            for (attr, _) in element.value().attrs() {
                if attr.starts_with("on") && !self.allowed_handlers.contains(attr) {
                    return GuardrailVerdict::Reject {
                        reason: format!("event handler attribute {attr:?}"),
                    };
                }
            }
        }

        let required = ai_markers(seed);
        if !required.is_empty() {
            let present = ai_markers(candidate);
            for marker in &required {
                if !present.contains(marker) {
                    return GuardrailVerdict::Reject {
                        reason: format!("stripped marker {marker:?}"),
                    };
                }
            }
        }

        GuardrailVerdict::Approve
    }
}

/// All `data-ai-*` attribute names present anywhere in a fragment.
pub fn ai_markers(html: &str) -> HashSet<String> {
    let fragment = Html::parse_fragment(html);
    let mut markers = HashSet::new();
    for node in fragment.root_element().descendants() {
        let Some(element) = scraper::ElementRef::wrap(node) else {
            continue;
        };
        for (attr, _) in element.value().attrs() {
            if attr.starts_with("data-ai-") {
                markers.insert(attr.to_string());
            }
        }
    }
    markers
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guardrail() -> Guardrail {
        Guardrail::from_config(&CoreConfig::default())
    }

    #[test]
    fn plain_fragment_passes() {
        let verdict = guardrail().check("<h1>Welcome</h1>", "<h1>Welcome</h1>");
        assert!(verdict.approved());
    }

    #[test]
    fn script_is_rejected() {
        let verdict = guardrail().check("<div><script>alert(1)</script></div>", "<div></div>");
        assert!(!verdict.approved());
    }

    #[test]
    fn inline_handler_is_rejected() {
        let verdict = guardrail().check(r#"<button onclick="go()">Buy</button>"#, "<button></button>");
        assert!(!verdict.approved());
    }

    #[test]
    fn oversize_markup_is_rejected() {
        let big = format!("<div>{}</div>", "x".repeat(70_000));
        let verdict = guardrail().check(&big, "<div></div>");
        assert!(!verdict.approved());
    }

    #[test]
    fn stripped_marker_is_rejected() {
        let seed = r#"<div data-ai-component="hero">Hi</div>"#;
        let verdict = guardrail().check("<div>Hi</div>", seed);
        assert!(matches!(
            verdict,
            GuardrailVerdict::Reject { ref reason } if reason.contains("data-ai-component")
        ));
    }

    #[test]
    fn preserved_marker_passes() {
        let seed = r#"<div data-ai-component="hero">Hi</div>"#;
        let candidate = r#"<div data-ai-component="hero"><strong>Hi there</strong></div>"#;
        assert!(guardrail().check(candidate, seed).approved());
    }

    #[test]
    fn flagged_phrase_is_rejected() {
        let verdict = guardrail().check("<p>Guaranteed Results or your money back</p>", "<p></p>");
        assert!(!verdict.approved());
    }
}
