//! Regeneration engine: rewrites a losing variant with a language model.
//!
//! Runs detached from the reward request that triggered it. The storage-held
//! advisory lock keeps at most one rewrite in flight per record; a timed-out
//! or failed call leaves the active slot untouched and releases the lock.
//!
//! API key: `LLM_API_KEY` in the environment. Without it the engine runs in
//! stub mode: triggers are acknowledged and skipped.

use crate::bandit::RegenCandidate;
use crate::config::CoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::guardrail::{ai_markers, Guardrail};
use crate::shared::{BehavioralVector, EngineMode, IdentityState, SlotLabel, VariantKey};
use crate::store::DocumentStore;
use scraper::Html;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

const LLM_API_BASE: &str = "https://openrouter.ai/api/v1";

// OpenAI-compatible request/response shapes.
#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Deserialize)]
struct ChatMessageResponse {
    content: String,
}

/// Thin client over an OpenAI-compatible chat-completions endpoint.
pub struct LlmBridge {
    api_key: String,
    model: String,
    base_url: String,
    client: reqwest::Client,
}

impl LlmBridge {
    /// Builds a bridge from `LLM_API_KEY`. Returns `None` when the key is
    /// missing or blank, which puts the engine in stub mode.
    pub fn from_env(config: &CoreConfig) -> Option<Self> {
        let key = std::env::var("LLM_API_KEY").ok()?.trim().to_string();
        if key.is_empty() {
            return None;
        }
        Some(Self::new(key, &config.llm_model, config.regen_deadline_ms))
    }

    pub fn new(api_key: String, model: &str, deadline_ms: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(deadline_ms))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            api_key: api_key.trim().to_string(),
            model: model.to_string(),
            base_url: LLM_API_BASE.to_string(),
            client,
        }
    }

    /// Points the bridge at a different endpoint (tests, self-hosted models).
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    /// Asks the model to rewrite the losing fragment. Returns the raw model
    /// output; the caller re-grafts the structural skeleton.
    pub async fn rewrite(
        &self,
        seed_html: &str,
        losing_html: &str,
        winning_html: &str,
        identity_state: IdentityState,
        vector: &BehavioralVector,
    ) -> CoreResult<String> {
        let system = "You rewrite small HTML fragments to improve engagement. \
            Output ONLY the rewritten fragment: same top-level tag as the original, \
            every data-ai-* attribute preserved, no script tags, no inline event \
            handlers, no commentary.";

        let user = format!(
            "Original author fragment:\n{seed_html}\n\n\
             Underperforming variant (rewrite this):\n{losing_html}\n\n\
             Outperforming variant (for contrast, do not copy verbatim):\n{winning_html}\n\n\
             Current visitor state: {}\nBehavioral vector: {}",
            identity_state.as_str(),
            serde_json::to_string(vector).unwrap_or_default(),
        );

        let url = format!("{}/chat/completions", self.base_url);
        let body = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user,
                },
            ],
            temperature: 0.7,
            max_tokens: 2_048,
        };

        let res = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| CoreError::Llm(format!("rewrite request failed: {e}")))?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(CoreError::Llm(format!("rewrite API error {status}: {body}")));
        }

        let parsed: ChatResponse = res
            .json()
            .await
            .map_err(|e| CoreError::Llm(format!("rewrite response parse failed: {e}")))?;

        let text = parsed
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .ok_or_else(|| CoreError::Llm("empty rewrite response".to_string()))?;

        Ok(strip_fences(&text))
    }
}

/// Models often wrap fragments in markdown fences; unwrap before grafting.
fn strip_fences(text: &str) -> String {
    let trimmed = text.trim();
    if let Some(inner) = trimmed.strip_prefix("```") {
        let inner = inner
            .strip_prefix("html")
            .or_else(|| inner.strip_prefix("HTML"))
            .unwrap_or(inner);
        if let Some(body) = inner.strip_suffix("```") {
            return body.trim().to_string();
        }
    }
    trimmed.to_string()
}

/// First top-level element of a fragment: `(tag, attrs, inner_html)`.
fn top_element(html: &str) -> Option<(String, Vec<(String, String)>, String)> {
    let fragment = Html::parse_fragment(html);
    let root = fragment.root_element();
    for child in root.children() {
        if let Some(element) = scraper::ElementRef::wrap(child) {
            let tag = element.value().name().to_string();
            let attrs = element
                .value()
                .attrs()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            return Some((tag, attrs, element.inner_html()));
        }
    }
    None
}

fn escape_attr(value: &str) -> String {
    value.replace('&', "&amp;").replace('"', "&quot;")
}

/// Deterministic post-processor: forces the candidate onto the seed's
/// structural skeleton. The result keeps the seed's top-level tag and carries
/// every `data-ai-*` attribute from the seed's root, with the candidate's
/// other root attributes and inner content preserved.
pub fn regraft_skeleton(seed_html: &str, candidate_html: &str) -> CoreResult<String> {
    let Some((seed_tag, seed_attrs, _)) = top_element(seed_html) else {
        // Seed has no element skeleton to preserve.
        return Ok(candidate_html.trim().to_string());
    };

    let (inner, candidate_attrs) = match top_element(candidate_html) {
        Some((_, attrs, inner)) => (inner, attrs),
        None => {
            let text = candidate_html.trim();
            if text.is_empty() {
                return Err(CoreError::Llm("empty rewrite output".to_string()));
            }
            (text.to_string(), Vec::new())
        }
    };

    let mut attrs: Vec<(String, String)> = Vec::new();
    for (k, v) in &candidate_attrs {
        if !k.starts_with("data-ai-") {
            attrs.push((k.clone(), v.clone()));
        }
    }
    // Seed markers win over whatever the model produced.
    for (k, v) in &seed_attrs {
        if k.starts_with("data-ai-") {
            attrs.push((k.clone(), v.clone()));
        }
    }

    let attr_text: String = attrs
        .iter()
        .map(|(k, v)| format!(" {}=\"{}\"", k, escape_attr(v)))
        .collect();
    Ok(format!("<{seed_tag}{attr_text}>{inner}</{seed_tag}>"))
}

/// Owns the rewrite loop; shared by reference from the orchestrator.
pub struct RegenerationEngine {
    store: Arc<DocumentStore>,
    guardrail: Guardrail,
    bridge: Option<Arc<LlmBridge>>,
    lock_ttl: Duration,
    deadline: Duration,
}

impl RegenerationEngine {
    pub fn new(store: Arc<DocumentStore>, config: &CoreConfig, bridge: Option<LlmBridge>) -> Self {
        Self {
            store,
            guardrail: Guardrail::from_config(config),
            bridge: bridge.map(Arc::new),
            lock_ttl: Duration::from_secs(config.regen_lock_ttl_secs),
            deadline: Duration::from_millis(config.regen_deadline_ms),
        }
    }

    /// Whether a live model backs the engine.
    pub fn mode(&self) -> EngineMode {
        if self.bridge.is_some() {
            EngineMode::MultiAgent
        } else {
            EngineMode::Stub
        }
    }

    /// Schedules a rewrite of the losing slot, detached from the caller.
    /// Returns immediately; the job coalesces with any in-flight rewrite of
    /// the same record via the advisory lock.
    pub fn spawn(
        self: &Arc<Self>,
        candidate: RegenCandidate,
        identity_state: IdentityState,
        vector: BehavioralVector,
    ) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = engine.run(&candidate, identity_state, &vector).await {
                tracing::warn!(
                    target: "morph::regen",
                    key = %candidate.key,
                    slot = candidate.loser.as_str(),
                    error = %e,
                    "regeneration failed; slot unchanged"
                );
            }
        });
    }

    async fn run(
        &self,
        candidate: &RegenCandidate,
        identity_state: IdentityState,
        vector: &BehavioralVector,
    ) -> CoreResult<()> {
        let key = &candidate.key;
        let Some(holder) = self.store.acquire_regen_lock(key, self.lock_ttl)? else {
            tracing::debug!(target: "morph::regen", %key, "rewrite already in flight; coalesced");
            return Ok(());
        };

        let result = self.rewrite_slot(key, candidate.loser, identity_state, vector).await;
        self.store.release_regen_lock(key, &holder)?;
        result
    }

    async fn rewrite_slot(
        &self,
        key: &VariantKey,
        loser: SlotLabel,
        identity_state: IdentityState,
        vector: &BehavioralVector,
    ) -> CoreResult<()> {
        let Some(bridge) = &self.bridge else {
            tracing::info!(target: "morph::regen", %key, "stub mode; rewrite skipped");
            return Ok(());
        };

        let record = self
            .store
            .get_variant(key)?
            .ok_or_else(|| CoreError::NotFound(format!("variant {key}")))?;
        let losing_html = record.slot(loser).current_html.clone();
        let winning_html = record.slot(loser.other()).current_html.clone();
        let seed_html = record.seed_html.clone();

        let raw = tokio::time::timeout(
            self.deadline,
            bridge.rewrite(&seed_html, &losing_html, &winning_html, identity_state, vector),
        )
        .await
        .map_err(|_| CoreError::Llm(format!("rewrite deadline {:?} exceeded", self.deadline)))??;

        let grafted = regraft_skeleton(&seed_html, &raw)?;
        let verdict = self.guardrail.check(&grafted, &seed_html);
        if let crate::guardrail::GuardrailVerdict::Reject { reason } = verdict {
            return Err(CoreError::Llm(format!("rewrite rejected by guardrail: {reason}")));
        }
        debug_assert!(ai_markers(&seed_html)
            .iter()
            .all(|m| ai_markers(&grafted).contains(m)));

        let updated = self.store.replace_variant_html(key, loser, &grafted)?;
        tracing::info!(
            target: "morph::regen",
            %key,
            slot = loser.as_str(),
            archived = updated.slot(loser).history.len(),
            "rewritten candidate installed"
        );
        Ok(())
    }
}
