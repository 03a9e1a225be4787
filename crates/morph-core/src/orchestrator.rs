//! Request orchestrator: sequences identity resolution, ingestion, the
//! analytics/identity/decision/guardrail agents, and conditional
//! regeneration. All collaborators are explicit dependencies constructed at
//! startup and shared by reference; per-request state lives in
//! [`RequestContext`] and dies with the request.

use crate::analytics::BehavioralAggregator;
use crate::bandit::DecisionEngine;
use crate::classifier::IdentityClassifier;
use crate::config::CoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::events::{EventIngestor, IncomingEvent, IngestReport};
use crate::guardrail::{Guardrail, GuardrailVerdict};
use crate::identity::{IdentityInput, IdentityResolver};
use crate::regen::{LlmBridge, RegenerationEngine};
use crate::shared::{
    AuditEntry, BehavioralVector, EngineMode, EventRecord, IdentityState, RequestContext,
    ResolvedIdentity, SessionSnapshot, SlotLabel, UserRecord, VariantKey, VariantRecord,
};
use crate::store::DocumentStore;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Optimize-path input, already parsed off the wire.
#[derive(Debug, Clone, Default)]
pub struct OptimizeRequest {
    pub api_key: Option<String>,
    pub origin: Option<String>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub global_uid: Option<String>,
    pub component_id: String,
    /// The author's fragment to personalize.
    pub changing_html: String,
    /// Surrounding markup; recorded for context, not rewritten.
    pub context_html: Option<String>,
}

/// Optimize-path output (§wire: variant, markup, classification, audit).
#[derive(Debug, Clone, Serialize)]
pub struct OptimizeResponse {
    pub variant: SlotLabel,
    #[serde(rename = "changingHtml")]
    pub changing_html: String,
    pub identity_state: IdentityState,
    pub confidence: f64,
    pub behavioral_vector: BehavioralVector,
    pub audit_log: Vec<AuditEntry>,
    pub user_id: String,
    pub session_id: String,
    pub mode: EngineMode,
}

/// Reward-path input.
#[derive(Debug, Clone, Default)]
pub struct RewardRequest {
    pub api_key: Option<String>,
    pub origin: Option<String>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub variant: Option<SlotLabel>,
    /// Explicit scalar; wins over `reward_type` mapping.
    pub reward: Option<f64>,
    /// Named reward looked up in the configured reward map.
    pub reward_type: Option<String>,
    pub component_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentReward {
    pub component_id: String,
    pub new_score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RewardResponse {
    pub results: Vec<ComponentReward>,
    pub audit_log: Vec<AuditEntry>,
}

/// One user's events and variant records (admin journey view).
#[derive(Debug, Clone, Serialize)]
pub struct JourneySnapshot {
    pub user: Option<UserRecord>,
    pub events: Vec<EventRecord>,
    pub variants: Vec<VariantRecord>,
}

/// Tenant-level aggregates (admin dashboard view).
#[derive(Debug, Clone, Serialize)]
pub struct DashboardSummary {
    pub total_users: usize,
    pub event_counts: std::collections::HashMap<String, u64>,
    pub identity_states: std::collections::HashMap<String, u64>,
    pub variant_records: usize,
    pub total_trials: u64,
    pub mean_score_a: f64,
    pub mean_score_b: f64,
    pub monthly_events_used: u64,
    pub monthly_event_limit: u64,
    /// Sharing agreements this tenant appears in. Advisory metadata only;
    /// no behavioral data crosses tenant boundaries.
    pub sharing_agreements: usize,
}

/// The orchestrator. One instance per process, shared across requests.
pub struct Orchestrator {
    store: Arc<DocumentStore>,
    config: CoreConfig,
    ingestor: EventIngestor,
    decision: DecisionEngine,
    guardrail: Guardrail,
    regen: Arc<RegenerationEngine>,
}

impl Orchestrator {
    /// Wires the pipeline. `bridge` is the startup capability check: `None`
    /// runs the whole process in stub mode.
    pub fn new(store: Arc<DocumentStore>, config: CoreConfig, bridge: Option<LlmBridge>) -> Self {
        let ingestor = EventIngestor::new(Arc::clone(&store), &config);
        let decision = DecisionEngine::new(Arc::clone(&store), &config);
        let guardrail = Guardrail::from_config(&config);
        let regen = Arc::new(RegenerationEngine::new(Arc::clone(&store), &config, bridge));
        Self {
            store,
            config,
            ingestor,
            decision,
            guardrail,
            regen,
        }
    }

    pub fn mode(&self) -> EngineMode {
        self.regen.mode()
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<DocumentStore> {
        &self.store
    }

    pub fn ingestor(&self) -> &EventIngestor {
        &self.ingestor
    }

    // -------------------------------------------------------------------------
    // Optimize path
    // -------------------------------------------------------------------------

    /// Runs the optimize pipeline under the soft deadline. Authorization and
    /// validation errors propagate; everything downstream degrades to the
    /// best available markup with an audit entry.
    pub async fn optimize(&self, req: OptimizeRequest) -> CoreResult<OptimizeResponse> {
        let started = Instant::now();
        let deadline = Duration::from_millis(self.config.request_deadline_ms);
        let mut ctx = RequestContext::new();

        if req.component_id.trim().is_empty() {
            return Err(CoreError::Validation("missing component_id".to_string()));
        }
        if req.changing_html.trim().is_empty() {
            return Err(CoreError::Validation("missing changingHtml".to_string()));
        }
        if req.changing_html.len() > self.config.guardrail_max_bytes {
            return Err(CoreError::Validation("changingHtml exceeds size bound".to_string()));
        }

        let resolved = IdentityResolver::resolve(
            &self.store,
            IdentityInput {
                api_key: req.api_key.as_deref(),
                origin: req.origin.as_deref(),
                user_id: req.user_id.as_deref(),
                session_id: req.session_id.as_deref(),
                global_uid: req.global_uid.as_deref(),
            },
        )?;
        ctx.resolved = Some(resolved.clone());
        ctx.audit(
            "identity",
            format!(
                "tenant {} user {}{}",
                resolved.business.business_id,
                resolved.user_id,
                if resolved.minted_user { " (minted)" } else { "" }
            ),
        );

        let key = VariantKey::new(
            &resolved.business.business_id,
            &resolved.user_id,
            &req.component_id,
        );
        let seed = req.changing_html.clone();

        if started.elapsed() >= deadline {
            return Ok(self.degraded(ctx, resolved, key, seed, "deadline_exceeded"));
        }

        // Context event; quota exhaustion degrades the stage, not the request.
        match self.ingestor.ingest_now(
            &resolved,
            IncomingEvent {
                event_name: "component_viewed".to_string(),
                component_id: Some(req.component_id.clone()),
                properties: Default::default(),
                timestamp: None,
            },
        ) {
            Ok(()) => ctx.audit("ingest", "component_viewed recorded"),
            Err(e) => ctx.audit("ingest", format!("degraded: {e}")),
        }

        if started.elapsed() >= deadline {
            return Ok(self.degraded(ctx, resolved, key, seed, "deadline_exceeded"));
        }

        let events = match self.store.recent_events(
            &resolved.business.business_id,
            &resolved.user_id,
            self.config.event_limit,
            Duration::from_secs(self.config.event_window_secs),
        ) {
            Ok(events) => events,
            Err(e) => {
                ctx.audit("analytics", format!("degraded: {e}"));
                Vec::new()
            }
        };
        let (vector, signals) = BehavioralAggregator::aggregate(&events);
        ctx.behavioral_vector = vector;
        ctx.audit("analytics", format!("{} events folded", events.len()));

        let classification = IdentityClassifier::classify(&vector, &signals);
        ctx.identity_state = classification.state;
        ctx.confidence = classification.confidence;
        ctx.audit(
            "identity_state",
            format!(
                "{} ({:.2})",
                classification.state.as_str(),
                classification.confidence
            ),
        );

        if started.elapsed() >= deadline {
            return Ok(self.degraded(ctx, resolved, key, seed, "deadline_exceeded"));
        }

        let record = match self.store.get_or_init_variant(&key, &seed) {
            Ok(record) => record,
            Err(e) => {
                ctx.audit("decision", format!("degraded: {e}"));
                return Ok(self.degraded(ctx, resolved, key, seed, "storage_degraded"));
            }
        };
        let (label, explored) = self.decision.choose(&record);
        ctx.audit(
            "decision",
            format!(
                "slot {} ({})",
                label.as_str(),
                if explored { "explore" } else { "exploit" }
            ),
        );

        // Guardrail gates the trial count: a rejected candidate is never
        // counted as served.
        let (final_label, final_html, counted) = self.gate(&mut ctx, &record, label, &seed);
        if counted {
            if let Err(e) = self.decision.count_trial(&key, final_label) {
                ctx.audit("decision", format!("trial count degraded: {e}"));
            }
        }
        ctx.selected_slot = Some(final_label);

        let snapshot = SessionSnapshot {
            session_id: resolved.session_id.clone(),
            identity_state: ctx.identity_state,
            identity_confidence: ctx.confidence,
            behavioral_vector: ctx.behavioral_vector,
        };
        if let Err(e) = self.store.upsert_user_session(
            &resolved.business.business_id,
            &resolved.user_id,
            snapshot,
            Some(final_html.clone()),
        ) {
            ctx.audit("session", format!("snapshot skipped: {e}"));
        }

        Ok(OptimizeResponse {
            variant: final_label,
            changing_html: final_html,
            identity_state: ctx.identity_state,
            confidence: ctx.confidence,
            behavioral_vector: ctx.behavioral_vector,
            audit_log: ctx.audit_log,
            user_id: resolved.user_id,
            session_id: resolved.session_id,
            mode: self.mode(),
        })
    }

    /// Guardrail stage: approve the chosen slot, else the other, else the
    /// seed. Returns `(label, html, count_trial)`.
    fn gate(
        &self,
        ctx: &mut RequestContext,
        record: &VariantRecord,
        label: SlotLabel,
        seed: &str,
    ) -> (SlotLabel, String, bool) {
        let chosen = &record.slot(label).current_html;
        match self.guardrail.check(chosen, seed) {
            GuardrailVerdict::Approve => {
                ctx.audit("guardrail", "approved");
                (label, chosen.clone(), true)
            }
            GuardrailVerdict::Reject { reason } => {
                ctx.audit("guardrail", format!("slot {} rejected: {reason}", label.as_str()));
                let other = label.other();
                let fallback = &record.slot(other).current_html;
                match self.guardrail.check(fallback, seed) {
                    GuardrailVerdict::Approve => {
                        ctx.audit("guardrail", format!("fell back to slot {}", other.as_str()));
                        (other, fallback.clone(), true)
                    }
                    GuardrailVerdict::Reject { reason } => {
                        ctx.audit(
                            "guardrail",
                            format!("slot {} rejected: {reason}; serving seed", other.as_str()),
                        );
                        (label, seed.to_string(), false)
                    }
                }
            }
        }
    }

    /// Deadline/storage degradation: best available markup, no trial counted.
    fn degraded(
        &self,
        mut ctx: RequestContext,
        resolved: ResolvedIdentity,
        key: VariantKey,
        seed: String,
        reason: &str,
    ) -> OptimizeResponse {
        let (label, html) = match self.store.get_variant(&key) {
            Ok(Some(record)) => {
                let label = record.leader();
                (label, record.slot(label).current_html.clone())
            }
            _ => (SlotLabel::A, seed),
        };
        ctx.audit(reason, format!("served slot {} without trial", label.as_str()));
        OptimizeResponse {
            variant: label,
            changing_html: html,
            identity_state: ctx.identity_state,
            confidence: ctx.confidence,
            behavioral_vector: ctx.behavioral_vector,
            audit_log: ctx.audit_log,
            user_id: resolved.user_id,
            session_id: resolved.session_id,
            mode: self.mode(),
        }
    }

    // -------------------------------------------------------------------------
    // Reward path
    // -------------------------------------------------------------------------

    /// Applies a reward to each named component's record and schedules
    /// regeneration where the score gap demands it. Returns after the score
    /// writes commit; rewrites run detached.
    pub async fn reward(&self, req: RewardRequest) -> CoreResult<RewardResponse> {
        let mut ctx = RequestContext::new();

        let label = req
            .variant
            .ok_or_else(|| CoreError::Validation("missing variantAttributed".to_string()))?;
        if req.component_ids.is_empty() {
            return Err(CoreError::Validation("missing component_ids".to_string()));
        }
        let user_id = req
            .user_id
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .ok_or_else(|| CoreError::Validation("missing user_id".to_string()))?
            .to_string();

        let resolved = IdentityResolver::resolve(
            &self.store,
            IdentityInput {
                api_key: req.api_key.as_deref(),
                origin: req.origin.as_deref(),
                user_id: Some(&user_id),
                session_id: req.session_id.as_deref(),
                global_uid: None,
            },
        )?;
        ctx.audit("identity", format!("tenant {}", resolved.business.business_id));

        let reward = match req.reward {
            Some(r) => r,
            None => self
                .config
                .reward_for(req.reward_type.as_deref().unwrap_or("click")),
        };

        // The regeneration prompt wants the visitor's last known posture.
        let (identity_state, vector) = self
            .store
            .get_user(&resolved.business.business_id, &user_id)
            .ok()
            .flatten()
            .and_then(|u| u.last_session)
            .map(|s| (s.identity_state, s.behavioral_vector))
            .unwrap_or((IdentityState::Exploratory, BehavioralVector::neutral()));

        let mut results = Vec::with_capacity(req.component_ids.len());
        for component_id in &req.component_ids {
            let key = VariantKey::new(&resolved.business.business_id, &user_id, component_id);
            let updated = self.decision.apply_reward(&key, label, reward)?;
            let new_score = updated.slot(label).current_score;
            ctx.audit(
                "decision",
                format!("{component_id}: slot {} -> {:.3}", label.as_str(), new_score),
            );
            results.push(ComponentReward {
                component_id: component_id.clone(),
                new_score,
            });

            if let Some(candidate) = self.decision.regeneration_check(&key, &updated) {
                ctx.audit(
                    "regeneration",
                    format!("{component_id}: slot {} scheduled", candidate.loser.as_str()),
                );
                self.regen.spawn(candidate, identity_state, vector);
            }
        }

        Ok(RewardResponse {
            results,
            audit_log: ctx.audit_log,
        })
    }

    // -------------------------------------------------------------------------
    // Ingest, sync, and admin surfaces
    // -------------------------------------------------------------------------

    /// Resolves identity and ingests a client batch.
    pub fn ingest_events(
        &self,
        api_key: Option<&str>,
        origin: Option<&str>,
        user_id: Option<&str>,
        session_id: Option<&str>,
        events: Vec<IncomingEvent>,
    ) -> CoreResult<IngestReport> {
        let resolved = IdentityResolver::resolve(
            &self.store,
            IdentityInput {
                api_key,
                origin,
                user_id,
                session_id,
                global_uid: None,
            },
        )?;
        self.ingestor.ingest(&resolved, events)
    }

    /// Links a local user to a cross-site identity.
    pub fn link_global_user(
        &self,
        api_key: Option<&str>,
        origin: Option<&str>,
        user_id: &str,
        global_uid: &str,
    ) -> CoreResult<crate::shared::GlobalUser> {
        let resolved = IdentityResolver::resolve(
            &self.store,
            IdentityInput {
                api_key,
                origin,
                user_id: Some(user_id),
                session_id: None,
                global_uid: Some(global_uid),
            },
        )?;
        self.store
            .link_global_user(global_uid, &resolved.business.business_id, &resolved.user_id)
    }

    /// Tenant roster (admin).
    pub fn users_all(&self, api_key: Option<&str>, origin: Option<&str>) -> CoreResult<Vec<UserRecord>> {
        let resolved = self.resolve_admin(api_key, origin)?;
        self.store.list_users(&resolved.business.business_id)
    }

    /// One user's events and variants (admin).
    pub fn user_journey(
        &self,
        api_key: Option<&str>,
        origin: Option<&str>,
        user_id: &str,
    ) -> CoreResult<JourneySnapshot> {
        let resolved = self.resolve_admin(api_key, origin)?;
        let business_id = &resolved.business.business_id;
        Ok(JourneySnapshot {
            user: self.store.get_user(business_id, user_id)?,
            events: self.store.events_for_user(business_id, user_id)?,
            variants: self.store.variants_for_user(business_id, user_id)?,
        })
    }

    /// Tenant aggregates (admin).
    pub fn dashboard(&self, api_key: Option<&str>, origin: Option<&str>) -> CoreResult<DashboardSummary> {
        let resolved = self.resolve_admin(api_key, origin)?;
        let business_id = &resolved.business.business_id;

        let users = self.store.list_users(business_id)?;
        let mut identity_states: std::collections::HashMap<String, u64> = Default::default();
        for user in &users {
            if let Some(session) = &user.last_session {
                *identity_states
                    .entry(session.identity_state.as_str().to_string())
                    .or_insert(0) += 1;
            }
        }

        let variants = self.store.variants_for_business(business_id)?;
        let mut total_trials = 0u64;
        let (mut sum_a, mut sum_b) = (0.0, 0.0);
        for record in &variants {
            total_trials +=
                record.variants.a.number_of_trials + record.variants.b.number_of_trials;
            sum_a += record.variants.a.current_score;
            sum_b += record.variants.b.current_score;
        }
        let denom = variants.len().max(1) as f64;

        Ok(DashboardSummary {
            total_users: users.len(),
            event_counts: self.store.event_counts(business_id)?,
            identity_states,
            variant_records: variants.len(),
            total_trials,
            mean_score_a: sum_a / denom,
            mean_score_b: sum_b / denom,
            monthly_events_used: resolved.business.monthly_events_used,
            monthly_event_limit: resolved.business.monthly_event_limit,
            sharing_agreements: self.store.agreements_for(business_id)?.len(),
        })
    }

    fn resolve_admin(
        &self,
        api_key: Option<&str>,
        origin: Option<&str>,
    ) -> CoreResult<ResolvedIdentity> {
        IdentityResolver::resolve(
            &self.store,
            IdentityInput {
                api_key,
                origin,
                // Admin reads are tenant-scoped; no user identity involved.
                user_id: Some("admin"),
                session_id: None,
                global_uid: None,
            },
        )
    }
}
