//! Shared types used across the morph crates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Separator byte for composite storage keys. Opaque ids are UUID strings and
/// never contain NUL, so the encoding is unambiguous.
pub const KEY_SEP: u8 = 0x00;

// -----------------------------------------------------------------------------
// Tenant & identity
// -----------------------------------------------------------------------------

/// A registered tenant. Immutable after registration except for the event
/// counters and the partner list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Business {
    /// Unique tenant identifier.
    pub business_id: String,
    /// Unique API key presented in `X-API-Key`.
    pub api_key: String,
    /// Origins allowed to call on behalf of this tenant. Empty = any origin.
    #[serde(default)]
    pub allowed_domains: Vec<String>,
    /// Billing tier label (e.g. "free", "growth"). Advisory only in the core.
    #[serde(default)]
    pub tier: String,
    /// Partner tenants in the sharing graph. Symmetry lives at the agreement level.
    #[serde(default)]
    pub partner_ids: Vec<String>,
    /// Monthly ingest ceiling.
    #[serde(default = "default_event_limit")]
    pub monthly_event_limit: u64,
    /// Events accepted this month. Never exceeds `monthly_event_limit`.
    #[serde(default)]
    pub monthly_events_used: u64,
}

fn default_event_limit() -> u64 {
    100_000
}

impl Business {
    /// Remaining ingest budget for this month.
    #[inline]
    pub fn quota_remaining(&self) -> u64 {
        self.monthly_event_limit
            .saturating_sub(self.monthly_events_used)
    }

    /// True when `origin` may call on behalf of this tenant. Matches the
    /// origin's host exactly or as a subdomain of an allowed domain.
    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        if self.allowed_domains.is_empty() {
            return true;
        }
        let Some(origin) = origin else {
            return false;
        };
        let host = origin.split("://").nth(1).unwrap_or(origin);
        let host = host.split(['/', ':']).next().unwrap_or(host);
        self.allowed_domains
            .iter()
            .any(|d| host == d.as_str() || host.ends_with(&format!(".{d}")))
    }
}

/// A cross-site user identity. Membership is append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalUser {
    pub global_uid: String,
    /// (tenant, local user) pairs this identity has been seen under.
    #[serde(default)]
    pub business_uids: Vec<Membership>,
}

/// One (tenant, local user) membership of a [`GlobalUser`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub business_id: String,
    pub user_id: String,
}

/// Result of identity resolution for one request.
#[derive(Debug, Clone)]
pub struct ResolvedIdentity {
    pub business: Business,
    pub user_id: String,
    pub session_id: String,
    pub global_uid: Option<String>,
    /// True when `user_id` was minted server-side on this call.
    pub minted_user: bool,
}

/// Tenant-scoped user record. `(business_id, user_id)` is unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub business_id: String,
    pub user_id: String,
    /// Snapshot of the most recent session's classification.
    #[serde(default)]
    pub last_session: Option<SessionSnapshot>,
    /// Most recently rendered markup, kept for admin preview.
    #[serde(default)]
    pub last_html: Option<String>,
}

/// Embedded session snapshot on a [`UserRecord`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub identity_state: IdentityState,
    pub identity_confidence: f64,
    pub behavioral_vector: BehavioralVector,
}

// -----------------------------------------------------------------------------
// Events
// -----------------------------------------------------------------------------

/// One behavioral event. Append-only; ordered by `timestamp` within a
/// `(business_id, user_id, session_id)` with insertion-order tiebreak.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub business_id: String,
    pub user_id: String,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_uid: Option<String>,
    pub event_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component_id: Option<String>,
    /// Free-form payload. Coalesced high-frequency events carry
    /// `coalesced_count` here.
    #[serde(default)]
    pub properties: HashMap<String, serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl EventRecord {
    /// Serializes to JSON bytes for storage.
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Deserializes from JSON bytes.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice(bytes).ok()
    }

    /// Numeric property accessor (`duration_ms`, `coalesced_count`, ...).
    pub fn prop_f64(&self, key: &str) -> Option<f64> {
        self.properties.get(key).and_then(|v| v.as_f64())
    }
}

// -----------------------------------------------------------------------------
// Behavioral vector & identity states
// -----------------------------------------------------------------------------

/// Five-component summary of a user's recent activity. Every component is in
/// [0, 1]; 0.5 is the neutral fallback when a component's signal is absent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BehavioralVector {
    /// Breadth of interest: unique components viewed vs total views.
    pub exploration_score: f64,
    /// Decision friction: weighted hesitation/idle/direction-change activity.
    pub hesitation_score: f64,
    /// Attention: time on components vs elapsed session time.
    pub engagement_depth: f64,
    /// Speed from viewing a component to acting on it.
    pub decision_velocity: f64,
    /// Focus vs scatter: inverse of direction churn and tab-hidden time.
    pub content_focus_ratio: f64,
}

impl BehavioralVector {
    /// The all-neutral vector used when there is no usable signal.
    pub fn neutral() -> Self {
        Self {
            exploration_score: 0.5,
            hesitation_score: 0.5,
            engagement_depth: 0.5,
            decision_velocity: 0.5,
            content_focus_ratio: 0.5,
        }
    }

    /// Clamps all components to [0, 1].
    pub fn clamp(&mut self) {
        self.exploration_score = self.exploration_score.clamp(0.0, 1.0);
        self.hesitation_score = self.hesitation_score.clamp(0.0, 1.0);
        self.engagement_depth = self.engagement_depth.clamp(0.0, 1.0);
        self.decision_velocity = self.decision_velocity.clamp(0.0, 1.0);
        self.content_focus_ratio = self.content_focus_ratio.clamp(0.0, 1.0);
    }
}

impl Default for BehavioralVector {
    fn default() -> Self {
        Self::neutral()
    }
}

/// One of seven labels summarizing the user's current behavioral posture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityState {
    Confident,
    Exploratory,
    Overwhelmed,
    ComparisonFocused,
    ReadyToDecide,
    Cautious,
    ImpulseBuyer,
}

impl IdentityState {
    /// Wire label (snake_case, matches the serde encoding).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Confident => "confident",
            Self::Exploratory => "exploratory",
            Self::Overwhelmed => "overwhelmed",
            Self::ComparisonFocused => "comparison_focused",
            Self::ReadyToDecide => "ready_to_decide",
            Self::Cautious => "cautious",
            Self::ImpulseBuyer => "impulse_buyer",
        }
    }
}

// -----------------------------------------------------------------------------
// Variants
// -----------------------------------------------------------------------------

/// Label of one of the two competing variant slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SlotLabel {
    A,
    B,
}

impl SlotLabel {
    /// The opposing slot.
    #[inline]
    pub fn other(&self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::A => "A",
            Self::B => "B",
        }
    }

    /// Parses "A"/"B" (case-insensitive).
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "A" | "a" => Some(Self::A),
            "B" | "b" => Some(Self::B),
            _ => None,
        }
    }
}

/// A retired markup candidate archived on regeneration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetiredVariant {
    pub html: String,
    pub score: f64,
    pub timestamp: DateTime<Utc>,
}

/// One competing markup candidate with its rolling score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantSlot {
    pub current_html: String,
    /// Rolling mean of rewards applied to this candidate.
    pub current_score: f64,
    /// Selections served for this candidate. Monotonically non-decreasing
    /// until the candidate is replaced.
    pub number_of_trials: u64,
    /// Every prior candidate with the score it retired at.
    #[serde(default)]
    pub history: Vec<RetiredVariant>,
}

impl VariantSlot {
    /// A freshly seeded slot: author markup, zero score, zero trials.
    pub fn seeded(html: &str) -> Self {
        Self {
            current_html: html.to_string(),
            current_score: 0.0,
            number_of_trials: 0,
            history: Vec::new(),
        }
    }
}

/// Both slots of one variant record, keyed `A`/`B` on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantSlots {
    #[serde(rename = "A")]
    pub a: VariantSlot,
    #[serde(rename = "B")]
    pub b: VariantSlot,
}

/// The A/B record for one `(business, user, component)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantRecord {
    pub component_id: String,
    /// The site author's original fragment; regeneration grafts its skeleton.
    pub seed_html: String,
    pub variants: VariantSlots,
    /// When this record was first materialized.
    pub created_at: DateTime<Utc>,
}

impl VariantRecord {
    /// Materializes a record with both slots seeded from the author markup.
    pub fn seeded(component_id: &str, seed_html: &str) -> Self {
        Self {
            component_id: component_id.to_string(),
            seed_html: seed_html.to_string(),
            variants: VariantSlots {
                a: VariantSlot::seeded(seed_html),
                b: VariantSlot::seeded(seed_html),
            },
            created_at: Utc::now(),
        }
    }

    pub fn slot(&self, label: SlotLabel) -> &VariantSlot {
        match label {
            SlotLabel::A => &self.variants.a,
            SlotLabel::B => &self.variants.b,
        }
    }

    pub fn slot_mut(&mut self, label: SlotLabel) -> &mut VariantSlot {
        match label {
            SlotLabel::A => &mut self.variants.a,
            SlotLabel::B => &mut self.variants.b,
        }
    }

    /// The slot with the higher current score. Ties go to A.
    pub fn leader(&self) -> SlotLabel {
        if self.variants.b.current_score > self.variants.a.current_score {
            SlotLabel::B
        } else {
            SlotLabel::A
        }
    }

    /// Serializes to JSON bytes for storage.
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Deserializes from JSON bytes.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice(bytes).ok()
    }
}

/// Storage key of a variant record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VariantKey {
    pub business_id: String,
    pub user_id: String,
    pub component_id: String,
}

impl VariantKey {
    pub fn new(business_id: &str, user_id: &str, component_id: &str) -> Self {
        Self {
            business_id: business_id.to_string(),
            user_id: user_id.to_string(),
            component_id: component_id.to_string(),
        }
    }

    /// Composite sled key: `business \0 user \0 component`.
    pub fn storage_key(&self) -> Vec<u8> {
        let mut k = Vec::with_capacity(
            self.business_id.len() + self.user_id.len() + self.component_id.len() + 2,
        );
        k.extend_from_slice(self.business_id.as_bytes());
        k.push(KEY_SEP);
        k.extend_from_slice(self.user_id.as_bytes());
        k.push(KEY_SEP);
        k.extend_from_slice(self.component_id.as_bytes());
        k
    }
}

impl std::fmt::Display for VariantKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.business_id, self.user_id, self.component_id
        )
    }
}

// -----------------------------------------------------------------------------
// Data sharing agreements (advisory metadata)
// -----------------------------------------------------------------------------

/// How much behavioral context one tenant shares with another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SharingLevel {
    Aggregate,
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgreementStatus {
    Pending,
    Active,
    Revoked,
}

/// Directed sharing agreement between two tenants. The core stores and serves
/// these; it never routes events across tenant boundaries on its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSharingAgreement {
    pub from_business_id: String,
    pub to_business_id: String,
    pub sharing_level: SharingLevel,
    #[serde(default)]
    pub permissions: HashMap<String, bool>,
    pub status: AgreementStatus,
}

// -----------------------------------------------------------------------------
// Audit trail & per-request state
// -----------------------------------------------------------------------------

/// One stage outcome in the per-request audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub stage: String,
    pub outcome: String,
    pub timestamp: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(stage: &str, outcome: impl Into<String>) -> Self {
        Self {
            stage: stage.to_string(),
            outcome: outcome.into(),
            timestamp: Utc::now(),
        }
    }
}

/// State threaded through one optimize/reward request. Owned by the
/// orchestrator for the lifetime of the request; nothing here outlives it.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Correlation id for tracing; minted per request.
    pub correlation_id: String,
    pub resolved: Option<ResolvedIdentity>,
    pub behavioral_vector: BehavioralVector,
    pub identity_state: IdentityState,
    pub confidence: f64,
    pub selected_slot: Option<SlotLabel>,
    pub audit_log: Vec<AuditEntry>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self {
            correlation_id: uuid::Uuid::new_v4().to_string(),
            resolved: None,
            behavioral_vector: BehavioralVector::neutral(),
            identity_state: IdentityState::Exploratory,
            confidence: 0.5,
            selected_slot: None,
            audit_log: Vec::new(),
        }
    }

    /// Appends a stage outcome and mirrors it to the server log.
    pub fn audit(&mut self, stage: &str, outcome: impl Into<String>) {
        let entry = AuditEntry::new(stage, outcome);
        tracing::debug!(
            target: "morph::audit",
            correlation_id = %self.correlation_id,
            stage = %entry.stage,
            outcome = %entry.outcome,
        );
        self.audit_log.push(entry);
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether the decision pipeline is backed by a live language model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EngineMode {
    MultiAgent,
    Stub,
}

impl EngineMode {
    /// Wire label reported on the health endpoint.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MultiAgent => "multi-agent",
            Self::Stub => "stub",
        }
    }
}
