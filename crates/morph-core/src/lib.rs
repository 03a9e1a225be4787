//! morph-core: adaptive markup optimization core (document store, behavioral
//! agents, A/B bandit, and the language-model regeneration loop).
//!
//! The gateway consumes everything through these re-exports.

mod analytics;
mod bandit;
mod classifier;
mod config;
mod error;
mod events;
mod guardrail;
mod identity;
mod orchestrator;
mod regen;
mod shared;
mod store;

pub use analytics::{synthetic_event, BehavioralAggregator, SessionSignals, CONVERSION_EVENTS};
pub use bandit::{DecisionEngine, RegenCandidate};
pub use classifier::{Classification, IdentityClassifier};
pub use config::CoreConfig;
pub use error::{CoreError, CoreResult};
pub use events::{
    is_throttleable, min_interval_ms, EventIngestor, IncomingEvent, IngestReport, IngestStatus,
    HIGH_FREQUENCY_INTERVALS,
};
pub use guardrail::{ai_markers, Guardrail, GuardrailVerdict};
pub use identity::{IdentityInput, IdentityResolver};
pub use orchestrator::{
    ComponentReward, DashboardSummary, JourneySnapshot, OptimizeRequest, OptimizeResponse,
    Orchestrator, RewardRequest, RewardResponse,
};
pub use regen::{regraft_skeleton, LlmBridge, RegenerationEngine};
pub use shared::{
    AgreementStatus, AuditEntry, BehavioralVector, Business, DataSharingAgreement, EngineMode,
    EventRecord, GlobalUser, IdentityState, Membership, RequestContext, ResolvedIdentity,
    RetiredVariant, SessionSnapshot, SharingLevel, SlotLabel, UserRecord, VariantKey,
    VariantRecord, VariantSlot, VariantSlots,
};
pub use store::{DocumentStore, InsertOutcome, RegenLock};
