//! Event ingestion: validation, monthly quota, server-side throttling of
//! high-frequency events, and a non-blocking write path.
//!
//! The request thread never waits on storage. Accepted events go over a
//! bounded channel to a background writer; above the configured watermark the
//! throttleable set is dropped first and the drop count is reported back.

use crate::config::CoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::shared::{EventRecord, ResolvedIdentity};
use crate::store::DocumentStore;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// High-frequency event names and the minimum interval (ms) between persisted
/// occurrences from one `(user, session)`. Also the drop-first set under
/// back-pressure. The client throttles too; this is defense in depth.
pub const HIGH_FREQUENCY_INTERVALS: &[(&str, u64)] = &[
    ("mouse_hesitation", 500),
    ("mouse_idle_start", 1_000),
    ("mouse_idle_end", 1_000),
    ("scroll_direction_change", 500),
    ("scroll_fast", 1_000),
    ("scroll_pause", 2_000),
    ("hover", 1_000),
    ("hover_end", 1_000),
    ("dead_click", 5_000),
];

static INTERVALS: once_cell::sync::Lazy<HashMap<&'static str, u64>> =
    once_cell::sync::Lazy::new(|| HIGH_FREQUENCY_INTERVALS.iter().copied().collect());

/// Minimum persisted interval for a high-frequency event name.
pub fn min_interval_ms(event_name: &str) -> Option<u64> {
    INTERVALS.get(event_name).copied()
}

/// True for events that may be coalesced or dropped under pressure.
#[inline]
pub fn is_throttleable(event_name: &str) -> bool {
    min_interval_ms(event_name).is_some()
}

/// One event as submitted over the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingEvent {
    pub event_name: String,
    #[serde(default)]
    pub component_id: Option<String>,
    #[serde(default)]
    pub properties: HashMap<String, serde_json::Value>,
    /// Defaults to server receipt time when omitted.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Per-index outcome of an ingest call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum IngestStatus {
    /// Queued for persistence.
    Accepted,
    /// Folded into an earlier event's `coalesced_count`; not stored itself.
    Coalesced,
    /// Shed under back-pressure.
    Dropped,
    Rejected { reason: String },
}

/// Result of one ingest call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestReport {
    pub statuses: Vec<IngestStatus>,
    pub accepted: usize,
    pub coalesced: usize,
    pub dropped: usize,
    pub rejected: usize,
}

struct ThrottleEntry {
    last_stored_ms: i64,
    /// Occurrences folded since the last stored event.
    pending: u64,
}

/// Accepts, validates, throttles, and enqueues behavioral events.
pub struct EventIngestor {
    store: Arc<DocumentStore>,
    tx: mpsc::Sender<Vec<EventRecord>>,
    queue_depth: Arc<AtomicUsize>,
    watermark: usize,
    /// `(user, session, event_name)` -> throttle window state.
    throttle: DashMap<String, ThrottleEntry>,
}

impl EventIngestor {
    /// Builds the ingestor and spawns its background writer. Must be called
    /// from within a tokio runtime.
    pub fn new(store: Arc<DocumentStore>, config: &CoreConfig) -> Self {
        let (tx, mut rx) = mpsc::channel::<Vec<EventRecord>>(config.ingest_queue_depth.max(1));
        let queue_depth = Arc::new(AtomicUsize::new(0));

        let writer_store = Arc::clone(&store);
        let writer_depth = Arc::clone(&queue_depth);
        tokio::spawn(async move {
            while let Some(batch) = rx.recv().await {
                writer_depth.fetch_sub(batch.len(), Ordering::Relaxed);
                match writer_store.insert_events(&batch) {
                    Ok(outcomes) => {
                        let failed = outcomes
                            .iter()
                            .filter(|o| !matches!(o, crate::store::InsertOutcome::Ok))
                            .count();
                        if failed > 0 {
                            tracing::warn!(
                                target: "morph::ingest",
                                failed,
                                total = batch.len(),
                                "event writer: partial batch failure"
                            );
                        }
                    }
                    Err(e) => {
                        tracing::error!(target: "morph::ingest", error = %e, "event writer: batch lost");
                    }
                }
            }
            tracing::info!(target: "morph::ingest", "event writer stopped");
        });

        Self {
            store,
            tx,
            queue_depth,
            watermark: config.ingest_queue_depth,
            throttle: DashMap::new(),
        }
    }

    /// Current write-queue depth (events enqueued but not yet persisted).
    pub fn queue_depth(&self) -> usize {
        self.queue_depth.load(Ordering::Relaxed)
    }

    /// Waits until the writer has drained the queue. Test and shutdown hook.
    pub async fn drain(&self) {
        while self.queue_depth() > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }

    /// Ingests a batch for one resolved identity. Returns per-index statuses;
    /// `QuotaExceeded` only when the tenant has no budget left at all.
    pub fn ingest(
        &self,
        identity: &ResolvedIdentity,
        events: Vec<IncomingEvent>,
    ) -> CoreResult<IngestReport> {
        if events.is_empty() {
            return Err(CoreError::Validation("empty event batch".to_string()));
        }

        let now = Utc::now();
        let mut statuses = vec![IngestStatus::Accepted; events.len()];
        let mut accepted: Vec<(usize, EventRecord)> = Vec::with_capacity(events.len());

        for (idx, incoming) in events.into_iter().enumerate() {
            match self.admit(identity, incoming, now) {
                Admission::Store(record) => accepted.push((idx, record)),
                Admission::Coalesced => statuses[idx] = IngestStatus::Coalesced,
                Admission::Invalid(reason) => statuses[idx] = IngestStatus::Rejected { reason },
            }
        }

        // Back-pressure: shed the throttleable set before touching the quota.
        if self.queue_depth() + accepted.len() > self.watermark {
            accepted.retain(|(idx, record)| {
                if is_throttleable(&record.event_name) {
                    statuses[*idx] = IngestStatus::Dropped;
                    false
                } else {
                    true
                }
            });
        }

        // Monthly quota on what survived; the overflow tail is rejected
        // per-index so the counter never exceeds the limit.
        if !accepted.is_empty() {
            let granted = self
                .store
                .increment_events_used(&identity.business.business_id, accepted.len() as u64)?;
            while accepted.len() as u64 > granted {
                if let Some((idx, _)) = accepted.pop() {
                    statuses[idx] = IngestStatus::Rejected {
                        reason: "quota_exceeded".to_string(),
                    };
                }
            }
        }

        if !accepted.is_empty() {
            let batch: Vec<EventRecord> = accepted.iter().map(|(_, r)| r.clone()).collect();
            let len = batch.len();
            // Count the batch before handing it over so the writer's decrement
            // can never observe a depth it was not part of.
            self.queue_depth.fetch_add(len, Ordering::Relaxed);
            match self.tx.try_send(batch) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.queue_depth.fetch_sub(len, Ordering::Relaxed);
                    for (idx, _) in &accepted {
                        statuses[*idx] = IngestStatus::Dropped;
                    }
                    tracing::warn!(
                        target: "morph::ingest",
                        shed = len,
                        "write queue saturated; batch shed"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    self.queue_depth.fetch_sub(len, Ordering::Relaxed);
                    return Err(CoreError::StorageUnavailable(
                        "event writer stopped".to_string(),
                    ));
                }
            }
        }

        Ok(Self::report(statuses))
    }

    /// Synchronous ingest for server-generated context events (the optimize
    /// path's `component_viewed`). Bypasses the queue but not the quota.
    pub fn ingest_now(
        &self,
        identity: &ResolvedIdentity,
        incoming: IncomingEvent,
    ) -> CoreResult<()> {
        let record = match self.admit(identity, incoming, Utc::now()) {
            Admission::Store(record) => record,
            Admission::Coalesced => return Ok(()),
            Admission::Invalid(reason) => return Err(CoreError::Validation(reason)),
        };
        self.store
            .increment_events_used(&identity.business.business_id, 1)?;
        self.store.insert_events(std::slice::from_ref(&record))?;
        Ok(())
    }

    fn admit(
        &self,
        identity: &ResolvedIdentity,
        incoming: IncomingEvent,
        now: DateTime<Utc>,
    ) -> Admission {
        let name = incoming.event_name.trim();
        if name.is_empty() {
            return Admission::Invalid("missing event_name".to_string());
        }
        if name.len() > 128 {
            return Admission::Invalid("event_name too long".to_string());
        }

        let timestamp = incoming.timestamp.unwrap_or(now);
        let mut properties = incoming.properties;

        if let Some(interval_ms) = min_interval_ms(name) {
            let key = format!("{}\x00{}\x00{}", identity.user_id, identity.session_id, name);
            let now_ms = now.timestamp_millis();
            let mut entry = self.throttle.entry(key).or_insert(ThrottleEntry {
                last_stored_ms: i64::MIN / 2,
                pending: 0,
            });
            if now_ms - entry.last_stored_ms < interval_ms as i64 {
                entry.pending += 1;
                return Admission::Coalesced;
            }
            let coalesced_count = 1 + entry.pending;
            entry.last_stored_ms = now_ms;
            entry.pending = 0;
            properties.insert(
                "coalesced_count".to_string(),
                serde_json::Value::from(coalesced_count),
            );
        }

        Admission::Store(EventRecord {
            business_id: identity.business.business_id.clone(),
            user_id: identity.user_id.clone(),
            session_id: identity.session_id.clone(),
            global_uid: identity.global_uid.clone(),
            event_name: name.to_string(),
            component_id: incoming.component_id,
            properties,
            timestamp,
        })
    }

    fn report(statuses: Vec<IngestStatus>) -> IngestReport {
        let mut report = IngestReport {
            accepted: 0,
            coalesced: 0,
            dropped: 0,
            rejected: 0,
            statuses: Vec::new(),
        };
        for s in &statuses {
            match s {
                IngestStatus::Accepted => report.accepted += 1,
                IngestStatus::Coalesced => report.coalesced += 1,
                IngestStatus::Dropped => report.dropped += 1,
                IngestStatus::Rejected { .. } => report.rejected += 1,
            }
        }
        report.statuses = statuses;
        report
    }
}

enum Admission {
    Store(EventRecord),
    Coalesced,
    Invalid(String),
}
