//! Sled-backed document store with one tree per collection.
//!
//! | Tree            | Key                                   | Value            |
//! |-----------------|---------------------------------------|------------------|
//! | `businesses`    | business_id                           | Business JSON    |
//! | `business_keys` | api_key                               | business_id      |
//! | `users`         | business \0 user                      | UserRecord JSON  |
//! | `global_users`  | global_uid                            | GlobalUser JSON  |
//! | `events`        | business \0 user \0 ts \0 seq         | EventRecord JSON |
//! | `variants`      | business \0 user \0 component         | VariantRecord    |
//! | `agreements`    | from \0 to                            | Agreement JSON   |
//! | `regen_locks`   | business \0 user \0 component         | RegenLock JSON   |
//!
//! Event keys order by timestamp (zero-padded seconds) with a process-local
//! sequence number breaking ties in insertion order. Transient sled errors are
//! retried with bounded backoff inside this layer; exhaustion surfaces as
//! `CoreError::StorageUnavailable`.

use crate::error::{CoreError, CoreResult};
use crate::shared::{
    Business, DataSharingAgreement, EventRecord, GlobalUser, Membership, SessionSnapshot,
    UserRecord, VariantKey, VariantRecord, KEY_SEP,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_MS: u64 = 10;

/// Advisory regeneration lock held in storage so it survives crashes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegenLock {
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
}

/// Per-index outcome of a batch insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Ok,
    Failed(String),
}

/// Document store owning all persisted entities. Other components hold
/// borrowed views for the duration of one request.
pub struct DocumentStore {
    db: Db,
    businesses: Tree,
    business_keys: Tree,
    users: Tree,
    global_users: Tree,
    events: Tree,
    variants: Tree,
    agreements: Tree,
    regen_locks: Tree,
    /// Read-through cache for api-key resolution; invalidated on writes.
    key_cache: DashMap<String, Business>,
    /// Insertion-order tiebreak for same-second events.
    event_seq: AtomicU64,
}

impl DocumentStore {
    /// Opens or creates the store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let db = sled::open(path)?;
        Ok(Self {
            businesses: db.open_tree("businesses")?,
            business_keys: db.open_tree("business_keys")?,
            users: db.open_tree("users")?,
            global_users: db.open_tree("global_users")?,
            events: db.open_tree("events")?,
            variants: db.open_tree("variants")?,
            agreements: db.open_tree("agreements")?,
            regen_locks: db.open_tree("regen_locks")?,
            key_cache: DashMap::new(),
            event_seq: AtomicU64::new(0),
            db,
        })
    }

    /// Flushes all trees to disk.
    pub fn flush(&self) -> CoreResult<()> {
        self.db.flush()?;
        Ok(())
    }

    fn with_retry<T>(&self, mut op: impl FnMut() -> sled::Result<T>) -> CoreResult<T> {
        let mut last = None;
        for attempt in 0..RETRY_ATTEMPTS {
            match op() {
                Ok(v) => return Ok(v),
                Err(e) => {
                    tracing::warn!(
                        target: "morph::store",
                        attempt,
                        error = %e,
                        "storage operation failed, retrying"
                    );
                    last = Some(e);
                    std::thread::sleep(Duration::from_millis(RETRY_BASE_MS << attempt));
                }
            }
        }
        Err(CoreError::StorageUnavailable(
            last.map(|e| e.to_string()).unwrap_or_default(),
        ))
    }

    // -------------------------------------------------------------------------
    // Businesses
    // -------------------------------------------------------------------------

    /// Registers a tenant and maintains the unique api-key index.
    pub fn insert_business(&self, business: &Business) -> CoreResult<()> {
        let bytes = serde_json::to_vec(business)
            .map_err(|e| CoreError::Validation(format!("business encode: {e}")))?;
        self.with_retry(|| {
            self.businesses
                .insert(business.business_id.as_bytes(), bytes.clone())?;
            self.business_keys
                .insert(business.api_key.as_bytes(), business.business_id.as_bytes())?;
            Ok(())
        })?;
        self.key_cache.remove(&business.api_key);
        Ok(())
    }

    pub fn get_business(&self, business_id: &str) -> CoreResult<Option<Business>> {
        let bytes = self.with_retry(|| self.businesses.get(business_id.as_bytes()))?;
        Ok(bytes.and_then(|b| serde_json::from_slice(&b).ok()))
    }

    /// Resolves an api key to its tenant. Unknown keys are `Unauthorized`.
    pub fn business_by_api_key(&self, api_key: &str) -> CoreResult<Business> {
        if let Some(cached) = self.key_cache.get(api_key) {
            return Ok(cached.clone());
        }
        let id = self
            .with_retry(|| self.business_keys.get(api_key.as_bytes()))?
            .ok_or_else(|| CoreError::Unauthorized("unknown api key".to_string()))?;
        let id = String::from_utf8_lossy(&id).to_string();
        let business = self
            .get_business(&id)?
            .ok_or_else(|| CoreError::Unauthorized("dangling api key index".to_string()))?;
        self.key_cache.insert(api_key.to_string(), business.clone());
        Ok(business)
    }

    /// Atomically grants up to `requested` events against the monthly quota.
    /// Returns the granted count; `QuotaExceeded` when the ceiling is already
    /// reached. The counter never exceeds the limit.
    pub fn increment_events_used(&self, business_id: &str, requested: u64) -> CoreResult<u64> {
        loop {
            let old = self
                .with_retry(|| self.businesses.get(business_id.as_bytes()))?
                .ok_or_else(|| CoreError::NotFound(format!("business {business_id}")))?;
            let mut business: Business = serde_json::from_slice(&old)
                .map_err(|e| CoreError::StorageUnavailable(format!("business decode: {e}")))?;

            let remaining = business.quota_remaining();
            if remaining == 0 {
                return Err(CoreError::QuotaExceeded {
                    used: business.monthly_events_used,
                    limit: business.monthly_event_limit,
                });
            }
            let granted = requested.min(remaining);
            business.monthly_events_used += granted;
            let new = serde_json::to_vec(&business)
                .map_err(|e| CoreError::StorageUnavailable(format!("business encode: {e}")))?;

            let swapped = self.with_retry(|| {
                self.businesses
                    .compare_and_swap(business_id.as_bytes(), Some(&old), Some(new.clone()))
            })?;
            if swapped.is_ok() {
                self.key_cache.remove(&business.api_key);
                return Ok(granted);
            }
            // Lost the race against a concurrent counter bump; re-read.
        }
    }

    // -------------------------------------------------------------------------
    // Users
    // -------------------------------------------------------------------------

    fn user_key(business_id: &str, user_id: &str) -> Vec<u8> {
        let mut k = Vec::with_capacity(business_id.len() + user_id.len() + 1);
        k.extend_from_slice(business_id.as_bytes());
        k.push(KEY_SEP);
        k.extend_from_slice(user_id.as_bytes());
        k
    }

    pub fn get_user(&self, business_id: &str, user_id: &str) -> CoreResult<Option<UserRecord>> {
        let bytes = self.with_retry(|| self.users.get(Self::user_key(business_id, user_id)))?;
        Ok(bytes.and_then(|b| serde_json::from_slice(&b).ok()))
    }

    /// Creates or refreshes the user record with the latest session snapshot
    /// and rendered markup.
    pub fn upsert_user_session(
        &self,
        business_id: &str,
        user_id: &str,
        snapshot: SessionSnapshot,
        last_html: Option<String>,
    ) -> CoreResult<()> {
        let mut record = self.get_user(business_id, user_id)?.unwrap_or(UserRecord {
            business_id: business_id.to_string(),
            user_id: user_id.to_string(),
            last_session: None,
            last_html: None,
        });
        record.last_session = Some(snapshot);
        if last_html.is_some() {
            record.last_html = last_html;
        }
        let bytes = serde_json::to_vec(&record)
            .map_err(|e| CoreError::StorageUnavailable(format!("user encode: {e}")))?;
        self.with_retry(|| {
            self.users
                .insert(Self::user_key(business_id, user_id), bytes.clone())
        })?;
        Ok(())
    }

    /// Tenant-scoped user roster.
    pub fn list_users(&self, business_id: &str) -> CoreResult<Vec<UserRecord>> {
        let mut prefix = business_id.as_bytes().to_vec();
        prefix.push(KEY_SEP);
        let mut out = Vec::new();
        for item in self.users.scan_prefix(&prefix) {
            let (_, v) = item?;
            if let Ok(record) = serde_json::from_slice::<UserRecord>(&v) {
                out.push(record);
            }
        }
        Ok(out)
    }

    // -------------------------------------------------------------------------
    // Global users
    // -------------------------------------------------------------------------

    /// Links a (tenant, local user) pair to a global identity. Membership is
    /// append-only; linking twice is a no-op.
    pub fn link_global_user(
        &self,
        global_uid: &str,
        business_id: &str,
        user_id: &str,
    ) -> CoreResult<GlobalUser> {
        let membership = Membership {
            business_id: business_id.to_string(),
            user_id: user_id.to_string(),
        };
        loop {
            let old = self.with_retry(|| self.global_users.get(global_uid.as_bytes()))?;
            let mut user = match &old {
                Some(bytes) => serde_json::from_slice::<GlobalUser>(bytes)
                    .map_err(|e| CoreError::StorageUnavailable(format!("global user decode: {e}")))?,
                None => GlobalUser {
                    global_uid: global_uid.to_string(),
                    business_uids: Vec::new(),
                },
            };
            if user.business_uids.contains(&membership) {
                return Ok(user);
            }
            user.business_uids.push(membership.clone());
            let new = serde_json::to_vec(&user)
                .map_err(|e| CoreError::StorageUnavailable(format!("global user encode: {e}")))?;
            let swapped = self.with_retry(|| {
                self.global_users.compare_and_swap(
                    global_uid.as_bytes(),
                    old.as_ref(),
                    Some(new.clone()),
                )
            })?;
            if swapped.is_ok() {
                return Ok(user);
            }
        }
    }

    pub fn get_global_user(&self, global_uid: &str) -> CoreResult<Option<GlobalUser>> {
        let bytes = self.with_retry(|| self.global_users.get(global_uid.as_bytes()))?;
        Ok(bytes.and_then(|b| serde_json::from_slice(&b).ok()))
    }

    // -------------------------------------------------------------------------
    // Events
    // -------------------------------------------------------------------------

    fn event_key(&self, event: &EventRecord) -> Vec<u8> {
        let seq = self.event_seq.fetch_add(1, Ordering::Relaxed);
        let mut k = Vec::new();
        k.extend_from_slice(event.business_id.as_bytes());
        k.push(KEY_SEP);
        k.extend_from_slice(event.user_id.as_bytes());
        k.push(KEY_SEP);
        k.extend_from_slice(format!("{:020}", event.timestamp.timestamp()).as_bytes());
        k.push(KEY_SEP);
        k.extend_from_slice(format!("{seq:012}").as_bytes());
        k
    }

    /// Appends a batch. Each index gets its own outcome; a failed encode or
    /// exhausted retry marks that index and the rest of the batch proceeds.
    pub fn insert_events(&self, events: &[EventRecord]) -> CoreResult<Vec<InsertOutcome>> {
        let mut outcomes = Vec::with_capacity(events.len());
        for event in events {
            let bytes = event.to_bytes();
            if bytes.is_empty() {
                outcomes.push(InsertOutcome::Failed("encode failed".to_string()));
                continue;
            }
            let key = self.event_key(event);
            match self.with_retry(|| self.events.insert(key.clone(), bytes.clone())) {
                Ok(_) => outcomes.push(InsertOutcome::Ok),
                Err(e) => outcomes.push(InsertOutcome::Failed(e.to_string())),
            }
        }
        Ok(outcomes)
    }

    /// Up to `limit` most recent events for the user within `window`,
    /// newest-first.
    pub fn recent_events(
        &self,
        business_id: &str,
        user_id: &str,
        limit: usize,
        window: Duration,
    ) -> CoreResult<Vec<EventRecord>> {
        let mut prefix = Vec::new();
        prefix.extend_from_slice(business_id.as_bytes());
        prefix.push(KEY_SEP);
        prefix.extend_from_slice(user_id.as_bytes());
        prefix.push(KEY_SEP);

        let cutoff = Utc::now()
            - ChronoDuration::from_std(window).unwrap_or_else(|_| ChronoDuration::seconds(600));
        let mut out = Vec::new();
        for item in self.events.scan_prefix(&prefix).rev() {
            let (_, v) = item?;
            let Some(event) = EventRecord::from_bytes(&v) else {
                continue;
            };
            if event.timestamp < cutoff {
                break;
            }
            out.push(event);
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    /// All events for one user, oldest-first (journey endpoint).
    pub fn events_for_user(&self, business_id: &str, user_id: &str) -> CoreResult<Vec<EventRecord>> {
        let mut prefix = Vec::new();
        prefix.extend_from_slice(business_id.as_bytes());
        prefix.push(KEY_SEP);
        prefix.extend_from_slice(user_id.as_bytes());
        prefix.push(KEY_SEP);
        let mut out = Vec::new();
        for item in self.events.scan_prefix(&prefix) {
            let (_, v) = item?;
            if let Some(event) = EventRecord::from_bytes(&v) {
                out.push(event);
            }
        }
        Ok(out)
    }

    /// Event counts by name for one tenant (dashboard aggregate).
    pub fn event_counts(
        &self,
        business_id: &str,
    ) -> CoreResult<std::collections::HashMap<String, u64>> {
        let mut prefix = business_id.as_bytes().to_vec();
        prefix.push(KEY_SEP);
        let mut counts = std::collections::HashMap::new();
        for item in self.events.scan_prefix(&prefix) {
            let (_, v) = item?;
            if let Some(event) = EventRecord::from_bytes(&v) {
                *counts.entry(event.event_name).or_insert(0u64) += 1;
            }
        }
        Ok(counts)
    }

    // -------------------------------------------------------------------------
    // Variants
    // -------------------------------------------------------------------------

    /// Idempotent A/B materialization: creates the record with both slots
    /// seeded from the author markup when absent, otherwise returns the
    /// existing record unchanged.
    pub fn get_or_init_variant(
        &self,
        key: &VariantKey,
        seed_html: &str,
    ) -> CoreResult<VariantRecord> {
        let storage_key = key.storage_key();
        if let Some(bytes) = self.with_retry(|| self.variants.get(&storage_key))? {
            if let Some(record) = VariantRecord::from_bytes(&bytes) {
                return Ok(record);
            }
        }
        let seeded = VariantRecord::seeded(&key.component_id, seed_html);
        let bytes = seeded.to_bytes();
        let swapped = self.with_retry(|| {
            self.variants
                .compare_and_swap(&storage_key, None::<&[u8]>, Some(bytes.clone()))
        })?;
        match swapped {
            Ok(()) => Ok(seeded),
            // Lost the materialization race; the winner's record is authoritative.
            Err(cas) => cas
                .current
                .as_ref()
                .and_then(|b| VariantRecord::from_bytes(b))
                .ok_or_else(|| CoreError::StorageUnavailable("variant decode".to_string())),
        }
    }

    pub fn get_variant(&self, key: &VariantKey) -> CoreResult<Option<VariantRecord>> {
        let bytes = self.with_retry(|| self.variants.get(key.storage_key()))?;
        Ok(bytes.and_then(|b| VariantRecord::from_bytes(&b)))
    }

    /// Optimistic read-modify-write on a variant record. The closure mutates a
    /// copy; the write lands only if the stored bytes are unchanged. One
    /// transparent retry; a second lost race surfaces `Conflict` with the
    /// authoritative record.
    pub fn modify_variant(
        &self,
        key: &VariantKey,
        mutate: impl Fn(&mut VariantRecord) -> CoreResult<()>,
    ) -> CoreResult<VariantRecord> {
        let storage_key = key.storage_key();
        let mut retried = false;
        loop {
            let old = self
                .with_retry(|| self.variants.get(&storage_key))?
                .ok_or_else(|| CoreError::NotFound(format!("variant {key}")))?;
            let mut record = VariantRecord::from_bytes(&old)
                .ok_or_else(|| CoreError::StorageUnavailable("variant decode".to_string()))?;
            mutate(&mut record)?;
            let new = record.to_bytes();
            let swapped = self.with_retry(|| {
                self.variants
                    .compare_and_swap(&storage_key, Some(&old), Some(new.clone()))
            })?;
            match swapped {
                Ok(()) => return Ok(record),
                Err(_) if !retried => {
                    tracing::debug!(target: "morph::store", %key, "variant CAS lost, retrying once");
                    retried = true;
                }
                Err(cas) => {
                    let current = cas
                        .current
                        .as_ref()
                        .and_then(|b| VariantRecord::from_bytes(b))
                        .ok_or_else(|| {
                            CoreError::StorageUnavailable("variant decode".to_string())
                        })?;
                    return Err(CoreError::Conflict {
                        current: Box::new(current),
                    });
                }
            }
        }
    }

    /// Installs a rewritten candidate on one slot: the previous markup and
    /// its score at retirement move to `history`, the score and trial count
    /// reset for the new candidate.
    pub fn replace_variant_html(
        &self,
        key: &VariantKey,
        label: crate::shared::SlotLabel,
        new_html: &str,
    ) -> CoreResult<VariantRecord> {
        self.modify_variant(key, |record| {
            let slot = record.slot_mut(label);
            slot.history.push(crate::shared::RetiredVariant {
                html: std::mem::take(&mut slot.current_html),
                score: slot.current_score,
                timestamp: Utc::now(),
            });
            slot.current_html = new_html.to_string();
            slot.current_score = 0.0;
            slot.number_of_trials = 0;
            Ok(())
        })
    }

    /// Variant records for one user (journey endpoint).
    pub fn variants_for_user(
        &self,
        business_id: &str,
        user_id: &str,
    ) -> CoreResult<Vec<VariantRecord>> {
        let mut prefix = Vec::new();
        prefix.extend_from_slice(business_id.as_bytes());
        prefix.push(KEY_SEP);
        prefix.extend_from_slice(user_id.as_bytes());
        prefix.push(KEY_SEP);
        let mut out = Vec::new();
        for item in self.variants.scan_prefix(&prefix) {
            let (_, v) = item?;
            if let Some(record) = VariantRecord::from_bytes(&v) {
                out.push(record);
            }
        }
        Ok(out)
    }

    /// All variant records for one tenant (dashboard aggregate).
    pub fn variants_for_business(&self, business_id: &str) -> CoreResult<Vec<VariantRecord>> {
        let mut prefix = business_id.as_bytes().to_vec();
        prefix.push(KEY_SEP);
        let mut out = Vec::new();
        for item in self.variants.scan_prefix(&prefix) {
            let (_, v) = item?;
            if let Some(record) = VariantRecord::from_bytes(&v) {
                out.push(record);
            }
        }
        Ok(out)
    }

    // -------------------------------------------------------------------------
    // Data sharing agreements (advisory)
    // -------------------------------------------------------------------------

    pub fn upsert_agreement(&self, agreement: &DataSharingAgreement) -> CoreResult<()> {
        let mut key = agreement.from_business_id.as_bytes().to_vec();
        key.push(KEY_SEP);
        key.extend_from_slice(agreement.to_business_id.as_bytes());
        let bytes = serde_json::to_vec(agreement)
            .map_err(|e| CoreError::Validation(format!("agreement encode: {e}")))?;
        self.with_retry(|| self.agreements.insert(key.clone(), bytes.clone()))?;
        Ok(())
    }

    /// Agreements where the tenant appears on either side.
    pub fn agreements_for(&self, business_id: &str) -> CoreResult<Vec<DataSharingAgreement>> {
        let mut out = Vec::new();
        for item in self.agreements.iter() {
            let (_, v) = item?;
            if let Ok(agreement) = serde_json::from_slice::<DataSharingAgreement>(&v) {
                if agreement.from_business_id == business_id
                    || agreement.to_business_id == business_id
                {
                    out.push(agreement);
                }
            }
        }
        Ok(out)
    }

    // -------------------------------------------------------------------------
    // Regeneration locks
    // -------------------------------------------------------------------------

    /// Acquires the advisory regeneration lock for a record. Returns the
    /// holder token on success, `None` when a live lock is already held.
    /// Expired locks (past `ttl`) are reclaimed.
    pub fn acquire_regen_lock(
        &self,
        key: &VariantKey,
        ttl: Duration,
    ) -> CoreResult<Option<String>> {
        let storage_key = key.storage_key();
        let holder = uuid::Uuid::new_v4().to_string();
        let lock = RegenLock {
            holder: holder.clone(),
            acquired_at: Utc::now(),
        };
        let new = serde_json::to_vec(&lock)
            .map_err(|e| CoreError::StorageUnavailable(format!("lock encode: {e}")))?;

        let existing = self.with_retry(|| self.regen_locks.get(&storage_key))?;
        let expired = existing.as_ref().is_some_and(|bytes| {
            serde_json::from_slice::<RegenLock>(bytes)
                .map(|l| {
                    Utc::now() - l.acquired_at
                        > ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::seconds(30))
                })
                .unwrap_or(true)
        });
        if existing.is_some() && !expired {
            return Ok(None);
        }
        let swapped = self.with_retry(|| {
            self.regen_locks
                .compare_and_swap(&storage_key, existing.as_ref(), Some(new.clone()))
        })?;
        Ok(swapped.is_ok().then_some(holder))
    }

    /// Releases the lock when still held by `holder`; stale releases are no-ops.
    pub fn release_regen_lock(&self, key: &VariantKey, holder: &str) -> CoreResult<()> {
        let storage_key = key.storage_key();
        let existing = self.with_retry(|| self.regen_locks.get(&storage_key))?;
        let held_by_us = existing.as_ref().is_some_and(|bytes| {
            serde_json::from_slice::<RegenLock>(bytes)
                .map(|l| l.holder == holder)
                .unwrap_or(false)
        });
        if held_by_us {
            let _ = self.with_retry(|| {
                self.regen_locks
                    .compare_and_swap(&storage_key, existing.as_ref(), None::<&[u8]>)
            })?;
        }
        Ok(())
    }
}
