//! Integration test: document store invariants — idempotent A/B
//! materialization, archive-and-reset on candidate replacement, event
//! ordering, quota ceiling, and the advisory regeneration lock.

use morph_core::{
    Business, DocumentStore, EventRecord, SlotLabel, VariantKey,
};
use chrono::{Duration as ChronoDuration, Utc};
use std::time::Duration;

fn open_store() -> (tempfile::TempDir, DocumentStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = DocumentStore::open(dir.path()).unwrap();
    (dir, store)
}

fn tenant(limit: u64, used: u64) -> Business {
    Business {
        business_id: "biz-1".to_string(),
        api_key: "key-1".to_string(),
        allowed_domains: vec![],
        tier: "free".to_string(),
        partner_ids: vec![],
        monthly_event_limit: limit,
        monthly_events_used: used,
    }
}

fn event(name: &str, offset_secs: i64) -> EventRecord {
    EventRecord {
        business_id: "biz-1".to_string(),
        user_id: "user-1".to_string(),
        session_id: "sess-1".to_string(),
        global_uid: None,
        event_name: name.to_string(),
        component_id: None,
        properties: Default::default(),
        timestamp: Utc::now() + ChronoDuration::seconds(offset_secs),
    }
}

// ===========================================================================
// Test 1: GetOrInit is idempotent and seeds both slots equally
// ===========================================================================

#[test]
fn get_or_init_is_idempotent() {
    let (_dir, store) = open_store();
    let key = VariantKey::new("biz-1", "user-1", "hero");

    let first = store.get_or_init_variant(&key, "<h1>Welcome</h1>").unwrap();
    assert_eq!(first.variants.a.current_html, "<h1>Welcome</h1>");
    assert_eq!(first.variants.b.current_html, "<h1>Welcome</h1>");
    assert_eq!(first.variants.a.current_score, 0.0);
    assert_eq!(first.variants.a.number_of_trials, 0);
    assert!(first.variants.a.history.is_empty());

    // A second call returns the same record and never grows history,
    // even with a different seed.
    let second = store.get_or_init_variant(&key, "<h1>Other</h1>").unwrap();
    assert_eq!(second.variants.a.current_html, "<h1>Welcome</h1>");
    assert!(second.variants.a.history.is_empty());
    assert!(second.variants.b.history.is_empty());
}

// ===========================================================================
// Test 2: Replacing a candidate archives it and resets the slot
// ===========================================================================

#[test]
fn replace_archives_and_resets() {
    let (_dir, store) = open_store();
    let key = VariantKey::new("biz-1", "user-1", "hero");
    store.get_or_init_variant(&key, "<h1>Welcome</h1>").unwrap();

    store
        .modify_variant(&key, |r| {
            r.slot_mut(SlotLabel::B).current_score = 1.5;
            r.slot_mut(SlotLabel::B).number_of_trials = 5;
            Ok(())
        })
        .unwrap();

    let updated = store
        .replace_variant_html(&key, SlotLabel::B, "<h1>Fresh copy</h1>")
        .unwrap();
    let b = updated.slot(SlotLabel::B);
    assert_eq!(b.current_html, "<h1>Fresh copy</h1>");
    assert_eq!(b.current_score, 0.0);
    assert_eq!(b.number_of_trials, 0);
    assert_eq!(b.history.len(), 1);
    assert_eq!(b.history[0].html, "<h1>Welcome</h1>");
    assert_eq!(b.history[0].score, 1.5);

    // A is untouched.
    assert_eq!(updated.slot(SlotLabel::A).current_html, "<h1>Welcome</h1>");
}

// ===========================================================================
// Test 3: Event order is non-decreasing per (business, user, session)
// ===========================================================================

#[test]
fn events_persist_in_timestamp_order() {
    let (_dir, store) = open_store();
    // Inserted out of order; the keyspace orders by timestamp.
    store
        .insert_events(&[event("click", 5), event("hover", 1), event("scroll_pause", 3)])
        .unwrap();

    let all = store.events_for_user("biz-1", "user-1").unwrap();
    assert_eq!(all.len(), 3);
    for pair in all.windows(2) {
        assert!(pair[0].timestamp <= pair[1].timestamp);
    }

    let recent = store
        .recent_events("biz-1", "user-1", 10, Duration::from_secs(600))
        .unwrap();
    assert_eq!(recent.len(), 3);
    for pair in recent.windows(2) {
        assert!(pair[0].timestamp >= pair[1].timestamp, "newest first");
    }
}

#[test]
fn recent_events_honors_limit() {
    let (_dir, store) = open_store();
    let batch: Vec<EventRecord> = (0..20).map(|i| event("hover", i)).collect();
    store.insert_events(&batch).unwrap();
    let recent = store
        .recent_events("biz-1", "user-1", 5, Duration::from_secs(600))
        .unwrap();
    assert_eq!(recent.len(), 5);
}

// ===========================================================================
// Test 4: Quota counter never exceeds the limit
// ===========================================================================

#[test]
fn quota_grants_partial_then_rejects() {
    let (_dir, store) = open_store();
    store.insert_business(&tenant(10, 8)).unwrap();

    let granted = store.increment_events_used("biz-1", 5).unwrap();
    assert_eq!(granted, 2);

    let business = store.get_business("biz-1").unwrap().unwrap();
    assert_eq!(business.monthly_events_used, 10);

    let err = store.increment_events_used("biz-1", 1).unwrap_err();
    assert!(matches!(
        err,
        morph_core::CoreError::QuotaExceeded { used: 10, limit: 10 }
    ));
    // Counter untouched by the rejected call.
    let business = store.get_business("biz-1").unwrap().unwrap();
    assert_eq!(business.monthly_events_used, 10);
}

// ===========================================================================
// Test 5: Advisory regeneration lock with TTL reclaim
// ===========================================================================

#[test]
fn regen_lock_excludes_and_expires() {
    let (_dir, store) = open_store();
    let key = VariantKey::new("biz-1", "user-1", "hero");

    let holder = store
        .acquire_regen_lock(&key, Duration::from_secs(30))
        .unwrap()
        .expect("first acquire succeeds");
    assert!(store
        .acquire_regen_lock(&key, Duration::from_secs(30))
        .unwrap()
        .is_none());

    store.release_regen_lock(&key, &holder).unwrap();
    assert!(store
        .acquire_regen_lock(&key, Duration::from_secs(30))
        .unwrap()
        .is_some());
}

#[test]
fn regen_lock_reclaimed_after_ttl() {
    let (_dir, store) = open_store();
    let key = VariantKey::new("biz-1", "user-1", "hero");

    store
        .acquire_regen_lock(&key, Duration::from_millis(10))
        .unwrap()
        .expect("first acquire succeeds");
    std::thread::sleep(Duration::from_millis(30));
    assert!(
        store
            .acquire_regen_lock(&key, Duration::from_millis(10))
            .unwrap()
            .is_some(),
        "expired lock is reclaimable"
    );
}

// ===========================================================================
// Test 6: Stale releases are no-ops
// ===========================================================================

#[test]
fn stale_release_does_not_free_lock() {
    let (_dir, store) = open_store();
    let key = VariantKey::new("biz-1", "user-1", "hero");

    let first = store
        .acquire_regen_lock(&key, Duration::from_millis(10))
        .unwrap()
        .unwrap();
    std::thread::sleep(Duration::from_millis(30));
    let second = store
        .acquire_regen_lock(&key, Duration::from_secs(30))
        .unwrap()
        .unwrap();
    assert_ne!(first, second);

    // The crashed holder's release must not free the new holder's lock.
    store.release_regen_lock(&key, &first).unwrap();
    assert!(store
        .acquire_regen_lock(&key, Duration::from_secs(30))
        .unwrap()
        .is_none());
}

// ===========================================================================
// Test 7: Sharing agreements are stored and readable from both sides
// ===========================================================================

#[test]
fn agreements_visible_to_both_parties() {
    let (_dir, store) = open_store();
    store
        .upsert_agreement(&morph_core::DataSharingAgreement {
            from_business_id: "biz-1".to_string(),
            to_business_id: "biz-2".to_string(),
            sharing_level: morph_core::SharingLevel::Aggregate,
            permissions: Default::default(),
            status: morph_core::AgreementStatus::Pending,
        })
        .unwrap();

    assert_eq!(store.agreements_for("biz-1").unwrap().len(), 1);
    assert_eq!(store.agreements_for("biz-2").unwrap().len(), 1);
    assert!(store.agreements_for("biz-3").unwrap().is_empty());
}

// ===========================================================================
// Test 8: Global user membership is append-only
// ===========================================================================

#[test]
fn global_user_membership_only_grows() {
    let (_dir, store) = open_store();
    let linked = store.link_global_user("g-1", "biz-1", "user-1").unwrap();
    assert_eq!(linked.business_uids.len(), 1);

    let relinked = store.link_global_user("g-1", "biz-1", "user-1").unwrap();
    assert_eq!(relinked.business_uids.len(), 1, "duplicate link is a no-op");

    let grown = store.link_global_user("g-1", "biz-2", "user-9").unwrap();
    assert_eq!(grown.business_uids.len(), 2);
}
