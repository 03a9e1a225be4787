//! Integration test: event ingestor — server-side throttling, quota
//! enforcement, and back-pressure shedding.

use morph_core::{
    Business, CoreConfig, CoreError, DocumentStore, EventIngestor, IncomingEvent, IngestStatus,
    ResolvedIdentity,
};
use std::sync::Arc;

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

fn setup(limit: u64, used: u64, queue_depth: usize) -> (tempfile::TempDir, Arc<DocumentStore>, EventIngestor) {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(DocumentStore::open(dir.path()).unwrap());
    store.insert_business(&tenant(limit, used)).unwrap();
    let config = CoreConfig {
        ingest_queue_depth: queue_depth,
        ..CoreConfig::default()
    };
    let ingestor = EventIngestor::new(Arc::clone(&store), &config);
    (dir, store, ingestor)
}

fn identity() -> ResolvedIdentity {
    ResolvedIdentity {
        business: tenant(100_000, 0),
        user_id: "user-1".to_string(),
        session_id: "sess-1".to_string(),
        global_uid: None,
        minted_user: false,
    }
}

fn incoming(name: &str) -> IncomingEvent {
    IncomingEvent {
        event_name: name.to_string(),
        component_id: None,
        properties: Default::default(),
        timestamp: None,
    }
}

// ===========================================================================
// Test 1: a burst of mouse_hesitation collapses to one stored event
// ===========================================================================

#[tokio::test]
async fn hesitation_burst_is_coalesced() {
    let (_dir, store, ingestor) = setup(100_000, 0, 1024);

    let burst: Vec<IncomingEvent> = (0..20).map(|_| incoming("mouse_hesitation")).collect();
    let report = ingestor.ingest(&identity(), burst).unwrap();

    assert_eq!(report.accepted, 1);
    assert_eq!(report.coalesced, 19);
    assert_eq!(report.statuses[0], IngestStatus::Accepted);
    assert!(report.statuses[1..]
        .iter()
        .all(|s| *s == IngestStatus::Coalesced));

    ingestor.drain().await;
    let stored = store.events_for_user("biz-1", "user-1").unwrap();
    assert_eq!(stored.len(), 1);
    assert!(stored[0].prop_f64("coalesced_count").unwrap() >= 1.0);
}

// ===========================================================================
// Test 2: folded occurrences surface on the next stored survivor
// ===========================================================================

#[tokio::test]
async fn pending_occurrences_fold_into_next_survivor() {
    let (_dir, store, ingestor) = setup(100_000, 0, 1024);
    let id = identity();

    let burst: Vec<IncomingEvent> = (0..5).map(|_| incoming("dead_click")).collect();
    ingestor.ingest(&id, burst).unwrap();

    // Past the dead_click window the next event persists and carries the
    // four folded occurrences.
    tokio::time::sleep(std::time::Duration::from_millis(5_100)).await;
    ingestor.ingest(&id, vec![incoming("dead_click")]).unwrap();
    ingestor.drain().await;

    let stored = store.events_for_user("biz-1", "user-1").unwrap();
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[1].prop_f64("coalesced_count"), Some(5.0));
}

// ===========================================================================
// Test 3: ordinary events pass through untouched
// ===========================================================================

#[tokio::test]
async fn ordinary_events_are_not_throttled() {
    let (_dir, store, ingestor) = setup(100_000, 0, 1024);
    let batch: Vec<IncomingEvent> = (0..10).map(|_| incoming("click")).collect();
    let report = ingestor.ingest(&identity(), batch).unwrap();
    assert_eq!(report.accepted, 10);
    assert_eq!(report.coalesced, 0);

    ingestor.drain().await;
    assert_eq!(store.events_for_user("biz-1", "user-1").unwrap().len(), 10);
}

// ===========================================================================
// Test 4: quota — exhausted tenants are rejected, counter untouched
// ===========================================================================

#[tokio::test]
async fn exhausted_quota_rejects_whole_call() {
    let (_dir, store, ingestor) = setup(10, 10, 1024);
    let err = ingestor
        .ingest(&identity(), vec![incoming("click")])
        .unwrap_err();
    assert!(matches!(err, CoreError::QuotaExceeded { used: 10, limit: 10 }));
    assert_eq!(
        store.get_business("biz-1").unwrap().unwrap().monthly_events_used,
        10
    );
}

#[tokio::test]
async fn partial_quota_rejects_overflow_tail() {
    let (_dir, store, ingestor) = setup(10, 8, 1024);
    let batch: Vec<IncomingEvent> = (0..5).map(|_| incoming("click")).collect();
    let report = ingestor.ingest(&identity(), batch).unwrap();

    assert_eq!(report.accepted, 2);
    assert_eq!(report.rejected, 3);
    assert_eq!(
        store.get_business("biz-1").unwrap().unwrap().monthly_events_used,
        10
    );

    ingestor.drain().await;
    assert_eq!(store.events_for_user("biz-1", "user-1").unwrap().len(), 2);
}

// ===========================================================================
// Test 5: back-pressure sheds the throttleable set first
// ===========================================================================

#[tokio::test]
async fn watermark_drops_throttleable_events_first() {
    let (_dir, _store, ingestor) = setup(100_000, 0, 0);

    let report = ingestor
        .ingest(&identity(), vec![incoming("hover"), incoming("click")])
        .unwrap();

    // hover sheds; click survives the zero-watermark queue.
    assert_eq!(report.dropped, 1);
    assert_eq!(report.accepted, 1);
    assert_eq!(report.statuses[0], IngestStatus::Dropped);
    assert_eq!(report.statuses[1], IngestStatus::Accepted);
}

// ===========================================================================
// Test 6: validation is per-index in a batch
// ===========================================================================

#[tokio::test]
async fn invalid_events_are_rejected_per_index() {
    let (_dir, _store, ingestor) = setup(100_000, 0, 1024);
    let report = ingestor
        .ingest(&identity(), vec![incoming(""), incoming("click")])
        .unwrap();
    assert!(matches!(report.statuses[0], IngestStatus::Rejected { .. }));
    assert_eq!(report.statuses[1], IngestStatus::Accepted);
}
