//! Integration test: regeneration engine — skeleton re-grafting, stub-mode
//! behavior, and lock hygiene around failed rewrites.

use morph_core::{
    regraft_skeleton, Business, CoreConfig, DecisionEngine, DocumentStore, EngineMode,
    RegenerationEngine, SlotLabel, VariantKey,
};
use std::sync::Arc;
use std::time::Duration;

fn setup() -> (tempfile::TempDir, Arc<DocumentStore>) {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(DocumentStore::open(dir.path()).unwrap());
    store
        .insert_business(&Business {
            business_id: "biz-1".to_string(),
            api_key: "key-1".to_string(),
            allowed_domains: vec![],
            tier: "free".to_string(),
            partner_ids: vec![],
            monthly_event_limit: 100_000,
            monthly_events_used: 0,
        })
        .unwrap();
    (dir, store)
}

// ===========================================================================
// Skeleton re-grafting is deterministic
// ===========================================================================

#[test]
fn regraft_forces_seed_tag_and_markers() {
    let seed = r#"<div data-ai-component="hero" data-ai-slot="main">Welcome</div>"#;
    let candidate = r#"<section class="shiny"><strong>Hello there</strong></section>"#;
    let grafted = regraft_skeleton(seed, candidate).unwrap();

    assert!(grafted.starts_with("<div"));
    assert!(grafted.ends_with("</div>"));
    assert!(grafted.contains(r#"data-ai-component="hero""#));
    assert!(grafted.contains(r#"data-ai-slot="main""#));
    assert!(grafted.contains(r#"class="shiny""#));
    assert!(grafted.contains("<strong>Hello there</strong>"));
}

#[test]
fn regraft_wraps_bare_text() {
    let seed = r#"<h1 data-ai-component="hero">Welcome</h1>"#;
    let grafted = regraft_skeleton(seed, "Limited-time welcome!").unwrap();
    assert_eq!(
        grafted,
        r#"<h1 data-ai-component="hero">Limited-time welcome!</h1>"#
    );
}

#[test]
fn regraft_prefers_seed_markers_over_model_markers() {
    let seed = r#"<div data-ai-component="hero">x</div>"#;
    let candidate = r#"<div data-ai-component="invented">y</div>"#;
    let grafted = regraft_skeleton(seed, candidate).unwrap();
    assert!(grafted.contains(r#"data-ai-component="hero""#));
    assert!(!grafted.contains("invented"));
}

#[test]
fn regraft_rejects_empty_output() {
    let seed = r#"<div data-ai-component="hero">x</div>"#;
    assert!(regraft_skeleton(seed, "   ").is_err());
}

#[test]
fn regraft_is_idempotent() {
    let seed = r#"<div data-ai-component="hero">Welcome</div>"#;
    let candidate = r#"<span>New welcome</span>"#;
    let once = regraft_skeleton(seed, candidate).unwrap();
    let twice = regraft_skeleton(seed, &once).unwrap();
    assert_eq!(once, twice);
}

// ===========================================================================
// Stub mode: triggers acknowledged, slots untouched, lock released
// ===========================================================================

#[tokio::test]
async fn stub_mode_leaves_slot_untouched_and_releases_lock() {
    let (_dir, store) = setup();
    let config = CoreConfig::default();
    let key = VariantKey::new("biz-1", "user-1", "hero");
    store.get_or_init_variant(&key, "<h1>Welcome</h1>").unwrap();

    let decision = DecisionEngine::new(Arc::clone(&store), &config);
    let engine = Arc::new(RegenerationEngine::new(Arc::clone(&store), &config, None));
    assert_eq!(engine.mode(), EngineMode::Stub);

    // Shape a diverged record so the trigger is live.
    for _ in 0..5 {
        decision.count_trial(&key, SlotLabel::A).unwrap();
        decision.apply_reward(&key, SlotLabel::A, 3.0).unwrap();
        decision.count_trial(&key, SlotLabel::B).unwrap();
        decision.apply_reward(&key, SlotLabel::B, 1.5).unwrap();
    }
    let record = store.get_variant(&key).unwrap().unwrap();
    let candidate = decision.regeneration_check(&key, &record).unwrap();

    engine.spawn(
        candidate,
        morph_core::IdentityState::Exploratory,
        morph_core::BehavioralVector::neutral(),
    );
    tokio::time::sleep(Duration::from_millis(100)).await;

    let after = store.get_variant(&key).unwrap().unwrap();
    assert_eq!(after.slot(SlotLabel::B).current_html, "<h1>Welcome</h1>");
    assert!(after.slot(SlotLabel::B).history.is_empty());

    // The advisory lock must be free again.
    assert!(store
        .acquire_regen_lock(&key, Duration::from_secs(30))
        .unwrap()
        .is_some());
}
