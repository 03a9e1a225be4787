//! Identity resolution: maps an incoming request onto a stable
//! (tenant, local user, optional global user) triple.

use crate::error::{CoreError, CoreResult};
use crate::shared::ResolvedIdentity;
use crate::store::DocumentStore;

/// Raw identity material pulled off a request by the gateway.
#[derive(Debug, Clone, Default)]
pub struct IdentityInput<'a> {
    pub api_key: Option<&'a str>,
    pub origin: Option<&'a str>,
    pub user_id: Option<&'a str>,
    pub session_id: Option<&'a str>,
    pub global_uid: Option<&'a str>,
}

/// Stateless resolver; all lookups go through the store.
pub struct IdentityResolver;

impl IdentityResolver {
    /// Resolves the request identity. Missing local ids are minted as opaque
    /// UUIDs (the client is expected to persist the user id); `global_uid` is
    /// accepted only when presented, never synthesized server-side.
    pub fn resolve(store: &DocumentStore, input: IdentityInput<'_>) -> CoreResult<ResolvedIdentity> {
        let api_key = input
            .api_key
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| CoreError::Unauthorized("missing api key".to_string()))?;

        let business = store.business_by_api_key(api_key)?;

        if !business.origin_allowed(input.origin) {
            return Err(CoreError::Forbidden(format!(
                "origin {:?} not in allowed domains",
                input.origin.unwrap_or("<none>")
            )));
        }

        let (user_id, minted_user) = match input.user_id.map(str::trim).filter(|u| !u.is_empty()) {
            Some(u) => (u.to_string(), false),
            None => (uuid::Uuid::new_v4().to_string(), true),
        };
        let session_id = input
            .session_id
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let global_uid = input
            .global_uid
            .map(str::trim)
            .filter(|g| !g.is_empty())
            .map(str::to_string);

        Ok(ResolvedIdentity {
            business,
            user_id,
            session_id,
            global_uid,
            minted_user,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::Business;

    fn store_with_tenant(allowed: Vec<String>) -> (tempfile::TempDir, DocumentStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(dir.path()).unwrap();
        store
            .insert_business(&Business {
                business_id: "biz-1".to_string(),
                api_key: "key-1".to_string(),
                allowed_domains: allowed,
                tier: "free".to_string(),
                partner_ids: vec![],
                monthly_event_limit: 1000,
                monthly_events_used: 0,
            })
            .unwrap();
        (dir, store)
    }

    #[test]
    fn unknown_key_is_unauthorized() {
        let (_dir, store) = store_with_tenant(vec![]);
        let err = IdentityResolver::resolve(
            &store,
            IdentityInput {
                api_key: Some("nope"),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::Unauthorized(_)));
    }

    #[test]
    fn disallowed_origin_is_forbidden() {
        let (_dir, store) = store_with_tenant(vec!["shop.example".to_string()]);
        let err = IdentityResolver::resolve(
            &store,
            IdentityInput {
                api_key: Some("key-1"),
                origin: Some("https://evil.example"),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::Forbidden(_)));
    }

    #[test]
    fn missing_ids_are_minted_and_global_uid_passes_through() {
        let (_dir, store) = store_with_tenant(vec![]);
        let resolved = IdentityResolver::resolve(
            &store,
            IdentityInput {
                api_key: Some("key-1"),
                global_uid: Some("g-42"),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(resolved.minted_user);
        assert!(!resolved.user_id.is_empty());
        assert!(!resolved.session_id.is_empty());
        assert_eq!(resolved.global_uid.as_deref(), Some("g-42"));
    }
}
