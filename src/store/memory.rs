//! In-memory session store with real compare-and-swap semantics.
//! Used by the test suite and by `MASQUERADE_STORE=memory` for local runs
//! where no SPARQL endpoint is available. Each method takes the lock once,
//! so `load`/`swap` are atomic sections and concurrent overlay calls observe
//! linearizable behavior.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::StoreError;
use crate::identity::{FacetKind, IdentityRef, SessionRecord};

use super::{AccountLinks, SessionStore};

#[derive(Default)]
pub struct MemoryStore {
    sessions: RwLock<HashMap<String, SessionRecord>>,
    directory: RwLock<HashMap<(FacetKind, String), IdentityRef>>,
    account_links: RwLock<HashMap<String, AccountLinks>>,
    // Fault injection knobs for tests.
    deny_writes: AtomicBool,
    forced_swap_failures: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_session(&self, session_uri: &str, record: SessionRecord) {
        self.sessions.write().insert(session_uri.to_string(), record);
    }

    pub fn seed_facet(&self, kind: FacetKind, external_id: &str, uri: &str) -> IdentityRef {
        let r = IdentityRef::new(uri, external_id);
        self.directory.write().insert((kind, external_id.to_string()), r.clone());
        r
    }

    pub fn seed_account_links(&self, account_uri: &str, links: AccountLinks) {
        self.account_links.write().insert(account_uri.to_string(), links);
    }

    pub fn record(&self, session_uri: &str) -> Option<SessionRecord> {
        self.sessions.read().get(session_uri).cloned()
    }

    /// Make every subsequent `swap` fail with `Denied`.
    pub fn deny_writes(&self, deny: bool) {
        self.deny_writes.store(deny, Ordering::SeqCst);
    }

    /// Make the next `n` `swap` calls report a lost race regardless of state.
    pub fn force_swap_failures(&self, n: usize) {
        self.forced_swap_failures.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn load(&self, session_uri: &str) -> Result<Option<SessionRecord>, StoreError> {
        Ok(self.sessions.read().get(session_uri).cloned())
    }

    async fn swap(
        &self,
        session_uri: &str,
        expected: Option<&SessionRecord>,
        next: &SessionRecord,
    ) -> Result<bool, StoreError> {
        if self.deny_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Denied("write rejected by access policy".into()));
        }
        if self
            .forced_swap_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Ok(false);
        }
        let mut sessions = self.sessions.write();
        let current = sessions.get(session_uri);
        if current != expected {
            return Ok(false);
        }
        sessions.insert(session_uri.to_string(), next.clone());
        Ok(true)
    }

    async fn resolve(&self, kind: FacetKind, external_id: &str) -> Result<Option<IdentityRef>, StoreError> {
        Ok(self.directory.read().get(&(kind, external_id.to_string())).cloned())
    }

    async fn expand_account(&self, account: &IdentityRef) -> Result<Option<AccountLinks>, StoreError> {
        Ok(self.account_links.read().get(&account.uri).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::FacetSet;

    fn record(id: &str, account: IdentityRef) -> SessionRecord {
        SessionRecord {
            session_id: id.to_string(),
            active: FacetSet { account: Some(account), ..Default::default() },
            original: None,
        }
    }

    #[tokio::test]
    async fn swap_applies_only_on_matching_state() {
        let store = MemoryStore::new();
        let a1 = IdentityRef::new("http://ex/account/1", "a1");
        let a2 = IdentityRef::new("http://ex/account/2", "a2");
        let base = record("s1", a1);
        store.seed_session("http://ex/session/1", base.clone());

        let next = record("s1", a2);
        // Stale expectation loses.
        assert!(!store.swap("http://ex/session/1", None, &next).await.unwrap());
        // Matching expectation wins.
        assert!(store.swap("http://ex/session/1", Some(&base), &next).await.unwrap());
        assert_eq!(store.record("http://ex/session/1").unwrap(), next);
        // The old expectation is now stale.
        assert!(!store.swap("http://ex/session/1", Some(&base), &next).await.unwrap());
    }

    #[tokio::test]
    async fn denied_writes_surface_as_store_error() {
        let store = MemoryStore::new();
        let a1 = IdentityRef::new("http://ex/account/1", "a1");
        store.deny_writes(true);
        let err = store
            .swap("http://ex/session/1", None, &record("s1", a1))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Denied(_)));
    }
}
