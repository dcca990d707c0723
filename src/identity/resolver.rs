//! External-id resolution. Pure lookups against the store: no mutation, no
//! caching. Malformed or empty ids short-circuit to "not found" before any
//! store round trip.

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::error::AppResult;
use crate::identity::{FacetKind, IdentityRef};
use crate::store::{AccountLinks, SessionStore};

// Short external ids as minted by the identifier service: uuid-like tokens.
static EXTERNAL_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._:-]{0,127}$").unwrap_or_else(|e| panic!("external id regex: {e}")));

#[derive(Clone)]
pub struct Resolver {
    store: Arc<dyn SessionStore>,
}

impl Resolver {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    /// Resolve a short external id to its canonical reference, or `None` if
    /// the id is malformed or names nothing.
    pub async fn resolve(&self, kind: FacetKind, external_id: &str) -> AppResult<Option<IdentityRef>> {
        if !EXTERNAL_ID_RE.is_match(external_id) {
            debug!(?kind, external_id, "rejecting malformed external id without querying");
            return Ok(None);
        }
        Ok(self.store.resolve(kind, external_id).await?)
    }

    /// Relationship traversal from an account to its holder's membership and
    /// group, needed to fully populate an account-shaped identity.
    pub async fn expand_account(&self, account: &IdentityRef) -> AppResult<Option<AccountLinks>> {
        Ok(self.store.expand_account(account).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    #[tokio::test]
    async fn malformed_ids_short_circuit() {
        let store = Arc::new(MemoryStore::new());
        // Seed an entry under the empty id; the guard must still refuse it.
        store.seed_facet(FacetKind::Account, "", "http://ex/account/broken");
        let resolver = Resolver::new(store);
        assert!(resolver.resolve(FacetKind::Account, "").await.unwrap().is_none());
        assert!(resolver.resolve(FacetKind::Account, "a b").await.unwrap().is_none());
        assert!(resolver.resolve(FacetKind::Account, "<urn:evil>").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn resolves_seeded_ids() {
        let store = Arc::new(MemoryStore::new());
        let seeded = store.seed_facet(FacetKind::Role, "role-1", "http://ex/role/1");
        let resolver = Resolver::new(store);
        let found = resolver.resolve(FacetKind::Role, "role-1").await.unwrap();
        assert_eq!(found, Some(seeded));
        assert!(resolver.resolve(FacetKind::Role, "role-2").await.unwrap().is_none());
    }
}
