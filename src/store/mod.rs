//! Backing-store access for session identity state.
//! All session state lives in an external transactional store; this module
//! defines the narrow contract the overlay needs (a read, a compare-and-swap
//! write, and two lookup queries) plus the two backends: the SPARQL endpoint
//! used in deployments and an in-memory store for tests and local runs.

pub mod memory;
pub mod sparql;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::identity::{FacetKind, IdentityRef, SessionRecord};

/// Auxiliary facets reachable from an account, found by relationship
/// traversal: the account's holder links to a membership and a group, and
/// the account itself carries its session role.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountLinks {
    pub membership: Option<IdentityRef>,
    pub group: Option<IdentityRef>,
    pub role: Option<IdentityRef>,
}

/// Transactional store for session identity attributes.
///
/// `swap` is the only mutation: a conditional write that applies `next` only
/// if the session's record still equals `expected` (`None` meaning "no
/// identity attributes recorded"). Returning `false` signals a lost race;
/// the overlay re-reads and retries.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Read the session's identity attributes, or `None` if the session has
    /// none recorded.
    async fn load(&self, session_uri: &str) -> Result<Option<SessionRecord>, StoreError>;

    /// Conditionally replace the session's record. Returns `true` if the
    /// write applied, `false` if the current state no longer matched
    /// `expected`.
    async fn swap(
        &self,
        session_uri: &str,
        expected: Option<&SessionRecord>,
        next: &SessionRecord,
    ) -> Result<bool, StoreError>;

    /// Look up a facet entity by its short external id.
    async fn resolve(&self, kind: FacetKind, external_id: &str) -> Result<Option<IdentityRef>, StoreError>;

    /// Traverse from an account to its holder's membership and group.
    async fn expand_account(&self, account: &IdentityRef) -> Result<Option<AccountLinks>, StoreError>;
}
