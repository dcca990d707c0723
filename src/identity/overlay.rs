//! The session identity overlay state machine.
//!
//! All state lives in the external store; every public operation is one
//! logical read-modify-write expressed through the store's compare-and-swap
//! `swap`, with a bounded optimistic-retry loop around it. The invariants:
//! a session always has exactly one active identity; the original identity
//! exists only while impersonating; the first original captured stays
//! authoritative across retargeted impersonations until the impersonation
//! ends; ending restores exactly the pre-impersonation state.

use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{AppError, AppResult};
use crate::identity::{FacetKind, FacetSet, IdentityView, SessionRecord, TargetSpec};
use crate::identity::resolver::Resolver;
use crate::store::SessionStore;

const DEFAULT_RETRY_BUDGET: usize = 4;

/// Which facet shape this deployment impersonates. Deployments differ only
/// here; the overlay protocol itself is shared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayShape {
    /// Impersonate an account together with its membership and group.
    AccountMembership,
    /// Impersonate a bare role.
    Role,
    /// Impersonate a generic resource.
    Resource,
}

impl OverlayShape {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "account-membership" | "account" => Some(OverlayShape::AccountMembership),
            "role" => Some(OverlayShape::Role),
            "resource" => Some(OverlayShape::Resource),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            OverlayShape::AccountMembership => "account-membership",
            OverlayShape::Role => "role",
            OverlayShape::Resource => "resource",
        }
    }

    /// Caller-input check: the target must be non-empty and must only name
    /// facets this deployment impersonates.
    fn validate(&self, target: &TargetSpec) -> AppResult<()> {
        if target.is_empty() {
            return Err(AppError::user("empty_target", "at least one impersonation target must be supplied"));
        }
        let mismatch = |facet: &str| {
            AppError::user(
                "target_shape_mismatch".to_string(),
                format!("this deployment impersonates {}; {} is not accepted", self.label(), facet),
            )
        };
        match self {
            OverlayShape::AccountMembership => {
                if target.role.is_some() { return Err(mismatch("a role")); }
                if target.resource.is_some() { return Err(mismatch("a resource")); }
                if target.account.is_none() {
                    return Err(AppError::user("missing_account", "an account to impersonate must be supplied"));
                }
            }
            OverlayShape::Role => {
                if target.account.is_some() || target.membership.is_some() { return Err(mismatch("an account")); }
                if target.resource.is_some() { return Err(mismatch("a resource")); }
                if target.role.is_none() {
                    return Err(AppError::user("missing_role", "a role to impersonate must be supplied"));
                }
            }
            OverlayShape::Resource => {
                if target.account.is_some() || target.membership.is_some() { return Err(mismatch("an account")); }
                if target.role.is_some() { return Err(mismatch("a role")); }
                if target.resource.is_none() {
                    return Err(AppError::user("missing_resource", "a resource to impersonate must be supplied"));
                }
            }
        }
        Ok(())
    }
}

/// Outcome of ending an impersonation. Treating `NotImpersonating` as an
/// error or a no-op success is the adapter's choice, not the overlay's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndOutcome {
    Restored,
    NotImpersonating,
}

pub struct SessionOverlay {
    store: Arc<dyn SessionStore>,
    resolver: Resolver,
    shape: OverlayShape,
    retry_budget: usize,
}

impl SessionOverlay {
    pub fn new(store: Arc<dyn SessionStore>, shape: OverlayShape) -> Self {
        let resolver = Resolver::new(store.clone());
        Self { store, resolver, shape, retry_budget: DEFAULT_RETRY_BUDGET }
    }

    pub fn with_retry_budget(mut self, retry_budget: usize) -> Self {
        self.retry_budget = retry_budget;
        self
    }

    pub fn shape(&self) -> OverlayShape {
        self.shape
    }

    /// Read the session's current identity. Pure read, no side effects.
    pub async fn current(&self, session_uri: &str) -> AppResult<IdentityView> {
        match self.store.load(session_uri).await? {
            Some(rec) => Ok(rec.into()),
            None => Err(AppError::not_found("session_not_found", "session has no identity attributes recorded")),
        }
    }

    /// Start impersonating, or retarget an impersonation already in
    /// progress. The first call captures the displaced identity as the
    /// original; later calls replace only the active identity, so the true
    /// original survives until the impersonation ends.
    pub async fn begin(&self, session_uri: &str, target: &TargetSpec) -> AppResult<IdentityView> {
        self.shape.validate(target)?;
        let resolved = self.resolve_target(target).await?;
        for attempt in 0..=self.retry_budget {
            let Some(current) = self.store.load(session_uri).await? else {
                return Err(AppError::not_found("session_not_found", "session has no identity attributes recorded"));
            };
            let next = SessionRecord {
                session_id: current.session_id.clone(),
                active: resolved.clone(),
                original: current.original.clone().or_else(|| Some(current.active.clone())),
            };
            if self.store.swap(session_uri, Some(&current), &next).await? {
                info!(
                    session = %session_uri,
                    retargeted = current.is_impersonating(),
                    "impersonation started"
                );
                return Ok(next.into());
            }
            debug!(session = %session_uri, attempt, "impersonation write lost a race; retrying");
        }
        Err(AppError::contention("concurrent_modification", "session was modified concurrently; retry the request"))
    }

    /// End the active impersonation, restoring the pre-impersonation
    /// identity verbatim. No resolver calls: the stored references are
    /// already canonical.
    pub async fn end(&self, session_uri: &str) -> AppResult<EndOutcome> {
        for attempt in 0..=self.retry_budget {
            let Some(current) = self.store.load(session_uri).await? else {
                return Ok(EndOutcome::NotImpersonating);
            };
            let Some(original) = current.original.clone() else {
                return Ok(EndOutcome::NotImpersonating);
            };
            let next = SessionRecord {
                session_id: current.session_id.clone(),
                active: original,
                original: None,
            };
            if self.store.swap(session_uri, Some(&current), &next).await? {
                info!(session = %session_uri, "impersonation ended");
                return Ok(EndOutcome::Restored);
            }
            debug!(session = %session_uri, attempt, "restore write lost a race; retrying");
        }
        Err(AppError::contention("concurrent_modification", "session was modified concurrently; retry the request"))
    }

    /// Resolve the caller's partial target into the full facet set required
    /// by this deployment's shape. Any facet that fails to resolve, or an
    /// account whose holder lacks the auxiliary facets, is a 404-class
    /// target-not-found failure, distinct from authorization failures.
    async fn resolve_target(&self, target: &TargetSpec) -> AppResult<FacetSet> {
        let missing = |what: String| AppError::NotFound { code: "target_not_found".into(), message: what };
        match self.shape {
            OverlayShape::AccountMembership => {
                let account_id = target.account.as_deref().unwrap_or_default();
                let account = self
                    .resolver
                    .resolve(FacetKind::Account, account_id)
                    .await?
                    .ok_or_else(|| missing(format!("account {account_id} does not exist")))?;
                let links = self
                    .resolver
                    .expand_account(&account)
                    .await?
                    .ok_or_else(|| missing(format!("account {account_id} has no holder")))?;
                let membership = match &target.membership {
                    Some(id) => Some(
                        self.resolver
                            .resolve(FacetKind::Membership, id)
                            .await?
                            .ok_or_else(|| missing(format!("membership {id} does not exist")))?,
                    ),
                    None => links.membership,
                };
                let membership = membership
                    .ok_or_else(|| missing(format!("account {account_id} has no membership to impersonate")))?;
                Ok(FacetSet {
                    account: Some(account),
                    membership: Some(membership),
                    group: links.group,
                    role: links.role,
                    ..Default::default()
                })
            }
            OverlayShape::Role => {
                let role_id = target.role.as_deref().unwrap_or_default();
                let role = self
                    .resolver
                    .resolve(FacetKind::Role, role_id)
                    .await?
                    .ok_or_else(|| missing(format!("role {role_id} does not exist")))?;
                Ok(FacetSet { role: Some(role), ..Default::default() })
            }
            OverlayShape::Resource => {
                let resource_id = target.resource.as_deref().unwrap_or_default();
                let resource = self
                    .resolver
                    .resolve(FacetKind::Resource, resource_id)
                    .await?
                    .ok_or_else(|| missing(format!("resource {resource_id} does not exist")))?;
                Ok(FacetSet { resource: Some(resource), ..Default::default() })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(account: Option<&str>, role: Option<&str>, resource: Option<&str>) -> TargetSpec {
        TargetSpec {
            account: account.map(str::to_string),
            role: role.map(str::to_string),
            resource: resource.map(str::to_string),
            membership: None,
        }
    }

    #[test]
    fn empty_target_is_rejected() {
        for shape in [OverlayShape::AccountMembership, OverlayShape::Role, OverlayShape::Resource] {
            let err = shape.validate(&TargetSpec::default()).unwrap_err();
            assert_eq!(err.http_status(), 400);
            assert_eq!(err.code_str(), "empty_target");
        }
    }

    #[test]
    fn shape_rejects_foreign_facets() {
        let err = OverlayShape::Role.validate(&target(Some("a1"), None, None)).unwrap_err();
        assert_eq!(err.code_str(), "target_shape_mismatch");
        let err = OverlayShape::AccountMembership.validate(&target(None, Some("r1"), None)).unwrap_err();
        assert_eq!(err.code_str(), "target_shape_mismatch");
        let err = OverlayShape::Resource.validate(&target(None, Some("r1"), None)).unwrap_err();
        assert_eq!(err.code_str(), "target_shape_mismatch");
    }

    #[test]
    fn shape_accepts_its_own_facet() {
        assert!(OverlayShape::AccountMembership.validate(&target(Some("a1"), None, None)).is_ok());
        assert!(OverlayShape::Role.validate(&target(None, Some("r1"), None)).is_ok());
        assert!(OverlayShape::Resource.validate(&target(None, None, Some("x1"))).is_ok());
    }

    #[test]
    fn shape_labels_round_trip() {
        for shape in [OverlayShape::AccountMembership, OverlayShape::Role, OverlayShape::Resource] {
            assert_eq!(OverlayShape::parse(shape.label()), Some(shape));
        }
        assert_eq!(OverlayShape::parse("account"), Some(OverlayShape::AccountMembership));
        assert_eq!(OverlayShape::parse("bogus"), None);
    }
}
