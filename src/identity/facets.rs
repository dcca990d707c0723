use serde::{Deserialize, Serialize};

/// Canonical reference to an external identity entity, paired with the short
/// external id callers use to name it. The URI is the primary key inside the
/// store; the external id is what response documents render.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentityRef {
    pub uri: String,
    pub external_id: String,
}

impl IdentityRef {
    pub fn new<S: Into<String>>(uri: S, external_id: S) -> Self {
        Self { uri: uri.into(), external_id: external_id.into() }
    }
}

/// One component of an identity. The set of facets is fixed per deployment,
/// not per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FacetKind {
    Account,
    Membership,
    Role,
    Group,
    Resource,
}

impl FacetKind {
    /// Relationship name used in response documents.
    pub fn relationship(&self) -> &'static str {
        match self {
            FacetKind::Account => "account",
            FacetKind::Membership => "membership",
            FacetKind::Role => "role",
            FacetKind::Group => "group",
            FacetKind::Resource => "resource",
        }
    }

    /// Collection segment for resource links (`/accounts/{id}` etc.).
    pub fn collection(&self) -> &'static str {
        match self {
            FacetKind::Account => "accounts",
            FacetKind::Membership => "memberships",
            FacetKind::Role => "roles",
            FacetKind::Group => "groups",
            FacetKind::Resource => "resources",
        }
    }
}

/// A (possibly partial) identity: one optional reference per facet.
/// Absent facets stay absent; they are never rendered as nulls.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacetSet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<IdentityRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub membership: Option<IdentityRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<IdentityRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<IdentityRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<IdentityRef>,
}

impl FacetSet {
    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Present facets in a stable order, for rendering and for building
    /// store statements.
    pub fn entries(&self) -> Vec<(FacetKind, &IdentityRef)> {
        let mut out = Vec::new();
        if let Some(r) = &self.account { out.push((FacetKind::Account, r)); }
        if let Some(r) = &self.membership { out.push((FacetKind::Membership, r)); }
        if let Some(r) = &self.role { out.push((FacetKind::Role, r)); }
        if let Some(r) = &self.group { out.push((FacetKind::Group, r)); }
        if let Some(r) = &self.resource { out.push((FacetKind::Resource, r)); }
        out
    }

    pub fn get(&self, kind: FacetKind) -> Option<&IdentityRef> {
        match kind {
            FacetKind::Account => self.account.as_ref(),
            FacetKind::Membership => self.membership.as_ref(),
            FacetKind::Role => self.role.as_ref(),
            FacetKind::Group => self.group.as_ref(),
            FacetKind::Resource => self.resource.as_ref(),
        }
    }
}

/// Caller-supplied impersonation target: external ids, at least one present.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetSpec {
    pub account: Option<String>,
    pub membership: Option<String>,
    pub role: Option<String>,
    pub resource: Option<String>,
}

impl TargetSpec {
    pub fn is_empty(&self) -> bool {
        self.account.is_none()
            && self.membership.is_none()
            && self.role.is_none()
            && self.resource.is_none()
    }
}

/// The session's identity attributes as stored: the currently-effective facet
/// set plus, only while an impersonation is active, the displaced original.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Session uuid, assigned by the external authentication system.
    pub session_id: String,
    pub active: FacetSet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original: Option<FacetSet>,
}

impl SessionRecord {
    pub fn is_impersonating(&self) -> bool {
        self.original.is_some()
    }
}

/// Read-only view of a session's identity, handed to the adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdentityView {
    pub session_id: String,
    pub active: FacetSet,
    pub original: Option<FacetSet>,
}

impl From<SessionRecord> for IdentityView {
    fn from(rec: SessionRecord) -> Self {
        Self { session_id: rec.session_id, active: rec.active, original: rec.original }
    }
}
