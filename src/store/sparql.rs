//! SPARQL-endpoint session store.
//!
//! Session identity attributes live as triples on the session URI in an
//! external triple store (a mu-stack SPARQL endpoint). The conditional write
//! required by the overlay is expressed as a DELETE/INSERT whose WHERE clause
//! matches the expected prior triples exactly, so a writer that lost the race
//! matches nothing and applies nothing; the outcome is confirmed with a
//! read-back since SPARQL UPDATE reports no affected-row count.

use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::identity::{FacetKind, FacetSet, IdentityRef, SessionRecord};

use super::{AccountLinks, SessionStore};

const PREFIXES: &str = "\
PREFIX mu: <http://mu.semte.ch/vocabularies/core/>
PREFIX muExt: <http://mu.semte.ch/vocabularies/ext/>
PREFIX muSession: <http://mu.semte.ch/vocabularies/session/>
PREFIX foaf: <http://xmlns.com/foaf/0.1/>
PREFIX org: <http://www.w3.org/ns/org#>
";

const FACETS: [FacetKind; 5] = [
    FacetKind::Account,
    FacetKind::Membership,
    FacetKind::Role,
    FacetKind::Group,
    FacetKind::Resource,
];

/// Predicate linking a session to its currently-effective facet.
fn active_predicate(kind: FacetKind) -> &'static str {
    match kind {
        FacetKind::Account => "muSession:account",
        FacetKind::Membership => "muExt:sessionMembership",
        FacetKind::Role => "muExt:sessionRole",
        FacetKind::Group => "muExt:sessionGroup",
        FacetKind::Resource => "muExt:sessionResource",
    }
}

/// Predicate holding the displaced pre-impersonation facet.
fn original_predicate(kind: FacetKind) -> &'static str {
    match kind {
        FacetKind::Account => "muExt:originalAccount",
        FacetKind::Membership => "muExt:originalSessionMembership",
        FacetKind::Role => "muExt:originalSessionRole",
        FacetKind::Group => "muExt:originalSessionGroup",
        FacetKind::Resource => "muExt:originalSessionResource",
    }
}

/// rdf:type constraint applied when resolving an external id, where the
/// vocabulary defines one.
fn type_constraint(kind: FacetKind) -> Option<&'static str> {
    match kind {
        FacetKind::Role => Some("org:Role"),
        FacetKind::Membership => Some("org:Membership"),
        _ => None,
    }
}

pub fn sparql_escape_uri(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len() + 2);
    escaped.push('<');
    for c in value.chars() {
        match c {
            '\\' | '"' | '<' | '>' => {
                escaped.push('\\');
                escaped.push(c);
            }
            _ => escaped.push(c),
        }
    }
    escaped.push('>');
    escaped
}

pub fn sparql_escape_string(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

pub struct SparqlStore {
    client: reqwest::Client,
    endpoint: String,
}

impl SparqlStore {
    /// Build a store client against `endpoint` with a mandatory bounded
    /// request timeout.
    pub fn new(endpoint: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .with_context(|| format!("building SPARQL client for {}", endpoint))?;
        Ok(Self { client, endpoint: endpoint.to_string() })
    }

    async fn send(&self, field: &str, body: &str) -> Result<reqwest::Response, StoreError> {
        let resp = self
            .client
            .post(&self.endpoint)
            .header("Accept", "application/sparql-results+json")
            .form(&[(field, body)])
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    StoreError::Unavailable(format!("timeout talking to {}", self.endpoint))
                } else {
                    StoreError::Unavailable(e.to_string())
                }
            })?;
        let status = resp.status();
        if status == StatusCode::FORBIDDEN || status == StatusCode::UNAUTHORIZED {
            let reason = resp.text().await.unwrap_or_default();
            return Err(StoreError::Denied(if reason.is_empty() {
                "endpoint rejected the operation".to_string()
            } else {
                reason
            }));
        }
        if status.is_server_error() {
            warn!(status = %status, endpoint = %self.endpoint, "SPARQL endpoint error");
            return Err(StoreError::Unavailable(format!("endpoint answered {}", status)));
        }
        if !status.is_success() {
            return Err(StoreError::Protocol(format!("unexpected status {}", status)));
        }
        Ok(resp)
    }

    async fn select(&self, query: &str) -> Result<Vec<Value>, StoreError> {
        debug!(query, "sparql select");
        let resp = self.send("query", query).await?;
        let body: Value = resp
            .json()
            .await
            .map_err(|e| StoreError::Protocol(format!("invalid results document: {}", e)))?;
        let bindings = body
            .get("results")
            .and_then(|r| r.get("bindings"))
            .and_then(|b| b.as_array())
            .ok_or_else(|| StoreError::Protocol("results.bindings missing".into()))?;
        Ok(bindings.clone())
    }

    async fn update(&self, update: &str) -> Result<(), StoreError> {
        debug!(update, "sparql update");
        self.send("update", update).await?;
        Ok(())
    }
}

fn binding_value<'a>(row: &'a Value, var: &str) -> Option<&'a str> {
    row.get(var).and_then(|v| v.get("value")).and_then(|v| v.as_str())
}

fn binding_ref(row: &Value, uri_var: &str, id_var: &str) -> Option<IdentityRef> {
    let uri = binding_value(row, uri_var)?;
    let id = binding_value(row, id_var)?;
    Some(IdentityRef::new(uri, id))
}

/// SELECT retrieving the session uuid plus every active and original facet,
/// each optional so partially-populated identities come back as-is.
fn load_query(session_uri: &str) -> String {
    let mut q = String::from(PREFIXES);
    q.push_str("SELECT ?id");
    for kind in FACETS {
        let name = kind.relationship();
        q.push_str(&format!(" ?{name} ?{name}Id ?orig_{name} ?orig_{name}Id"));
    }
    q.push_str("\nWHERE {\n");
    q.push_str(&format!("  BIND({} AS ?uri)\n", sparql_escape_uri(session_uri)));
    q.push_str("  ?uri mu:uuid ?id .\n");
    for kind in FACETS {
        let name = kind.relationship();
        q.push_str(&format!(
            "  OPTIONAL {{ ?uri {} ?{name} . ?{name} mu:uuid ?{name}Id . }}\n",
            active_predicate(kind)
        ));
        q.push_str(&format!(
            "  OPTIONAL {{ ?uri {} ?orig_{name} . ?orig_{name} mu:uuid ?orig_{name}Id . }}\n",
            original_predicate(kind)
        ));
    }
    q.push_str("}\nLIMIT 1");
    q
}

fn facet_set_from_row(row: &Value, prefix: &str) -> FacetSet {
    let mut set = FacetSet::default();
    for kind in FACETS {
        let name = kind.relationship();
        let r = binding_ref(row, &format!("{prefix}{name}"), &format!("{prefix}{name}Id"));
        match kind {
            FacetKind::Account => set.account = r,
            FacetKind::Membership => set.membership = r,
            FacetKind::Role => set.role = r,
            FacetKind::Group => set.group = r,
            FacetKind::Resource => set.resource = r,
        }
    }
    set
}

/// Triple patterns that hold exactly when the session's stored facets equal
/// `expected`: present facets must match, absent ones must not exist.
fn guard_clauses(session: &str, expected: Option<&SessionRecord>) -> String {
    let mut out = String::new();
    let empty = FacetSet::default();
    let (active, original) = match expected {
        Some(rec) => (&rec.active, rec.original.as_ref().unwrap_or(&empty)),
        None => (&empty, &empty),
    };
    for kind in FACETS {
        for (set, pred) in [(active, active_predicate(kind)), (original, original_predicate(kind))] {
            match set.get(kind) {
                Some(r) => out.push_str(&format!("  {session} {pred} {} .\n", sparql_escape_uri(&r.uri))),
                None => out.push_str(&format!("  FILTER NOT EXISTS {{ {session} {pred} ?x_{pred_var} . }}\n",
                    pred_var = pred.replace(':', "_"))),
            }
        }
    }
    out
}

/// One-shot conditional DELETE/INSERT: removes the expected triples and
/// writes the next ones, guarded so that a stale writer matches nothing.
fn swap_update(session_uri: &str, expected: Option<&SessionRecord>, next: &SessionRecord) -> String {
    let session = sparql_escape_uri(session_uri);
    let mut delete = String::new();
    let empty = FacetSet::default();
    let (exp_active, exp_original) = match expected {
        Some(rec) => (&rec.active, rec.original.as_ref().unwrap_or(&empty)),
        None => (&empty, &empty),
    };
    for kind in FACETS {
        if let Some(r) = exp_active.get(kind) {
            delete.push_str(&format!("  {session} {} {} .\n", active_predicate(kind), sparql_escape_uri(&r.uri)));
        }
        if let Some(r) = exp_original.get(kind) {
            delete.push_str(&format!("  {session} {} {} .\n", original_predicate(kind), sparql_escape_uri(&r.uri)));
        }
    }
    let mut insert = String::new();
    let next_original = next.original.as_ref().unwrap_or(&empty);
    for kind in FACETS {
        if let Some(r) = next.active.get(kind) {
            insert.push_str(&format!("  {session} {} {} .\n", active_predicate(kind), sparql_escape_uri(&r.uri)));
        }
        if let Some(r) = next_original.get(kind) {
            insert.push_str(&format!("  {session} {} {} .\n", original_predicate(kind), sparql_escape_uri(&r.uri)));
        }
    }
    format!(
        "{PREFIXES}DELETE {{\n{delete}}}\nINSERT {{\n{insert}}}\nWHERE {{\n  {session} mu:uuid ?id .\n{guard}}}",
        guard = guard_clauses(&session, expected)
    )
}

fn resolve_query(kind: FacetKind, external_id: &str) -> String {
    let type_clause = match type_constraint(kind) {
        Some(t) => format!("?uri a {} ; mu:uuid {} .", t, sparql_escape_string(external_id)),
        None => format!("?uri mu:uuid {} .", sparql_escape_string(external_id)),
    };
    format!("{PREFIXES}SELECT DISTINCT ?uri\nWHERE {{\n  {type_clause}\n}}\nLIMIT 1")
}

fn expand_account_query(account_uri: &str) -> String {
    format!(
        "{PREFIXES}SELECT ?membership ?membershipId ?group ?groupId ?role ?roleId\nWHERE {{\n  \
         ?holder foaf:account {account} .\n  \
         OPTIONAL {{ ?holder org:hasMembership ?membership . ?membership mu:uuid ?membershipId . }}\n  \
         OPTIONAL {{ ?holder foaf:member ?group . ?group mu:uuid ?groupId . }}\n  \
         OPTIONAL {{ {account} muExt:sessionRole ?role . ?role mu:uuid ?roleId . }}\n}}\nLIMIT 1",
        account = sparql_escape_uri(account_uri)
    )
}

#[async_trait::async_trait]
impl SessionStore for SparqlStore {
    async fn load(&self, session_uri: &str) -> Result<Option<SessionRecord>, StoreError> {
        let rows = self.select(&load_query(session_uri)).await?;
        let Some(row) = rows.first() else { return Ok(None) };
        let session_id = binding_value(row, "id")
            .ok_or_else(|| StoreError::Protocol("session binding lacks uuid".into()))?
            .to_string();
        let active = facet_set_from_row(row, "");
        let original = {
            let set = facet_set_from_row(row, "orig_");
            if set.is_empty() { None } else { Some(set) }
        };
        // A session known to the store but with no identity attributes has
        // never been initialized from the overlay's point of view.
        if active.is_empty() && original.is_none() {
            return Ok(None);
        }
        Ok(Some(SessionRecord { session_id, active, original }))
    }

    async fn swap(
        &self,
        session_uri: &str,
        expected: Option<&SessionRecord>,
        next: &SessionRecord,
    ) -> Result<bool, StoreError> {
        self.update(&swap_update(session_uri, expected, next)).await?;
        // SPARQL UPDATE is silent about whether the guard matched; confirm
        // with a read-back.
        let after = self.load(session_uri).await?;
        Ok(after.as_ref().map(|rec| (&rec.active, &rec.original)) == Some((&next.active, &next.original)))
    }

    async fn resolve(&self, kind: FacetKind, external_id: &str) -> Result<Option<IdentityRef>, StoreError> {
        let rows = self.select(&resolve_query(kind, external_id)).await?;
        let Some(row) = rows.first() else { return Ok(None) };
        let uri = binding_value(row, "uri")
            .ok_or_else(|| StoreError::Protocol("resolve binding lacks uri".into()))?;
        Ok(Some(IdentityRef::new(uri, external_id)))
    }

    async fn expand_account(&self, account: &IdentityRef) -> Result<Option<AccountLinks>, StoreError> {
        let rows = self.select(&expand_account_query(&account.uri)).await?;
        let Some(row) = rows.first() else { return Ok(None) };
        Ok(Some(AccountLinks {
            membership: binding_ref(row, "membership", "membershipId"),
            group: binding_ref(row, "group", "groupId"),
            role: binding_ref(row, "role", "roleId"),
        }))
    }
}
