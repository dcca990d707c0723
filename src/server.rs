//!
//! masquerade HTTP server
//! ----------------------
//! Axum adapter over the session identity overlay. Thin by design: it pulls
//! the session reference out of the `mu-session-id` header, parses the
//! request document into a partial target spec, delegates to the overlay and
//! renders identity views as linked-resource documents. After every
//! successful state change it tells downstream authorization caches to drop
//! their state via the `mu-auth-allowed-groups: CLEAR` response header.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info};

use crate::config::{Config, StoreBackend};
use crate::error::AppError;
use crate::identity::{EndOutcome, FacetKind, IdentityRef, IdentityView, SessionOverlay, TargetSpec};
use crate::store::memory::MemoryStore;
use crate::store::sparql::SparqlStore;
use crate::store::SessionStore;

const SESSION_HEADER: &str = "mu-session-id";
const ALLOWED_GROUPS_HEADER: &str = "mu-auth-allowed-groups";

/// Shared server state injected into all handlers.
#[derive(Clone)]
pub struct AppState {
    pub overlay: Arc<SessionOverlay>,
}

/// Start the masquerade HTTP server with the given configuration.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let store: Arc<dyn SessionStore> = match config.store {
        StoreBackend::Sparql => Arc::new(SparqlStore::new(&config.sparql_endpoint, config.store_timeout)?),
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
    };
    let overlay = Arc::new(SessionOverlay::new(store, config.shape).with_retry_budget(config.retry_budget));
    let app = router(AppState { overlay });

    let addr: SocketAddr = format!("0.0.0.0:{}", config.http_port).parse()?;
    info!("Starting server on {} (shape={})", addr, config.shape.label());
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(|| async { "masquerade ok" }))
        .route("/impersonate/current", get(get_current).post(begin_impersonation))
        .route("/impersonate", delete(end_impersonation))
        .with_state(state)
}

/// Request document for starting an impersonation; external ids, at least
/// one required.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ImpersonatePayload {
    impersonated_account: Option<String>,
    impersonated_membership: Option<String>,
    impersonated_role: Option<String>,
    impersonated_resource: Option<String>,
}

impl From<ImpersonatePayload> for TargetSpec {
    fn from(p: ImpersonatePayload) -> Self {
        TargetSpec {
            account: p.impersonated_account,
            membership: p.impersonated_membership,
            role: p.impersonated_role,
            resource: p.impersonated_resource,
        }
    }
}

fn session_uri_from_headers(headers: &HeaderMap) -> Result<String, AppError> {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| AppError::user("missing_session", "the mu-session-id header is required"))
}

fn clear_groups_headers() -> HeaderMap {
    let mut h = HeaderMap::new();
    h.insert(ALLOWED_GROUPS_HEADER, HeaderValue::from_static("CLEAR"));
    h
}

fn error_response(e: &AppError) -> Response {
    let status = StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        error!(code = e.code_str(), "request failed: {}", e);
    }
    (status, Json(json!({"status": "error", "code": e.code_str(), "message": e.message()}))).into_response()
}

fn relationship_doc(kind: FacetKind, r: &IdentityRef) -> Value {
    json!({
        "links": format!("/{}/{}", kind.collection(), r.external_id),
        "data": { "type": kind.collection(), "id": r.external_id },
    })
}

/// Render an identity view as a linked-resource document. Absent facets are
/// omitted entirely; the original identity shows up as a parallel
/// `original-*` relationship set only while impersonating.
fn render_view(view: &IdentityView) -> Value {
    let mut relationships = serde_json::Map::new();
    for (kind, r) in view.active.entries() {
        relationships.insert(kind.relationship().to_string(), relationship_doc(kind, r));
    }
    if let Some(original) = &view.original {
        for (kind, r) in original.entries() {
            relationships.insert(format!("original-{}", kind.relationship()), relationship_doc(kind, r));
        }
    }
    let mut data = json!({ "type": "sessions", "id": view.session_id });
    if !relationships.is_empty() {
        data["relationships"] = Value::Object(relationships);
    }
    json!({ "links": { "self": "/impersonate/current" }, "data": data })
}

async fn get_current(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let session = match session_uri_from_headers(&headers) {
        Ok(s) => s,
        Err(e) => return error_response(&e),
    };
    match state.overlay.current(&session).await {
        Ok(view) => (StatusCode::OK, Json(render_view(&view))).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn begin_impersonation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<ImpersonatePayload>,
) -> Response {
    let session = match session_uri_from_headers(&headers) {
        Ok(s) => s,
        Err(e) => return error_response(&e),
    };
    let target: TargetSpec = payload.into();
    if target.is_empty() {
        return error_response(&AppError::user("empty_target", "at least one impersonation target must be supplied"));
    }
    match state.overlay.begin(&session, &target).await {
        Ok(view) => (StatusCode::OK, clear_groups_headers(), Json(render_view(&view))).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn end_impersonation(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let session = match session_uri_from_headers(&headers) {
        Ok(s) => s,
        Err(e) => return error_response(&e),
    };
    match state.overlay.end(&session).await {
        Ok(EndOutcome::Restored) => (StatusCode::NO_CONTENT, clear_groups_headers()).into_response(),
        Ok(EndOutcome::NotImpersonating) => {
            error_response(&AppError::not_found("no_active_impersonation", "session is not impersonating anyone"))
        }
        Err(e) => error_response(&e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::FacetSet;

    fn r(uri: &str, id: &str) -> IdentityRef {
        IdentityRef::new(uri, id)
    }

    #[test]
    fn render_omits_absent_facets() {
        let view = IdentityView {
            session_id: "s1".into(),
            active: FacetSet { role: Some(r("http://ex/role/1", "role-1")), ..Default::default() },
            original: None,
        };
        let doc = render_view(&view);
        let rels = &doc["data"]["relationships"];
        assert_eq!(rels["role"]["data"]["id"], "role-1");
        assert_eq!(rels["role"]["links"], "/roles/role-1");
        assert!(rels.get("account").is_none());
        assert!(rels.get("original-role").is_none());
    }

    #[test]
    fn render_includes_original_while_impersonating() {
        let view = IdentityView {
            session_id: "s1".into(),
            active: FacetSet {
                account: Some(r("http://ex/account/2", "a2")),
                membership: Some(r("http://ex/membership/2", "m2")),
                ..Default::default()
            },
            original: Some(FacetSet {
                account: Some(r("http://ex/account/1", "a1")),
                membership: Some(r("http://ex/membership/1", "m1")),
                ..Default::default()
            }),
        };
        let doc = render_view(&view);
        let rels = &doc["data"]["relationships"];
        assert_eq!(rels["account"]["data"]["id"], "a2");
        assert_eq!(rels["original-account"]["data"]["id"], "a1");
        assert_eq!(rels["original-membership"]["links"], "/memberships/m1");
        assert_eq!(doc["links"]["self"], "/impersonate/current");
    }

    #[test]
    fn session_header_is_required() {
        let err = session_uri_from_headers(&HeaderMap::new()).unwrap_err();
        assert_eq!(err.http_status(), 400);

        let mut headers = HeaderMap::new();
        headers.insert(SESSION_HEADER, HeaderValue::from_static("  "));
        assert!(session_uri_from_headers(&headers).is_err());

        headers.insert(SESSION_HEADER, HeaderValue::from_static("http://ex/session/1"));
        assert_eq!(session_uri_from_headers(&headers).unwrap(), "http://ex/session/1");
    }

    #[test]
    fn payload_accepts_camel_case_keys() {
        let p: ImpersonatePayload =
            serde_json::from_value(json!({"impersonatedAccount": "a1", "impersonatedMembership": "m1"})).unwrap();
        let target: TargetSpec = p.into();
        assert_eq!(target.account.as_deref(), Some("a1"));
        assert_eq!(target.membership.as_deref(), Some("m1"));
        assert!(target.role.is_none());

        let empty: ImpersonatePayload = serde_json::from_value(json!({})).unwrap();
        assert!(TargetSpec::from(empty).is_empty());
    }
}
