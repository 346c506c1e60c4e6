//! Registry reverse proxy (C6) — the central protocol surface.
//!
//! Stateless across requests: every authorization and forward decision
//! depends only on the request and the current policy snapshot (§4.3).

pub mod forward;

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use tower_http::trace::TraceLayer;
use tracing::instrument;

use crate::audit::AuditSink;
use crate::auth::{image_path_from_v2, MethodClass, PolicyResolver};
use crate::model::AuditEvent;
use crate::{Config, Error, Result};

pub struct ProxyState {
    pub config: Arc<Config>,
    pub resolver: Arc<PolicyResolver>,
    pub audit: Arc<AuditSink>,
    pub http_client: reqwest::Client,
}

impl ProxyState {
    pub fn new(config: Arc<Config>, resolver: Arc<PolicyResolver>, audit: Arc<AuditSink>) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.proxy_timeout_secs))
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            config,
            resolver,
            audit,
            http_client,
        })
    }
}

pub fn router(state: Arc<ProxyState>) -> Router {
    Router::new()
        .route("/v2/", any(handle))
        .route("/v2/{*path}", any(handle))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[instrument(skip(state, request), fields(method = %request.method(), uri = %request.uri()))]
async fn handle(State(state): State<Arc<ProxyState>>, request: Request) -> Response {
    match forward_request(&state, request).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn forward_request(state: &ProxyState, request: Request) -> Result<Response> {
    let start = Instant::now();
    let method = request.method().clone();
    let uri = request.uri().clone();
    let mut headers = request.headers().clone();
    let client_ip = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let image_path = uri.path().strip_prefix("/v2/").and_then(|_| image_path_from_v2(uri.path()));

    let username = if state.config.registry_proxy_auth_enabled {
        match authorize_request(state, &method, image_path, &headers).await {
            Ok(username) => username,
            Err(e) => {
                let status = match &e {
                    Error::Unauthenticated => 401,
                    Error::Forbidden(_) => 403,
                    _ => 500,
                };
                audit_and_return(state, &method, uri.path(), status, 0, start, client_ip, None).await;
                return Err(e);
            }
        }
    } else {
        None
    };

    let body = axum::body::to_bytes(request.into_body(), usize::MAX)
        .await
        .map_err(|e| Error::FatalInternal(format!("failed to buffer request body: {e}")))?;

    forward::strip_hop_by_hop(&mut headers);
    let is_pull = matches!(method, Method::GET | Method::HEAD);
    forward::widen_oci_accept(&mut headers, uri.path(), is_pull);

    let upstream_url = format!(
        "{}{}",
        state.config.registry_url.trim_end_matches('/'),
        path_and_query(&uri)
    );

    let outbound = state
        .http_client
        .request(reqwest_method(&method), &upstream_url)
        .headers(convert_headers_out(&headers))
        .body(body.clone())
        .send()
        .await;

    let upstream_response = match outbound {
        Ok(response) => response,
        Err(e) if e.is_timeout() => {
            audit_and_return(state, &method, uri.path(), 504, 0, start, client_ip, username).await;
            return Err(Error::UpstreamTimeout);
        }
        Err(e) if e.is_connect() => {
            audit_and_return(state, &method, uri.path(), 503, 0, start, client_ip, username).await;
            return Err(Error::UpstreamUnreachable(e.to_string()));
        }
        Err(e) => return Err(Error::Http(e)),
    };

    let status = upstream_response.status();
    let mut response_headers = upstream_response.headers().clone();
    let response_body = upstream_response.bytes().await?;

    let bytes_for_audit = if is_pull { response_body.len() } else { body.len() };
    audit_and_return(
        state,
        &method,
        uri.path(),
        status.as_u16(),
        bytes_for_audit,
        start,
        client_ip,
        username,
    )
    .await;

    let mut out_headers = HeaderMap::new();
    for (name, value) in response_headers.iter() {
        out_headers.insert(name.clone(), value.clone());
    }
    forward::strip_hop_by_hop(&mut out_headers);
    if let Some(location) = response_headers.get(axum::http::header::LOCATION).and_then(|v| v.to_str().ok()) {
        let rewritten = forward::rewrite_location(location, &state.config.registry_url, &state.config.public_base_url);
        if let Ok(value) = axum::http::HeaderValue::from_str(&rewritten) {
            out_headers.insert(forward::location_header_name(), value);
        }
    }
    response_headers.clear();

    let axum_status = StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    Ok((axum_status, out_headers, Bytes::from(response_body)).into_response())
}

/// Resolves the principal and enforces §3's folder rule, returning the
/// principal's username for audit attribution.
async fn authorize_request(
    state: &ProxyState,
    method: &Method,
    image_path: Option<&str>,
    headers: &HeaderMap,
) -> Result<Option<String>> {
    let authorization = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let principal = state.resolver.resolve_principal(authorization).await?;
    let username = principal.username().to_string();

    let Some(class) = MethodClass::of(method) else {
        return Ok(Some(username));
    };
    let Some(image_path) = image_path else {
        // No repository segment to scope against (e.g. a malformed v2 path);
        // let upstream produce its own 404 rather than guessing an authz verdict.
        return Ok(Some(username));
    };
    state.resolver.authorize(&principal, image_path, class).await?;
    Ok(Some(username))
}

async fn audit_and_return(
    state: &ProxyState,
    method: &Method,
    path: &str,
    http_status: u16,
    bytes: usize,
    start: Instant,
    client_ip: Option<String>,
    username: Option<String>,
) {
    let event_name = if matches!(*method, Method::GET | Method::HEAD) {
        "registry_pull"
    } else {
        "registry_push"
    };
    let event = AuditEvent {
        event: event_name.to_string(),
        timestamp: chrono::Utc::now(),
        path: Some(path.to_string()),
        method: Some(method.to_string()),
        http_status,
        bytes: bytes as u64,
        elapsed_s: start.elapsed().as_secs_f64(),
        client_ip,
        username,
    };
    if let Err(e) = state.audit.emit(event).await {
        tracing::error!(error = %e, "failed to emit audit event");
    }
}

fn path_and_query(uri: &Uri) -> String {
    uri.path_and_query().map(|pq| pq.as_str().to_string()).unwrap_or_else(|| uri.path().to_string())
}

fn reqwest_method(method: &Method) -> reqwest::Method {
    reqwest::Method::from_bytes(method.as_str().as_bytes()).unwrap_or(reqwest::Method::GET)
}

fn convert_headers_out(headers: &HeaderMap) -> reqwest::header::HeaderMap {
    let mut out = reqwest::header::HeaderMap::new();
    for (name, value) in headers.iter() {
        if let (Ok(name), Ok(value)) = (
            reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()),
            reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            out.append(name, value);
        }
    }
    out
}
