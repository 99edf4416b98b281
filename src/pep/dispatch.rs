//! Dispatch engine — the HTTP handler behind every frontend connection.
//!
//! Per request:
//!
//! ```text
//! Resolve ──► Prepare transport ──► Correlate ──► Decide ──► Forward ──► Annotate
//!   │ 404          │ 501 / 500          │ 413/400     │ 403      │ 502
//! ```
//!
//! The whole chain runs under the request timeout (504).
//!
//! The routing key is the SNI negotiated on the TLS connection, never the
//! `Host` header.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Extension;
use axum::Router;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::correlation::{BodyError, correlate_request};
use crate::logging::DATA_PLANE;
use crate::pdp::{DecisionPoint, PolicyDecision, RequestMetadata};
use crate::pep::pages;
use crate::pep::transport::Transports;
use crate::registry::ServiceRegistry;
use crate::Error;

/// Value of the `Strict-Transport-Security` header added to every backend
/// response.
pub const HSTS: &str = "max-age=63072000; includeSubDomains";

/// Headers that describe one hop and are never forwarded.
static HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

const X_FORWARDED_FOR: &str = "x-forwarded-for";

// ─────────────────────────────────────────────────────────────────────────────
// State
// ─────────────────────────────────────────────────────────────────────────────

/// Facts about the TLS connection a request arrived on.
///
/// Inserted as a request extension by the frontend server, one per
/// connection.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// SNI from the `ClientHello`
    pub sni: String,
    /// Peer address
    pub remote_addr: SocketAddr,
    /// Subject of the verified client certificate
    pub client_subject: Option<String>,
}

/// Shared, read-only dispatch state.
#[derive(Debug)]
pub struct DispatchState {
    /// Routing table
    pub registry: Arc<ServiceRegistry>,
    /// Outbound transports
    pub transports: Arc<Transports>,
    /// Authorization boundary
    pub pdp: Arc<dyn DecisionPoint>,
    /// Largest request body buffered for correlation
    pub max_body_size: usize,
    /// Deadline for one exchange, until the backend's response head arrives
    pub request_timeout: Duration,
}

/// Router answering every path with [`dispatch`].
pub fn router(state: Arc<DispatchState>) -> Router {
    Router::new().fallback(dispatch).with_state(state)
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Per-request failures. None of them affects other requests.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// No service for the SNI
    #[error("requested service {0} could not be served")]
    UnknownService(String),

    /// Backend scheme has no transport
    #[error("requested service {0} does not implement requested scheme")]
    UnsupportedScheme(String),

    /// Transport could not be built
    #[error("while serving requested service {service} an internal error occurred: {reason}")]
    Internal {
        /// Routing key
        service: String,
        /// What went wrong
        reason: String,
    },

    /// PDP refused the request
    #[error("request to {service} denied: {reason}")]
    Denied {
        /// Routing key
        service: String,
        /// PDP reason
        reason: String,
    },

    /// Request body could not be buffered
    #[error("request body for {service} rejected: {source}")]
    Body {
        /// Routing key
        service: String,
        /// Underlying cause
        #[source]
        source: BodyError,
    },

    /// Backend unreachable or failed mid-exchange
    #[error("http: proxy error: {0}")]
    Backend(String),

    /// Exchange exceeded the request timeout
    #[error("request to {0} timed out")]
    Timeout(String),
}

impl DispatchError {
    /// HTTP status reported to the client.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::UnknownService(_) => StatusCode::NOT_FOUND,
            Self::UnsupportedScheme(_) => StatusCode::NOT_IMPLEMENTED,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Denied { .. } => StatusCode::FORBIDDEN,
            Self::Body {
                source: BodyError::TooLarge(_),
                ..
            } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Body { .. } => StatusCode::BAD_REQUEST,
            Self::Backend(_) => StatusCode::BAD_GATEWAY,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        }
    }
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        match self {
            // Proxy failures carry no page, only the status.
            Self::Backend(_) => StatusCode::BAD_GATEWAY.into_response(),
            other => pages::render(other.status_code()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Handler
// ─────────────────────────────────────────────────────────────────────────────

/// Axum handler: run the dispatch state machine, log and render failures.
pub async fn dispatch(
    State(state): State<Arc<DispatchState>>,
    Extension(conn): Extension<ConnectionInfo>,
    request: Request,
) -> Response {
    let outcome = tokio::time::timeout(state.request_timeout, handle(&state, &conn, request))
        .await
        .unwrap_or_else(|_| Err(DispatchError::Timeout(conn.sni.clone())));

    match outcome {
        Ok(response) => response,
        Err(e) => {
            warn!(target: DATA_PLANE, status = e.status_code().as_u16(), "pep.dispatch(): {e}");
            e.into_response()
        }
    }
}

async fn handle(
    state: &DispatchState,
    conn: &ConnectionInfo,
    request: Request,
) -> Result<Response, DispatchError> {
    // Resolve
    let service = state
        .registry
        .lookup(&conn.sni)
        .ok_or_else(|| DispatchError::UnknownService(conn.sni.clone()))?;

    // Prepare transport
    let client = state
        .transports
        .for_service(&service)
        .await
        .map_err(|e| match e {
            Error::UnsupportedScheme(_) => {
                DispatchError::UnsupportedScheme(service.hostname.clone())
            }
            other => DispatchError::Internal {
                service: service.hostname.clone(),
                reason: other.to_string(),
            },
        })?;

    // Correlate
    let (request, token) =
        correlate_request(request, &conn.sni, conn.remote_addr, state.max_body_size)
            .await
            .map_err(|source| DispatchError::Body {
                service: service.hostname.clone(),
                source,
            })?;

    let metadata = RequestMetadata {
        method: request.method().clone(),
        path: request
            .uri()
            .path_and_query()
            .map_or_else(|| request.uri().path().to_owned(), ToString::to_string),
        sni: service.hostname.clone(),
        remote_addr: conn.remote_addr,
        client_subject: conn.client_subject.clone(),
        correlation: token.clone(),
    };
    let decision = state.pdp.decide(&metadata);
    debug!(
        target: DATA_PLANE,
        service = %service.hostname,
        allowed = decision.is_allowed(),
        "Policy decision - [Hash:'{token}']"
    );
    if let PolicyDecision::Deny { reason } = decision {
        return Err(DispatchError::Denied {
            service: service.hostname.clone(),
            reason,
        });
    }

    let target = target_url(&service.url, request.uri());
    info!(
        target: DATA_PLANE,
        "http: forwarding {} request from {} to {} - [Hash:'{token}']",
        request.method(),
        conn.remote_addr,
        target
    );

    // Forward
    let (parts, body) = request.into_parts();
    let body = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|e| DispatchError::Backend(e.to_string()))?;

    let mut headers = parts.headers;
    strip_hop_by_hop(&mut headers);
    headers.remove(header::HOST);
    append_forwarded_for(&mut headers, conn.remote_addr);

    let upstream = client
        .request(parts.method, target.clone())
        .headers(headers)
        .body(body)
        .send()
        .await
        .map_err(|e| DispatchError::Backend(e.to_string()))?;

    // Annotate
    let status = upstream.status();
    let mut response_headers = upstream.headers().clone();
    strip_hop_by_hop(&mut response_headers);
    response_headers.insert(
        header::STRICT_TRANSPORT_SECURITY,
        HeaderValue::from_static(HSTS),
    );

    let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;

    info!(
        target: DATA_PLANE,
        "http: serving {} to {} - [Hash:'{token}']",
        target,
        conn.remote_addr
    );
    Ok(response)
}

// ─────────────────────────────────────────────────────────────────────────────
// Request rewriting
// ─────────────────────────────────────────────────────────────────────────────

/// Backend URL for an inbound request: base path and request path joined with
/// exactly one slash, queries concatenated with `&`.
#[must_use]
pub fn target_url(base: &Url, uri: &Uri) -> Url {
    let mut url = base.clone();
    url.set_path(&join_paths(base.path(), uri.path()));

    let base_query = base.query().filter(|q| !q.is_empty());
    let request_query = uri.query().filter(|q| !q.is_empty());
    let query = match (base_query, request_query) {
        (Some(a), Some(b)) => Some(format!("{a}&{b}")),
        (Some(q), None) | (None, Some(q)) => Some(q.to_owned()),
        (None, None) => None,
    };
    url.set_query(query.as_deref());
    url
}

fn join_paths(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{base}{}", &path[1..]),
        (false, false) => format!("{base}/{path}"),
        _ => format!("{base}{path}"),
    }
}

/// Remove hop-by-hop headers, including any named in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, remote_addr: SocketAddr) {
    let client = remote_addr.ip().to_string();
    let value = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(prior) if !prior.is_empty() => format!("{prior}, {client}"),
        _ => client,
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
