//! Request correlation tokens.
//!
//! A token pairs the `forwarding` line logged before a request goes to the
//! backend with the `serving` line logged when the response comes back. It is
//! a log aid only: two identical requests in the same instant collide.

use std::net::SocketAddr;

use axum::body::Body;
use axum::http::header::HOST;
use axum::http::request::Parts;
use axum::http::uri::Authority;
use axum::http::{HeaderMap, Method, Request};
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Digest bytes kept; the token is twice as many hex characters.
pub const TOKEN_BYTES: usize = 7;

/// Why the request body could not be buffered.
#[derive(Debug, Error)]
pub enum BodyError {
    /// Body larger than the configured limit
    #[error("request body exceeds {0} bytes")]
    TooLarge(usize),
    /// Client went away or sent a malformed body
    #[error("failed to read request body: {0}")]
    Read(String),
}

/// Token over the request fields and `timestamp`.
///
/// Headers are serialised one line per name, `name: v1,v2\n`, in map order.
#[must_use]
pub fn compute(
    method: &Method,
    host: &str,
    remote_addr: &str,
    url: &str,
    headers: &HeaderMap,
    body: &[u8],
    timestamp: DateTime<Utc>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(method.as_str().as_bytes());
    hasher.update(host.as_bytes());
    hasher.update(remote_addr.as_bytes());
    hasher.update(url.as_bytes());

    for name in headers.keys() {
        let values = headers
            .get_all(name)
            .iter()
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
            .collect::<Vec<_>>()
            .join(",");
        hasher.update(format!("{}: {values}\n", name.as_str()).as_bytes());
    }

    hasher.update(body);
    hasher.update(
        timestamp
            .to_rfc3339_opts(SecondsFormat::Nanos, true)
            .as_bytes(),
    );

    let digest = hasher.finalize();
    hex::encode(&digest[..TOKEN_BYTES])
}

/// Buffer the body, compute the token, and hand back an equivalent request
/// whose body can be read again.
///
/// The host hashed is the one the client addressed; `fallback_host` is only
/// used when the request names none.
///
/// # Errors
///
/// Returns [`BodyError`] if the body exceeds `limit` or cannot be read.
pub async fn correlate_request(
    request: Request<Body>,
    fallback_host: &str,
    remote_addr: SocketAddr,
    limit: usize,
) -> Result<(Request<Body>, String), BodyError> {
    let (parts, body) = request.into_parts();
    let bytes = buffer_body(body, limit).await?;

    let token = compute(
        &parts.method,
        request_host(&parts, fallback_host),
        &remote_addr.to_string(),
        &parts.uri.to_string(),
        &parts.headers,
        &bytes,
        Utc::now(),
    );

    Ok((Request::from_parts(parts, Body::from(bytes)), token))
}

/// `Host` header, else the URI authority (`:authority` on HTTP/2), else
/// `fallback`.
fn request_host<'a>(parts: &'a Parts, fallback: &'a str) -> &'a str {
    parts
        .headers
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .or_else(|| parts.uri.authority().map(Authority::as_str))
        .unwrap_or(fallback)
}

async fn buffer_body(body: Body, limit: usize) -> Result<Bytes, BodyError> {
    Limited::new(body, limit)
        .collect()
        .await
        .map(http_body_util::Collected::to_bytes)
        .map_err(|e| {
            if e.downcast_ref::<LengthLimitError>().is_some() {
                BodyError::TooLarge(limit)
            } else {
                BodyError::Read(e.to_string())
            }
        })
}
