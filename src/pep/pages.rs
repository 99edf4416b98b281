//! Static HTML pages for proxy-generated error responses.

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};

/// `Content-Type` of every page.
pub const CONTENT_TYPE_HTML: &str = "text/html; charset=utf-8";

/// Page body for `status`: a heading with the status line and a one-line
/// explanation.
#[must_use]
pub fn body(status: StatusCode) -> String {
    let explanation = match status {
        StatusCode::BAD_REQUEST => "The request could not be read.",
        StatusCode::NOT_FOUND => "The requested resource could not be found.",
        StatusCode::FORBIDDEN => "You are not allowed to access the requested resource.",
        StatusCode::PAYLOAD_TOO_LARGE => "The request body is larger than this service accepts.",
        StatusCode::NOT_IMPLEMENTED => "Sorry, the requested functionality is not supported.",
        StatusCode::GATEWAY_TIMEOUT => "The service did not answer in time.",
        _ => "Sorry, something went wrong on our end.",
    };
    format!(
        "<html><body><h1>{} {}</h1><p>{explanation}</p></body></html>",
        status.as_u16(),
        status.canonical_reason().unwrap_or("Error"),
    )
}

/// Full response: status, HTML content type, page body.
#[must_use]
pub fn render(status: StatusCode) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, HeaderValue::from_static(CONTENT_TYPE_HTML))],
        body(status),
    )
        .into_response()
}
