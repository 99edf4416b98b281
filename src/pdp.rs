//! Policy Decision Point boundary.
//!
//! The dispatch engine asks a [`DecisionPoint`] whether to forward each
//! request. Authorization logic proper lives outside this crate; the only
//! implementation shipped here is [`AllowAll`].

use std::net::SocketAddr;

use axum::http::Method;

// ─────────────────────────────────────────────────────────────────────────────
// Decision input / output
// ─────────────────────────────────────────────────────────────────────────────

/// What the PDP gets to see about a request.
#[derive(Debug, Clone)]
pub struct RequestMetadata {
    /// HTTP method
    pub method: Method,
    /// Request path and query
    pub path: String,
    /// SNI negotiated on the connection
    pub sni: String,
    /// Peer socket address
    pub remote_addr: SocketAddr,
    /// Subject of the verified client certificate, when mTLS is on
    pub client_subject: Option<String>,
    /// Correlation token of the request
    pub correlation: String,
}

/// Result of a policy decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    /// Forward the request.
    Allow,
    /// Refuse the request.
    Deny {
        /// Shown in the data-plane log, never to the client.
        reason: String,
    },
}

impl PolicyDecision {
    /// `true` for [`PolicyDecision::Allow`].
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Decision points
// ─────────────────────────────────────────────────────────────────────────────

/// A policy decision function. Must be cheap and non-blocking; it runs on the
/// request path.
pub trait DecisionPoint: Send + Sync + std::fmt::Debug {
    /// Decide whether `request` may be forwarded.
    fn decide(&self, request: &RequestMetadata) -> PolicyDecision;
}

/// Stub PDP: every request is allowed.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl DecisionPoint for AllowAll {
    fn decide(&self, _request: &RequestMetadata) -> PolicyDecision {
        PolicyDecision::Allow
    }
}
