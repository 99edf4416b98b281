//! Policy Enforcement Point: the request path from TLS accept to backend.
//!
//! # Modules
//!
//! - [`server`] — startup wiring, TLS accept loop, HTTP/2 serving
//! - [`dispatch`] — per-request state machine (resolve, correlate, decide, forward)
//! - [`transport`] — pooled outbound clients, per backend scheme or bound service
//! - [`pages`] — HTML error pages

pub mod dispatch;
pub mod pages;
pub mod server;
pub mod transport;

pub use dispatch::{ConnectionInfo, DispatchError, DispatchState, HSTS, router};
pub use server::{ConnectionLimits, FrontendServer, Proxy};
pub use transport::{PoolSettings, Transports};
