//! PEP Proxy Library
//!
//! TLS-terminating reverse proxy acting as a Policy Enforcement Point.
//!
//! # Features
//!
//! - **SNI routing**: the TLS server name picks both the presented
//!   certificate and the backend service
//! - **Mutual TLS**: optional client authentication, CRL checks on both sides
//! - **Issuer-matched client certificates** toward backends that request one
//! - **Correlation tokens** pairing each `forwarding` log line with its `serving` line
//! - **Split logging**: data plane, control plane and system log go to separate sinks
//!
//! # Protocol
//!
//! TLS 1.3 only, HTTP/2 (ALPN `h2`) on both legs when the backend is `https`.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod correlation;
pub mod error;
pub mod logging;
pub mod pdp;
pub mod pep;
pub mod registry;
pub mod tls;

pub use error::{Error, Result};
pub use logging::{PlaneOutputs, setup_tracing};
