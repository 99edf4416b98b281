//! Certificate handling and TLS policy.
//!
//! # Modules
//!
//! - [`config`] — YAML configuration types (`TlsConfig`, `CertificateConfig`)
//! - [`store`] — CA trust sets and identity certificates
//! - [`crl`] — revocation lists (`RevocationList`, `is_revoked`)
//! - [`identity`] — X.509 field extraction (`CertInfo`)
//! - [`policy`] — inbound/outbound rustls configurations
//!
//! # Load order
//!
//! ```text
//! cas ─► TrustSet ─┬─► RevocationList (signature checked against the set)
//!                  └─► webpki verifiers
//! certificates ─► IdentityMap ─► SNI / issuer resolvers
//! ```

pub mod config;
pub mod crl;
pub mod identity;
pub mod policy;
pub mod store;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::{CertificateConfig, TlsConfig};
pub use crl::{RevocationList, SerialNumber, is_revoked};
pub use identity::CertInfo;
pub use policy::{
    IssuerMatchingResolver, SniResolver, TlsMaterial, build_client_policy, build_server_policy,
    check_revocation,
};
pub use store::{Identity, IdentityMap, TrustSet, load_certs, load_private_key};
