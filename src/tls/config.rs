//! TLS configuration types.
//!
//! The same block shape is used twice: once under `frontend.tls` (identities
//! shown to clients, CAs and CRL used to verify client certificates) and once
//! under `services.tls` (identities shown to backends, CAs and CRL used to
//! verify backend server certificates).
//!
//! # Example YAML
//!
//! ```yaml
//! tls:
//!   client_auth: true
//!   cas:
//!     - "/etc/pep/ca/clients-root.crt"
//!   crl: "/etc/pep/ca/clients.crl"
//!   certificates:
//!     svc.example.com:
//!       cert_file: "/etc/pep/tls/svc.crt"
//!       key_file:  "/etc/pep/tls/svc.key"
//! ```

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// TLS block
// ─────────────────────────────────────────────────────────────────────────────

/// One TLS configuration block.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Identity certificates keyed by hostname.
    ///
    /// Server side: the certificate presented to clients whose SNI matches
    /// the key. Client side: the certificates offered to backends that ask
    /// for a client certificate.
    pub certificates: HashMap<String, CertificateConfig>,

    /// Require and verify a client certificate on every inbound handshake.
    ///
    /// Only meaningful for the frontend block.
    pub client_auth: bool,

    /// PEM files holding the trusted CA certificates.
    pub cas: Vec<String>,

    /// CRL file (PEM or DER) signed by one of `cas`.
    pub crl: String,

    /// Offer an arbitrary identity when a backend's certificate request
    /// carries no acceptable-issuer list.
    ///
    /// Only meaningful for the services block.
    #[serde(default = "default_fallback_identity")]
    pub fallback_identity: bool,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            certificates: HashMap::new(),
            client_auth: false,
            cas: Vec::new(),
            crl: String::new(),
            fallback_identity: default_fallback_identity(),
        }
    }
}

fn default_fallback_identity() -> bool {
    true
}

/// Paths of one certificate + private key pair (PEM).
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct CertificateConfig {
    /// Certificate chain, leaf first.
    pub cert_file: String,
    /// Private key matching the leaf.
    pub key_file: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
