//! Certificate field extraction.
//!
//! Parses an X.509 DER-encoded certificate and extracts the fields the trust
//! engine works with: subject (for log lines and revocation errors), the raw
//! issuer DN (for acceptable-issuer matching), and the serial number (for CRL
//! lookups).

use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

use crate::tls::crl::SerialNumber;
use crate::{Error, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Certificate info
// ─────────────────────────────────────────────────────────────────────────────

/// Fields extracted once from a certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertInfo {
    /// RFC 4514-style subject, e.g. `CN=alice, O=Example`.
    pub subject: String,

    /// Certificate Common Name (CN), if any.
    pub common_name: Option<String>,

    /// DER encoding of the issuer `Name`, outer SEQUENCE included.
    pub issuer_dn: Vec<u8>,

    /// Serial number, normalised.
    pub serial: SerialNumber,
}

impl CertInfo {
    /// Parse a DER-encoded certificate and extract its fields.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the bytes are not a certificate.
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| Error::Config(format!("Failed to parse certificate: {e}")))?;

        Ok(Self::from_parsed(&cert))
    }

    pub(crate) fn from_parsed(cert: &X509Certificate<'_>) -> Self {
        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|attr| attr.as_str().ok())
            .map(str::to_owned);

        Self {
            subject: cert.subject().to_string(),
            common_name,
            issuer_dn: cert.issuer().as_raw().to_vec(),
            serial: SerialNumber::from_be_bytes(cert.raw_serial()),
        }
    }

    /// Byte-exact comparison of the issuer DN against an acceptable-issuer
    /// hint from a `CertificateRequest`.
    #[must_use]
    pub fn issued_by(&self, distinguished_name: &[u8]) -> bool {
        self.issuer_dn == distinguished_name
    }

    /// Short label for log lines: CN when present, full subject otherwise.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.common_name.as_deref().unwrap_or(&self.subject)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
