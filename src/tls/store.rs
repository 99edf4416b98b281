//! Certificate & trust store — CA bundles, identity certificates, PEM loading.
//!
//! Provides:
//! - [`TrustSet::load`] — CA files into an opaque verification pool plus a
//!   plain certificate list (CRL signature checks iterate the list)
//! - [`Identity::load`] — one certificate chain + private key bound to a
//!   hostname
//! - [`IdentityMap`] — hostname → identity, built once at startup
//! - [`load_certs`] / [`load_private_key`] — PEM file loading
//!
//! # File format
//!
//! Certificates and keys are expected in **PEM format**. CRLs may be PEM or
//! DER (see [`crate::tls::crl`]).

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::sync::Arc;

use rustls::RootCertStore;
use rustls::crypto::aws_lc_rs::sign::any_supported_type;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;
use tracing::debug;

use crate::logging::CONTROL_PLANE;
use crate::tls::config::CertificateConfig;
use crate::tls::identity::CertInfo;
use crate::{Error, Result};

// ─────────────────────────────────────────────────────────────────────────────
// CA trust set
// ─────────────────────────────────────────────────────────────────────────────

/// Trusted root/intermediate certificates.
///
/// `roots` feeds the rustls/webpki verifiers; `certificates` keeps the same
/// certificates in load order because the opaque store does not expose them.
#[derive(Debug, Clone)]
pub struct TrustSet {
    roots: Arc<RootCertStore>,
    certificates: Vec<CertificateDer<'static>>,
}

impl TrustSet {
    /// Load every certificate from every path.
    ///
    /// All-or-nothing: any unreadable file, file without certificates, or
    /// certificate that does not parse as X.509 fails the whole load.
    ///
    /// # Errors
    ///
    /// Returns `Error::Ca` naming the offending path.
    pub fn load<S: AsRef<str>>(paths: &[S]) -> Result<Self> {
        let mut roots = RootCertStore::empty();
        let mut certificates = Vec::new();

        for path in paths {
            let path = path.as_ref();
            let certs = load_certs(path).map_err(|e| Error::ca(path, e))?;
            for cert in certs {
                let info = CertInfo::from_der(cert.as_ref()).map_err(|e| Error::ca(path, e))?;
                roots
                    .add(cert.clone())
                    .map_err(|e| Error::ca(path, format!("not a usable trust anchor: {e}")))?;
                debug!(target: CONTROL_PLANE, ca = %info.subject, file = %path, "CA loaded");
                certificates.push(cert);
            }
        }

        Ok(Self {
            roots: Arc::new(roots),
            certificates,
        })
    }

    /// Verification pool for rustls.
    #[must_use]
    pub fn roots(&self) -> Arc<RootCertStore> {
        Arc::clone(&self.roots)
    }

    /// The same certificates in load order.
    #[must_use]
    pub fn certificates(&self) -> &[CertificateDer<'static>] {
        &self.certificates
    }

    /// Number of loaded CA certificates.
    #[must_use]
    pub fn len(&self) -> usize {
        self.certificates.len()
    }

    /// `true` when no CA is loaded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.certificates.is_empty()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Identity certificates
// ─────────────────────────────────────────────────────────────────────────────

/// A certificate chain and private key bound to one hostname.
///
/// Immutable once loaded.
#[derive(Debug, Clone)]
pub struct Identity {
    hostname: String,
    key: Arc<CertifiedKey>,
    leaf: CertInfo,
}

impl Identity {
    /// Load a certificate chain + key pair for `hostname`.
    ///
    /// # Errors
    ///
    /// Returns `Error::CertLoad` on any I/O or parse error, or when the key
    /// does not belong to the leaf certificate.
    pub fn load(hostname: &str, cert_file: &str, key_file: &str) -> Result<Self> {
        let chain = load_certs(cert_file).map_err(|e| Error::cert_load(hostname, e))?;
        let key = load_private_key(key_file).map_err(|e| Error::cert_load(hostname, e))?;
        Self::from_parts(hostname, chain, &key)
    }

    /// Build from already-decoded parts.
    ///
    /// # Errors
    ///
    /// Same conditions as [`Identity::load`] minus file access.
    pub fn from_parts(
        hostname: &str,
        chain: Vec<CertificateDer<'static>>,
        key: &PrivateKeyDer<'static>,
    ) -> Result<Self> {
        let leaf_der = chain
            .first()
            .ok_or_else(|| Error::cert_load(hostname, "empty certificate chain"))?;
        let leaf = CertInfo::from_der(leaf_der.as_ref())
            .map_err(|e| Error::cert_load(hostname, e))?;

        let signing_key = any_supported_type(key)
            .map_err(|e| Error::cert_load(hostname, format!("unsupported private key: {e}")))?;
        let certified = CertifiedKey::new(chain, signing_key);
        certified
            .keys_match()
            .map_err(|e| Error::cert_load(hostname, format!("key/certificate mismatch: {e}")))?;

        Ok(Self {
            hostname: normalize_hostname(hostname),
            key: Arc::new(certified),
            leaf,
        })
    }

    /// Hostname this identity is bound to (lowercase).
    #[must_use]
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Chain + signing key in the form rustls presents.
    #[must_use]
    pub fn certified_key(&self) -> Arc<CertifiedKey> {
        Arc::clone(&self.key)
    }

    /// Fields of the leaf certificate.
    #[must_use]
    pub fn leaf(&self) -> &CertInfo {
        &self.leaf
    }
}

/// Hostname → identity, built once and never mutated.
///
/// Ordered by hostname so "first identity" is deterministic.
#[derive(Debug, Clone, Default)]
pub struct IdentityMap {
    identities: BTreeMap<String, Identity>,
}

impl IdentityMap {
    /// Load every configured identity.
    ///
    /// # Errors
    ///
    /// Returns `Error::CertLoad` for the first identity that fails, or when
    /// two keys normalise to the same hostname.
    pub fn load(certificates: &HashMap<String, CertificateConfig>) -> Result<Self> {
        let mut map = Self::default();
        for (hostname, files) in certificates {
            map.insert(Identity::load(hostname, &files.cert_file, &files.key_file)?)?;
        }
        Ok(map)
    }

    /// Add an identity.
    ///
    /// # Errors
    ///
    /// Returns `Error::CertLoad` if the hostname is already bound.
    pub fn insert(&mut self, identity: Identity) -> Result<()> {
        let hostname = identity.hostname().to_owned();
        if self.identities.contains_key(&hostname) {
            return Err(Error::cert_load(&hostname, "duplicate identity for hostname"));
        }
        debug!(
            target: CONTROL_PLANE,
            hostname = %hostname,
            subject = %identity.leaf().subject,
            "Identity loaded"
        );
        self.identities.insert(hostname, identity);
        Ok(())
    }

    /// Identity bound to `hostname`, compared case-insensitively.
    #[must_use]
    pub fn get(&self, hostname: &str) -> Option<&Identity> {
        self.identities.get(&normalize_hostname(hostname))
    }

    /// Identities in hostname order.
    pub fn iter(&self) -> impl Iterator<Item = &Identity> {
        self.identities.values()
    }

    /// Number of identities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.identities.len()
    }

    /// `true` when no identity is loaded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }
}

/// Lowercase, without a trailing dot.
#[must_use]
pub fn normalize_hostname(hostname: &str) -> String {
    hostname.trim_end_matches('.').to_ascii_lowercase()
}

// ─────────────────────────────────────────────────────────────────────────────
// Public: PEM loading
// ─────────────────────────────────────────────────────────────────────────────

/// Load all certificates from a PEM file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or contains no valid PEM
/// certificate blocks.
pub fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let pem_data = read_file(path)?;
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut pem_data.as_slice())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Config(format!("Failed to parse certs from '{path}': {e}")))?;

    if certs.is_empty() {
        return Err(Error::Config(format!("No certificates found in '{path}'")));
    }

    Ok(certs)
}

/// Load the first private key from a PEM file.
///
/// Supports RSA (`RSA PRIVATE KEY`), PKCS#8 (`PRIVATE KEY`), and EC keys.
///
/// # Errors
///
/// Returns an error if the file cannot be read, contains no private key, or
/// the key format is unsupported.
pub fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let pem_data = read_file(path)?;
    let key = rustls_pemfile::private_key(&mut pem_data.as_slice())
        .map_err(|e| Error::Config(format!("Failed to parse private key from '{path}': {e}")))?
        .ok_or_else(|| Error::Config(format!("No private key found in '{path}'")))?;

    Ok(key)
}

fn read_file(path: &str) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| Error::Config(format!("Cannot read '{path}': {e}")))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
