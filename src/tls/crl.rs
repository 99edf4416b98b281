//! Certificate revocation list loading and lookup.
//!
//! A [`RevocationList`] is only constructed when it is usable:
//!
//! 1. the file parses as an X.509 CRL (PEM or DER),
//! 2. `thisUpdate <= now <= nextUpdate` (a CRL without `nextUpdate` is
//!    rejected),
//! 3. its signature verifies against at least one certificate of the
//!    corresponding CA trust set. Signers are tried in load order and the
//!    first one that validates wins.
//!
//! The list is not refreshed at runtime; reloading requires a restart.

use std::fmt;
use std::fs;

use tracing::debug;
use x509_parser::certificate::X509Certificate;
use x509_parser::pem::parse_x509_pem;
use x509_parser::prelude::FromDer;
use x509_parser::revocation_list::CertificateRevocationList;
use x509_parser::time::ASN1Time;

use crate::logging::CONTROL_PLANE;
use crate::tls::store::TrustSet;
use crate::{Error, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Serial numbers
// ─────────────────────────────────────────────────────────────────────────────

/// Certificate serial number in canonical big-endian form.
///
/// Leading zero bytes (DER sign padding) are stripped so a serial read from
/// a certificate compares equal to the same serial read from a CRL entry.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SerialNumber(Vec<u8>);

impl SerialNumber {
    /// Build from big-endian bytes.
    #[must_use]
    pub fn from_be_bytes(bytes: &[u8]) -> Self {
        let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
        let mut canonical = bytes[first..].to_vec();
        if canonical.is_empty() {
            canonical.push(0);
        }
        Self(canonical)
    }

    /// Canonical big-endian bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<u64> for SerialNumber {
    fn from(value: u64) -> Self {
        Self::from_be_bytes(&value.to_be_bytes())
    }
}

impl fmt::Debug for SerialNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SerialNumber({self})")
    }
}

impl fmt::Display for SerialNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Revocation list
// ─────────────────────────────────────────────────────────────────────────────

/// A verified, time-valid revocation list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevocationList {
    /// Revoked serials in CRL order.
    revoked: Vec<SerialNumber>,
    /// `thisUpdate` as a Unix timestamp.
    this_update: i64,
    /// `nextUpdate` as a Unix timestamp.
    next_update: i64,
    /// Subject of the CA whose signature validated.
    signer: String,
}

impl RevocationList {
    /// Read, parse and verify the CRL at `path` against `signers`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Crl` if the file is unreadable or unparsable, if the
    /// current time is outside the CRL's validity window, or if no signer
    /// validates its signature.
    pub fn load(path: &str, signers: &TrustSet) -> Result<Self> {
        if path.is_empty() {
            return Err(Error::crl(path, "no CRL file configured"));
        }
        let data = fs::read(path).map_err(|e| Error::crl(path, format!("cannot read: {e}")))?;
        Self::from_bytes(path, &data, signers, ASN1Time::now().timestamp())
    }

    /// Parse and verify CRL bytes, evaluating the validity window at `now`
    /// (Unix seconds). `label` names the source in errors.
    ///
    /// # Errors
    ///
    /// Same conditions as [`RevocationList::load`].
    pub fn from_bytes(label: &str, data: &[u8], signers: &TrustSet, now: i64) -> Result<Self> {
        let der = decode_pem_or_der(label, data)?;
        let (_, crl) = CertificateRevocationList::from_der(&der)
            .map_err(|e| Error::crl(label, format!("cannot parse: {e}")))?;

        let this_update = crl.last_update().timestamp();
        let next_update = crl
            .next_update()
            .map(|t| t.timestamp())
            .ok_or_else(|| Error::crl(label, "CRL carries no nextUpdate"))?;

        if this_update > now || next_update < now {
            return Err(Error::crl(label, "lies outside of valid time period"));
        }

        let signer = verify_signature(label, &crl, signers)?;

        let revoked = crl
            .iter_revoked_certificates()
            .map(|entry| SerialNumber::from_be_bytes(entry.raw_serial()))
            .collect::<Vec<_>>();

        debug!(
            target: CONTROL_PLANE,
            crl = %label,
            signer = %signer,
            revoked = revoked.len(),
            "CRL signature verified"
        );

        Ok(Self {
            revoked,
            this_update,
            next_update,
            signer,
        })
    }

    /// Revoked serials in CRL order.
    #[must_use]
    pub fn revoked(&self) -> &[SerialNumber] {
        &self.revoked
    }

    /// Subject of the CA whose signature validated this list.
    #[must_use]
    pub fn signer(&self) -> &str {
        &self.signer
    }

    /// `[thisUpdate, nextUpdate]` as Unix timestamps.
    #[must_use]
    pub fn validity(&self) -> (i64, i64) {
        (self.this_update, self.next_update)
    }
}

/// Whether `serial` is listed in `crl`. Linear scan, no side effects.
#[must_use]
pub fn is_revoked(crl: &RevocationList, serial: &SerialNumber) -> bool {
    crl.revoked.iter().any(|entry| entry == serial)
}

// ─────────────────────────────────────────────────────────────────────────────
// Private helpers
// ─────────────────────────────────────────────────────────────────────────────

fn decode_pem_or_der(label: &str, data: &[u8]) -> Result<Vec<u8>> {
    if !data.starts_with(b"-----BEGIN") {
        return Ok(data.to_vec());
    }
    let (_, pem) = parse_x509_pem(data).map_err(|e| Error::crl(label, format!("bad PEM: {e}")))?;
    if pem.label != "X509 CRL" {
        return Err(Error::crl(
            label,
            format!("expected an X509 CRL PEM block, found '{}'", pem.label),
        ));
    }
    Ok(pem.contents)
}

/// Try each signer in load order; return the subject of the first that
/// validates the CRL signature.
fn verify_signature(
    label: &str,
    crl: &CertificateRevocationList<'_>,
    signers: &TrustSet,
) -> Result<String> {
    let mut last_failure = String::from("no CA certificates loaded");

    for der in signers.certificates() {
        let Ok((_, ca)) = X509Certificate::from_der(der.as_ref()) else {
            continue;
        };
        match crl.verify_signature(ca.public_key()) {
            Ok(()) => return Ok(ca.subject().to_string()),
            Err(e) => last_failure = format!("{}: {e}", ca.subject()),
        }
    }

    Err(Error::crl(
        label,
        format!("could not verify CRL signature ({last_failure})"),
    ))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
