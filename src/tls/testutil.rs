//! Throwaway PKI for unit tests.

use std::path::Path;

use rcgen::{
    BasicConstraints, CertificateParams, CertificateRevocationListParams, DistinguishedName,
    DnType, ExtendedKeyUsagePurpose, IsCa, KeyIdMethod, KeyPair, KeyUsagePurpose,
    RevocationReason, RevokedCertParams, SerialNumber,
};
use time::{Duration, OffsetDateTime};

use crate::tls::store::TrustSet;

/// A self-signed CA able to issue leaves and sign CRLs.
pub struct TestCa {
    pub name: String,
    pub cert: rcgen::Certificate,
    pub key: KeyPair,
}

impl TestCa {
    pub fn new(common_name: &str) -> Self {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        dn.push(DnType::OrganizationName, "PEP Test");
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let key = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        Self {
            name: common_name.replace(' ', "_"),
            cert,
            key,
        }
    }

    pub fn cert_pem(&self) -> String {
        self.cert.pem()
    }

    /// DER of the CA subject, i.e. the issuer DN of every leaf it signs.
    pub fn subject_dn(&self) -> Vec<u8> {
        let (_, parsed) = x509_parser::parse_x509_certificate(self.cert.der()).unwrap();
        parsed.subject().as_raw().to_vec()
    }

    /// Write the CA certificate into `dir` and load it as a trust set.
    pub fn trust_set(&self, dir: &Path) -> TrustSet {
        let path = write(dir, &format!("{}.crt", self.name), &self.cert_pem());
        TrustSet::load(&[path]).unwrap()
    }

    /// Issue a leaf usable as both server and client certificate.
    /// Returns `(cert_pem, key_pem)`.
    pub fn issue(&self, common_name: &str, serial: u64) -> (String, String) {
        let mut params = CertificateParams::new(vec![common_name.to_string()]).unwrap();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        params.distinguished_name = dn;
        params.serial_number = Some(SerialNumber::from(serial));
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        let key = KeyPair::generate().unwrap();
        let cert = params.signed_by(&key, &self.cert, &self.key).unwrap();
        (cert.pem(), key.serialize_pem())
    }

    /// Issue a leaf and write it into `dir`. Returns `(cert_path, key_path)`.
    pub fn write_leaf(&self, dir: &Path, common_name: &str, serial: u64) -> (String, String) {
        let (cert, key) = self.issue(common_name, serial);
        (
            write(dir, &format!("{common_name}-{serial}.crt"), &cert),
            write(dir, &format!("{common_name}-{serial}.key"), &key),
        )
    }

    pub fn crl_der(&self, serials: &[u64]) -> Vec<u8> {
        self.crl(serials).der().to_vec()
    }

    pub fn crl_pem(&self, serials: &[u64]) -> String {
        self.crl(serials).pem().unwrap()
    }

    fn crl(&self, serials: &[u64]) -> rcgen::CertificateRevocationList {
        let now = OffsetDateTime::now_utc();
        let params = CertificateRevocationListParams {
            this_update: now - Duration::hours(1),
            next_update: now + Duration::days(1),
            crl_number: SerialNumber::from(1u64),
            issuing_distribution_point: None,
            revoked_certs: serials
                .iter()
                .map(|serial| RevokedCertParams {
                    serial_number: SerialNumber::from(*serial),
                    revocation_time: now - Duration::hours(1),
                    reason_code: Some(RevocationReason::KeyCompromise),
                    invalidity_date: None,
                })
                .collect(),
            key_identifier_method: KeyIdMethod::Sha256,
        };
        params.signed_by(&self.cert, &self.key).unwrap()
    }
}

/// Write `contents` to `dir/name`, returning the path as a string.
pub fn write(dir: &Path, name: &str, contents: &str) -> String {
    let path = dir.join(name);
    std::fs::write(&path, contents).unwrap();
    path.to_string_lossy().into_owned()
}
