//! TLS policy engine — inbound and outbound rustls configurations.
//!
//! Both sides are pinned to TLS 1.3, advertise only `h2` via ALPN and never
//! resume sessions.
//!
//! ```text
//! inbound  ClientHello ─► SniResolver ─► identity for SNI, or abort
//!          client cert ─► webpki chain check ─► CRL check (client_auth only)
//!
//! outbound server cert ─► webpki chain check ─► CRL check
//!          CertificateRequest ─► IssuerMatchingResolver ─► identity or none
//! ```

use std::sync::Arc;

use rustls::client::ResolvesClientCert;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::{ClientHello, ResolvesServerCert, WebPkiClientVerifier};
use rustls::sign::CertifiedKey;
use rustls::{
    CertificateError, ClientConfig, DigitallySignedStruct, DistinguishedName, ServerConfig,
    SignatureScheme,
};
use tracing::{debug, warn};

use crate::logging::CONTROL_PLANE;
use crate::tls::config::TlsConfig;
use crate::tls::crl::{RevocationList, is_revoked};
use crate::tls::identity::CertInfo;
use crate::tls::store::{Identity, IdentityMap, TrustSet};
use crate::{Error, Result};

/// ALPN protocol offered and accepted on both sides.
pub const ALPN_H2: &[u8] = b"h2";

// ─────────────────────────────────────────────────────────────────────────────
// Policy inputs
// ─────────────────────────────────────────────────────────────────────────────

/// Everything one side of the proxy needs to build its TLS policy.
///
/// Immutable after load; shared via `Arc` so a future reload can swap the
/// whole set at once.
#[derive(Debug, Clone)]
pub struct TlsMaterial {
    /// Trusted CAs for peer verification and CRL signatures.
    pub trust: TrustSet,
    /// Revocation list signed by one of `trust`.
    pub crl: Arc<RevocationList>,
    /// Identities presented to peers.
    pub identities: Arc<IdentityMap>,
}

impl TlsMaterial {
    /// Load CAs, then the CRL (verified against those CAs), then identities.
    ///
    /// # Errors
    ///
    /// Propagates `Error::Ca`, `Error::Crl` or `Error::CertLoad`.
    pub fn load(config: &TlsConfig) -> Result<Self> {
        let trust = TrustSet::load(&config.cas)?;
        let crl = RevocationList::load(&config.crl, &trust)?;
        let identities = IdentityMap::load(&config.certificates)?;
        Ok(Self {
            trust,
            crl: Arc::new(crl),
            identities: Arc::new(identities),
        })
    }
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

// ─────────────────────────────────────────────────────────────────────────────
// Public: BuildServerPolicy
// ─────────────────────────────────────────────────────────────────────────────

/// Inbound (frontend) TLS configuration.
///
/// The certificate is chosen per handshake from the SNI. With
/// `require_client_auth`, clients must present a certificate that chains to
/// `material.trust` and is not on `material.crl`; otherwise no certificate is
/// requested.
///
/// # Errors
///
/// Returns `Error::Config` if the verifier cannot be built (e.g. empty trust
/// set with client auth on).
pub fn build_server_policy(
    material: &TlsMaterial,
    require_client_auth: bool,
) -> Result<Arc<ServerConfig>> {
    let provider = provider();

    let verifier: Arc<dyn ClientCertVerifier> = if require_client_auth {
        let inner = WebPkiClientVerifier::builder_with_provider(
            material.trust.roots(),
            Arc::clone(&provider),
        )
        .build()
        .map_err(|e| Error::Config(format!("Failed to build client verifier: {e}")))?;
        Arc::new(RevocationCheckingClientVerifier {
            inner,
            crl: Arc::clone(&material.crl),
        })
    } else {
        WebPkiClientVerifier::no_client_auth()
    };

    let mut config = ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .with_client_cert_verifier(verifier)
        .with_cert_resolver(Arc::new(SniResolver::new(Arc::clone(&material.identities))));

    config.alpn_protocols = vec![ALPN_H2.to_vec()];
    config.send_tls13_tickets = 0;
    config.session_storage = Arc::new(rustls::server::NoServerSessionStorage {});

    debug!(
        target: CONTROL_PLANE,
        identities = material.identities.len(),
        cas = material.trust.len(),
        client_auth = require_client_auth,
        "Server TLS policy built"
    );

    Ok(Arc::new(config))
}

// ─────────────────────────────────────────────────────────────────────────────
// Public: BuildClientPolicy
// ─────────────────────────────────────────────────────────────────────────────

/// Outbound (backend-facing) TLS configuration.
///
/// Backend certificates must chain to `material.trust` and not be on
/// `material.crl`. When a backend requests a client certificate, one is
/// picked from `material.identities` by issuer DN; see
/// [`IssuerMatchingResolver`].
///
/// # Errors
///
/// Returns `Error::Config` if the server verifier cannot be built.
pub fn build_client_policy(
    material: &TlsMaterial,
    fallback_identity: bool,
) -> Result<ClientConfig> {
    let resolver = IssuerMatchingResolver::new(Arc::clone(&material.identities), fallback_identity);
    let config = client_policy(material, Arc::new(resolver))?;

    debug!(
        target: CONTROL_PLANE,
        identities = material.identities.len(),
        cas = material.trust.len(),
        fallback_identity,
        "Client TLS policy built"
    );
    Ok(config)
}

/// Outbound TLS configuration for a backend bound to its own identity.
///
/// Verification is the same as [`build_client_policy`], but `identity` is
/// the only certificate ever offered, whatever the backend asks for.
///
/// # Errors
///
/// Returns `Error::Config` if the server verifier cannot be built.
pub fn build_service_client_policy(
    material: &TlsMaterial,
    identity: &Identity,
) -> Result<ClientConfig> {
    let config = client_policy(material, Arc::new(PinnedIdentityResolver::new(identity)))?;

    debug!(
        target: CONTROL_PLANE,
        service = %identity.hostname(),
        client = %identity.leaf().display_name(),
        "Service TLS policy built"
    );
    Ok(config)
}

fn client_policy(
    material: &TlsMaterial,
    resolver: Arc<dyn ResolvesClientCert>,
) -> Result<ClientConfig> {
    let provider = provider();

    let inner = rustls::client::WebPkiServerVerifier::builder_with_provider(
        material.trust.roots(),
        Arc::clone(&provider),
    )
    .build()
    .map_err(|e| Error::Config(format!("Failed to build server verifier: {e}")))?;

    let mut config = ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(RevocationCheckingServerVerifier {
            inner,
            crl: Arc::clone(&material.crl),
        }))
        .with_client_cert_resolver(resolver);

    config.alpn_protocols = vec![ALPN_H2.to_vec()];
    config.resumption = rustls::client::Resumption::disabled();
    Ok(config)
}

// ─────────────────────────────────────────────────────────────────────────────
// Revocation
// ─────────────────────────────────────────────────────────────────────────────

/// Reject `end_entity` if its serial is on `crl`.
///
/// # Errors
///
/// Returns `Error::CertificateRevoked` naming the subject, or
/// `Error::Config` if the certificate cannot be parsed.
pub fn check_revocation(crl: &RevocationList, end_entity: &[u8]) -> Result<()> {
    let info = CertInfo::from_der(end_entity)?;
    if is_revoked(crl, &info.serial) {
        return Err(Error::CertificateRevoked {
            subject: info.display_name().to_owned(),
        });
    }
    Ok(())
}

fn revocation_verdict(
    crl: &RevocationList,
    end_entity: &[u8],
    peer: &str,
) -> std::result::Result<(), rustls::Error> {
    match check_revocation(crl, end_entity) {
        Ok(()) => Ok(()),
        Err(Error::CertificateRevoked { subject }) => {
            warn!(target: CONTROL_PLANE, "{peer} '{subject}' certificate is revoked");
            Err(rustls::Error::InvalidCertificate(CertificateError::Revoked))
        }
        Err(e) => {
            warn!(target: CONTROL_PLANE, error = %e, "{peer} certificate unreadable");
            Err(rustls::Error::InvalidCertificate(CertificateError::BadEncoding))
        }
    }
}

/// webpki client verification followed by a CRL lookup on the leaf.
#[derive(Debug)]
struct RevocationCheckingClientVerifier {
    inner: Arc<dyn ClientCertVerifier>,
    crl: Arc<RevocationList>,
}

impl ClientCertVerifier for RevocationCheckingClientVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        self.inner.root_hint_subjects()
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> std::result::Result<ClientCertVerified, rustls::Error> {
        let verified = self.inner.verify_client_cert(end_entity, intermediates, now)?;
        revocation_verdict(&self.crl, end_entity.as_ref(), "client")?;
        Ok(verified)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// webpki server verification followed by a CRL lookup on the leaf.
#[derive(Debug)]
struct RevocationCheckingServerVerifier {
    inner: Arc<rustls::client::WebPkiServerVerifier>,
    crl: Arc<RevocationList>,
}

impl ServerCertVerifier for RevocationCheckingServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let verified =
            self.inner
                .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)?;
        revocation_verdict(&self.crl, end_entity.as_ref(), "service")?;
        Ok(verified)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Server certificate selection
// ─────────────────────────────────────────────────────────────────────────────

/// Picks the server identity whose hostname equals the SNI.
#[derive(Debug)]
pub struct SniResolver {
    identities: Arc<IdentityMap>,
}

impl SniResolver {
    /// Resolver over a fixed identity map.
    #[must_use]
    pub fn new(identities: Arc<IdentityMap>) -> Self {
        Self { identities }
    }

    /// Identity for `server_name`.
    ///
    /// # Errors
    ///
    /// Returns `Error::NoSuitableCertificate` when no SNI was sent or no
    /// identity is bound to it.
    pub fn select(&self, server_name: Option<&str>) -> Result<Arc<CertifiedKey>> {
        let name = server_name.unwrap_or_default();
        self.identities
            .get(name)
            .map(|identity| identity.certified_key())
            .ok_or_else(|| Error::NoSuitableCertificate(name.to_owned()))
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        match self.select(client_hello.server_name()) {
            Ok(key) => Some(key),
            Err(e) => {
                warn!(target: CONTROL_PLANE, "{e}");
                None
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Client certificate selection
// ─────────────────────────────────────────────────────────────────────────────

/// Picks the client identity whose certificate issuer matches one of the
/// acceptable issuers a backend lists in its `CertificateRequest`.
///
/// Hints are scanned in the order received; for each hint, identities are
/// scanned in hostname order. When the backend lists no issuer at all, the
/// first identity is offered if `fallback` is set.
#[derive(Debug)]
pub struct IssuerMatchingResolver {
    identities: Arc<IdentityMap>,
    fallback: bool,
}

impl IssuerMatchingResolver {
    /// Resolver over a fixed identity map.
    #[must_use]
    pub fn new(identities: Arc<IdentityMap>, fallback: bool) -> Self {
        Self { identities, fallback }
    }

    /// Identity for a list of DER-encoded acceptable issuer names.
    ///
    /// # Errors
    ///
    /// Returns `Error::NoSuitableCertificate` if nothing matches.
    pub fn select(&self, acceptable_issuers: &[&[u8]]) -> Result<Arc<CertifiedKey>> {
        if acceptable_issuers.is_empty() {
            if !self.fallback {
                return Err(Error::NoSuitableCertificate(
                    "backend sent no acceptable issuers".into(),
                ));
            }
            let identity = self.identities.iter().next().ok_or_else(|| {
                Error::NoSuitableCertificate("no client identities loaded".into())
            })?;
            warn!(
                target: CONTROL_PLANE,
                identity = %identity.hostname(),
                "Backend sent no acceptable issuers, offering first identity"
            );
            return Ok(identity.certified_key());
        }

        for issuer in acceptable_issuers {
            if let Some(identity) = self.identities.iter().find(|id| id.leaf().issued_by(issuer)) {
                debug!(
                    target: CONTROL_PLANE,
                    identity = %identity.hostname(),
                    "Client certificate selected by issuer"
                );
                return Ok(identity.certified_key());
            }
        }

        Err(Error::NoSuitableCertificate(
            "no identity issued by an acceptable CA".into(),
        ))
    }
}

impl ResolvesClientCert for IssuerMatchingResolver {
    fn resolve(
        &self,
        root_hint_subjects: &[&[u8]],
        _sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        match self.select(root_hint_subjects) {
            Ok(key) => Some(key),
            Err(e) => {
                warn!(target: CONTROL_PLANE, "{e}");
                None
            }
        }
    }

    fn has_certs(&self) -> bool {
        !self.identities.is_empty()
    }
}

/// Offers one fixed identity on every `CertificateRequest`.
#[derive(Debug)]
pub struct PinnedIdentityResolver {
    key: Arc<CertifiedKey>,
}

impl PinnedIdentityResolver {
    /// Resolver that always answers with `identity`.
    #[must_use]
    pub fn new(identity: &Identity) -> Self {
        Self {
            key: identity.certified_key(),
        }
    }
}

impl ResolvesClientCert for PinnedIdentityResolver {
    fn resolve(
        &self,
        _root_hint_subjects: &[&[u8]],
        _sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.key))
    }

    fn has_certs(&self) -> bool {
        true
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
