//! End-to-end tests: client ─TLS/h2─► PEP proxy ─TLS/h2─► backend
//!
//! Every test builds a throwaway PKI with two CAs:
//! - Frontend CA: proxy server certificates and client certificates
//! - Services CA: backend server certificate and the proxy's client identity
//!
//! Run with: `cargo test --test proxy_tests`

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::extract::Request;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Router};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::service::TowerToHyperService;
use rcgen::{
    BasicConstraints, CertificateParams, CertificateRevocationListParams, DistinguishedName,
    DnType, ExtendedKeyUsagePurpose, IsCa, KeyIdMethod, KeyPair, KeyUsagePurpose,
    RevocationReason, RevokedCertParams, SerialNumber,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tempfile::TempDir;
use time::{Duration, OffsetDateTime};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use pep_proxy::config::{Config, ServiceConfig};
use pep_proxy::pep::{HSTS, Proxy};
use pep_proxy::tls::{CertificateConfig, TlsConfig};

const SERVICE: &str = "svc.example.com";
const FTP_SERVICE: &str = "ftp.example.com";
const NO_SERVICE: &str = "orphan.example.com";
const UNKNOWN: &str = "unknown.example.com";
// Bound to their own client identities, both issued by the services CA
const BILLING: &str = "billing.example.com";
const LEDGER: &str = "ledger.example.com";

const BACKEND: u64 = 2;

const GOOD_CLIENT: u64 = 10;
const REVOKED_CLIENT: u64 = 666;

// ─────────────────────────────────────────────────────────────────────────────
// PKI helpers
// ─────────────────────────────────────────────────────────────────────────────

struct Ca {
    name: String,
    cert: rcgen::Certificate,
    key: KeyPair,
}

impl Ca {
    fn new(common_name: &str) -> Self {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
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

    fn issue(&self, name: &str, serial: u64) -> (String, String) {
        let mut params = CertificateParams::new(vec![name.to_string()]).unwrap();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, name);
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

    fn write_leaf(&self, dir: &Path, name: &str, serial: u64) -> CertificateConfig {
        let (cert, key) = self.issue(name, serial);
        CertificateConfig {
            cert_file: write(dir, &format!("{name}-{serial}.crt"), &cert),
            key_file: write(dir, &format!("{name}-{serial}.key"), &key),
        }
    }

    fn write_cert(&self, dir: &Path) -> String {
        write(dir, &format!("{}.crt", self.name), &self.cert.pem())
    }

    fn write_crl(&self, dir: &Path, revoked: &[u64]) -> String {
        let now = OffsetDateTime::now_utc();
        let params = CertificateRevocationListParams {
            this_update: now - Duration::hours(1),
            next_update: now + Duration::days(1),
            crl_number: SerialNumber::from(1u64),
            issuing_distribution_point: None,
            revoked_certs: revoked
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
        let crl = params.signed_by(&self.cert, &self.key).unwrap();
        write(dir, &format!("{}.crl", self.name), &crl.pem().unwrap())
    }

    fn roots(&self) -> Arc<RootCertStore> {
        let mut roots = RootCertStore::empty();
        roots.add(self.cert.der().clone()).unwrap();
        Arc::new(roots)
    }
}

fn write(dir: &Path, name: &str, contents: &str) -> String {
    let path = dir.join(name);
    std::fs::write(&path, contents).unwrap();
    path.to_string_lossy().into_owned()
}

fn parse_pem(
    cert_pem: &str,
    key_pem: &str,
) -> (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>) {
    let chain = rustls_pemfile::certs(&mut cert_pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    let key = rustls_pemfile::private_key(&mut key_pem.as_bytes())
        .unwrap()
        .unwrap();
    (chain, key)
}

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

// ─────────────────────────────────────────────────────────────────────────────
// Backend
// ─────────────────────────────────────────────────────────────────────────────

/// HTTPS/h2 backend requiring a client certificate from the services CA.
/// Echoes the request URI and the CN of the client certificate it saw.
async fn https_backend(ca: &Ca) -> SocketAddr {
    let (chain, key) = {
        let (cert, key) = ca.issue("127.0.0.1", BACKEND);
        parse_pem(&cert, &key)
    };
    let verifier = WebPkiClientVerifier::builder_with_provider(ca.roots(), provider())
        .build()
        .unwrap();
    let mut config = ServerConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .unwrap()
        .with_client_cert_verifier(verifier)
        .with_single_cert(chain, key)
        .unwrap();
    config.alpn_protocols = vec![b"h2".to_vec()];
    let acceptor = TlsAcceptor::from(Arc::new(config));

    async fn echo(Extension(client_cn): Extension<String>, request: Request) -> Response {
        let echoed = [
            // h2 requests carry an absolute URI; echo the origin form
            (
                "x-echo-uri",
                request
                    .uri()
                    .path_and_query()
                    .map(ToString::to_string)
                    .unwrap_or_default(),
            ),
            ("x-backend-client", client_cn),
        ];
        (echoed, "backend says hi").into_response()
    }

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let Ok(tls) = acceptor.accept(stream).await else {
                    return;
                };
                let client_cn = tls
                    .get_ref()
                    .1
                    .peer_certificates()
                    .and_then(|chain| chain.first())
                    .and_then(|leaf| {
                        let (_, cert) = x509_parser::parse_x509_certificate(leaf.as_ref()).ok()?;
                        let cn = cert.subject().iter_common_name().next()?.as_str().ok()?;
                        Some(cn.to_owned())
                    })
                    .unwrap_or_default();
                let app = Router::new().fallback(echo).layer(Extension(client_cn));
                let _ = hyper::server::conn::http2::Builder::new(TokioExecutor::new())
                    .serve_connection(TokioIo::new(tls), TowerToHyperService::new(app))
                    .await;
            });
        }
    });
    addr
}

// ─────────────────────────────────────────────────────────────────────────────
// Harness
// ─────────────────────────────────────────────────────────────────────────────

/// What a scenario may vary; everything else is fixed.
struct Setup {
    client_auth: bool,
    revoked_clients: Vec<u64>,
    revoked_backends: Vec<u64>,
    idle_timeout: std::time::Duration,
}

impl Default for Setup {
    fn default() -> Self {
        Self {
            client_auth: true,
            revoked_clients: Vec::new(),
            revoked_backends: Vec::new(),
            idle_timeout: std::time::Duration::from_secs(30),
        }
    }
}

struct Harness {
    addr: SocketAddr,
    frontend_ca: Ca,
    _dir: TempDir,
    _shutdown: broadcast::Sender<()>,
}

impl Harness {
    async fn start(revoked_clients: &[u64]) -> Self {
        Self::with(Setup {
            revoked_clients: revoked_clients.to_vec(),
            ..Setup::default()
        })
        .await
    }

    async fn with(setup: Setup) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let frontend_ca = Ca::new("Frontend CA");
        let services_ca = Ca::new("Services CA");
        let backend = https_backend(&services_ca).await;
        let backend_url = format!("https://127.0.0.1:{}/api", backend.port());

        let mut config = Config::default();
        config.frontend.addr = "127.0.0.1:0".into();
        config.frontend.idle_timeout = setup.idle_timeout;
        config.frontend.tls = TlsConfig {
            certificates: [SERVICE, FTP_SERVICE, NO_SERVICE, BILLING, LEDGER]
                .into_iter()
                .zip(100..)
                .map(|(host, serial)| {
                    (host.to_string(), frontend_ca.write_leaf(dir.path(), host, serial))
                })
                .collect(),
            client_auth: setup.client_auth,
            cas: vec![frontend_ca.write_cert(dir.path())],
            crl: frontend_ca.write_crl(dir.path(), &setup.revoked_clients),
            ..TlsConfig::default()
        };
        config.services.tls = TlsConfig {
            certificates: HashMap::from([(
                "proxy-client".to_string(),
                services_ca.write_leaf(dir.path(), "proxy-client", 20),
            )]),
            cas: vec![services_ca.write_cert(dir.path())],
            crl: services_ca.write_crl(dir.path(), &setup.revoked_backends),
            ..TlsConfig::default()
        };
        config.services.service_pool = HashMap::from([
            (
                SERVICE.to_string(),
                ServiceConfig {
                    service_url: backend_url.clone(),
                    client_certificate: None,
                },
            ),
            (
                FTP_SERVICE.to_string(),
                ServiceConfig {
                    service_url: "ftp://files.example.com".into(),
                    client_certificate: None,
                },
            ),
            (
                BILLING.to_string(),
                ServiceConfig {
                    service_url: backend_url.clone(),
                    client_certificate: Some(services_ca.write_leaf(
                        dir.path(),
                        "billing-client",
                        30,
                    )),
                },
            ),
            (
                LEDGER.to_string(),
                ServiceConfig {
                    service_url: backend_url,
                    client_certificate: Some(services_ca.write_leaf(
                        dir.path(),
                        "ledger-client",
                        31,
                    )),
                },
            ),
        ]);

        let server = Proxy::build(&config).unwrap().into_server();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        tokio::spawn(server.serve(listener, shutdown_rx));

        Self {
            addr,
            frontend_ca,
            _dir: dir,
            _shutdown: shutdown_tx,
        }
    }

    /// TLS settings of a client presenting a frontend-CA certificate with
    /// `serial`.
    fn client_tls(&self, serial: u64) -> ClientConfig {
        let (cert, key) = self.frontend_ca.issue("alice", serial);
        let (chain, key) = parse_pem(&cert, &key);
        let mut tls = ClientConfig::builder_with_provider(provider())
            .with_protocol_versions(&[&rustls::version::TLS13])
            .unwrap()
            .with_root_certificates(self.frontend_ca.roots())
            .with_client_auth_cert(chain, key)
            .unwrap();
        tls.alpn_protocols = vec![b"h2".to_vec()];
        tls
    }

    /// h2 client without any certificate.
    fn anonymous_client(&self) -> reqwest::Client {
        let mut tls = ClientConfig::builder_with_provider(provider())
            .with_protocol_versions(&[&rustls::version::TLS13])
            .unwrap()
            .with_root_certificates(self.frontend_ca.roots())
            .with_no_client_auth();
        tls.alpn_protocols = vec![b"h2".to_vec()];
        self.http_client(tls)
    }

    /// h2 client presenting a frontend-CA certificate with `serial`.
    fn client(&self, serial: u64) -> reqwest::Client {
        self.http_client(self.client_tls(serial))
    }

    fn http_client(&self, tls: ClientConfig) -> reqwest::Client {
        [SERVICE, FTP_SERVICE, NO_SERVICE, UNKNOWN, BILLING, LEDGER]
            .into_iter()
            .fold(reqwest::Client::builder(), |builder, host| {
                builder.resolve(host, self.addr)
            })
            .use_preconfigured_tls(tls)
            .http2_prior_knowledge()
            .no_proxy()
            .build()
            .unwrap()
    }

    fn url(&self, host: &str, path: &str) -> String {
        format!("https://{host}:{}{path}", self.addr.port())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Scenarios
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn request_is_forwarded_to_https_backend() {
    // GIVEN: a proxy with client auth and an https backend requiring mTLS
    let harness = Harness::start(&[REVOKED_CLIENT]).await;
    let client = harness.client(GOOD_CLIENT);

    // WHEN: a request arrives with SNI svc.example.com
    let response = client
        .get(harness.url(SERVICE, "/health?x=1"))
        .send()
        .await
        .unwrap();

    // THEN: the backend answers through the proxy, with HSTS added
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(response.version(), reqwest::Version::HTTP_2);
    assert_eq!(response.headers()["strict-transport-security"], HSTS);
    assert_eq!(response.headers()["x-echo-uri"], "/api/health?x=1");
    // The proxy offered the identity issued by the CA the backend asked for
    assert_eq!(response.headers()["x-backend-client"], "proxy-client");
    assert_eq!(response.text().await.unwrap(), "backend says hi");
}

#[tokio::test]
async fn unknown_sni_fails_the_handshake() {
    let harness = Harness::start(&[]).await;
    let client = harness.client(GOOD_CLIENT);

    let result = client.get(harness.url(UNKNOWN, "/")).send().await;

    assert!(result.is_err());
}

#[tokio::test]
async fn unsupported_backend_scheme_yields_501() {
    let harness = Harness::start(&[]).await;
    let client = harness.client(GOOD_CLIENT);

    let response = client.get(harness.url(FTP_SERVICE, "/")).send().await.unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::NOT_IMPLEMENTED);
    assert!(response.headers().get("strict-transport-security").is_none());
    assert!(response.text().await.unwrap().contains("501 Not Implemented"));
}

#[tokio::test]
async fn certificate_without_service_yields_404() {
    // GIVEN: a hostname the proxy holds a certificate for but no route
    let harness = Harness::start(&[]).await;
    let client = harness.client(GOOD_CLIENT);

    // WHEN
    let response = client.get(harness.url(NO_SERVICE, "/")).send().await.unwrap();

    // THEN: the handshake succeeds and dispatch answers 404
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    assert!(response.text().await.unwrap().contains("404 Not Found"));
}

#[tokio::test]
async fn revoked_client_certificate_is_refused() {
    // GIVEN: a client whose certificate serial is on the frontend CRL
    let harness = Harness::start(&[REVOKED_CLIENT]).await;
    let client = harness.client(REVOKED_CLIENT);

    // WHEN
    let result = client.get(harness.url(SERVICE, "/")).send().await;

    // THEN: the connection is torn down before any HTTP exchange
    assert!(result.is_err());
}

#[tokio::test]
async fn client_without_certificate_is_refused() {
    let harness = Harness::start(&[]).await;
    let client = harness.anonymous_client();

    let result = client.get(harness.url(SERVICE, "/")).send().await;

    assert!(result.is_err());
}

#[tokio::test]
async fn client_without_certificate_is_served_when_client_auth_is_off() {
    // GIVEN: client auth disabled on the frontend
    let harness = Harness::with(Setup {
        client_auth: false,
        ..Setup::default()
    })
    .await;
    let client = harness.anonymous_client();

    // WHEN: a client with no certificate sends a request
    let response = client
        .get(harness.url(SERVICE, "/health"))
        .send()
        .await
        .unwrap();

    // THEN: it reaches the backend and the response carries HSTS
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(response.headers()["strict-transport-security"], HSTS);
    assert_eq!(response.headers()["x-echo-uri"], "/api/health");
    assert_eq!(response.headers()["x-backend-client"], "proxy-client");
}

#[tokio::test]
async fn revoked_backend_certificate_yields_502() {
    // GIVEN: the backend's certificate serial is on the services CRL
    let harness = Harness::with(Setup {
        revoked_backends: vec![BACKEND],
        ..Setup::default()
    })
    .await;
    let client = harness.client(GOOD_CLIENT);

    // WHEN
    let response = client.get(harness.url(SERVICE, "/")).send().await.unwrap();

    // THEN: the outbound handshake is refused and the client sees a bare 502
    assert_eq!(response.status(), reqwest::StatusCode::BAD_GATEWAY);
    assert!(response.text().await.unwrap().is_empty());
}

#[tokio::test]
async fn services_with_own_identity_present_their_own_certificate() {
    // GIVEN: billing and ledger bound to distinct identities from the same CA
    let harness = Harness::start(&[]).await;
    let client = harness.client(GOOD_CLIENT);

    // WHEN: both are called through the proxy
    let billing = client.get(harness.url(BILLING, "/")).send().await.unwrap();
    let ledger = client.get(harness.url(LEDGER, "/")).send().await.unwrap();

    // THEN: each backend saw the certificate configured for its service
    assert_eq!(billing.status(), reqwest::StatusCode::OK);
    assert_eq!(billing.headers()["x-backend-client"], "billing-client");
    assert_eq!(ledger.status(), reqwest::StatusCode::OK);
    assert_eq!(ledger.headers()["x-backend-client"], "ledger-client");
}

#[tokio::test]
async fn idle_connection_is_closed_after_handshake() {
    // GIVEN: a short idle timeout
    let harness = Harness::with(Setup {
        idle_timeout: std::time::Duration::from_millis(300),
        ..Setup::default()
    })
    .await;
    let connector = TlsConnector::from(Arc::new(harness.client_tls(GOOD_CLIENT)));
    let tcp = TcpStream::connect(harness.addr).await.unwrap();
    let mut tls = connector
        .connect(ServerName::try_from(SERVICE).unwrap(), tcp)
        .await
        .unwrap();

    // WHEN: the handshake completes but no HTTP/2 preface is ever sent
    let mut received = Vec::new();
    let closed = tokio::time::timeout(
        std::time::Duration::from_secs(5),
        tls.read_to_end(&mut received),
    )
    .await;

    // THEN: the proxy hangs up on its own
    assert!(closed.is_ok(), "idle connection still open after 5s");
}
