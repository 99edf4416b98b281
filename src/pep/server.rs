//! Frontend server: TLS accept loop and HTTP/2 connection serving.
//!
//! ```text
//! TcpListener ─► handshake (SNI cert, client auth, CRL) ─► HTTP/2 ─► dispatch
//! ```
//!
//! Handshake failures only ever affect the connection they happen on.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::{Extension, Router};
use http_body_util::BodyExt;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::service::TowerToHyperService;
use rustls::ServerConfig;
use tokio::net::{TcpListener, TcpStream};
use tokio::signal;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::logging::CONTROL_PLANE;
use crate::pdp::AllowAll;
use crate::pep::dispatch::{ConnectionInfo, DispatchState, router};
use crate::pep::transport::{PoolSettings, Transports};
use crate::registry::ServiceRegistry;
use crate::tls::identity::CertInfo;
use crate::tls::policy::{
    TlsMaterial, build_client_policy, build_server_policy, build_service_client_policy,
};
use crate::tls::store::normalize_hostname;
use crate::{Error, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Startup
// ─────────────────────────────────────────────────────────────────────────────

/// A fully loaded proxy, ready to bind.
///
/// Building it performs every startup check: CAs, CRLs, identities, the
/// service pool and both TLS policies. Nothing is re-read afterwards.
pub struct Proxy {
    addr: SocketAddr,
    server: FrontendServer,
    services: usize,
    server_identities: usize,
    client_identities: usize,
    crl_next_update: i64,
}

impl Proxy {
    /// Load all trust material and wire the dispatch engine.
    ///
    /// # Errors
    ///
    /// Returns the first startup error: `Error::Config`, `Error::Ca`,
    /// `Error::Crl`, `Error::CertLoad` or `Error::ServiceConfig`.
    pub fn build(config: &Config) -> Result<Self> {
        config.validate()?;
        let addr = config.frontend.socket_addr()?;

        // Frontend
        let frontend = TlsMaterial::load(&config.frontend.tls)?;
        if frontend.identities.is_empty() {
            return Err(Error::Config(
                "frontend.tls.certificates must name at least one identity".into(),
            ));
        }
        let server_tls = build_server_policy(&frontend, config.frontend.tls.client_auth)?;

        // Backends
        let registry = ServiceRegistry::build(&config.services.service_pool)?;
        let services = TlsMaterial::load(&config.services.tls)?;
        let client_tls = build_client_policy(&services, config.services.tls.fallback_identity)?;

        let mut transports = Transports::new(
            client_tls,
            PoolSettings {
                idle_timeout: config.services.idle_timeout,
                max_idle_per_host: config.services.max_idle_per_host,
            },
        );
        for identity in registry.client_identities() {
            transports = transports.with_service(
                identity.hostname(),
                build_service_client_policy(&services, identity)?,
            );
        }

        let service_count = registry.len();
        let dedicated = transports.dedicated();
        let state = Arc::new(DispatchState {
            registry: Arc::new(registry),
            transports: Arc::new(transports),
            pdp: Arc::new(AllowAll),
            max_body_size: config.frontend.max_body_size,
            request_timeout: config.frontend.request_timeout,
        });

        Ok(Self {
            addr,
            server: FrontendServer::new(
                server_tls,
                state,
                ConnectionLimits {
                    handshake_timeout: config.frontend.handshake_timeout,
                    idle_timeout: config.frontend.idle_timeout,
                    keep_alive_interval: config.frontend.keep_alive_interval,
                },
            ),
            services: service_count,
            server_identities: frontend.identities.len(),
            client_identities: services.identities.len() + dedicated,
            crl_next_update: frontend.crl.validity().1.min(services.crl.validity().1),
        })
    }

    /// Configured listen address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Number of routable services.
    pub fn services(&self) -> usize {
        self.services
    }

    /// Number of identities presented to clients.
    pub fn server_identities(&self) -> usize {
        self.server_identities
    }

    /// Number of identities offered to backends, shared and per service.
    pub fn client_identities(&self) -> usize {
        self.client_identities
    }

    /// Earliest `nextUpdate` of the two CRLs, as a Unix timestamp. CRLs are
    /// not reloaded, so the process must be restarted before then.
    pub fn crl_next_update(&self) -> i64 {
        self.crl_next_update
    }

    /// The frontend server, for callers that bring their own listener.
    pub fn into_server(self) -> FrontendServer {
        self.server
    }

    /// Bind the configured address and serve until SIGINT/SIGTERM.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the address cannot be bound.
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, services = self.services, "PEP proxy listening");

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        tokio::spawn(shutdown_signal(shutdown_tx));

        self.server.serve(listener, shutdown_rx).await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Connection serving
// ─────────────────────────────────────────────────────────────────────────────

/// Time bounds applied to every frontend connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionLimits {
    /// Deadline for completing the TLS handshake
    pub handshake_timeout: Duration,
    /// How long a connection may sit with no open stream
    pub idle_timeout: Duration,
    /// HTTP/2 PING interval
    pub keep_alive_interval: Duration,
}

/// Accepts TLS connections and serves HTTP/2 on them.
#[derive(Clone)]
pub struct FrontendServer {
    acceptor: TlsAcceptor,
    router: Router,
    limits: ConnectionLimits,
}

impl FrontendServer {
    /// Server over a TLS policy and dispatch state.
    pub fn new(
        tls: Arc<ServerConfig>,
        state: Arc<DispatchState>,
        limits: ConnectionLimits,
    ) -> Self {
        Self {
            acceptor: TlsAcceptor::from(tls),
            router: router(state).layer(TraceLayer::new_for_http()),
            limits,
        }
    }

    /// Accept until `shutdown` fires, then let open connections drain.
    ///
    /// # Errors
    ///
    /// Currently infallible once the listener exists; accept errors are
    /// logged and the loop continues.
    pub async fn serve(
        self,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote_addr)) => {
                        let server = self.clone();
                        let shutdown = shutdown.resubscribe();
                        connections.spawn(async move {
                            server.handle_connection(stream, remote_addr, shutdown).await;
                        });
                    }
                    Err(e) => warn!("Failed to accept connection: {e}"),
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = shutdown.recv() => {
                    info!(open = connections.len(), "Listener closed, draining connections");
                    break;
                }
            }
        }

        while connections.join_next().await.is_some() {}
        info!("Frontend shutdown complete");
        Ok(())
    }

    async fn handle_connection(
        self,
        stream: TcpStream,
        remote_addr: SocketAddr,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let limits = self.limits;
        let tls = match tokio::time::timeout(limits.handshake_timeout, self.acceptor.accept(stream))
            .await
        {
            Ok(Ok(tls)) => tls,
            Ok(Err(e)) => {
                warn!(target: CONTROL_PLANE, %remote_addr, "TLS handshake failed: {e}");
                return;
            }
            Err(_) => {
                warn!(target: CONTROL_PLANE, %remote_addr, "TLS handshake timed out");
                return;
            }
        };

        let (_, session) = tls.get_ref();
        let conn = ConnectionInfo {
            sni: session.server_name().map(normalize_hostname).unwrap_or_default(),
            remote_addr,
            client_subject: session
                .peer_certificates()
                .and_then(|chain| chain.first())
                .and_then(|leaf| CertInfo::from_der(leaf.as_ref()).ok())
                .map(|info| info.subject),
        };
        debug!(
            target: CONTROL_PLANE,
            %remote_addr,
            sni = %conn.sni,
            client = conn.client_subject.as_deref().unwrap_or("-"),
            "TLS handshake complete"
        );

        let (counter, mut open_streams) = watch::channel(0usize);
        let app = self
            .router
            .layer(Extension(conn))
            .layer(middleware::from_fn_with_state(counter, track_stream));
        let mut builder = hyper::server::conn::http2::Builder::new(TokioExecutor::new());
        builder
            .timer(TokioTimer::new())
            .keep_alive_interval(limits.keep_alive_interval);

        let connection = builder.serve_connection(TokioIo::new(tls), TowerToHyperService::new(app));
        tokio::pin!(connection);

        // A connection that ignores GOAWAY (or never sent its preface) is
        // dropped after one more idle period.
        let mut closing = false;
        let result = loop {
            let idle = *open_streams.borrow_and_update() == 0;
            tokio::select! {
                result = connection.as_mut() => break result,
                _ = shutdown.recv(), if !closing => {
                    closing = true;
                    connection.as_mut().graceful_shutdown();
                }
                Ok(()) = open_streams.changed() => {}
                () = tokio::time::sleep(limits.idle_timeout), if idle => {
                    if closing {
                        debug!(target: CONTROL_PLANE, %remote_addr, "Dropping connection");
                        break Ok(());
                    }
                    debug!(target: CONTROL_PLANE, %remote_addr, "Closing idle connection");
                    closing = true;
                    connection.as_mut().graceful_shutdown();
                }
            }
        };
        if let Err(e) = result {
            debug!(%remote_addr, "Connection closed with error: {e}");
        }
    }
}

/// One open request stream. The count drops once the response body is
/// finished or abandoned.
struct OpenStream(watch::Sender<usize>);

impl OpenStream {
    fn open(counter: watch::Sender<usize>) -> Self {
        counter.send_modify(|n| *n += 1);
        Self(counter)
    }
}

impl Drop for OpenStream {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n = n.saturating_sub(1));
    }
}

async fn track_stream(
    State(counter): State<watch::Sender<usize>>,
    request: Request,
    next: Next,
) -> Response {
    let stream = OpenStream::open(counter);
    let response = next.run(request).await;
    response.map(|body| {
        Body::new(body.map_frame(move |frame| {
            let _open = &stream;
            frame
        }))
    })
}

/// Shutdown signal handler
async fn shutdown_signal(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}
