//! Outbound transports, one per backend URL scheme plus one per service that
//! carries its own client identity.
//!
//! Each transport is a pooled `reqwest::Client` built on first use and then
//! shared by every request that resolves to it, so idle connections are
//! actually reused. The pool is the only mutable shared state on the request
//! path and is owned by the client.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rustls::ClientConfig;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::logging::DATA_PLANE;
use crate::registry::ServiceEntry;
use crate::tls::store::normalize_hostname;
use crate::{Error, Result};

/// Pooling parameters shared by all transports.
#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    /// Idle connections older than this are closed
    pub idle_timeout: Duration,
    /// Idle connections kept per backend host
    pub max_idle_per_host: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(10),
            max_idle_per_host: 10_000,
        }
    }
}

/// One lazily built client. `tls` is `None` for plain `http`.
#[derive(Debug)]
struct Transport {
    tls: Option<Arc<ClientConfig>>,
    client: OnceCell<reqwest::Client>,
}

impl Transport {
    fn new(tls: Option<ClientConfig>) -> Self {
        Self {
            tls: tls.map(Arc::new),
            client: OnceCell::new(),
        }
    }

    async fn get(&self, pool: PoolSettings, label: &str) -> Result<reqwest::Client> {
        self.client
            .get_or_try_init(|| async { self.build(pool, label) })
            .await
            .cloned()
    }

    fn build(&self, pool: PoolSettings, label: &str) -> Result<reqwest::Client> {
        let builder = reqwest::Client::builder()
            .pool_idle_timeout(pool.idle_timeout)
            .pool_max_idle_per_host(pool.max_idle_per_host)
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy();

        let builder = match &self.tls {
            Some(tls) => builder
                .use_preconfigured_tls((**tls).clone())
                .http2_prior_knowledge(),
            None => builder.http1_only(),
        };

        let client = builder
            .build()
            .map_err(|e| Error::Transport(format!("Failed to build HTTP client: {e}")))?;

        debug!(
            target: DATA_PLANE,
            transport = label,
            tls = self.tls.is_some(),
            idle_timeout = ?pool.idle_timeout,
            max_idle_per_host = pool.max_idle_per_host,
            "Transport built"
        );
        Ok(client)
    }
}

/// Lazily built transports keyed by scheme, and by hostname for services
/// bound to their own identity.
#[derive(Debug)]
pub struct Transports {
    pool: PoolSettings,
    https: Transport,
    http: Transport,
    services: HashMap<String, Transport>,
}

impl Transports {
    /// Transports using `client_tls` for `https` backends.
    #[must_use]
    pub fn new(client_tls: ClientConfig, pool: PoolSettings) -> Self {
        Self {
            pool,
            https: Transport::new(Some(client_tls)),
            http: Transport::new(None),
            services: HashMap::new(),
        }
    }

    /// Use `client_tls` instead of the shared `https` policy for `hostname`.
    #[must_use]
    pub fn with_service(mut self, hostname: &str, client_tls: ClientConfig) -> Self {
        self.services
            .insert(normalize_hostname(hostname), Transport::new(Some(client_tls)));
        self
    }

    /// Transport for `scheme`, building it on first use.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnsupportedScheme` for anything but `https`/`http`,
    /// and `Error::Transport` if the client cannot be built.
    pub async fn for_scheme(&self, scheme: &str) -> Result<reqwest::Client> {
        match scheme {
            "https" => self.https.get(self.pool, scheme).await,
            "http" => self.http.get(self.pool, scheme).await,
            other => Err(Error::UnsupportedScheme(other.to_owned())),
        }
    }

    /// Transport for `service`: its own when it is an `https` backend bound
    /// to a dedicated identity, the shared one for its scheme otherwise.
    ///
    /// # Errors
    ///
    /// Same as [`Transports::for_scheme`].
    pub async fn for_service(&self, service: &ServiceEntry) -> Result<reqwest::Client> {
        match self.services.get(&service.hostname) {
            Some(transport) if service.scheme() == "https" => {
                transport.get(self.pool, &service.hostname).await
            }
            _ => self.for_scheme(service.scheme()).await,
        }
    }

    /// Number of services with a dedicated transport.
    #[must_use]
    pub fn dedicated(&self) -> usize {
        self.services.len()
    }

    #[cfg(test)]
    fn is_built(&self, scheme: &str) -> bool {
        match scheme {
            "https" => self.https.client.initialized(),
            "http" => self.http.client.initialized(),
            host => self
                .services
                .get(host)
                .is_some_and(|t| t.client.initialized()),
        }
    }
}
