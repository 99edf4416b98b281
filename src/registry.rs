//! Service registry: SNI hostname → backend target.
//!
//! Built once from `services.service_pool` and never mutated afterwards, so
//! lookups need no locking.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;
use url::Url;

use crate::config::ServiceConfig;
use crate::logging::CONTROL_PLANE;
use crate::tls::store::{Identity, normalize_hostname};
use crate::{Error, Result};

/// One routing entry.
#[derive(Debug, Clone)]
pub struct ServiceEntry {
    /// Routing key (lowercase)
    pub hostname: String,
    /// Backend base URL
    pub url: Url,
    /// Identity presented to this backend, when configured per service
    pub client_identity: Option<Identity>,
}

impl ServiceEntry {
    /// Backend URL scheme (`https`, `http`, ...).
    #[must_use]
    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }
}

/// Hostname → service entry.
#[derive(Debug, Clone, Default)]
pub struct ServiceRegistry {
    services: HashMap<String, Arc<ServiceEntry>>,
}

impl ServiceRegistry {
    /// Build the registry from the configured pool.
    ///
    /// All-or-nothing: the first malformed entry aborts the build.
    ///
    /// # Errors
    ///
    /// Returns `Error::ServiceConfig` naming the entry for an empty hostname,
    /// a malformed or host-less URL, an unloadable client certificate, or two
    /// keys that normalise to the same hostname.
    pub fn build(pool: &HashMap<String, ServiceConfig>) -> Result<Self> {
        let mut services = HashMap::with_capacity(pool.len());

        for (key, config) in pool {
            let hostname = normalize_hostname(key);
            if hostname.is_empty() {
                return Err(Error::service_config(key, "empty hostname"));
            }

            let url = Url::parse(&config.service_url)
                .map_err(|e| Error::service_config(key, format!("malformed service_url: {e}")))?;
            if !url.has_host() {
                return Err(Error::service_config(key, "service_url has no host"));
            }

            let client_identity = config
                .client_certificate
                .as_ref()
                .map(|c| Identity::load(&hostname, &c.cert_file, &c.key_file))
                .transpose()
                .map_err(|e| Error::service_config(key, e))?;

            let entry = ServiceEntry {
                hostname: hostname.clone(),
                url,
                client_identity,
            };
            if services.insert(hostname.clone(), Arc::new(entry)).is_some() {
                return Err(Error::service_config(key, "duplicate service entry"));
            }
        }

        for entry in services.values() {
            info!(
                target: CONTROL_PLANE,
                service = %entry.hostname,
                url = %entry.url,
                "Service registered"
            );
        }

        Ok(Self { services })
    }

    /// Entry for `hostname`, compared case-insensitively.
    #[must_use]
    pub fn lookup(&self, hostname: &str) -> Option<Arc<ServiceEntry>> {
        self.services.get(&normalize_hostname(hostname)).cloned()
    }

    /// Per-service client identities. Each one's hostname is the service it
    /// is bound to.
    pub fn client_identities(&self) -> impl Iterator<Item = &Identity> {
        self.services
            .values()
            .filter_map(|entry| entry.client_identity.as_ref())
    }

    /// Number of services.
    #[must_use]
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// `true` when no service is configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}
