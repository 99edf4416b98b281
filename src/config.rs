//! Configuration management

use std::{collections::HashMap, net::SocketAddr, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::tls::config::{CertificateConfig, TlsConfig};
use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Inbound listener and its TLS policy
    pub frontend: FrontendConfig,
    /// Backend-facing TLS policy and routing table
    pub services: ServicesConfig,
    /// Sink for request dispatch decisions
    pub data_plane_logger: PlaneLoggerConfig,
    /// Sink for certificate and trust decisions
    pub control_plane_logger: PlaneLoggerConfig,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // PEP_PROXY_FRONTEND__ADDR=0.0.0.0:8443 etc.
        figment = figment.merge(Env::prefixed("PEP_PROXY_").split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Structural checks that need no file access.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for an unparsable listen address, a zero body
    /// limit or idle timeout, or a CRL path left empty on either side.
    pub fn validate(&self) -> Result<()> {
        self.frontend.socket_addr()?;

        if self.frontend.idle_timeout.is_zero() {
            return Err(Error::Config("frontend.idle_timeout must be > 0".into()));
        }
        if self.frontend.max_body_size == 0 {
            return Err(Error::Config("frontend.max_body_size must be > 0".into()));
        }
        if self.frontend.tls.crl.is_empty() {
            return Err(Error::Config("frontend.tls.crl is required".into()));
        }
        if self.services.tls.crl.is_empty() {
            return Err(Error::Config("services.tls.crl is required".into()));
        }
        Ok(())
    }
}

/// Frontend (client-facing) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FrontendConfig {
    /// Listen address, e.g. `0.0.0.0:443`
    pub addr: String,
    /// Deadline for completing the TLS handshake
    #[serde(with = "humantime_serde")]
    pub handshake_timeout: Duration,
    /// Deadline for one HTTP exchange, backend round-trip included
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// HTTP/2 PING interval; peers that stop answering are disconnected
    #[serde(with = "humantime_serde")]
    pub keep_alive_interval: Duration,
    /// A connection with no open stream is closed after this long, including
    /// one that completed the handshake but never sent a request
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
    /// Maximum request body size (bytes)
    pub max_body_size: usize,
    /// Server-side TLS policy
    pub tls: TlsConfig,
}

impl Default for FrontendConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:443".to_string(),
            handshake_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(60),
            keep_alive_interval: Duration::from_secs(20),
            idle_timeout: Duration::from_secs(30),
            max_body_size: 10 * 1024 * 1024, // 10MB
            tls: TlsConfig::default(),
        }
    }
}

impl FrontendConfig {
    /// Parsed listen address.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if `addr` is not `ip:port`.
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        self.addr
            .parse()
            .map_err(|e| Error::Config(format!("Invalid frontend.addr '{}': {e}", self.addr)))
    }
}

/// Services (backend-facing) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    /// Idle pooled connections are closed after this long
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
    /// Upper bound of idle pooled connections per backend host
    pub max_idle_per_host: usize,
    /// Client-side TLS policy
    pub tls: TlsConfig,
    /// Routing table keyed by SNI hostname
    pub service_pool: HashMap<String, ServiceConfig>,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(10),
            max_idle_per_host: 10_000,
            tls: TlsConfig::default(),
            service_pool: HashMap::new(),
        }
    }
}

/// One routing table entry
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct ServiceConfig {
    /// Backend base URL (`scheme://host:port[/base/path]`)
    pub service_url: String,
    /// Identity always presented to this backend instead of one picked from
    /// `services.tls.certificates`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_certificate: Option<CertificateConfig>,
}

/// Where one log plane is written
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PlaneLoggerConfig {
    /// `stdout`, `stderr`, or a file path (appended)
    pub output: String,
}

impl Default for PlaneLoggerConfig {
    fn default() -> Self {
        Self {
            output: "stdout".to_string(),
        }
    }
}

/// Humantime serde support
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s", "250ms")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let s = s.trim();

        // "ms" must be tried before "s" and "m"
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(serde::de::Error::custom)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(serde::de::Error::custom)
        } else {
            // Assume seconds
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        }
    }
}
