//! Error types for the PEP proxy

use std::io;

use thiserror::Error;

/// Result type alias for the PEP proxy
pub type Result<T> = std::result::Result<T, Error>;

/// PEP proxy errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A trusted CA file could not be read or parsed
    #[error("CA error: '{path}': {reason}")]
    Ca {
        /// Offending CA file
        path: String,
        /// What went wrong
        reason: String,
    },

    /// The revocation list is unreadable, unparsable, expired or unsigned
    #[error("CRL error: '{path}': {reason}")]
    Crl {
        /// Offending CRL file
        path: String,
        /// What went wrong
        reason: String,
    },

    /// An identity certificate/key pair could not be loaded
    #[error("Certificate for '{hostname}' could not be loaded: {reason}")]
    CertLoad {
        /// Hostname the identity is bound to
        hostname: String,
        /// What went wrong
        reason: String,
    },

    /// A service pool entry is malformed
    #[error("Service '{service}' is misconfigured: {reason}")]
    ServiceConfig {
        /// Routing key of the offending entry
        service: String,
        /// What went wrong
        reason: String,
    },

    /// No identity is loaded for the SNI presented in a `ClientHello`
    #[error("No suitable certificate for '{0}'")]
    NoSuitableCertificate(String),

    /// The peer's leaf certificate serial number is on the revocation list
    #[error("Certificate of '{subject}' is revoked")]
    CertificateRevoked {
        /// Subject DN of the revoked leaf
        subject: String,
    },

    /// Backend URL scheme has no transport
    #[error("Unsupported scheme: {0}")]
    UnsupportedScheme(String),

    /// Transport construction error
    #[error("Transport error: {0}")]
    Transport(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// TLS library error
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for [`Error::Ca`].
    pub fn ca(path: impl Into<String>, reason: impl ToString) -> Self {
        Self::Ca {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Shorthand for [`Error::Crl`].
    pub fn crl(path: impl Into<String>, reason: impl ToString) -> Self {
        Self::Crl {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Shorthand for [`Error::CertLoad`].
    pub fn cert_load(hostname: impl Into<String>, reason: impl ToString) -> Self {
        Self::CertLoad {
            hostname: hostname.into(),
            reason: reason.to_string(),
        }
    }

    /// Shorthand for [`Error::ServiceConfig`].
    pub fn service_config(service: impl Into<String>, reason: impl ToString) -> Self {
        Self::ServiceConfig {
            service: service.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether this error aborts process startup.
    #[must_use]
    pub fn is_startup_fatal(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::Ca { .. }
                | Self::Crl { .. }
                | Self::CertLoad { .. }
                | Self::ServiceConfig { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startup_errors_are_fatal() {
        assert!(Error::ca("/x", "bad").is_startup_fatal());
        assert!(Error::crl("/x", "bad").is_startup_fatal());
        assert!(Error::cert_load("a.example", "bad").is_startup_fatal());
        assert!(Error::service_config("a.example", "bad").is_startup_fatal());
    }

    #[test]
    fn handshake_errors_are_not_startup_fatal() {
        assert!(!Error::NoSuitableCertificate("x".into()).is_startup_fatal());
        assert!(
            !Error::CertificateRevoked {
                subject: "CN=x".into()
            }
            .is_startup_fatal()
        );
    }

    #[test]
    fn revoked_message_names_subject() {
        let err = Error::CertificateRevoked {
            subject: "CN=alice".into(),
        };
        assert_eq!(err.to_string(), "Certificate of 'CN=alice' is revoked");
    }
}
