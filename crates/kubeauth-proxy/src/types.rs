//! Shared types

use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Severity of a connection status update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusLevel {
    Info,
    Error,
}

impl fmt::Display for StatusLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusLevel::Info => write!(f, "info"),
            StatusLevel::Error => write!(f, "error"),
        }
    }
}

/// A human-readable status update for the cluster connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub message: String,
    pub level: StatusLevel,
}

impl StatusEvent {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            level: StatusLevel::Info,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            level: StatusLevel::Error,
        }
    }
}

/// PEM certificate and private key handed to the proxy for TLS
#[derive(Clone, PartialEq, Eq)]
pub struct ProxyCertificate {
    pub cert: String,
    pub private_key: String,
}

impl ProxyCertificate {
    pub fn new(cert: impl Into<String>, private_key: impl Into<String>) -> Self {
        Self {
            cert: cert.into(),
            private_key: private_key.into(),
        }
    }
}

impl fmt::Debug for ProxyCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyCertificate")
            .field("cert_len", &self.cert.len())
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// Number of random bytes behind an [`ApiPrefix`]
pub const API_PREFIX_BYTES: usize = 8;

/// Random path segment namespacing the proxy's endpoints
///
/// Sixteen lowercase hex characters drawn once per proxy instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ApiPrefix(String);

impl ApiPrefix {
    /// Draw a fresh prefix from `rng`
    pub fn generate<R: RngCore + ?Sized>(rng: &mut R) -> Self {
        let mut bytes = [0u8; API_PREFIX_BYTES];
        rng.fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    /// The bare hex segment
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The prefix as a URL path (`/` + hex), as exported in `API_PREFIX`
    pub fn path(&self) -> String {
        format!("/{}", self.0)
    }
}

impl fmt::Display for ApiPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_prefix_is_deterministic_for_seeded_rng() {
        let a = ApiPrefix::generate(&mut StdRng::seed_from_u64(7));
        let b = ApiPrefix::generate(&mut StdRng::seed_from_u64(7));
        assert_eq!(a, b);
        assert_eq!(a.path(), format!("/{}", a.as_str()));
    }

    #[test]
    fn test_certificate_debug_redacts_key() {
        let cert = ProxyCertificate::new("CERT", "SECRET");
        let rendered = format!("{:?}", cert);
        assert!(!rendered.contains("SECRET"));
    }

    #[test]
    fn test_status_level_display() {
        assert_eq!(StatusLevel::Info.to_string(), "info");
        assert_eq!(StatusLevel::Error.to_string(), "error");
        assert_eq!(StatusEvent::error("boom").level, StatusLevel::Error);
    }

    proptest! {
        #[test]
        fn prop_prefix_is_sixteen_lowercase_hex(seed in any::<u64>()) {
            let prefix = ApiPrefix::generate(&mut StdRng::seed_from_u64(seed));
            prop_assert_eq!(prefix.as_str().len(), 16);
            prop_assert!(prefix
                .as_str()
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
        }
    }
}
