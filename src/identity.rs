//! Local device credentials: a self-signed certificate and its key.
//!
//! The certificate is what the bootstrap listener hands to unauthenticated
//! peers and what the TLS server presents afterwards, so its subject
//! alternative names must cover every name a peer might dial: the configured
//! hostname, the current LAN address, and loopback.

use rcgen::{CertificateParams, DnType, KeyPair};
use tracing::{info, warn};

use crate::config::DeviceConfig;
use crate::error::Result;

/// How many generation attempts are made before giving up. Credential
/// failure is terminal after this, never an endless restart loop.
pub const CREDENTIAL_ATTEMPTS: u32 = 3;

/// A self-signed certificate plus private key, both PEM encoded.
#[derive(Debug, Clone)]
pub struct Identity {
    certificate_pem: String,
    private_key_pem: String,
}

impl Identity {
    /// Generate a fresh self-signed certificate for this device.
    pub fn generate(config: &DeviceConfig) -> Result<Self> {
        let mut subject_alt_names = vec![
            config.hostname.clone(),
            "localhost".to_string(),
            "127.0.0.1".to_string(),
        ];
        if let Ok(ip) = local_ip_address::local_ip() {
            subject_alt_names.push(ip.to_string());
        }

        let mut params = CertificateParams::new(subject_alt_names)?;
        params
            .distinguished_name
            .push(DnType::CommonName, config.device_id.clone());

        let key_pair = KeyPair::generate()?;
        let cert = params.self_signed(&key_pair)?;

        info!(device_id = %config.device_id, "generated device certificate");
        Ok(Self {
            certificate_pem: cert.pem(),
            private_key_pem: key_pair.serialize_pem(),
        })
    }

    /// Generate with a bounded number of attempts, pausing briefly between
    /// failures. The final error is returned rather than retried forever.
    pub async fn generate_with_retry(config: &DeviceConfig, attempts: u32) -> Result<Self> {
        let attempts = attempts.max(1);
        let mut last_err = None;
        for attempt in 1..=attempts {
            match Self::generate(config) {
                Ok(identity) => return Ok(identity),
                Err(e) => {
                    warn!(attempt, attempts, "credential generation failed: {e}");
                    last_err = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(std::time::Duration::from_millis(250)).await;
                    }
                }
            }
        }
        Err(last_err.expect("at least one attempt was made"))
    }

    /// Construct from previously persisted PEM data.
    pub fn from_pem(certificate_pem: impl Into<String>, private_key_pem: impl Into<String>) -> Self {
        Self {
            certificate_pem: certificate_pem.into(),
            private_key_pem: private_key_pem.into(),
        }
    }

    /// Replace the certificate and key with freshly generated ones.
    pub fn regenerate(&mut self, config: &DeviceConfig) -> Result<()> {
        *self = Self::generate(config)?;
        Ok(())
    }

    /// Certificate in PEM form, as served by the bootstrap listener.
    pub fn certificate_pem(&self) -> &[u8] {
        self.certificate_pem.as_bytes()
    }

    /// Private key in PEM form.
    pub fn private_key_pem(&self) -> &[u8] {
        self.private_key_pem.as_bytes()
    }

    /// TLS server identity for the transfer server.
    pub fn tls_identity(&self) -> tonic::transport::Identity {
        tonic::transport::Identity::from_pem(&self.certificate_pem, &self.private_key_pem)
    }
}

/// Seam for the (out-of-scope) credential persistence layer: supplies the
/// stored identity, or regenerates one on demand.
pub trait CredentialProvider: Send + Sync + 'static {
    /// Current identity, generating one if none is stored.
    fn identity(&self) -> Result<Identity>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> DeviceConfig {
        DeviceConfig::new("dev-test", "Test", "testhost", "tester", "/tmp/downloads")
    }

    #[test]
    fn generated_identity_is_pem() {
        let identity = Identity::generate(&config()).unwrap();
        let cert = std::str::from_utf8(identity.certificate_pem()).unwrap();
        let key = std::str::from_utf8(identity.private_key_pem()).unwrap();
        assert!(cert.starts_with("-----BEGIN CERTIFICATE-----"));
        assert!(key.contains("PRIVATE KEY"));
    }

    #[test]
    fn regenerate_replaces_material() {
        let cfg = config();
        let mut identity = Identity::generate(&cfg).unwrap();
        let before = identity.certificate_pem().to_vec();
        identity.regenerate(&cfg).unwrap();
        assert_ne!(before, identity.certificate_pem());
    }

    #[tokio::test]
    async fn bounded_retry_succeeds_on_valid_config() {
        let identity = Identity::generate_with_retry(&config(), CREDENTIAL_ATTEMPTS)
            .await
            .unwrap();
        assert!(!identity.certificate_pem().is_empty());
    }
}
