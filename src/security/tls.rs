//! # Asymmetric (TLS) security
//!
//! The asymmetric envelope is a TLS handshake on the TCP stream itself.
//! The certificate may come from PEM files or be located in the platform
//! trust store by SHA-256 thumbprint. Peer validation accepts either the
//! platform trust chain or an explicit certificate allow-list; when
//! neither accepts the peer, the connection attempt is rejected with an
//! authentication error and chain diagnostics are logged, not swallowed.
//!
//! A handshake failure is fatal for that connection attempt only.

use std::fs::File;
use std::io::{BufReader, Write};
use std::path::Path;
use std::sync::Arc;

use rustls::client::{ServerCertVerified, ServerCertVerifier, WebPkiVerifier};
use rustls::{Certificate, ClientConfig, PrivateKey, RootCertStore, ServerConfig, ServerName};
use rustls_pemfile::{certs, pkcs8_private_keys};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info, warn};

use crate::error::{CommError, Result};

/// Asymmetric security settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsSettings {
    /// PEM certificate chain (listening side)
    pub cert_path: Option<String>,

    /// PKCS#8 PEM private key (listening side)
    pub key_path: Option<String>,

    /// Password of a protected certificate container. Encrypted
    /// containers are rejected eagerly with an instructive error;
    /// supply an unencrypted PKCS#8 key instead.
    pub cert_password: Option<String>,

    /// Subject name the peer certificate must present; defaults to the
    /// configured endpoint host
    pub expected_subject_name: Option<String>,

    /// Hex SHA-256 fingerprints of explicitly trusted peer certificates.
    /// Replaces default chain validation for matching peers.
    #[serde(default)]
    pub allowed_fingerprints: Vec<String>,

    /// Trust the platform root store
    #[serde(default = "default_true")]
    pub use_platform_roots: bool,

    /// Restrict the platform store to the single root with this hex
    /// SHA-256 thumbprint
    pub root_thumbprint: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            cert_path: None,
            key_path: None,
            cert_password: None,
            expected_subject_name: None,
            allowed_fingerprints: Vec::new(),
            use_platform_roots: true,
            root_thumbprint: None,
        }
    }
}

impl TlsSettings {
    /// Validate TLS settings
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.cert_path.is_some() != self.key_path.is_some() {
            errors.push("TLS certificate and key paths must be supplied together".to_string());
        }

        if self.cert_password.is_some() {
            errors.push(
                "Password-protected certificate containers are not supported; supply an unencrypted PKCS#8 key"
                    .to_string(),
            );
        }

        for fp in &self.allowed_fingerprints {
            if hex::decode(fp).map(|b| b.len() != 32).unwrap_or(true) {
                errors.push(format!(
                    "Invalid certificate fingerprint '{fp}' (expected 64 hex chars of SHA-256)"
                ));
            }
        }

        if let Some(tp) = &self.root_thumbprint {
            if hex::decode(tp).map(|b| b.len() != 32).unwrap_or(true) {
                errors.push(format!(
                    "Invalid root thumbprint '{tp}' (expected 64 hex chars of SHA-256)"
                ));
            }
        }

        if !self.use_platform_roots
            && self.allowed_fingerprints.is_empty()
            && self.root_thumbprint.is_none()
        {
            errors.push(
                "TLS client has no trust source: enable platform roots or add a fingerprint allow-list"
                    .to_string(),
            );
        }

        errors
    }

    /// SHA-256 fingerprint of a DER certificate
    pub fn certificate_fingerprint(cert: &Certificate) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(&cert.0);
        hasher.finalize().into()
    }

    /// Generate a self-signed certificate/key pair for development
    pub fn generate_self_signed<P: AsRef<Path>>(
        cert_path: P,
        key_path: P,
        subject: &str,
    ) -> Result<()> {
        let cert = rcgen::generate_simple_self_signed(vec![subject.to_string()])
            .map_err(|e| CommError::Tls(format!("Certificate generation error: {e}")))?;

        let mut cert_file = File::create(&cert_path)?;
        cert_file.write_all(cert.cert.pem().as_bytes())?;

        let mut key_file = File::create(&key_path)?;
        key_file.write_all(cert.signing_key.serialize_pem().as_bytes())?;

        Ok(())
    }

    /// Load the listening-side rustls configuration
    pub fn load_server_config(&self) -> Result<ServerConfig> {
        let cert_path = self
            .cert_path
            .as_ref()
            .ok_or_else(|| CommError::Tls("Server requires a certificate path".to_string()))?;
        let key_path = self
            .key_path
            .as_ref()
            .ok_or_else(|| CommError::Tls("Server requires a private key path".to_string()))?;

        let cert_file = File::open(cert_path)
            .map_err(|e| CommError::Tls(format!("Failed to open cert file: {e}")))?;
        let mut cert_reader = BufReader::new(cert_file);
        let cert_chain: Vec<Certificate> = certs(&mut cert_reader)
            .map_err(|_| CommError::Tls("Failed to parse certificate".into()))?
            .into_iter()
            .map(Certificate)
            .collect();

        if cert_chain.is_empty() {
            return Err(CommError::Tls("No certificates found in file".into()));
        }

        let key_file = File::open(key_path)
            .map_err(|e| CommError::Tls(format!("Failed to open key file: {e}")))?;
        let mut key_reader = BufReader::new(key_file);
        let keys = pkcs8_private_keys(&mut key_reader)
            .map_err(|_| CommError::Tls("Failed to parse PKCS8 private key".into()))?;

        if keys.is_empty() {
            return Err(CommError::Tls("No private keys found".into()));
        }

        let private_key = PrivateKey(keys[0].clone());

        let config = ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(cert_chain, private_key)
            .map_err(|e| CommError::Tls(format!("TLS error: {e}")))?;

        Ok(config)
    }

    /// Load the connecting-side rustls configuration with the
    /// chain-or-allow-list verifier.
    pub fn load_client_config(&self) -> Result<ClientConfig> {
        let mut root_store = RootCertStore::empty();

        if self.use_platform_roots || self.root_thumbprint.is_some() {
            let wanted = self
                .root_thumbprint
                .as_ref()
                .map(|tp| hex::decode(tp))
                .transpose()
                .map_err(|_| CommError::Tls("Invalid root thumbprint hex".into()))?;

            let native_certs = rustls_native_certs::load_native_certs()
                .map_err(|e| CommError::Tls(format!("Failed to load native certs: {e}")))?;

            let mut located = false;
            for cert in native_certs {
                let cert = Certificate(cert.0);
                if let Some(wanted) = &wanted {
                    if Self::certificate_fingerprint(&cert).as_slice() != wanted.as_slice() {
                        continue;
                    }
                    located = true;
                }
                if let Err(e) = root_store.add(&cert) {
                    debug!(error = %e, "Skipping unparseable platform root");
                }
            }

            if wanted.is_some() && !located {
                return Err(CommError::Tls(
                    "No platform root matched the configured thumbprint".into(),
                ));
            }
        }

        let allow_list = self
            .allowed_fingerprints
            .iter()
            .map(|fp| {
                hex::decode(fp)
                    .map_err(|_| CommError::Tls(format!("Invalid fingerprint hex: {fp}")))
            })
            .collect::<Result<Vec<_>>>()?;

        let chain_verifier = if root_store.is_empty() {
            None
        } else {
            Some(WebPkiVerifier::new(root_store, None))
        };

        let verifier = ChainOrAllowListVerifier {
            chain: chain_verifier,
            allow_list,
        };

        let config = ClientConfig::builder()
            .with_safe_defaults()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_no_client_auth();

        Ok(config)
    }

    /// Build the stream acceptor for a listening engine
    pub fn acceptor(&self) -> Result<TlsAcceptor> {
        Ok(TlsAcceptor::from(Arc::new(self.load_server_config()?)))
    }

    /// Build the stream connector plus the server name to verify.
    /// `default_host` is the configured endpoint host, used when no
    /// expected subject name is set.
    pub fn connector(&self, default_host: &str) -> Result<(TlsConnector, ServerName)> {
        let connector = TlsConnector::from(Arc::new(self.load_client_config()?));
        let name = self
            .expected_subject_name
            .as_deref()
            .unwrap_or(default_host);
        let server_name = ServerName::try_from(name)
            .map_err(|_| CommError::Tls(format!("Invalid server name: {name}")))?;
        Ok((connector, server_name))
    }
}

/// Accepts a peer when the platform trust chain verifies it, or when its
/// SHA-256 fingerprint appears on the explicit allow-list. When neither
/// applies the peer is rejected and the chain diagnostics are logged.
struct ChainOrAllowListVerifier {
    chain: Option<WebPkiVerifier>,
    allow_list: Vec<Vec<u8>>,
}

impl ServerCertVerifier for ChainOrAllowListVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &Certificate,
        intermediates: &[Certificate],
        server_name: &ServerName,
        scts: &mut dyn Iterator<Item = &[u8]>,
        ocsp_response: &[u8],
        now: std::time::SystemTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let chain_result = match &self.chain {
            Some(verifier) => verifier.verify_server_cert(
                end_entity,
                intermediates,
                server_name,
                scts,
                ocsp_response,
                now,
            ),
            None => Err(rustls::Error::General("No trust roots configured".into())),
        };

        match chain_result {
            Ok(verified) => {
                debug!(?server_name, "Peer certificate accepted by trust chain");
                Ok(verified)
            }
            Err(chain_err) => {
                let fingerprint = TlsSettings::certificate_fingerprint(end_entity);
                if self
                    .allow_list
                    .iter()
                    .any(|fp| fp.as_slice() == fingerprint.as_slice())
                {
                    info!(
                        fingerprint = %hex::encode(fingerprint),
                        "Peer certificate accepted via allow-list"
                    );
                    return Ok(ServerCertVerified::assertion());
                }

                // Surface the diagnostics before rejecting
                warn!(
                    ?server_name,
                    chain_error = %chain_err,
                    fingerprint = %hex::encode(fingerprint),
                    intermediates = intermediates.len(),
                    "Peer certificate rejected: not trusted by chain or allow-list"
                );
                Err(rustls::Error::General(format!(
                    "Peer authentication failed: {chain_err}"
                )))
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn validation_flags_lone_cert_path() {
        let settings = TlsSettings {
            cert_path: Some("cert.pem".into()),
            ..TlsSettings::default()
        };
        assert!(!settings.validate().is_empty());
    }

    #[test]
    fn validation_flags_cert_password() {
        let settings = TlsSettings {
            cert_password: Some("secret".into()),
            ..TlsSettings::default()
        };
        assert!(settings
            .validate()
            .iter()
            .any(|e| e.contains("Password-protected")));
    }

    #[test]
    fn validation_flags_bad_fingerprint() {
        let settings = TlsSettings {
            allowed_fingerprints: vec!["zz".into()],
            ..TlsSettings::default()
        };
        assert!(!settings.validate().is_empty());
    }

    #[test]
    fn validation_requires_a_trust_source() {
        let settings = TlsSettings {
            use_platform_roots: false,
            ..TlsSettings::default()
        };
        assert!(settings
            .validate()
            .iter()
            .any(|e| e.contains("no trust source")));
    }

    #[test]
    fn default_settings_validate() {
        assert!(TlsSettings::default().validate().is_empty());
    }
}
