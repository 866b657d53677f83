//! rustls configuration for both ends of a gateway connection.
//!
//! Both builders pin TLS 1.3 and the ring provider, and replace webpki chain
//! building with the registry verifiers from [`super::verifier`].

use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, ServerConfig};

use crate::address::AccountAddress;
use crate::tls::verifier::{RegistryClientVerifier, RegistryServerVerifier, TrustVerifier};

#[derive(Debug, thiserror::Error)]
pub enum TlsSetupError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid PEM in {what}: {message}")]
    Pem { what: &'static str, message: String },
    #[error("no certificates found in {0}")]
    EmptyChain(String),
    #[error("tls configuration rejected: {0}")]
    Rustls(#[from] rustls::Error),
    #[error("invalid server name {0:?}")]
    ServerName(String),
}

/// Certificate chain and private key presented to the peer.
#[derive(Debug)]
pub struct TlsIdentity {
    pub chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl Clone for TlsIdentity {
    fn clone(&self) -> Self {
        Self {
            chain: self.chain.clone(),
            key: self.key.clone_key(),
        }
    }
}

impl TlsIdentity {
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self, TlsSetupError> {
        let chain = CertificateDer::pem_slice_iter(cert_pem)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| TlsSetupError::Pem {
                what: "certificate",
                message: e.to_string(),
            })?;
        if chain.is_empty() {
            return Err(TlsSetupError::EmptyChain("certificate PEM".to_string()));
        }
        let key = PrivateKeyDer::from_pem_slice(key_pem).map_err(|e| TlsSetupError::Pem {
            what: "private key",
            message: e.to_string(),
        })?;
        Ok(Self { chain, key })
    }

    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self, TlsSetupError> {
        let read = |p: &Path| {
            std::fs::read(p).map_err(|source| TlsSetupError::Read {
                path: p.display().to_string(),
                source,
            })
        };
        Self::from_pem(&read(cert_path)?, &read(key_path)?)
    }
}

/// Gateway listener configuration. Every presented client certificate goes
/// through the registry verifier; `require_client_cert` decides whether a
/// client may connect without one.
pub fn server_config(
    identity: TlsIdentity,
    trust: Arc<TrustVerifier>,
    require_client_cert: bool,
) -> Result<ServerConfig, TlsSetupError> {
    let provider = trust.provider();
    let verifier = Arc::new(RegistryClientVerifier::new(trust, require_client_cert));
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .with_client_cert_verifier(verifier)
        .with_single_cert(identity.chain, identity.key)?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

/// Tenant-side configuration for dialing a provider. `target`, when known,
/// pins the provider address the server certificate must carry.
pub fn client_config(
    identity: TlsIdentity,
    trust: Arc<TrustVerifier>,
    target: Option<AccountAddress>,
) -> Result<ClientConfig, TlsSetupError> {
    let provider = trust.provider();
    let verifier = Arc::new(RegistryServerVerifier::new(trust, target));
    let mut config = ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_client_auth_cert(identity.chain, identity.key)?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

/// Server name for `host` or `host:port`. Certificates are issued for the
/// bare host, so any port is dropped.
pub fn server_name(host: &str) -> Result<ServerName<'static>, TlsSetupError> {
    let bare = strip_port(host);
    ServerName::try_from(bare.to_string()).map_err(|_| TlsSetupError::ServerName(host.to_string()))
}

fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        // [::1]:8443
        return rest.split_once(']').map_or(rest, |(h, _)| h);
    }
    match host.rsplit_once(':') {
        Some((h, port)) if !h.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => h,
        _ => host,
    }
}
