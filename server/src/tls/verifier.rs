//! Registry-backed peer certificate verification.
//!
//! Owner certificates are self-issued: Subject and Issuer CommonName both
//! carry the owner's account address and no CA signs them. Trust instead
//! comes from the certificate registry, which must report exactly one
//! `valid` record for the certificate's `(owner, serial)` pair, and that
//! record must hold the very certificate presented. CommonName and serial are
//! public, so anyone can mint a self-issued certificate carrying them.
//!
//! Verification happens in two places:
//!
//! - inside the rustls handshake ([`RegistryServerVerifier`],
//!   [`RegistryClientVerifier`]), which is synchronous and runs every check
//!   except the registry lookup, so malformed chains never complete a
//!   handshake;
//! - [`TrustVerifier::verify`], which runs the complete ordered check list
//!   including the registry lookup on the freshly established stream, before
//!   any application byte is exchanged.

use std::fmt;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::WebPkiClientVerifier;
use rustls::{DigitallySignedStruct, DistinguishedName, RootCertStore, SignatureScheme};
use tracing::{debug, warn};
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::address::AccountAddress;
use crate::registry::{
    CertificateFilter, CertificateRecord, CertificateRegistry, CertificateState, RegistryError,
};

#[derive(Debug, thiserror::Error)]
pub enum TrustError {
    #[error("expected exactly one peer certificate, got {0}")]
    ChainLength(usize),
    #[error("failed to parse peer certificate: {0}")]
    Parse(String),
    #[error("certificate CommonName is not a valid account address: {0}")]
    CommonName(String),
    #[error("certificate subject CommonName {subject:?} does not match issuer {issuer:?}")]
    IssuerMismatch { subject: String, issuer: String },
    #[error("hijacked certificate: expected {expected}, got {actual}")]
    Hijacked { expected: String, actual: String },
    #[error("certificate has no serial number")]
    MissingSerial,
    #[error("certificate {owner}/{serial} is not registered as valid")]
    NotRegistered { owner: String, serial: String },
    #[error("certificate {owner}/{serial} differs from the registered one")]
    CertificateMismatch { owner: String, serial: String },
    #[error("registry returned {count} valid records for {owner}/{serial}")]
    Ambiguous {
        owner: String,
        serial: String,
        count: usize,
    },
    #[error("certificate registry query failed: {0}")]
    Registry(#[from] RegistryError),
    #[error("x509 verification failed: {0}")]
    X509(String),
}

impl From<TrustError> for rustls::Error {
    fn from(e: TrustError) -> Self {
        rustls::Error::General(e.to_string())
    }
}

/// Identity recovered from a verified peer certificate.
///
/// Lives as long as the connection that presented it and is attached to every
/// request made over that connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    pub owner: AccountAddress,
    pub serial: String,
}

/// Which side the peer plays, and what it is expected to prove.
#[derive(Debug, Clone)]
pub enum PeerRole {
    /// The peer is a server we dialed: its certificate must name `server_name`
    /// and allow server authentication. When `target` is set the CommonName
    /// must equal it.
    Server {
        server_name: ServerName<'static>,
        target: Option<AccountAddress>,
    },
    /// The peer is a client that connected to us.
    Client,
}

/// Fields of an X.509 certificate the trust checks look at.
#[derive(Debug, Clone, Default)]
pub struct CertificateFields {
    pub common_name: Option<String>,
    pub issuer_common_name: Option<String>,
    /// Decimal serial, `None` when the certificate carries an empty serial.
    pub serial: Option<String>,
    /// DER-encoded SubjectPublicKeyInfo.
    pub public_key: Vec<u8>,
}

impl CertificateFields {
    pub fn parse(der: &[u8]) -> Result<Self, TrustError> {
        let (_, cert) =
            X509Certificate::from_der(der).map_err(|e| TrustError::Parse(e.to_string()))?;
        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(str::to_string);
        let issuer_common_name = cert
            .issuer()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(str::to_string);
        let tbs = &cert.tbs_certificate;
        let serial = if tbs.raw_serial().is_empty() {
            None
        } else {
            Some(tbs.serial.to_string())
        };
        Ok(Self {
            common_name,
            issuer_common_name,
            serial,
            public_key: cert.public_key().raw.to_vec(),
        })
    }
}

/// Verifies peer certificates against the registry.
pub struct TrustVerifier {
    registry: Arc<dyn CertificateRegistry>,
    hrp: String,
    provider: Arc<CryptoProvider>,
}

impl fmt::Debug for TrustVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustVerifier")
            .field("hrp", &self.hrp)
            .finish_non_exhaustive()
    }
}

impl TrustVerifier {
    pub fn new(registry: Arc<dyn CertificateRegistry>, hrp: impl Into<String>) -> Self {
        Self {
            registry,
            hrp: hrp.into(),
            provider: Arc::new(rustls::crypto::ring::default_provider()),
        }
    }

    pub fn provider(&self) -> Arc<CryptoProvider> {
        Arc::clone(&self.provider)
    }

    /// Run every check in order: chain length, CommonName, issuer, target,
    /// serial, registry, x509.
    pub async fn verify(
        &self,
        chain: &[CertificateDer<'_>],
        role: &PeerRole,
    ) -> Result<PeerIdentity, TrustError> {
        let leaf = single_leaf(chain)?;
        let target = match role {
            PeerRole::Server { target, .. } => target.as_ref(),
            PeerRole::Client => None,
        };
        let identity = self.check_leaf(leaf, target)?;
        self.check_registry(&identity, leaf).await?;
        match role {
            PeerRole::Server { server_name, .. } => self.check_x509_server(leaf, server_name)?,
            PeerRole::Client => self.check_x509_client(leaf)?,
        }
        debug!(owner = %identity.owner, serial = %identity.serial, "peer certificate verified");
        Ok(identity)
    }

    /// Structural checks on the leaf: CommonName, issuer, target, serial.
    pub fn check_leaf(
        &self,
        leaf: &CertificateDer<'_>,
        target: Option<&AccountAddress>,
    ) -> Result<PeerIdentity, TrustError> {
        let fields = CertificateFields::parse(leaf.as_ref())?;
        let subject = fields.common_name.unwrap_or_default();
        let owner = AccountAddress::parse_with_prefix(&subject, &self.hrp)
            .map_err(|e| TrustError::CommonName(e.to_string()))?;

        let issuer = fields.issuer_common_name.unwrap_or_default();
        if issuer != subject {
            return Err(TrustError::IssuerMismatch { subject, issuer });
        }

        if let Some(expected) = target {
            if *expected != owner {
                return Err(TrustError::Hijacked {
                    expected: expected.to_string(),
                    actual: owner.to_string(),
                });
            }
        }

        let serial = fields.serial.ok_or(TrustError::MissingSerial)?;
        Ok(PeerIdentity { owner, serial })
    }

    async fn check_registry(
        &self,
        identity: &PeerIdentity,
        leaf: &CertificateDer<'_>,
    ) -> Result<(), TrustError> {
        let filter = CertificateFilter {
            owner: Some(identity.owner.clone()),
            serial: Some(identity.serial.clone()),
            state: Some(CertificateState::Valid),
        };
        let records = self.registry.query(&filter).await?;
        let valid: Vec<_> = records
            .iter()
            .filter(|r| r.state == CertificateState::Valid)
            .collect();
        match (records.len(), valid.as_slice()) {
            (1, [record]) => {
                if registered_as(record, leaf)? {
                    Ok(())
                } else {
                    Err(TrustError::CertificateMismatch {
                        owner: identity.owner.to_string(),
                        serial: identity.serial.clone(),
                    })
                }
            }
            (0, _) | (1, _) => Err(TrustError::NotRegistered {
                owner: identity.owner.to_string(),
                serial: identity.serial.clone(),
            }),
            (count, _) => Err(TrustError::Ambiguous {
                owner: identity.owner.to_string(),
                serial: identity.serial.clone(),
                count,
            }),
        }
    }

    /// Verify `leaf` as a server certificate for `server_name`, trusting only
    /// the leaf itself.
    pub fn check_x509_server(
        &self,
        leaf: &CertificateDer<'_>,
        server_name: &ServerName<'_>,
    ) -> Result<(), TrustError> {
        let roots = self.self_root(leaf)?;
        let verifier = WebPkiServerVerifier::builder_with_provider(roots, self.provider())
            .build()
            .map_err(|e| TrustError::X509(e.to_string()))?;
        verifier
            .verify_server_cert(leaf, &[], server_name, &[], UnixTime::now())
            .map_err(|e| TrustError::X509(e.to_string()))?;
        Ok(())
    }

    /// Verify `leaf` as a client certificate, trusting only the leaf itself.
    pub fn check_x509_client(&self, leaf: &CertificateDer<'_>) -> Result<(), TrustError> {
        let roots = self.self_root(leaf)?;
        let verifier = WebPkiClientVerifier::builder_with_provider(roots, self.provider())
            .build()
            .map_err(|e| TrustError::X509(e.to_string()))?;
        verifier
            .verify_client_cert(leaf, &[], UnixTime::now())
            .map_err(|e| TrustError::X509(e.to_string()))?;
        Ok(())
    }

    fn self_root(&self, leaf: &CertificateDer<'_>) -> Result<Arc<RootCertStore>, TrustError> {
        let mut roots = RootCertStore::empty();
        roots
            .add(leaf.clone().into_owned())
            .map_err(|e| TrustError::X509(e.to_string()))?;
        Ok(Arc::new(roots))
    }
}

/// Whether `record` is the certificate `leaf`. Records without the DER fall
/// back to comparing the SubjectPublicKeyInfo.
fn registered_as(
    record: &CertificateRecord,
    leaf: &CertificateDer<'_>,
) -> Result<bool, TrustError> {
    if !record.cert_der.is_empty() {
        return Ok(record.cert_der == leaf.as_ref());
    }
    if record.public_key.is_empty() {
        return Ok(false);
    }
    let fields = CertificateFields::parse(leaf.as_ref())?;
    Ok(record.public_key == fields.public_key)
}

fn single_leaf<'a>(chain: &'a [CertificateDer<'a>]) -> Result<&'a CertificateDer<'a>, TrustError> {
    match chain {
        [leaf] => Ok(leaf),
        _ => Err(TrustError::ChainLength(chain.len())),
    }
}

fn check_chain_length(intermediates: &[CertificateDer<'_>]) -> Result<(), TrustError> {
    if intermediates.is_empty() {
        Ok(())
    } else {
        Err(TrustError::ChainLength(intermediates.len() + 1))
    }
}

/// rustls hook used when dialing a provider.
#[derive(Debug)]
pub struct RegistryServerVerifier {
    trust: Arc<TrustVerifier>,
    target: Option<AccountAddress>,
}

impl RegistryServerVerifier {
    pub fn new(trust: Arc<TrustVerifier>, target: Option<AccountAddress>) -> Self {
        Self { trust, target }
    }
}

impl ServerCertVerifier for RegistryServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let checked = check_chain_length(intermediates)
            .and_then(|()| self.trust.check_leaf(end_entity, self.target.as_ref()))
            .and_then(|_| self.trust.check_x509_server(end_entity, server_name));
        if let Err(e) = checked {
            warn!(error = %e, "rejecting server certificate");
            return Err(e.into());
        }
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.trust.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.trust.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.trust
            .provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// rustls hook used by the gateway listener.
#[derive(Debug)]
pub struct RegistryClientVerifier {
    trust: Arc<TrustVerifier>,
    mandatory: bool,
}

impl RegistryClientVerifier {
    pub fn new(trust: Arc<TrustVerifier>, mandatory: bool) -> Self {
        Self { trust, mandatory }
    }
}

impl ClientCertVerifier for RegistryClientVerifier {
    fn client_auth_mandatory(&self) -> bool {
        self.mandatory
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        // Self-issued certificates, there is no CA to hint at.
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        let checked = check_chain_length(intermediates)
            .and_then(|()| self.trust.check_leaf(end_entity, None))
            .and_then(|_| self.trust.check_x509_client(end_entity));
        if let Err(e) = checked {
            warn!(error = %e, "rejecting client certificate");
            return Err(e.into());
        }
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.trust.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.trust.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.trust
            .provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
