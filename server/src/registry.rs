//! Certificate registry.
//!
//! The registry is the trust root of the gateway: a certificate is accepted
//! only while the registry reports exactly one `valid` record for its
//! `(owner, serial)` pair. The chain-backed registry is an external service;
//! [`MemoryRegistry`] is the in-process implementation used by the binaries
//! (loaded from a TOML file) and by tests.
//!
//! The backing store may lag behind the chain, so a freshly revoked
//! certificate can still be reported valid for a short window. Nothing here
//! attempts to paper over that.

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::address::AccountAddress;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CertificateState {
    Valid,
    Revoked,
}

/// One registry entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateRecord {
    pub owner: AccountAddress,
    /// Decimal rendering of the X.509 serial number.
    pub serial: String,
    pub state: CertificateState,
    pub cert_der: Vec<u8>,
    pub public_key: Vec<u8>,
}

/// Query filter. `None` fields match anything.
#[derive(Debug, Clone, Default)]
pub struct CertificateFilter {
    pub owner: Option<AccountAddress>,
    pub serial: Option<String>,
    pub state: Option<CertificateState>,
}

impl CertificateFilter {
    fn matches(&self, record: &CertificateRecord) -> bool {
        self.owner.as_ref().is_none_or(|o| *o == record.owner)
            && self.serial.as_ref().is_none_or(|s| *s == record.serial)
            && self.state.is_none_or(|s| s == record.state)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("registry unavailable: {0}")]
    Unavailable(String),
    #[error("certificate {owner}/{serial} already registered")]
    Duplicate { owner: String, serial: String },
    #[error("certificate {owner}/{serial} not found")]
    NotFound { owner: String, serial: String },
    #[error("certificate {owner}/{serial} is revoked")]
    AlreadyRevoked { owner: String, serial: String },
    #[error("failed to read registry file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse registry file {path}: {message}")]
    Parse { path: String, message: String },
}

/// Read-only lookup against the certificate registry.
///
/// Called once per TLS handshake from any number of connection tasks at the
/// same time, so implementations must not serialize callers.
#[async_trait]
pub trait CertificateRegistry: Send + Sync {
    async fn query(&self, filter: &CertificateFilter)
        -> Result<Vec<CertificateRecord>, RegistryError>;
}

/// In-memory registry keyed by `(owner, serial)`.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    records: RwLock<HashMap<(AccountAddress, String), CertificateRecord>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new certificate. Re-registering an existing pair fails.
    pub fn insert(&self, record: CertificateRecord) -> Result<(), RegistryError> {
        let mut records = self
            .records
            .write()
            .map_err(|_| RegistryError::Unavailable("registry lock poisoned".to_string()))?;
        let key = (record.owner.clone(), record.serial.clone());
        if records.contains_key(&key) {
            return Err(RegistryError::Duplicate {
                owner: key.0.to_string(),
                serial: key.1,
            });
        }
        debug!(owner = %record.owner, serial = %record.serial, "certificate registered");
        records.insert(key, record);
        Ok(())
    }

    /// Move a certificate from `valid` to `revoked`. The transition is one way.
    pub fn revoke(&self, owner: &AccountAddress, serial: &str) -> Result<(), RegistryError> {
        let mut records = self
            .records
            .write()
            .map_err(|_| RegistryError::Unavailable("registry lock poisoned".to_string()))?;
        let record = records
            .get_mut(&(owner.clone(), serial.to_string()))
            .ok_or_else(|| RegistryError::NotFound {
                owner: owner.to_string(),
                serial: serial.to_string(),
            })?;
        if record.state == CertificateState::Revoked {
            return Err(RegistryError::AlreadyRevoked {
                owner: owner.to_string(),
                serial: serial.to_string(),
            });
        }
        record.state = CertificateState::Revoked;
        info!(%owner, serial, "certificate revoked");
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.records.read().map_or(0, |r| r.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Load a registry file.
    ///
    /// ```toml
    /// [[certificates]]
    /// owner = "akash1..."
    /// state = "valid"
    /// cert = """
    /// -----BEGIN CERTIFICATE-----
    /// ...
    /// -----END CERTIFICATE-----
    /// """
    /// ```
    ///
    /// Owner and serial are read from the certificate itself; an explicit
    /// `owner` must agree with the certificate CommonName.
    pub fn load(path: &Path) -> Result<Self, RegistryError> {
        let location = path.display().to_string();
        let content = std::fs::read_to_string(path).map_err(|source| RegistryError::Read {
            path: location.clone(),
            source,
        })?;
        let registry = Self::from_toml(&content).map_err(|message| RegistryError::Parse {
            path: location.clone(),
            message,
        })?;
        info!(path = %location, certificates = registry.len(), "certificate registry loaded");
        Ok(registry)
    }

    fn from_toml(content: &str) -> Result<Self, String> {
        let file: RegistryFile = toml::from_str(content).map_err(|e| e.to_string())?;
        let registry = Self::new();
        for (idx, entry) in file.certificates.into_iter().enumerate() {
            let record = entry
                .into_record()
                .map_err(|e| format!("certificates[{idx}]: {e}"))?;
            registry.insert(record).map_err(|e| e.to_string())?;
        }
        Ok(registry)
    }
}

#[async_trait]
impl CertificateRegistry for MemoryRegistry {
    async fn query(
        &self,
        filter: &CertificateFilter,
    ) -> Result<Vec<CertificateRecord>, RegistryError> {
        let records = self
            .records
            .read()
            .map_err(|_| RegistryError::Unavailable("registry lock poisoned".to_string()))?;
        Ok(records
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect())
    }
}

#[derive(Deserialize)]
struct RegistryFile {
    #[serde(default)]
    certificates: Vec<RegistryEntry>,
}

#[derive(Deserialize)]
struct RegistryEntry {
    owner: Option<AccountAddress>,
    #[serde(default = "default_state")]
    state: CertificateState,
    cert: String,
}

fn default_state() -> CertificateState {
    CertificateState::Valid
}

impl RegistryEntry {
    fn into_record(self) -> Result<CertificateRecord, String> {
        use rustls::pki_types::pem::PemObject;
        use rustls::pki_types::CertificateDer;

        let der = CertificateDer::from_pem_slice(self.cert.as_bytes())
            .map_err(|e| format!("invalid certificate PEM: {e}"))?;
        let fields = crate::tls::verifier::CertificateFields::parse(der.as_ref())
            .map_err(|e| e.to_string())?;
        let cert_owner = fields
            .common_name
            .as_deref()
            .ok_or("certificate has no CommonName")?
            .parse::<AccountAddress>()
            .map_err(|e| format!("certificate CommonName: {e}"))?;
        if let Some(owner) = self.owner {
            if owner != cert_owner {
                return Err(format!(
                    "owner {owner} does not match certificate CommonName {cert_owner}"
                ));
            }
        }
        let serial = fields.serial.ok_or("certificate has no serial number")?;
        Ok(CertificateRecord {
            owner: cert_owner,
            serial,
            state: self.state,
            public_key: fields.public_key,
            cert_der: der.to_vec(),
        })
    }
}
