//! Certificate and registry fixtures shared by unit tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, KeyPair, SerialNumber,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

use crate::address::AccountAddress;
use crate::registry::{CertificateRecord, CertificateState, MemoryRegistry};
use crate::tls::config::TlsIdentity;
use crate::tls::verifier::CertificateFields;

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(0x1000_0000_0000_0000);

pub struct TestCert {
    pub owner: AccountAddress,
    pub serial: String,
    pub der: CertificateDer<'static>,
    pub key_der: Vec<u8>,
    pub cert_pem: String,
    pub key_pem: String,
}

impl TestCert {
    pub fn identity(&self) -> TlsIdentity {
        TlsIdentity {
            chain: vec![self.der.clone()],
            key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_der.clone())),
        }
    }

    pub fn record(&self) -> CertificateRecord {
        CertificateRecord {
            owner: self.owner.clone(),
            serial: self.serial.clone(),
            state: CertificateState::Valid,
            cert_der: self.der.to_vec(),
            public_key: CertificateFields::parse(self.der.as_ref())
                .unwrap()
                .public_key,
        }
    }
}

pub fn owner(byte: u8) -> AccountAddress {
    AccountAddress::from_payload("akash", &[byte; 20]).unwrap()
}

/// Self-issued certificate for `owner(byte)` valid for `hosts`.
pub fn owner_cert(byte: u8, hosts: &[&str]) -> TestCert {
    let owner = owner(byte);
    let mut cert = cert_with_names(owner.as_str(), owner.as_str(), hosts);
    cert.owner = owner;
    cert
}

/// Certificate with arbitrary subject/issuer CommonNames. When they differ the
/// certificate is signed by a throwaway issuer carrying `issuer_cn`.
pub fn cert_with_names(subject_cn: &str, issuer_cn: &str, hosts: &[&str]) -> TestCert {
    let serial = NEXT_SERIAL.fetch_add(1, Ordering::Relaxed);
    build(subject_cn, issuer_cn, hosts, serial)
}

/// A fresh key pair self-signing a certificate with `victim`'s CommonName
/// and serial.
pub fn impersonate(victim: &TestCert, hosts: &[&str]) -> TestCert {
    let serial = victim.serial.parse().unwrap();
    let mut cert = build(victim.owner.as_str(), victim.owner.as_str(), hosts, serial);
    cert.owner = victim.owner.clone();
    cert
}

fn build(subject_cn: &str, issuer_cn: &str, hosts: &[&str], serial: u64) -> TestCert {
    let key = KeyPair::generate().unwrap();
    let mut params =
        CertificateParams::new(hosts.iter().map(|h| (*h).to_string()).collect::<Vec<_>>())
            .unwrap();
    params.distinguished_name = DistinguishedName::new();
    params
        .distinguished_name
        .push(DnType::CommonName, subject_cn);
    params.serial_number = Some(SerialNumber::from_slice(&serial.to_be_bytes()));
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];

    let cert = if subject_cn == issuer_cn {
        params.self_signed(&key).unwrap()
    } else {
        let issuer_key = KeyPair::generate().unwrap();
        let mut issuer_params = CertificateParams::default();
        issuer_params.distinguished_name = DistinguishedName::new();
        issuer_params
            .distinguished_name
            .push(DnType::CommonName, issuer_cn);
        issuer_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let issuer = issuer_params.self_signed(&issuer_key).unwrap();
        params.signed_by(&key, &issuer, &issuer_key).unwrap()
    };

    TestCert {
        owner: AccountAddress::parse_any(subject_cn).unwrap_or_else(|_| owner(0)),
        serial: serial.to_string(),
        der: cert.der().clone(),
        key_der: key.serialize_der(),
        cert_pem: cert.pem(),
        key_pem: key.serialize_pem(),
    }
}

pub fn registry_with(certs: &[&TestCert]) -> Arc<MemoryRegistry> {
    let registry = MemoryRegistry::new();
    for cert in certs {
        registry.insert(cert.record()).unwrap();
    }
    Arc::new(registry)
}
