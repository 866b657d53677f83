//! Mutual TLS without a certificate authority.
//!
//! - [`verifier`]: registry-backed trust checks
//! - [`config`]: rustls configurations and PEM identity loading
//! - [`listener`]: the gateway's TLS accept loop

pub mod config;
pub mod listener;
pub mod verifier;

pub use config::{client_config, server_config, server_name, TlsIdentity, TlsSetupError};
pub use verifier::{PeerIdentity, PeerRole, TrustError, TrustVerifier};
