#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! leasegw library: the provider side of the lease gateway protocol, plus
//! the wire types a tenant client needs.
//!
//! - `tls`: registry-backed mutual TLS and the accept loop
//! - `registry`: certificate registry trait and the file-backed registry
//! - `routes` / `middleware`: the HTTP router and its authorization chain
//! - `ws`: the shell multiplexer and the log/event streamer (server halves)
//! - `protocol`: frame codec, close codes and JSON payloads shared with clients
//! - `cluster`: backend capability traits and the local backend
//! - `config`: TOML + env-var configuration

pub mod address;
pub mod cluster;
pub mod config;
pub mod error;
pub mod lease;
pub mod middleware;
pub mod protocol;
pub mod registry;
pub mod routes;
pub mod state;
pub mod tls;
pub mod ws;

#[cfg(any(test, feature = "test-util"))]
pub mod testutil;

// Re-export key types at crate root for convenience.
pub use address::AccountAddress;
pub use config::Config;
pub use error::GatewayError;
pub use lease::{DeploymentId, LeaseId};
pub use registry::{CertificateRegistry, MemoryRegistry};
pub use state::AppState;
pub use tls::listener::Gateway;
pub use tls::{PeerIdentity, TrustVerifier};
