#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]

//! leasegw-client: tenant side of the lease gateway protocol.
//!
//! - `client`: [`ProviderClient`], with mutual TLS, registry check and REST calls
//! - `shell`: lease shell over the tagged-frame WebSocket
//! - `logs`: log and event streams

pub mod client;
pub mod error;
pub mod logs;
pub mod shell;

#[cfg(test)]
mod testserver;

pub use client::ProviderClient;
pub use error::{ClientError, ShellError};
pub use logs::{JsonStream, LeaseEvents, LogOptions, ServiceLogs};
pub use shell::{ShellIo, ShellRequest};
