//! Lease and deployment identifiers.
//!
//! A lease is scoped by its owner, the deployment sequence, the group and
//! order sequences within that deployment, and the provider that won it. The
//! gateway learns the owner from the verified peer certificate and the
//! provider from its own configuration, so routes only carry the sequences.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::address::AccountAddress;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeploymentId {
    pub owner: AccountAddress,
    pub dseq: u64,
}

impl fmt::Display for DeploymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.dseq)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeaseId {
    pub owner: AccountAddress,
    pub dseq: u64,
    pub gseq: u32,
    pub oseq: u32,
    pub provider: AccountAddress,
}

impl LeaseId {
    pub fn deployment(&self) -> DeploymentId {
        DeploymentId {
            owner: self.owner.clone(),
            dseq: self.dseq,
        }
    }

    /// Path segment used by tenant-facing routes, e.g. `42/1/1`.
    pub fn route_path(&self) -> String {
        format!("{}/{}/{}", self.dseq, self.gseq, self.oseq)
    }
}

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}/{}",
            self.owner, self.dseq, self.gseq, self.oseq, self.provider
        )
    }
}
