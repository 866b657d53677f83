//! Wire-level types shared by the gateway and its clients.
//!
//! - [`frame`]: tag-prefixed binary frames of the shell protocol
//! - close codes for the streaming WebSockets
//! - JSON payloads: shell result, log lines, lease events, status documents

pub mod frame;

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use frame::{Frame, FrameError, Tag, TerminalSize};

/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// The server failed while setting up or running the stream.
pub const CLOSE_INTERNAL_ERROR: u16 = 4000;
/// Nothing to stream: no log sources, or the lease is unknown.
pub const CLOSE_NO_SOURCES: u16 = 4001;

/// Interval between keepalive pings.
pub const PING_PERIOD: Duration = Duration::from_secs(10);
/// How long the peer has to answer before the connection is considered dead.
pub const PONG_WAIT: Duration = Duration::from_secs(15);

/// Payload of a `Result` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellResult {
    pub exit_code: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl ShellResult {
    pub fn exited(exit_code: i32) -> Self {
        Self {
            exit_code,
            message: String::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            message: message.into(),
        }
    }
}

/// One line from one log source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceLogMessage {
    pub name: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct LeaseEventObject {
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reporting_controller: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reporting_instance: String,
    /// Milliseconds since the Unix epoch.
    pub time: u64,
    pub reason: String,
    pub note: String,
    pub object: LeaseEventObject,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ServiceStatus {
    pub name: String,
    pub available: u32,
    pub total: u32,
    #[serde(default)]
    pub uris: Vec<String>,
    pub replicas: u32,
    pub ready_replicas: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardedPortStatus {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host: String,
    pub port: u16,
    #[serde(rename = "externalPort")]
    pub external_port: u16,
    pub proto: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct LeaseStatus {
    pub services: BTreeMap<String, ServiceStatus>,
    #[serde(default)]
    pub forwarded_ports: BTreeMap<String, Vec<ForwardedPortStatus>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderStatus {
    pub address: String,
    pub leases: u32,
    pub services: u32,
    pub version: String,
    pub uptime_secs: u64,
}

/// Resources requested by one deployment group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSpec {
    pub name: String,
    pub resources: Vec<ResourceUnit>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUnit {
    pub count: u32,
    /// CPU in thousandths of a core.
    pub cpu_millis: u64,
    pub memory_bytes: u64,
    #[serde(default)]
    pub storage_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coin {
    pub denom: String,
    pub amount: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidateResult {
    pub min_bid_price: Coin,
}

/// Deployment manifest: the workload each group runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Manifest(pub Vec<ManifestGroup>);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestGroup {
    pub name: String,
    pub services: Vec<ManifestService>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestService {
    pub name: String,
    pub image: String,
    #[serde(default = "default_count")]
    pub count: u32,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
}

fn default_count() -> u32 {
    1
}

impl Manifest {
    /// Structural validation: at least one group, unique non-empty names,
    /// every service has an image and a positive count.
    pub fn validate(&self) -> Result<(), String> {
        if self.0.is_empty() {
            return Err("manifest has no groups".to_string());
        }
        let mut groups = std::collections::HashSet::new();
        for group in &self.0 {
            if group.name.is_empty() {
                return Err("group name is empty".to_string());
            }
            if !groups.insert(group.name.as_str()) {
                return Err(format!("duplicate group {:?}", group.name));
            }
            if group.services.is_empty() {
                return Err(format!("group {:?} has no services", group.name));
            }
            let mut services = std::collections::HashSet::new();
            for svc in &group.services {
                if svc.name.is_empty() {
                    return Err(format!("group {:?} has a service without a name", group.name));
                }
                if !services.insert(svc.name.as_str()) {
                    return Err(format!(
                        "duplicate service {:?} in group {:?}",
                        svc.name, group.name
                    ));
                }
                if svc.image.is_empty() {
                    return Err(format!("service {:?} has no image", svc.name));
                }
                if svc.count == 0 {
                    return Err(format!("service {:?} has a zero count", svc.name));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_result_omits_empty_message() {
        let json = serde_json::to_string(&ShellResult::exited(0)).unwrap();
        assert_eq!(json, r#"{"exit_code":0}"#);
        let json = serde_json::to_string(&ShellResult::error("pod index out of range")).unwrap();
        assert_eq!(json, r#"{"exit_code":0,"message":"pod index out of range"}"#);
        let parsed: ShellResult = serde_json::from_str(r#"{"exit_code":3}"#).unwrap();
        assert_eq!(parsed, ShellResult::exited(3));
    }

    #[test]
    fn log_message_shape() {
        let line = ServiceLogMessage {
            name: "web-0".to_string(),
            message: "hello".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&line).unwrap(),
            serde_json::json!({"name": "web-0", "message": "hello"})
        );
    }

    #[test]
    fn lease_event_uses_camel_case() {
        let event = LeaseEvent {
            kind: "Normal".to_string(),
            reporting_controller: "leasegw".to_string(),
            reporting_instance: String::new(),
            time: 1,
            reason: "Started".to_string(),
            note: "exec started".to_string(),
            object: LeaseEventObject::default(),
        };
        let v = serde_json::to_value(&event).unwrap();
        assert_eq!(v["type"], "Normal");
        assert_eq!(v["reportingController"], "leasegw");
        assert!(v.get("reportingInstance").is_none());
    }

    #[test]
    fn manifest_validation() {
        let mut manifest: Manifest = serde_json::from_value(serde_json::json!([
            {"name": "g", "services": [{"name": "web", "image": "nginx"}]}
        ]))
        .unwrap();
        assert!(manifest.validate().is_ok());
        assert_eq!(manifest.0[0].services[0].count, 1);

        manifest.0[0].services[0].count = 0;
        assert!(manifest.validate().is_err());
        assert!(Manifest::default().validate().is_err());

        let dup: Manifest = serde_json::from_value(serde_json::json!([
            {"name": "g", "services": [{"name": "a", "image": "x"}, {"name": "a", "image": "y"}]}
        ]))
        .unwrap();
        assert!(dup.validate().unwrap_err().contains("duplicate service"));
    }
}
