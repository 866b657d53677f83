//! Backend that serves leases from the machine the gateway runs on.
//!
//! Leases and their services come from the `[[local.leases]]` configuration.
//! A service is a working directory plus a set of log files; every replica
//! of it is the same host, so `podIndex` only has to be in range.
//!
//! - exec runs argv directly in the service's working directory
//!   ([`process`], with a PTY from [`pty`] for terminal sessions)
//! - logs tail the configured files ([`logs`])
//! - events are produced by this backend itself ([`events`])

pub mod events;
pub mod logs;
pub mod process;
pub mod pty;

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::address::AccountAddress;
use crate::cluster::{
    ClusterError, EventReader, EventStream, ExecIo, ExecRequest, ExecResult, Execer, LeaseReader,
    LogReader, LogRequest, LogSource, ManifestSubmitter, ProviderInfo,
};
use crate::config::{LocalConfig, LocalServiceConfig};
use crate::lease::{DeploymentId, LeaseId};
use crate::protocol::{
    Coin, GroupSpec, LeaseStatus, Manifest, ProviderStatus, ServiceStatus, ValidateResult,
};

use events::EventHub;

/// Bid price per thousandth of a CPU core, in micro-denomination units.
const PRICE_PER_CPU_MILLI: u64 = 1;
const PRICE_PER_MEMORY_MIB: u64 = 1;
const PRICE_PER_STORAGE_GIB: u64 = 10;
const PRICE_DENOM: &str = "uakt";

struct LocalLease {
    services: Vec<LocalServiceConfig>,
}

impl LocalLease {
    fn service(&self, name: &str) -> Option<&LocalServiceConfig> {
        self.services.iter().find(|s| s.name == name)
    }
}

pub struct LocalCluster {
    provider: AccountAddress,
    leases: HashMap<LeaseId, LocalLease>,
    manifests: RwLock<HashMap<DeploymentId, Manifest>>,
    events: EventHub,
    started: Instant,
}

impl LocalCluster {
    pub fn from_config(
        provider: AccountAddress,
        config: &LocalConfig,
        hrp: &str,
    ) -> Result<Self, ClusterError> {
        let mut leases = HashMap::new();
        for entry in &config.leases {
            let owner = AccountAddress::parse_with_prefix(&entry.owner, hrp).map_err(|e| {
                ClusterError::Internal(format!("local lease owner {:?}: {e}", entry.owner))
            })?;
            let id = LeaseId {
                owner,
                dseq: entry.dseq,
                gseq: entry.gseq,
                oseq: entry.oseq,
                provider: provider.clone(),
            };
            debug!(lease = %id, services = entry.services.len(), "local lease");
            leases.insert(
                id,
                LocalLease {
                    services: entry.services.clone(),
                },
            );
        }
        info!(leases = leases.len(), "local backend ready");
        Ok(Self {
            provider,
            leases,
            manifests: RwLock::new(HashMap::new()),
            events: EventHub::new(),
            started: Instant::now(),
        })
    }

    /// Last manifest accepted for `deployment`.
    pub async fn manifest(&self, deployment: &DeploymentId) -> Option<Manifest> {
        self.manifests.read().await.get(deployment).cloned()
    }

    fn lease(&self, id: &LeaseId) -> Result<&LocalLease, ClusterError> {
        self.leases.get(id).ok_or(ClusterError::LeaseNotFound)
    }

    /// Services selected by a filter; an empty filter selects all of them.
    fn select<'a>(
        lease: &'a LocalLease,
        names: &[String],
    ) -> Result<Vec<&'a LocalServiceConfig>, ClusterError> {
        if names.is_empty() {
            return Ok(lease.services.iter().collect());
        }
        names
            .iter()
            .map(|name| lease.service(name).ok_or(ClusterError::NoServiceWithName))
            .collect()
    }
}

fn service_status(svc: &LocalServiceConfig) -> ServiceStatus {
    let ready = if svc.running { svc.replicas } else { 0 };
    ServiceStatus {
        name: svc.name.clone(),
        available: ready,
        total: svc.replicas,
        uris: svc.uris.clone(),
        replicas: svc.replicas,
        ready_replicas: ready,
    }
}

fn pod_name(service: &str, index: u32) -> String {
    format!("{service}-{index}")
}

#[async_trait]
impl Execer for LocalCluster {
    async fn exec(
        &self,
        req: ExecRequest,
        io: ExecIo,
        cancel: CancellationToken,
    ) -> Result<ExecResult, ClusterError> {
        let lease = self.lease(&req.lease)?;
        let svc = lease
            .service(&req.service)
            .ok_or(ClusterError::NoServiceWithName)?;
        if !svc.running {
            return Err(ClusterError::ServiceNotRunning);
        }
        if req.pod_index >= svc.replicas {
            return Err(ClusterError::PodIndexOutOfRange);
        }

        let pod = pod_name(&svc.name, req.pod_index);
        let program = req.cmd.first().cloned().unwrap_or_default();
        self.events
            .publish(&req.lease, &svc.name, &pod, "Exec", format!("started {program}"))
            .await;
        let code = process::run(req.cmd, &svc.working_dir, req.tty, io, cancel).await?;
        self.events
            .publish(
                &req.lease,
                &svc.name,
                &pod,
                "Exec",
                format!("{program} exited with code {code}"),
            )
            .await;
        Ok(ExecResult { exit_code: code })
    }
}

#[async_trait]
impl LogReader for LocalCluster {
    async fn logs(
        &self,
        req: LogRequest,
        cancel: CancellationToken,
    ) -> Result<Vec<LogSource>, ClusterError> {
        let lease = self.lease(&req.lease)?;
        let mut sources = Vec::new();
        for svc in Self::select(lease, &req.services)? {
            if !svc.running {
                continue;
            }
            for (idx, path) in svc.log_files.iter().enumerate() {
                let name = pod_name(&svc.name, u32::try_from(idx).unwrap_or(u32::MAX));
                sources.push(logs::tail_file(
                    name,
                    path.clone(),
                    req.tail,
                    req.follow,
                    cancel.clone(),
                ));
            }
        }
        Ok(sources)
    }
}

#[async_trait]
impl EventReader for LocalCluster {
    async fn events(
        &self,
        lease: &LeaseId,
        services: &[String],
        follow: bool,
    ) -> Result<Option<EventStream>, ClusterError> {
        let Some(local) = self.leases.get(lease) else {
            return Ok(None);
        };
        Self::select(local, services)?;
        Ok(Some(self.events.stream(lease, services, follow).await))
    }
}

#[async_trait]
impl LeaseReader for LocalCluster {
    async fn lease_exists(&self, lease: &LeaseId) -> Result<bool, ClusterError> {
        Ok(self.leases.contains_key(lease))
    }

    async fn deployment_exists(&self, deployment: &DeploymentId) -> Result<bool, ClusterError> {
        Ok(self.leases.keys().any(|id| &id.deployment() == deployment))
    }

    async fn lease_status(&self, lease: &LeaseId) -> Result<LeaseStatus, ClusterError> {
        let local = self.lease(lease)?;
        if !local.services.iter().any(|s| s.global) {
            return Err(ClusterError::NoGlobalServices);
        }
        let services: BTreeMap<String, ServiceStatus> = local
            .services
            .iter()
            .map(|s| (s.name.clone(), service_status(s)))
            .collect();
        Ok(LeaseStatus {
            services,
            forwarded_ports: BTreeMap::new(),
        })
    }

    async fn service_status(
        &self,
        lease: &LeaseId,
        service: &str,
    ) -> Result<ServiceStatus, ClusterError> {
        let local = self.lease(lease)?;
        local
            .service(service)
            .map(service_status)
            .ok_or(ClusterError::NoServiceWithName)
    }
}

#[async_trait]
impl ManifestSubmitter for LocalCluster {
    async fn submit(&self, deployment: &DeploymentId, manifest: Manifest) -> Result<(), ClusterError> {
        let lease = self
            .leases
            .iter()
            .find(|(id, _)| &id.deployment() == deployment)
            .map(|(id, _)| id.clone())
            .ok_or(ClusterError::NoLeaseForDeployment)?;
        manifest.validate().map_err(ClusterError::InvalidManifest)?;
        let services: usize = manifest.0.iter().map(|g| g.services.len()).sum();
        self.manifests
            .write()
            .await
            .insert(deployment.clone(), manifest);
        info!(%deployment, services, "manifest accepted");
        self.events
            .publish(&lease, "", "manifest", "ManifestAccepted", format!("{services} services"))
            .await;
        Ok(())
    }
}

#[async_trait]
impl ProviderInfo for LocalCluster {
    async fn status(&self) -> Result<ProviderStatus, ClusterError> {
        let services: usize = self.leases.values().map(|l| l.services.len()).sum();
        Ok(ProviderStatus {
            address: self.provider.to_string(),
            leases: u32::try_from(self.leases.len()).unwrap_or(u32::MAX),
            services: u32::try_from(services).unwrap_or(u32::MAX),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_secs: self.started.elapsed().as_secs(),
        })
    }

    async fn validate(&self, spec: &GroupSpec) -> Result<ValidateResult, ClusterError> {
        if spec.resources.is_empty() {
            return Err(ClusterError::InvalidGroupSpec(format!(
                "group {:?} requests no resources",
                spec.name
            )));
        }
        let mut amount: u64 = 0;
        for unit in &spec.resources {
            if unit.count == 0 || unit.cpu_millis == 0 || unit.memory_bytes == 0 {
                return Err(ClusterError::InvalidGroupSpec(format!(
                    "group {:?} has an empty resource unit",
                    spec.name
                )));
            }
            let per_unit = unit.cpu_millis * PRICE_PER_CPU_MILLI
                + (unit.memory_bytes >> 20) * PRICE_PER_MEMORY_MIB
                + (unit.storage_bytes >> 30) * PRICE_PER_STORAGE_GIB;
            amount = amount.saturating_add(per_unit.saturating_mul(u64::from(unit.count)));
        }
        Ok(ValidateResult {
            min_bid_price: Coin {
                denom: PRICE_DENOM.to_string(),
                amount: amount.to_string(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LocalLeaseConfig;
    use crate::protocol::ResourceUnit;
    use crate::testutil;
    use futures::StreamExt;
    use tokio::io::{duplex, AsyncBufReadExt, AsyncReadExt};

    fn service(name: &str) -> LocalServiceConfig {
        LocalServiceConfig {
            name: name.to_string(),
            replicas: 2,
            running: true,
            working_dir: "/".to_string(),
            log_files: Vec::new(),
            uris: vec![format!("{name}.example.com")],
            global: true,
        }
    }

    fn local_cluster(services: Vec<LocalServiceConfig>) -> (LocalCluster, LeaseId) {
        let provider = testutil::owner(9);
        let owner = testutil::owner(1);
        let config = LocalConfig {
            leases: vec![LocalLeaseConfig {
                owner: owner.to_string(),
                dseq: 42,
                gseq: 1,
                oseq: 1,
                services,
            }],
        };
        let lease = LeaseId {
            owner,
            dseq: 42,
            gseq: 1,
            oseq: 1,
            provider: provider.clone(),
        };
        (LocalCluster::from_config(provider, &config, "akash").unwrap(), lease)
    }

    fn exec_io() -> (ExecIo, tokio::io::DuplexStream) {
        let (out_w, out_r) = duplex(4096);
        let (err_w, _err_r) = duplex(4096);
        (
            ExecIo {
                stdin: None,
                stdout: Box::new(out_w),
                stderr: Box::new(err_w),
                resize: None,
            },
            out_r,
        )
    }

    fn request(lease: &LeaseId, service: &str, pod_index: u32, cmd: &[&str]) -> ExecRequest {
        ExecRequest {
            lease: lease.clone(),
            service: service.to_string(),
            pod_index,
            cmd: cmd.iter().map(|s| (*s).to_string()).collect(),
            tty: false,
        }
    }

    #[tokio::test]
    async fn exec_checks_service_and_pod() {
        let mut stopped = service("db");
        stopped.running = false;
        let (cluster, lease) = local_cluster(vec![service("web"), stopped]);
        let cancel = CancellationToken::new();

        let err = cluster
            .exec(request(&lease, "nope", 0, &["true"]), exec_io().0, cancel.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::NoServiceWithName));

        let err = cluster
            .exec(request(&lease, "db", 0, &["true"]), exec_io().0, cancel.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::ServiceNotRunning));

        let err = cluster
            .exec(request(&lease, "web", 2, &["true"]), exec_io().0, cancel.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::PodIndexOutOfRange));

        let mut other = lease.clone();
        other.dseq = 7;
        let err = cluster
            .exec(request(&other, "web", 0, &["true"]), exec_io().0, cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::LeaseNotFound));
    }

    #[tokio::test]
    async fn exec_runs_and_records_events() {
        let (cluster, lease) = local_cluster(vec![service("web")]);
        let (io, mut out) = exec_io();
        let result = cluster
            .exec(request(&lease, "web", 1, &["echo", "hi"]), io, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.exit_code, 0);
        let mut text = String::new();
        out.read_to_string(&mut text).await.unwrap();
        assert_eq!(text, "hi\n");

        let events: Vec<_> = cluster
            .events(&lease, &[], false)
            .await
            .unwrap()
            .unwrap()
            .collect()
            .await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].object.name, "web-1");
        assert!(events[1].note.contains("exited with code 0"));
    }

    #[tokio::test]
    async fn unknown_lease_has_no_event_stream() {
        let (cluster, mut lease) = local_cluster(vec![service("web")]);
        lease.oseq = 5;
        assert!(cluster.events(&lease, &[], true).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn logs_skip_stopped_services() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("web.log");
        std::fs::write(&path, "ready\n").unwrap();
        let mut web = service("web");
        web.log_files = vec![path];
        let mut db = service("db");
        db.running = false;
        db.log_files = vec![dir.path().join("db.log")];
        let (cluster, lease) = local_cluster(vec![web, db]);

        let req = LogRequest {
            lease: lease.clone(),
            services: Vec::new(),
            follow: false,
            tail: None,
        };
        let sources = cluster.logs(req, CancellationToken::new()).await.unwrap();
        assert_eq!(sources.len(), 1);
        let source = sources.into_iter().next().unwrap();
        assert_eq!(source.name, "web-0");
        let mut lines = source.reader.lines();
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("ready"));

        let only_db = LogRequest {
            lease,
            services: vec!["db".to_string()],
            follow: false,
            tail: None,
        };
        assert!(cluster
            .logs(only_db, CancellationToken::new())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn status_requires_global_service() {
        let (cluster, lease) = local_cluster(vec![service("web")]);
        let status = cluster.lease_status(&lease).await.unwrap();
        assert_eq!(status.services["web"].ready_replicas, 2);

        let mut internal = service("worker");
        internal.global = false;
        let (cluster, lease) = local_cluster(vec![internal]);
        assert!(matches!(
            cluster.lease_status(&lease).await,
            Err(ClusterError::NoGlobalServices)
        ));
        assert!(cluster.service_status(&lease, "worker").await.is_ok());
        assert!(matches!(
            cluster.service_status(&lease, "other").await,
            Err(ClusterError::NoServiceWithName)
        ));
    }

    #[tokio::test]
    async fn manifest_needs_a_lease_and_a_valid_body() {
        let (cluster, lease) = local_cluster(vec![service("web")]);
        let manifest: Manifest = serde_json::from_value(serde_json::json!([
            {"name": "g", "services": [{"name": "web", "image": "nginx"}]}
        ]))
        .unwrap();
        cluster
            .submit(&lease.deployment(), manifest.clone())
            .await
            .unwrap();
        assert_eq!(cluster.manifest(&lease.deployment()).await, Some(manifest.clone()));

        let mut unknown = lease.deployment();
        unknown.dseq = 1;
        assert!(matches!(
            cluster.submit(&unknown, manifest).await,
            Err(ClusterError::NoLeaseForDeployment)
        ));
        assert!(matches!(
            cluster.submit(&lease.deployment(), Manifest::default()).await,
            Err(ClusterError::InvalidManifest(_))
        ));
    }

    #[tokio::test]
    async fn validate_prices_resources() {
        let (cluster, _) = local_cluster(vec![service("web")]);
        let spec = GroupSpec {
            name: "g".to_string(),
            resources: vec![ResourceUnit {
                count: 2,
                cpu_millis: 500,
                memory_bytes: 512 << 20,
                storage_bytes: 1 << 30,
            }],
        };
        let result = cluster.validate(&spec).await.unwrap();
        assert_eq!(result.min_bid_price.denom, "uakt");
        assert_eq!(result.min_bid_price.amount, ((500 + 512 + 10) * 2).to_string());

        let empty = GroupSpec {
            name: "g".to_string(),
            resources: Vec::new(),
        };
        assert!(matches!(
            cluster.validate(&empty).await,
            Err(ClusterError::InvalidGroupSpec(_))
        ));
    }
}
