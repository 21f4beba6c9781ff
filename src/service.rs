//! Caller-facing VM operations
//!
//! [`VmService`] ties provisioning, the lifecycle pool, port allocation and
//! the repository together. Lifecycle calls return the record as it was
//! before the operation; their outcome lands in the store later.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, instrument, warn};

use crate::cluster::{gvk, ClusterApi};
use crate::guard;
use crate::lifecycle::{LifecycleDispatcher, LifecycleOp};
use crate::manifest::{self, Substitutions};
use crate::model::{
    NewVirtualMachine, ProvisionRequest, ProvisioningResult, VirtualMachine, VmStatus,
};
use crate::ports::PortAllocator;
use crate::provision::Provisioner;
use crate::repository::VmRepository;
use crate::{Error, Result};

/// Parameters for launching a VM on behalf of a user
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LaunchRequest {
    /// The user's namespace
    pub namespace: String,
    /// VM name
    pub name: String,
    /// Access secret
    pub secret: String,
    /// Host routed to the VM's web service
    pub access_host: String,
    /// Image to import; the service default when absent
    pub image: Option<String>,
    /// Requested NodePort; allocated when absent
    pub port: Option<u16>,
    /// Build VM objects with the typed builder instead of templates
    pub typed: bool,
}

/// A launched VM: its record and what provisioning created
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchOutcome {
    /// Stored record, still `Provisioning` when returned
    pub vm: VirtualMachine,
    /// Provisioning summary
    pub result: ProvisioningResult,
}

/// Cluster reachability
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Health {
    /// The API server answered
    Healthy,
    /// The API server could not be reached
    Unhealthy(String),
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => f.write_str("healthy"),
            Self::Unhealthy(reason) => write!(f, "unhealthy: {}", reason),
        }
    }
}

/// VM operations exposed to callers
pub struct VmService {
    cluster: Arc<dyn ClusterApi>,
    repository: Arc<dyn VmRepository>,
    provisioner: Provisioner,
    dispatcher: LifecycleDispatcher,
    ports: PortAllocator,
    vm_manifest_dir: PathBuf,
    default_image: String,
}

impl VmService {
    /// Wire the service from its parts
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        repository: Arc<dyn VmRepository>,
        provisioner: Provisioner,
        dispatcher: LifecycleDispatcher,
        vm_manifest_dir: impl Into<PathBuf>,
        default_image: impl Into<String>,
    ) -> Self {
        Self {
            ports: PortAllocator::new(repository.clone()),
            cluster,
            repository,
            provisioner,
            dispatcher,
            vm_manifest_dir: vm_manifest_dir.into(),
            default_image: default_image.into(),
        }
    }

    /// Provision cluster objects for a VM without touching the store
    pub async fn create_user_vm(&self, request: &ProvisionRequest) -> Result<ProvisioningResult> {
        self.provisioner.provision(request).await
    }

    /// Like [`Self::create_user_vm`] but with the typed builder
    pub async fn create_typed_user_vm(
        &self,
        request: &ProvisionRequest,
        image: Option<&str>,
    ) -> Result<ProvisioningResult> {
        let image = image.unwrap_or(&self.default_image);
        self.provisioner.provision_typed(request, image).await
    }

    /// Record, provision and start tracking a new VM.
    ///
    /// The record is created in `Provisioning` before any cluster call and
    /// set to `Failed` if provisioning fails. Template launches record the
    /// image their DataVolume imports.
    #[instrument(skip(self, request), fields(vm = %request.name, namespace = %request.namespace))]
    pub async fn launch_vm(&self, owner_id: u64, request: LaunchRequest) -> Result<LaunchOutcome> {
        let port = match request.port {
            Some(port) => port,
            None => self.ports.available_port().await?,
        };
        let provision_request = ProvisionRequest {
            namespace: request.namespace.clone(),
            vm_name: request.name.clone(),
            secret: request.secret.clone(),
            access_host: request.access_host.clone(),
            manifest_dir: self.vm_manifest_dir.clone(),
            port,
        };
        guard::check(&provision_request)?;
        let image = if request.typed {
            request
                .image
                .clone()
                .unwrap_or_else(|| self.default_image.clone())
        } else if request.image.is_some() {
            return Err(Error::validation(
                "image can only be chosen for typed launches; templates import their own",
            ));
        } else {
            template_image(&provision_request)?
        };

        let vm = self
            .repository
            .create(NewVirtualMachine {
                owner_id,
                name: request.name.clone(),
                namespace: request.namespace.clone(),
                node_port: port,
                secret: request.secret.clone(),
                image: image.clone(),
            })
            .await?;
        info!(id = vm.id, port, "VM record created");

        let provisioned = if request.typed {
            self.provisioner
                .provision_typed(&provision_request, &image)
                .await
        } else {
            self.provisioner.provision(&provision_request).await
        };
        let result = match provisioned {
            Ok(result) => result,
            Err(e) => {
                if let Err(update) = self
                    .repository
                    .update_status(&vm.name, VmStatus::Failed)
                    .await
                {
                    error!(error = %update, "Failed to mark VM as failed");
                }
                return Err(e);
            }
        };

        if let Err(e) = self.dispatcher.dispatch(LifecycleOp::AwaitRunning, vm.clone()) {
            warn!(error = %e, "VM provisioned but running-wait was not queued");
        }
        Ok(LaunchOutcome { vm, result })
    }

    /// Queue a stop; returns the record as it was
    pub fn stop_vm(&self, vm: &VirtualMachine) -> Result<VirtualMachine> {
        self.dispatch(LifecycleOp::Stop, vm)
    }

    /// Queue a start; returns the record as it was
    pub fn start_vm(&self, vm: &VirtualMachine) -> Result<VirtualMachine> {
        self.dispatch(LifecycleOp::Start, vm)
    }

    /// Queue a delete; returns the record as it was
    pub fn delete_vm(&self, vm: &VirtualMachine) -> Result<VirtualMachine> {
        self.dispatch(LifecycleOp::Delete, vm)
    }

    fn dispatch(&self, op: LifecycleOp, vm: &VirtualMachine) -> Result<VirtualMachine> {
        self.dispatcher.dispatch(op, vm.clone())?;
        Ok(vm.clone())
    }

    /// Lowest free port in the allocator band
    pub async fn available_port(&self) -> Result<u16> {
        self.ports.available_port().await
    }

    /// Lowest band port held by neither an active VM nor any Service in
    /// the cluster
    pub async fn available_cluster_port(&self) -> Result<u16> {
        self.ports.available_cluster_port(self.cluster.as_ref()).await
    }

    /// Whether no active VM holds `port`
    pub async fn is_port_available(&self, port: u16) -> Result<bool> {
        self.ports.is_port_available(port).await
    }

    /// A user's active VMs; secrets are blanked unless asked for
    pub async fn list_user_vms(
        &self,
        owner_id: u64,
        include_secret: bool,
    ) -> Result<Vec<VirtualMachine>> {
        let vms = self.repository.list_by_owner(owner_id).await?;
        Ok(if include_secret {
            vms
        } else {
            vms.iter().map(VirtualMachine::redacted).collect()
        })
    }

    /// Active VM by name
    pub async fn find_vm(&self, name: &str, include_secret: bool) -> Result<VirtualMachine> {
        let vm = self
            .repository
            .find_by_name(name)
            .await?
            .ok_or_else(|| Error::not_found(name))?;
        Ok(if include_secret { vm } else { vm.redacted() })
    }

    /// Ask the API server for at most one namespace
    pub async fn check_connectivity(&self) -> Health {
        let request = async {
            let target = self.cluster.resolve(&gvk("v1", "Namespace"))?;
            self.cluster.list(&target, "", 1).await
        };
        match request.await {
            Ok(_) => Health::Healthy,
            Err(e) => {
                warn!(error = %e, "Cluster connectivity check failed");
                Health::Unhealthy(e.to_string())
            }
        }
    }
}

/// Image the VM templates import, empty when they declare none
fn template_image(request: &ProvisionRequest) -> Result<String> {
    let documents = manifest::load_dir(&request.manifest_dir, &Substitutions::for_vm(request))?;
    Ok(manifest::imported_image(&documents)
        .unwrap_or_default()
        .to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::fake::FakeCluster;
    use crate::cluster::{ApiTarget, MockClusterApi};
    use crate::lifecycle::{PollSettings, VmLifecycle};
    use crate::provision::DEFAULT_INIT_DIR;
    use crate::repository::InMemoryVmRepository;
    use std::time::Duration;

    const VM_TEMPLATES: &str = "yaml-data/client-vm";

    struct Harness {
        service: VmService,
        cluster: Arc<FakeCluster>,
        repo: Arc<InMemoryVmRepository>,
        pool: tokio::task::JoinHandle<()>,
    }

    /// Service over a fake cluster, reading the crate's own templates
    fn harness() -> Harness {
        let cluster = Arc::new(FakeCluster::new());
        let repo = Arc::new(InMemoryVmRepository::new());
        let lifecycle = Arc::new(VmLifecycle::new(
            cluster.clone(),
            repo.clone(),
            PollSettings {
                interval: Duration::from_secs(5),
                timeout: Duration::from_secs(60),
            },
        ));
        let (dispatcher, pool) = LifecycleDispatcher::spawn(lifecycle, 2, 16);
        let provisioner = Provisioner::new(cluster.clone(), DEFAULT_INIT_DIR);
        let service = VmService::new(
            cluster.clone(),
            repo.clone(),
            provisioner,
            dispatcher,
            VM_TEMPLATES,
            "https://images.example.com/ubuntu.img",
        );
        Harness {
            service,
            cluster,
            repo,
            pool,
        }
    }

    fn launch_request(name: &str) -> LaunchRequest {
        LaunchRequest {
            namespace: "user-7".to_string(),
            name: name.to_string(),
            secret: "Passw0rd!".to_string(),
            access_host: format!("{name}.example.com"),
            image: None,
            port: None,
            typed: true,
        }
    }

    async fn finish(harness: Harness) -> (Arc<FakeCluster>, Arc<InMemoryVmRepository>) {
        let Harness {
            service,
            cluster,
            repo,
            pool,
            ..
        } = harness;
        drop(service);
        pool.await.unwrap();
        (cluster, repo)
    }

    // ==========================================================================
    // Story Tests: launching and managing VMs through the service
    // ==========================================================================

    /// Story: a typed launch allocates the first port, records the VM,
    /// provisions it, and the background wait moves it to Running
    #[tokio::test(start_paused = true)]
    async fn story_launch_reaches_running() {
        let h = harness();
        h.cluster.set_printable_status("web-1", "Running");

        let outcome = h.service.launch_vm(7, launch_request("web-1")).await.unwrap();
        assert_eq!(outcome.vm.node_port, 30003);
        assert_eq!(outcome.vm.status, VmStatus::Provisioning);
        assert_eq!(outcome.vm.image, "https://images.example.com/ubuntu.img");
        assert_eq!(outcome.result.created_resources.len(), 6);

        let (cluster, repo) = finish(h).await;
        let stored = repo.find_by_name("web-1").await.unwrap().unwrap();
        assert_eq!(stored.status, VmStatus::Running);
        assert!(cluster.contains("Namespace", "", "user-7"));
        assert!(cluster.contains("ResourceQuota", "user-7", "vm-quota"));
    }

    /// Story: a second launch gets the next port
    #[tokio::test(start_paused = true)]
    async fn story_second_launch_gets_next_port() {
        let h = harness();
        h.service.launch_vm(7, launch_request("web-1")).await.unwrap();
        let second = h.service.launch_vm(7, launch_request("web-2")).await.unwrap();
        assert_eq!(second.vm.node_port, 30004);
        assert!(!h.service.is_port_available(30004).await.unwrap());
        assert_eq!(h.service.available_port().await.unwrap(), 30005);
    }

    /// Story: ports taken by Services the store never recorded are skipped
    /// only by the cluster-wide lookup
    #[tokio::test(start_paused = true)]
    async fn story_cluster_port_sees_unrecorded_services() {
        let h = harness();
        h.service.launch_vm(7, launch_request("web-1")).await.unwrap();
        h.repo.mark_deleted("web-1").await.unwrap();

        assert_eq!(h.service.available_port().await.unwrap(), 30003);
        assert_eq!(h.service.available_cluster_port().await.unwrap(), 30004);
        assert!(h.cluster.contains("Service", "user-7", "vps-access-web-1"));
    }

    /// Story: provisioning fails and the record is marked Failed
    #[tokio::test]
    async fn story_failed_provisioning_marks_record() {
        let h = harness();
        h.cluster.fail_create_of("web-1");

        let err = h
            .service
            .launch_vm(7, launch_request("web-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Apply { .. }));

        let stored = h.repo.find_by_name("web-1").await.unwrap().unwrap();
        assert_eq!(stored.status, VmStatus::Failed);
        assert_eq!(h.cluster.object_count(), 0);
    }

    #[tokio::test]
    async fn duplicate_name_is_a_conflict() {
        let h = harness();
        h.service.launch_vm(7, launch_request("web-1")).await.unwrap();
        let err = h
            .service
            .launch_vm(7, launch_request("web-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
    }

    #[tokio::test]
    async fn invalid_launch_creates_no_record() {
        let h = harness();
        let request = LaunchRequest {
            secret: "bad secret with spaces".to_string(),
            ..launch_request("web-1")
        };
        let err = h.service.launch_vm(7, request).await.unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert!(h.repo.find_by_name("web-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn template_launch_uses_manifest_dir() {
        let h = harness();
        let request = LaunchRequest {
            typed: false,
            port: Some(30100),
            ..launch_request("web-1")
        };
        let outcome = h.service.launch_vm(7, request).await.unwrap();
        let kinds: Vec<_> = outcome
            .result
            .created_resources
            .iter()
            .map(|r| r.kind.as_str())
            .collect();
        assert_eq!(
            kinds,
            vec![
                "Secret",
                "DataVolume",
                "VirtualMachine",
                "Service",
                "Service",
                "Ingress"
            ]
        );
        assert_eq!(outcome.vm.node_port, 30100);
        assert_eq!(
            outcome.vm.image,
            "https://cloud-images.ubuntu.com/jammy/current/jammy-server-cloudimg-amd64.img"
        );
    }

    #[tokio::test]
    async fn template_launch_rejects_an_explicit_image() {
        let h = harness();
        let request = LaunchRequest {
            typed: false,
            image: Some("https://images.example.com/debian.img".to_string()),
            ..launch_request("web-1")
        };
        let err = h.service.launch_vm(7, request).await.unwrap_err();
        assert!(
            matches!(err, Error::Validation { ref message } if message.contains("typed")),
            "{err:?}"
        );
        assert!(h.repo.find_by_name("web-1").await.unwrap().is_none());
        assert_eq!(h.cluster.object_count(), 0);
    }

    /// Story: stop returns the old snapshot at once; the store catches up
    #[tokio::test(start_paused = true)]
    async fn story_stop_is_fire_and_forget() {
        let h = harness();
        h.cluster.set_printable_status("web-1", "Running");
        let vm = h.service.launch_vm(7, launch_request("web-1")).await.unwrap().vm;
        h.cluster.set_printable_status("web-1", "Stopped");

        let snapshot = h.service.stop_vm(&vm).unwrap();
        assert_eq!(snapshot.status, VmStatus::Provisioning);

        let (_, repo) = finish(h).await;
        let stored = repo.find_by_name("web-1").await.unwrap().unwrap();
        assert_eq!(stored.status, VmStatus::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn delete_soft_deletes_and_frees_port() {
        let h = harness();
        let vm = h.service.launch_vm(7, launch_request("web-1")).await.unwrap().vm;
        h.service.delete_vm(&vm).unwrap();

        let (cluster, repo) = finish(h).await;
        assert!(repo.find_by_name("web-1").await.unwrap().is_none());
        assert!(repo.used_ports().await.unwrap().is_empty());
        assert!(!cluster.contains("VirtualMachine", "user-7", "web-1"));
    }

    #[tokio::test]
    async fn listing_redacts_secrets_by_default() {
        let h = harness();
        h.service.launch_vm(7, launch_request("web-1")).await.unwrap();

        let listed = h.service.list_user_vms(7, false).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].secret.is_empty());

        let with_secret = h.service.find_vm("web-1", true).await.unwrap();
        assert_eq!(with_secret.secret, "Passw0rd!");

        let err = h.service.find_vm("ghost", false).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn connectivity_reports_health() {
        let h = harness();
        assert_eq!(h.service.check_connectivity().await, Health::Healthy);

        let mut cluster = MockClusterApi::new();
        cluster
            .expect_resolve()
            .returning(|gvk| Ok(ApiTarget::from_gvk(gvk, false)));
        cluster
            .expect_list()
            .withf(|_, _, limit| *limit == 1)
            .returning(|_, _, _| Err(Error::config("connection refused")));
        let repo = Arc::new(InMemoryVmRepository::new());
        let cluster: Arc<dyn ClusterApi> = Arc::new(cluster);
        let lifecycle = Arc::new(VmLifecycle::new(
            cluster.clone(),
            repo.clone(),
            PollSettings::default(),
        ));
        let (dispatcher, _pool) = LifecycleDispatcher::spawn(lifecycle, 1, 1);
        let service = VmService::new(
            cluster.clone(),
            repo,
            Provisioner::new(cluster, "unused"),
            dispatcher,
            "yaml-data/client-vm",
            "image",
        );
        match service.check_connectivity().await {
            Health::Unhealthy(reason) => assert!(reason.contains("connection refused")),
            Health::Healthy => panic!("Expected unhealthy"),
        }
    }

    #[test]
    fn health_display() {
        assert_eq!(Health::Healthy.to_string(), "healthy");
        assert_eq!(
            Health::Unhealthy("timeout".to_string()).to_string(),
            "unhealthy: timeout"
        );
    }
}
