//! VM lifecycle state machine
//!
//! Stop and start flip `spec.running` on the KubeVirt VirtualMachine and then
//! poll `status.printableStatus` until the cluster reports the desired state.
//! The persisted record is the source of truth for callers; it is only moved
//! forward once the cluster agrees.
//!
//! ```text
//! Provisioning --await running--> Running --stop--> Stopping --> Stopped
//!                                    ^                              |
//!                                    +------------start-------------+
//! any --delete--> Deleted
//! ```

mod dispatch;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use kube::api::DynamicObject;
use serde_json::json;
use tokio::time::{interval_at, timeout, Instant};
use tracing::{info, instrument, trace};

use crate::cluster::{gvk, ApiTarget, ClusterApi};
use crate::model::{VirtualMachine, VmStatus};
use crate::repository::VmRepository;
use crate::{Error, Result};

pub use dispatch::{LifecycleDispatcher, LifecycleJob, LifecycleOp};

/// apiVersion of KubeVirt VirtualMachines
pub const VIRTUAL_MACHINE_API_VERSION: &str = "kubevirt.io/v1";

/// Default time between status polls
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Default limit for a status wait
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(60);

/// Poll cadence for status waits
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollSettings {
    /// Time between checks; the first check happens after one interval
    pub interval: Duration,
    /// Total time before giving up
    pub timeout: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            timeout: DEFAULT_POLL_TIMEOUT,
        }
    }
}

/// Poll `check` every `interval` until it returns `Ok(true)`.
///
/// The first check runs one interval after the call. An `Err` from `check`
/// ends the wait immediately; running out of `settings.timeout` yields
/// `on_timeout()`.
pub async fn poll_until<F, Fut>(
    settings: PollSettings,
    on_timeout: impl FnOnce() -> Error,
    mut check: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let poll = async {
        let mut ticker = interval_at(Instant::now() + settings.interval, settings.interval);
        loop {
            ticker.tick().await;
            if check().await? {
                return Ok(());
            }
            trace!("Polling condition not yet met");
        }
    };
    match timeout(settings.timeout, poll).await {
        Ok(result) => result,
        Err(_) => Err(on_timeout()),
    }
}

/// `status.printableStatus` of a VirtualMachine, if reported yet
pub fn printable_status(object: &DynamicObject) -> Option<&str> {
    object
        .data
        .get("status")
        .and_then(|s| s.get("printableStatus"))
        .and_then(|s| s.as_str())
}

/// Drives stop, start, delete and running-wait for persisted VMs
pub struct VmLifecycle {
    cluster: Arc<dyn ClusterApi>,
    repository: Arc<dyn VmRepository>,
    poll: PollSettings,
}

impl VmLifecycle {
    /// Create a lifecycle driver
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        repository: Arc<dyn VmRepository>,
        poll: PollSettings,
    ) -> Self {
        Self {
            cluster,
            repository,
            poll,
        }
    }

    fn vm_target(&self) -> Result<ApiTarget> {
        self.cluster
            .resolve(&gvk(VIRTUAL_MACHINE_API_VERSION, "VirtualMachine"))
    }

    /// Stop a VM and wait for the cluster to report it stopped.
    ///
    /// The record moves to `Stopping` before anything else happens and stays
    /// there if the wait fails.
    #[instrument(skip(self, vm), fields(vm = %vm.name, namespace = %vm.namespace))]
    pub async fn stop(&self, vm: &VirtualMachine) -> Result<()> {
        self.repository
            .update_status(&vm.name, VmStatus::Stopping)
            .await?;
        let target = self.vm_target()?;
        self.cluster
            .patch_merge(
                &target,
                &vm.namespace,
                &vm.name,
                &json!({ "spec": { "running": false } }),
            )
            .await?;
        self.wait_for_status(&target, vm, VmStatus::Stopped).await?;
        self.repository
            .update_status(&vm.name, VmStatus::Stopped)
            .await?;
        info!("VM stopped");
        Ok(())
    }

    /// Start a VM and wait for the cluster to report it running
    #[instrument(skip(self, vm), fields(vm = %vm.name, namespace = %vm.namespace))]
    pub async fn start(&self, vm: &VirtualMachine) -> Result<()> {
        let target = self.vm_target()?;
        self.cluster
            .patch_merge(
                &target,
                &vm.namespace,
                &vm.name,
                &json!({ "spec": { "running": true } }),
            )
            .await?;
        self.wait_for_status(&target, vm, VmStatus::Running).await?;
        self.repository
            .update_status(&vm.name, VmStatus::Running)
            .await?;
        info!("VM started");
        Ok(())
    }

    /// Wait for a freshly provisioned VM to report running
    #[instrument(skip(self, vm), fields(vm = %vm.name, namespace = %vm.namespace))]
    pub async fn await_running(&self, vm: &VirtualMachine) -> Result<()> {
        let target = self.vm_target()?;
        self.wait_for_status(&target, vm, VmStatus::Running).await?;
        self.repository
            .update_status(&vm.name, VmStatus::Running)
            .await?;
        info!("VM running");
        Ok(())
    }

    /// Soft-delete the record, then delete the VM's cluster objects in order.
    ///
    /// The first deletion failure stops the sweep; the soft delete stands.
    #[instrument(skip(self, vm), fields(vm = %vm.name, namespace = %vm.namespace))]
    pub async fn delete(&self, vm: &VirtualMachine) -> Result<()> {
        self.repository.mark_deleted(&vm.name).await?;

        let names = vm.resource_names();
        let sweep = [
            ("v1", "Service", &names.access_service),
            ("networking.k8s.io/v1", "Ingress", &names.ingress),
            (
                VIRTUAL_MACHINE_API_VERSION,
                "VirtualMachine",
                &names.virtual_machine,
            ),
            ("v1", "Secret", &names.userdata_secret),
            ("cdi.kubevirt.io/v1beta1", "DataVolume", &names.data_volume),
            ("v1", "Service", &names.web_service),
        ];
        for (api_version, kind, name) in sweep {
            let target = self.cluster.resolve(&gvk(api_version, kind))?;
            self.cluster.delete(&target, &vm.namespace, name).await?;
            info!(kind = %kind, name = %name, "Deleted VM resource");
        }
        info!("VM deleted");
        Ok(())
    }

    async fn wait_for_status(
        &self,
        target: &ApiTarget,
        vm: &VirtualMachine,
        desired: VmStatus,
    ) -> Result<()> {
        let waited = self.poll.timeout;
        let cluster = self.cluster.as_ref();
        poll_until(
            self.poll,
            || Error::timeout(&vm.name, desired.as_str(), waited),
            move || async move {
                let object = cluster.get(target, &vm.namespace, &vm.name).await?;
                let observed = printable_status(&object);
                trace!(observed = ?observed, desired = %desired, "Observed VM status");
                Ok(observed.is_some_and(|s| s.eq_ignore_ascii_case(desired.as_str())))
            },
        )
        .await
    }
}
