//! Shared setup for cluster-backed tests

use std::sync::Arc;
use std::time::Duration;

use kube::Client;

use vm_controller::cluster::{gvk, ClusterApi, KubeCluster};
use vm_controller::lifecycle::{LifecycleDispatcher, PollSettings, VmLifecycle};
use vm_controller::provision::{Provisioner, DEFAULT_INIT_DIR};
use vm_controller::repository::{InMemoryVmRepository, VmRepository};
use vm_controller::service::VmService;

/// VM templates shipped with the crate
pub const VM_TEMPLATES: &str = "yaml-data/client-vm";

/// Connect to the current kubeconfig context
pub async fn ensure_test_cluster() -> Result<Arc<dyn ClusterApi>, String> {
    let client = Client::try_default()
        .await
        .map_err(|e| format!("no cluster available: {e}"))?;
    let cluster = KubeCluster::from_client(client)
        .await
        .map_err(|e| e.to_string())?;
    Ok(Arc::new(cluster))
}

/// Polling tuned for VMs booting on a small test cluster
pub fn test_poll() -> PollSettings {
    PollSettings {
        interval: Duration::from_secs(5),
        timeout: Duration::from_secs(600),
    }
}

/// Service plus handles the tests assert through
pub struct TestService {
    pub service: VmService,
    pub repository: Arc<dyn VmRepository>,
}

pub fn test_service(cluster: Arc<dyn ClusterApi>) -> TestService {
    let repository: Arc<dyn VmRepository> = Arc::new(InMemoryVmRepository::new());
    let lifecycle = Arc::new(VmLifecycle::new(
        cluster.clone(),
        repository.clone(),
        test_poll(),
    ));
    let (dispatcher, _pool) = LifecycleDispatcher::spawn(lifecycle, 2, 16);
    let provisioner = Provisioner::new(cluster.clone(), DEFAULT_INIT_DIR);
    TestService {
        service: VmService::new(
            cluster,
            repository.clone(),
            provisioner,
            dispatcher,
            VM_TEMPLATES,
            vm_controller::config::DEFAULT_IMAGE,
        ),
        repository,
    }
}

/// Whether an object exists, treating any read error as absence
pub async fn exists(
    cluster: &dyn ClusterApi,
    api_version: &str,
    kind: &str,
    namespace: &str,
    name: &str,
) -> bool {
    let Ok(target) = cluster.resolve(&gvk(api_version, kind)) else {
        return false;
    };
    cluster.get(&target, namespace, name).await.is_ok()
}

/// Remove a test namespace, ignoring errors
pub async fn cleanup_namespace(cluster: &dyn ClusterApi, namespace: &str) {
    if let Ok(target) = cluster.resolve(&gvk("v1", "Namespace")) {
        let _ = cluster.delete(&target, "", namespace).await;
    }
}
