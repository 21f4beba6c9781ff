//! Lifecycle stories against a live cluster

use std::time::Duration;

use vm_controller::model::VmStatus;
use vm_controller::service::LaunchRequest;

use super::helpers::{cleanup_namespace, ensure_test_cluster, exists, test_service};

/// Wait until the stored status matches, polling the repository
async fn wait_for_record(
    repository: &dyn vm_controller::repository::VmRepository,
    name: &str,
    status: VmStatus,
) -> bool {
    for _ in 0..120 {
        if let Ok(Some(vm)) = repository.find_by_name(name).await {
            if vm.status == status {
                return true;
            }
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
    }
    false
}

/// Story: a user launches a VM, stops it, starts it again and deletes it
///
/// Every lifecycle call returns at once; the repository shows each
/// transition once the worker pool has finished it.
#[tokio::test]
#[ignore = "requires a cluster with KubeVirt and CDI"]
async fn story_launch_stop_start_delete() {
    let cluster = ensure_test_cluster().await.expect("cluster");
    let namespace = "vmc-it-lifecycle";
    let harness = test_service(cluster.clone());
    let service = &harness.service;

    let launched = service
        .launch_vm(
            1,
            LaunchRequest {
                namespace: namespace.to_string(),
                name: "life-1".to_string(),
                secret: "Passw0rd!".to_string(),
                access_host: "life-1.vm.test".to_string(),
                image: None,
                port: None,
                typed: true,
            },
        )
        .await
        .expect("launch");
    assert_eq!(launched.vm.status, VmStatus::Provisioning);
    assert!(wait_for_record(harness.repository.as_ref(), "life-1", VmStatus::Running).await);

    let vm = service.find_vm("life-1", false).await.expect("record");
    service.stop_vm(&vm).expect("stop queued");
    assert!(wait_for_record(harness.repository.as_ref(), "life-1", VmStatus::Stopped).await);

    let vm = service.find_vm("life-1", false).await.expect("record");
    service.start_vm(&vm).expect("start queued");
    assert!(wait_for_record(harness.repository.as_ref(), "life-1", VmStatus::Running).await);

    let vm = service.find_vm("life-1", false).await.expect("record");
    service.delete_vm(&vm).expect("delete queued");
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(service.find_vm("life-1", false).await.is_err());
    assert!(
        !exists(
            cluster.as_ref(),
            "kubevirt.io/v1",
            "VirtualMachine",
            namespace,
            "life-1"
        )
        .await
    );

    cleanup_namespace(cluster.as_ref(), namespace).await;
}

/// Story: the health check reports a reachable cluster
#[tokio::test]
#[ignore = "requires a cluster with KubeVirt and CDI"]
async fn story_health_check() {
    let cluster = ensure_test_cluster().await.expect("cluster");
    let harness = test_service(cluster);
    assert_eq!(
        harness.service.check_connectivity().await,
        vm_controller::service::Health::Healthy
    );
}
