//! Provisioning stories against a live cluster

use vm_controller::model::ProvisionRequest;
use vm_controller::Error;

use super::helpers::{cleanup_namespace, ensure_test_cluster, exists, test_service, VM_TEMPLATES};

fn request(namespace: &str, name: &str, port: u16) -> ProvisionRequest {
    ProvisionRequest {
        namespace: namespace.to_string(),
        vm_name: name.to_string(),
        secret: "Passw0rd!".to_string(),
        access_host: format!("{name}.vm.test"),
        manifest_dir: VM_TEMPLATES.into(),
        port,
    }
}

/// Story: a user's first VM brings up the namespace bootstrap objects and the
/// six VM objects
///
/// Expected behavior:
/// - the result lists the VM-phase objects in template order
/// - the VirtualMachine and its NodePort service exist afterwards
#[tokio::test]
#[ignore = "requires a cluster with KubeVirt and CDI"]
async fn story_first_vm_creates_bundle() {
    let cluster = ensure_test_cluster().await.expect("cluster");
    let namespace = "vmc-it-provision";
    let harness = test_service(cluster.clone());

    let result = harness
        .service
        .create_user_vm(&request(namespace, "web-1", 30250))
        .await
        .expect("provisioning failed");

    let kinds: Vec<_> = result
        .created_resources
        .iter()
        .map(|r| r.kind.as_str())
        .collect();
    assert_eq!(
        kinds,
        vec!["Secret", "DataVolume", "VirtualMachine", "Service", "Service", "Ingress"]
    );
    assert!(exists(cluster.as_ref(), "kubevirt.io/v1", "VirtualMachine", namespace, "web-1").await);
    assert!(exists(cluster.as_ref(), "v1", "Service", namespace, "vps-access-web-1").await);

    cleanup_namespace(cluster.as_ref(), namespace).await;
}

/// Story: a NodePort that is already taken makes the access service fail;
/// the VM objects created before it are rolled back
#[tokio::test]
#[ignore = "requires a cluster with KubeVirt and CDI"]
async fn story_port_collision_rolls_back() {
    let cluster = ensure_test_cluster().await.expect("cluster");
    let namespace = "vmc-it-rollback";
    let harness = test_service(cluster.clone());

    harness
        .service
        .create_user_vm(&request(namespace, "web-1", 30251))
        .await
        .expect("first VM");
    let err = harness
        .service
        .create_user_vm(&request(namespace, "web-2", 30251))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Apply { ref kind, .. } if kind == "Service"), "{err:?}");
    assert!(
        !exists(
            cluster.as_ref(),
            "kubevirt.io/v1",
            "VirtualMachine",
            namespace,
            "web-2"
        )
        .await
    );
    assert!(
        !exists(
            cluster.as_ref(),
            "v1",
            "Secret",
            namespace,
            "web-2-cloud-init-userdata"
        )
        .await
    );

    cleanup_namespace(cluster.as_ref(), namespace).await;
}

/// Story: invalid input is rejected before the cluster is touched
#[tokio::test]
#[ignore = "requires a cluster with KubeVirt and CDI"]
async fn story_injection_attempt_is_rejected() {
    let cluster = ensure_test_cluster().await.expect("cluster");
    let harness = test_service(cluster.clone());
    let mut bad = request("vmc-it-guard", "web-1", 30252);
    bad.access_host = "x.test\nkind: ClusterRoleBinding".to_string();

    let err = harness.service.create_user_vm(&bad).await.unwrap_err();
    assert!(matches!(err, Error::Validation { .. }));
    assert!(!exists(cluster.as_ref(), "v1", "Namespace", "", "vmc-it-guard").await);
}
