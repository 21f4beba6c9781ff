//! Provisioning orchestration
//!
//! A run has two phases against the same namespace:
//!
//! 1. bootstrap: shared per-namespace objects from the `client-init`
//!    directory, only `{{NAMESPACE}}` substituted, existing objects expected;
//! 2. VM: the per-VM objects, either from a template directory with all five
//!    tokens or from [`VmResourceBuilder`].
//!
//! If either phase fails, everything created by this run is deleted in reverse
//! creation order and the original error is returned. Deletion failures during
//! that sweep are logged and do not stop it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use kube::api::GroupVersionKind;
use tracing::{error, info, instrument, warn};

use crate::applier::{apply_documents, ExistingPolicy};
use crate::cluster::ClusterApi;
use crate::guard;
use crate::manifest::{self, ManifestDocument, Substitutions, VmResourceBuilder};
use crate::model::{CreatedResource, ProvisionRequest, ProvisioningResult};
use crate::Result;

/// Directory name of the bootstrap templates next to the VM templates
pub const INIT_DIR_NAME: &str = "client-init";

/// Default bootstrap directory when none exists next to the VM templates
pub const DEFAULT_INIT_DIR: &str = "yaml-data/client-init";

/// Runs provisioning against a cluster
pub struct Provisioner {
    cluster: Arc<dyn ClusterApi>,
    init_fallback: PathBuf,
}

impl Provisioner {
    /// Create a provisioner with the bootstrap fallback directory
    pub fn new(cluster: Arc<dyn ClusterApi>, init_fallback: impl Into<PathBuf>) -> Self {
        Self {
            cluster,
            init_fallback: init_fallback.into(),
        }
    }

    /// Bootstrap directory for a VM template directory
    ///
    /// `<parent of manifest_dir>/client-init` when it exists, otherwise the
    /// configured fallback.
    pub fn init_dir_for(&self, manifest_dir: &Path) -> PathBuf {
        let sibling = manifest_dir
            .parent()
            .unwrap_or_else(|| Path::new(""))
            .join(INIT_DIR_NAME);
        if sibling.is_dir() {
            sibling
        } else {
            self.init_fallback.clone()
        }
    }

    /// Provision a VM from the request's template directory
    #[instrument(skip(self, request), fields(vm = %request.vm_name, namespace = %request.namespace))]
    pub async fn provision(&self, request: &ProvisionRequest) -> Result<ProvisioningResult> {
        guard::check(request)?;
        self.run(request, || {
            manifest::load_dir(&request.manifest_dir, &Substitutions::for_vm(request))
        })
        .await
    }

    /// Provision a VM with the typed builder instead of VM-phase templates
    ///
    /// The bootstrap phase still reads `client-init` templates.
    #[instrument(skip(self, request), fields(vm = %request.vm_name, namespace = %request.namespace))]
    pub async fn provision_typed(
        &self,
        request: &ProvisionRequest,
        image: &str,
    ) -> Result<ProvisioningResult> {
        guard::check(request)?;
        self.run(request, || VmResourceBuilder::new(request, image).build())
            .await
    }

    async fn run<F>(&self, request: &ProvisionRequest, vm_documents: F) -> Result<ProvisioningResult>
    where
        F: FnOnce() -> Result<Vec<ManifestDocument>>,
    {
        let namespace = request.namespace.as_str();
        let mut ledger: Vec<CreatedResource> = Vec::new();

        let init_dir = self.init_dir_for(&request.manifest_dir);
        info!(dir = %init_dir.display(), "Applying bootstrap manifests");
        let bootstrap = manifest::load_dir(&init_dir, &Substitutions::namespace_only(namespace))?;
        match apply_documents(
            self.cluster.as_ref(),
            &bootstrap,
            namespace,
            ExistingPolicy::Ignore,
        )
        .await
        {
            Ok(created) => ledger.extend(created),
            Err(partial) => {
                error!(error = %partial.error, "Bootstrap phase failed");
                ledger.extend(partial.created);
                self.rollback(&ledger).await;
                return Err(partial.error);
            }
        }

        info!("Applying VM manifests");
        let documents = match vm_documents() {
            Ok(documents) => documents,
            Err(e) => {
                error!(error = %e, "Failed to render VM manifests");
                self.rollback(&ledger).await;
                return Err(e);
            }
        };
        let vm_created = match apply_documents(
            self.cluster.as_ref(),
            &documents,
            namespace,
            ExistingPolicy::Untracked,
        )
        .await
        {
            Ok(created) => created,
            Err(partial) => {
                error!(error = %partial.error, "VM phase failed");
                ledger.extend(partial.created);
                self.rollback(&ledger).await;
                return Err(partial.error);
            }
        };

        info!(
            bootstrap = ledger.len(),
            vm = vm_created.len(),
            "Provisioning complete"
        );
        Ok(ProvisioningResult {
            namespace: request.namespace.clone(),
            name: request.vm_name.clone(),
            port: request.port,
            secret: request.secret.clone(),
            access_host: request.access_host.clone(),
            created_resources: vm_created,
        })
    }

    /// Delete ledger entries newest first, logging failures
    pub async fn rollback(&self, ledger: &[CreatedResource]) {
        if ledger.is_empty() {
            return;
        }
        warn!(resources = ledger.len(), "Rolling back created resources");
        for resource in ledger.iter().rev() {
            if let Err(e) = self.delete_created(resource).await {
                error!(
                    kind = %resource.kind,
                    name = %resource.name,
                    namespace = %resource.namespace,
                    error = %e,
                    "Failed to delete resource during rollback"
                );
            }
        }
    }

    async fn delete_created(&self, resource: &CreatedResource) -> Result<()> {
        let gvk = GroupVersionKind {
            group: resource.group.clone(),
            version: resource.version.clone(),
            kind: resource.kind.clone(),
        };
        let target = self.cluster.resolve(&gvk)?;
        self.cluster
            .delete(&target, &resource.namespace, &resource.name)
            .await?;
        info!(kind = %resource.kind, name = %resource.name, "Rolled back resource");
        Ok(())
    }
}

impl std::fmt::Debug for Provisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provisioner")
            .field("init_fallback", &self.init_fallback)
            .finish_non_exhaustive()
    }
}
