//! Core data types shared by the provisioning and lifecycle engines

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Persisted status of a virtual machine record
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub enum VmStatus {
    /// Cluster resources are being created
    #[default]
    Provisioning,
    /// Cluster reports the VM running
    Running,
    /// Stop requested, waiting for the cluster to report Stopped
    Stopping,
    /// Cluster reports the VM stopped
    Stopped,
    /// Provisioning failed
    Failed,
    /// Record has been torn down
    Deleted,
}

impl VmStatus {
    /// Status string as reported by KubeVirt's `status.printableStatus`
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Provisioning => "Provisioning",
            Self::Running => "Running",
            Self::Stopping => "Stopping",
            Self::Stopped => "Stopped",
            Self::Failed => "Failed",
            Self::Deleted => "Deleted",
        }
    }
}

impl std::fmt::Display for VmStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user's virtual machine as stored by the repository
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachine {
    /// Store-assigned identifier
    pub id: u64,
    /// Owning user
    pub owner_id: u64,
    /// VM name, unique among active records
    pub name: String,
    /// Namespace the VM's resources live in
    pub namespace: String,
    /// NodePort exposing SSH access, unique among active records
    pub node_port: u16,
    /// Access secret injected into cloud-init
    pub secret: String,
    /// Image identifier the disk was imported from
    pub image: String,
    /// Last persisted lifecycle status
    pub status: VmStatus,
    /// Soft-delete flag
    pub deleted: bool,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last modification time
    pub updated_at: DateTime<Utc>,
}

impl VirtualMachine {
    /// Copy of this record with the access secret blanked out
    pub fn redacted(&self) -> Self {
        Self {
            secret: String::new(),
            ..self.clone()
        }
    }

    /// Names of the cluster objects that belong to this VM
    pub fn resource_names(&self) -> ResourceNames {
        ResourceNames::new(&self.name)
    }
}

/// Fields needed to insert a new VM record
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewVirtualMachine {
    /// Owning user
    pub owner_id: u64,
    /// VM name
    pub name: String,
    /// Target namespace
    pub namespace: String,
    /// Claimed NodePort
    pub node_port: u16,
    /// Access secret
    pub secret: String,
    /// Image identifier
    pub image: String,
}

/// Naming convention for the cluster objects created per VM.
///
/// The typed manifest builder and the delete sweep both derive names from
/// here so they cannot drift apart.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceNames {
    /// NodePort service for SSH access
    pub access_service: String,
    /// Ingress for the web-facing service
    pub ingress: String,
    /// KubeVirt VirtualMachine
    pub virtual_machine: String,
    /// cloud-init userdata secret
    pub userdata_secret: String,
    /// CDI DataVolume backing the root disk
    pub data_volume: String,
    /// ClusterIP service behind the ingress
    pub web_service: String,
}

impl ResourceNames {
    /// Derive all object names for a VM
    pub fn new(vm_name: &str) -> Self {
        Self {
            access_service: format!("vps-access-{}", vm_name),
            ingress: format!("vm-ingress-{}", vm_name),
            virtual_machine: vm_name.to_string(),
            userdata_secret: format!("{}-cloud-init-userdata", vm_name),
            data_volume: format!("{}-disk", vm_name),
            web_service: format!("vps-web-{}", vm_name),
        }
    }
}

/// Caller-supplied parameters for provisioning one VM
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProvisionRequest {
    /// Target namespace
    pub namespace: String,
    /// VM name
    pub vm_name: String,
    /// Access secret
    pub secret: String,
    /// Host name routed to the VM's web service
    pub access_host: String,
    /// Directory holding the VM-phase manifest templates
    pub manifest_dir: PathBuf,
    /// NodePort for SSH access
    pub port: u16,
}

/// A resource created during provisioning, kept to drive rollback
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CreatedResource {
    /// API group ("" for core)
    pub group: String,
    /// API version
    pub version: String,
    /// Kind
    pub kind: String,
    /// Object name as returned by the API server
    pub name: String,
    /// Object namespace ("" for cluster-scoped)
    pub namespace: String,
    /// Server-assigned UID
    pub uid: String,
}

impl CreatedResource {
    /// apiVersion string ("v1" for core, "group/version" otherwise)
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

/// Outcome of a successful provisioning run
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProvisioningResult {
    /// Namespace the VM was provisioned into
    pub namespace: String,
    /// VM name
    pub name: String,
    /// NodePort for SSH access
    pub port: u16,
    /// Access secret
    pub secret: String,
    /// Host routed to the web service
    pub access_host: String,
    /// Resources created by the VM phase, in creation order
    pub created_resources: Vec<CreatedResource>,
}
