//! Typed construction of the per-VM resource set
//!
//! Produces the same objects as the `client-vm` templates without any text
//! substitution: caller values land in the objects as typed scalars, so no
//! value can change a document's structure.

use std::collections::BTreeMap;
use std::path::PathBuf;

use k8s_openapi::api::core::v1::{Secret, Service, ServicePort, ServiceSpec};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{DynamicObject, GroupVersionKind};
use serde::Serialize;
use serde_json::{json, Value};

use super::{parse_api_version, ManifestDocument};
use crate::model::{ProvisionRequest, ResourceNames};
use crate::{Error, Result};

/// Source recorded on documents produced by the builder
pub const BUILDER_SOURCE: &str = "<typed builder>";

/// Label tying the VM's pod to its services
pub const DOMAIN_LABEL: &str = "kubevirt.io/domain";

const DATA_VOLUME_API_VERSION: &str = "cdi.kubevirt.io/v1beta1";
const VIRTUAL_MACHINE_API_VERSION: &str = "kubevirt.io/v1";
const SSH_PORT: i32 = 22;
const WEB_PORT: i32 = 80;
const CLOUD_INIT_USER: &str = "ubuntu";

/// Builds the VM-phase resources for one provisioning request
#[derive(Clone, Debug)]
pub struct VmResourceBuilder {
    namespace: String,
    names: ResourceNames,
    port: u16,
    secret: String,
    access_host: String,
    image: String,
    disk_size: String,
    memory: String,
    cpu_cores: u32,
}

impl VmResourceBuilder {
    /// Start from a validated request and the image URL to import
    pub fn new(request: &ProvisionRequest, image: impl Into<String>) -> Self {
        Self {
            namespace: request.namespace.clone(),
            names: ResourceNames::new(&request.vm_name),
            port: request.port,
            secret: request.secret.clone(),
            access_host: request.access_host.clone(),
            image: image.into(),
            disk_size: "10Gi".to_string(),
            memory: "2Gi".to_string(),
            cpu_cores: 1,
        }
    }

    /// Requested size of the root disk
    pub fn disk_size(mut self, size: impl Into<String>) -> Self {
        self.disk_size = size.into();
        self
    }

    /// Memory request for the guest
    pub fn memory(mut self, memory: impl Into<String>) -> Self {
        self.memory = memory.into();
        self
    }

    /// Number of guest CPU cores
    pub fn cpu_cores(mut self, cores: u32) -> Self {
        self.cpu_cores = cores;
        self
    }

    /// All VM-phase documents in creation order
    pub fn build(&self) -> Result<Vec<ManifestDocument>> {
        Ok(vec![
            typed(&self.userdata_secret())?,
            dynamic(DATA_VOLUME_API_VERSION, "DataVolume", self.data_volume())?,
            dynamic(
                VIRTUAL_MACHINE_API_VERSION,
                "VirtualMachine",
                self.virtual_machine(),
            )?,
            typed(&self.access_service())?,
            typed(&self.web_service())?,
            typed(&self.ingress())?,
        ])
    }

    fn metadata(&self, name: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(self.namespace.clone()),
            labels: Some(self.selector()),
            ..Default::default()
        }
    }

    fn selector(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(
            DOMAIN_LABEL.to_string(),
            self.names.virtual_machine.clone(),
        )])
    }

    /// cloud-init user data rendered as JSON, which cloud-init accepts as YAML
    fn user_data(&self) -> String {
        let config = json!({
            "ssh_pwauth": true,
            "chpasswd": {
                "expire": false,
                "users": [{
                    "name": CLOUD_INIT_USER,
                    "password": self.secret,
                    "type": "text",
                }],
            },
        });
        format!("#cloud-config\n{}\n", config)
    }

    /// Secret holding the cloud-init user data
    pub fn userdata_secret(&self) -> Secret {
        Secret {
            metadata: self.metadata(&self.names.userdata_secret),
            string_data: Some(BTreeMap::from([(
                "userdata".to_string(),
                self.user_data(),
            )])),
            ..Default::default()
        }
    }

    /// CDI DataVolume importing the image into the root disk
    pub fn data_volume(&self) -> Value {
        json!({
            "apiVersion": DATA_VOLUME_API_VERSION,
            "kind": "DataVolume",
            "metadata": {
                "name": self.names.data_volume,
                "namespace": self.namespace,
            },
            "spec": {
                "source": { "http": { "url": self.image } },
                "storage": {
                    "accessModes": ["ReadWriteOnce"],
                    "resources": { "requests": { "storage": self.disk_size } },
                },
            },
        })
    }

    /// KubeVirt VirtualMachine booting from the DataVolume
    pub fn virtual_machine(&self) -> Value {
        let name = &self.names.virtual_machine;
        json!({
            "apiVersion": VIRTUAL_MACHINE_API_VERSION,
            "kind": "VirtualMachine",
            "metadata": {
                "name": name,
                "namespace": self.namespace,
                "labels": self.selector(),
            },
            "spec": {
                "running": true,
                "template": {
                    "metadata": { "labels": self.selector() },
                    "spec": {
                        "domain": {
                            "cpu": { "cores": self.cpu_cores },
                            "resources": { "requests": { "memory": self.memory } },
                            "devices": {
                                "disks": [
                                    { "name": "rootdisk", "disk": { "bus": "virtio" } },
                                    { "name": "cloudinitdisk", "disk": { "bus": "virtio" } },
                                ],
                                "interfaces": [{ "name": "default", "masquerade": {} }],
                            },
                        },
                        "networks": [{ "name": "default", "pod": {} }],
                        "volumes": [
                            {
                                "name": "rootdisk",
                                "dataVolume": { "name": self.names.data_volume },
                            },
                            {
                                "name": "cloudinitdisk",
                                "cloudInitNoCloud": {
                                    "secretRef": { "name": self.names.userdata_secret },
                                },
                            },
                        ],
                    },
                },
            },
        })
    }

    /// NodePort service exposing SSH
    pub fn access_service(&self) -> Service {
        Service {
            metadata: self.metadata(&self.names.access_service),
            spec: Some(ServiceSpec {
                type_: Some("NodePort".to_string()),
                selector: Some(self.selector()),
                ports: Some(vec![ServicePort {
                    name: Some("ssh".to_string()),
                    protocol: Some("TCP".to_string()),
                    port: SSH_PORT,
                    target_port: Some(IntOrString::Int(SSH_PORT)),
                    node_port: Some(i32::from(self.port)),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// ClusterIP service for the guest's web port
    pub fn web_service(&self) -> Service {
        Service {
            metadata: self.metadata(&self.names.web_service),
            spec: Some(ServiceSpec {
                type_: Some("ClusterIP".to_string()),
                selector: Some(self.selector()),
                ports: Some(vec![ServicePort {
                    name: Some("http".to_string()),
                    protocol: Some("TCP".to_string()),
                    port: WEB_PORT,
                    target_port: Some(IntOrString::Int(WEB_PORT)),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Ingress routing the access host to the web service
    pub fn ingress(&self) -> Ingress {
        Ingress {
            metadata: self.metadata(&self.names.ingress),
            spec: Some(IngressSpec {
                rules: Some(vec![IngressRule {
                    host: Some(self.access_host.clone()),
                    http: Some(HTTPIngressRuleValue {
                        paths: vec![HTTPIngressPath {
                            path: Some("/".to_string()),
                            path_type: "Prefix".to_string(),
                            backend: IngressBackend {
                                service: Some(IngressServiceBackend {
                                    name: self.names.web_service.clone(),
                                    port: Some(ServiceBackendPort {
                                        number: Some(WEB_PORT),
                                        ..Default::default()
                                    }),
                                }),
                                ..Default::default()
                            },
                        }],
                    }),
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

fn typed<K>(resource: &K) -> Result<ManifestDocument>
where
    K: k8s_openapi::Resource + Serialize,
{
    let value = serde_json::to_value(resource)
        .map_err(|e| Error::decode(BUILDER_SOURCE, e.to_string()))?;
    let object: DynamicObject =
        serde_json::from_value(value).map_err(|e| Error::decode(BUILDER_SOURCE, e.to_string()))?;
    Ok(ManifestDocument {
        source: PathBuf::from(BUILDER_SOURCE),
        gvk: GroupVersionKind {
            group: K::GROUP.to_string(),
            version: K::VERSION.to_string(),
            kind: K::KIND.to_string(),
        },
        object,
    })
}

fn dynamic(api_version: &str, kind: &str, value: Value) -> Result<ManifestDocument> {
    let (group, version) = parse_api_version(api_version);
    let object: DynamicObject =
        serde_json::from_value(value).map_err(|e| Error::decode(BUILDER_SOURCE, e.to_string()))?;
    Ok(ManifestDocument {
        source: PathBuf::from(BUILDER_SOURCE),
        gvk: GroupVersionKind {
            group,
            version,
            kind: kind.to_string(),
        },
        object,
    })
}
