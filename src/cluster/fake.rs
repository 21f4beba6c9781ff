//! In-memory [`ClusterApi`] for stateful tests
//!
//! Keeps created objects so tests can assert on what is left in the cluster
//! after a rollback, and lets a test make specific creates or deletes fail.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use kube::api::{DynamicObject, GroupVersionKind};
use kube::core::ErrorResponse;
use parking_lot::Mutex;
use serde_json::{json, Value};

use super::{ApiTarget, ClusterApi, CreateOutcome};
use crate::{Error, Result};

type Key = (String, String, String);

const CLUSTER_SCOPED: &[&str] = &["Namespace", "ClusterRole", "ClusterRoleBinding"];
const KNOWN_KINDS: &[&str] = &[
    "Namespace",
    "ClusterRole",
    "ClusterRoleBinding",
    "ConfigMap",
    "Secret",
    "Service",
    "ServiceAccount",
    "ResourceQuota",
    "LimitRange",
    "NetworkPolicy",
    "Role",
    "RoleBinding",
    "Ingress",
    "DataVolume",
    "VirtualMachine",
];

#[derive(Default)]
struct FakeState {
    objects: BTreeMap<Key, DynamicObject>,
    created: Vec<String>,
    deleted: Vec<String>,
    patches: Vec<(String, Value)>,
    fail_create: HashSet<String>,
    fail_delete: HashSet<String>,
    printable_status: HashMap<String, String>,
    next_uid: u64,
}

/// Stateful fake cluster
#[derive(Default)]
pub(crate) struct FakeCluster {
    state: Mutex<FakeState>,
}

fn api_error(code: u16, reason: &str, message: impl Into<String>) -> Error {
    Error::Kube(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: message.into(),
        reason: reason.to_string(),
        code,
    }))
}

fn key(target: &ApiTarget, namespace: &str, name: &str) -> Key {
    let namespace = if target.namespaced { namespace } else { "" };
    (
        target.kind().to_string(),
        namespace.to_string(),
        name.to_string(),
    )
}

impl FakeCluster {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Make any create of an object with this name fail
    pub(crate) fn fail_create_of(&self, name: &str) {
        self.state.lock().fail_create.insert(name.to_string());
    }

    /// Make any delete of an object with this name fail
    pub(crate) fn fail_delete_of(&self, name: &str) {
        self.state.lock().fail_delete.insert(name.to_string());
    }

    /// Seed an object as if something else had created it
    pub(crate) fn seed(&self, kind: &str, namespace: &str, name: &str) {
        let namespace = if CLUSTER_SCOPED.contains(&kind) {
            ""
        } else {
            namespace
        };
        let mut object = DynamicObject {
            types: None,
            metadata: Default::default(),
            data: json!({}),
        };
        object.metadata.name = Some(name.to_string());
        object.metadata.namespace = Some(namespace.to_string()).filter(|n| !n.is_empty());
        self.state.lock().objects.insert(
            (kind.to_string(), namespace.to_string(), name.to_string()),
            object,
        );
    }

    /// Set the `status.printableStatus` reported for a VirtualMachine
    pub(crate) fn set_printable_status(&self, name: &str, status: &str) {
        self.state
            .lock()
            .printable_status
            .insert(name.to_string(), status.to_string());
    }

    pub(crate) fn contains(&self, kind: &str, namespace: &str, name: &str) -> bool {
        self.state.lock().objects.keys().any(|(k, ns, n)| {
            k == kind && n == name && (ns == namespace || ns.is_empty())
        })
    }

    /// Number of objects currently stored
    pub(crate) fn object_count(&self) -> usize {
        self.state.lock().objects.len()
    }

    /// Successful creates as `Kind/name`, in order
    pub(crate) fn created(&self) -> Vec<String> {
        self.state.lock().created.clone()
    }

    /// Successful deletes as `Kind/name`, in order
    pub(crate) fn deleted(&self) -> Vec<String> {
        self.state.lock().deleted.clone()
    }

    /// Merge patches applied, keyed by `Kind/name`
    pub(crate) fn patches(&self) -> Vec<(String, Value)> {
        self.state.lock().patches.clone()
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    fn resolve(&self, gvk: &GroupVersionKind) -> Result<ApiTarget> {
        if !KNOWN_KINDS.contains(&gvk.kind.as_str()) {
            let api_version = if gvk.group.is_empty() {
                gvk.version.clone()
            } else {
                format!("{}/{}", gvk.group, gvk.version)
            };
            return Err(Error::discovery(api_version, gvk.kind.clone()));
        }
        Ok(ApiTarget::from_gvk(
            gvk,
            !CLUSTER_SCOPED.contains(&gvk.kind.as_str()),
        ))
    }

    async fn create(&self, target: &ApiTarget, object: &DynamicObject) -> Result<CreateOutcome> {
        let name = object.metadata.name.clone().unwrap_or_default();
        let namespace = object.metadata.namespace.clone().unwrap_or_default();
        let mut state = self.state.lock();

        if state.fail_create.contains(&name) {
            return Err(api_error(500, "InternalError", format!("create {name} refused")));
        }
        if name.is_empty() {
            return Err(api_error(422, "Invalid", "metadata.name: Required value"));
        }

        let key = key(target, &namespace, &name);
        if state.objects.contains_key(&key) {
            return Ok(CreateOutcome::AlreadyExists);
        }

        state.next_uid += 1;
        let uid = format!("uid-{}", state.next_uid);
        let mut stored = object.clone();
        stored.metadata.uid = Some(uid.clone());
        state.objects.insert(key.clone(), stored);
        state.created.push(format!("{}/{}", target.kind(), name));

        Ok(CreateOutcome::Created {
            name,
            namespace: key.1,
            uid,
        })
    }

    async fn get(&self, target: &ApiTarget, namespace: &str, name: &str) -> Result<DynamicObject> {
        let state = self.state.lock();
        let mut object = state
            .objects
            .get(&key(target, namespace, name))
            .cloned()
            .ok_or_else(|| api_error(404, "NotFound", format!("{name} not found")))?;
        if let Some(status) = state.printable_status.get(name) {
            object.data["status"] = json!({ "printableStatus": status });
        }
        Ok(object)
    }

    async fn list(
        &self,
        target: &ApiTarget,
        namespace: &str,
        limit: u32,
    ) -> Result<Vec<DynamicObject>> {
        let state = self.state.lock();
        Ok(state
            .objects
            .iter()
            .filter(|((kind, ns, _), _)| {
                kind == target.kind()
                    && (!target.namespaced || namespace.is_empty() || ns == namespace)
            })
            .take(if limit == 0 { usize::MAX } else { limit as usize })
            .map(|(_, object)| object.clone())
            .collect())
    }

    async fn patch_merge(
        &self,
        target: &ApiTarget,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if !state.objects.contains_key(&key(target, namespace, name)) {
            return Err(api_error(404, "NotFound", format!("{name} not found")));
        }
        state
            .patches
            .push((format!("{}/{}", target.kind(), name), patch.clone()));
        Ok(())
    }

    async fn delete(&self, target: &ApiTarget, namespace: &str, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_delete.contains(name) {
            return Err(api_error(500, "InternalError", format!("delete {name} refused")));
        }
        if state
            .objects
            .remove(&key(target, namespace, name))
            .is_none()
        {
            return Err(api_error(404, "NotFound", format!("{name} not found")));
        }
        state.deleted.push(format!("{}/{}", target.kind(), name));
        Ok(())
    }
}
