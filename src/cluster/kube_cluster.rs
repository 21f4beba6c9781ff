//! [`ClusterApi`] backed by a live API server

use async_trait::async_trait;
use kube::api::{
    Api, DeleteParams, DynamicObject, GroupVersionKind, ListParams, Patch, PatchParams, PostParams,
};
use kube::discovery::{Discovery, Scope};
use kube::Client;
use serde_json::Value;
use tracing::{debug, info, trace};

use super::{build_client, ApiTarget, ClientSettings, ClusterApi, CreateOutcome, KubeEnv};
use crate::{Error, Result};

/// Live cluster client with discovery results cached at construction
pub struct KubeCluster {
    client: Client,
    discovery: Discovery,
}

impl KubeCluster {
    /// Build the client and run API discovery once
    pub async fn connect(settings: &ClientSettings, env: &dyn KubeEnv) -> Result<Self> {
        let client = build_client(settings, env).await?;
        Self::from_client(client).await
    }

    /// Run discovery against an existing client
    pub async fn from_client(client: Client) -> Result<Self> {
        let discovery = Discovery::new(client.clone())
            .run()
            .await
            .map_err(|e| Error::config(format!("API discovery failed: {}", e)))?;
        info!(groups = discovery.groups().count(), "API discovery complete");
        Ok(Self { client, discovery })
    }

    fn api(&self, target: &ApiTarget, namespace: &str) -> Api<DynamicObject> {
        if !target.namespaced {
            Api::all_with(self.client.clone(), &target.resource)
        } else if namespace.is_empty() {
            Api::default_namespaced_with(self.client.clone(), &target.resource)
        } else {
            Api::namespaced_with(self.client.clone(), namespace, &target.resource)
        }
    }
}

fn is_status(err: &kube::Error, code: u16) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == code)
}

#[async_trait]
impl ClusterApi for KubeCluster {
    fn resolve(&self, gvk: &GroupVersionKind) -> Result<ApiTarget> {
        let (resource, caps) = self.discovery.resolve_gvk(gvk).ok_or_else(|| {
            let api_version = if gvk.group.is_empty() {
                gvk.version.clone()
            } else {
                format!("{}/{}", gvk.group, gvk.version)
            };
            Error::discovery(api_version, gvk.kind.clone())
        })?;
        Ok(ApiTarget {
            resource,
            namespaced: matches!(caps.scope, Scope::Namespaced),
        })
    }

    async fn create(&self, target: &ApiTarget, object: &DynamicObject) -> Result<CreateOutcome> {
        let namespace = object.metadata.namespace.as_deref().unwrap_or_default();
        let api = self.api(target, namespace);
        match api.create(&PostParams::default(), object).await {
            Ok(created) => {
                trace!(kind = %target.kind(), name = ?created.metadata.name, "created");
                Ok(CreateOutcome::Created {
                    name: created.metadata.name.unwrap_or_default(),
                    namespace: created.metadata.namespace.unwrap_or_default(),
                    uid: created.metadata.uid.unwrap_or_default(),
                })
            }
            Err(e) if is_status(&e, 409) => Ok(CreateOutcome::AlreadyExists),
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, target: &ApiTarget, namespace: &str, name: &str) -> Result<DynamicObject> {
        Ok(self.api(target, namespace).get(name).await?)
    }

    async fn list(
        &self,
        target: &ApiTarget,
        namespace: &str,
        limit: u32,
    ) -> Result<Vec<DynamicObject>> {
        let params = if limit == 0 {
            ListParams::default()
        } else {
            ListParams::default().limit(limit)
        };
        let api = if target.namespaced && namespace.is_empty() {
            Api::all_with(self.client.clone(), &target.resource)
        } else {
            self.api(target, namespace)
        };
        let list = api.list(&params).await?;
        Ok(list.items)
    }

    async fn patch_merge(
        &self,
        target: &ApiTarget,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<()> {
        self.api(target, namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await?;
        debug!(kind = %target.kind(), name = %name, namespace = %namespace, "patched");
        Ok(())
    }

    async fn delete(&self, target: &ApiTarget, namespace: &str, name: &str) -> Result<()> {
        self.api(target, namespace)
            .delete(name, &DeleteParams::background())
            .await?;
        debug!(kind = %target.kind(), name = %name, namespace = %namespace, "deleted");
        Ok(())
    }
}
