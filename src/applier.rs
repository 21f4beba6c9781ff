//! Resource creation with a ledger for rollback
//!
//! Objects are created one at a time. "Already exists" never fails a run; the
//! object is skipped and left out of the ledger so a rollback never deletes
//! something this run did not create.

use std::fmt;

use tracing::{debug, info, warn};

use crate::cluster::{ClusterApi, CreateOutcome};
use crate::manifest::ManifestDocument;
use crate::model::CreatedResource;
use crate::{Error, Result};

/// How an object that already exists is reported
///
/// Both policies skip the object and keep it out of the ledger; they only
/// differ in how the skip is logged.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExistingPolicy {
    /// Shared bootstrap objects; existing ones are expected
    Ignore,
    /// Per-VM objects; an existing one is unusual and called out
    Untracked,
}

/// A batch that stopped part way, with everything created before the failure
#[derive(Debug)]
pub struct PartialApply {
    /// Resources created before the failure, in creation order
    pub created: Vec<CreatedResource>,
    /// The failure that stopped the batch
    pub error: Error,
}

impl fmt::Display for PartialApply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (after creating {} resources)",
            self.error,
            self.created.len()
        )
    }
}

/// Create one document, defaulting its namespace.
///
/// Returns `None` when the object already existed.
pub async fn apply_document(
    cluster: &dyn ClusterApi,
    document: &ManifestDocument,
    default_namespace: &str,
    policy: ExistingPolicy,
) -> Result<Option<CreatedResource>> {
    let kind = document.gvk.kind.as_str();
    let name = document.name();
    let target = cluster.resolve(&document.gvk)?;

    let mut object = document.object.clone();
    if target.namespaced {
        if object.metadata.namespace.as_deref().unwrap_or_default().is_empty() {
            object.metadata.namespace = Some(default_namespace.to_string());
        }
    } else {
        object.metadata.namespace = None;
    }

    match cluster.create(&target, &object).await {
        Ok(CreateOutcome::Created {
            name,
            namespace,
            uid,
        }) => {
            info!(kind = %kind, name = %name, namespace = %namespace, "Created resource");
            Ok(Some(CreatedResource {
                group: document.gvk.group.clone(),
                version: document.gvk.version.clone(),
                kind: kind.to_string(),
                name,
                namespace,
                uid,
            }))
        }
        Ok(CreateOutcome::AlreadyExists) => {
            match policy {
                ExistingPolicy::Ignore => {
                    debug!(kind = %kind, name = %name, "Resource already exists, skipping")
                }
                ExistingPolicy::Untracked => warn!(
                    kind = %kind,
                    name = %name,
                    "Resource already exists, skipping without tracking for rollback"
                ),
            }
            Ok(None)
        }
        Err(e) => Err(Error::apply(kind, name, e.to_string())),
    }
}

/// Create documents in order, stopping at the first failure
pub async fn apply_documents(
    cluster: &dyn ClusterApi,
    documents: &[ManifestDocument],
    default_namespace: &str,
    policy: ExistingPolicy,
) -> std::result::Result<Vec<CreatedResource>, PartialApply> {
    let mut created = Vec::with_capacity(documents.len());
    for document in documents {
        match apply_document(cluster, document, default_namespace, policy).await {
            Ok(Some(resource)) => created.push(resource),
            Ok(None) => {}
            Err(error) => return Err(PartialApply { created, error }),
        }
    }
    Ok(created)
}
