//! Manifest template engine
//!
//! Loads a directory of `.yaml` templates, substitutes placeholder tokens and
//! decodes every document into a [`DynamicObject`] with its group/version/kind.
//! Substitution is plain text replacement; values are expected to have passed
//! [`crate::guard`] before they get here.

pub mod builder;
pub mod yaml;

use std::path::{Path, PathBuf};

use kube::api::{DynamicObject, GroupVersionKind};
use serde_json::Value;
use tracing::{debug, trace};

use crate::model::ProvisionRequest;
use crate::{Error, Result};

pub use builder::VmResourceBuilder;

/// Namespace the VM's resources are created in
pub const TOKEN_NAMESPACE: &str = "{{NAMESPACE}}";
/// NodePort for SSH access
pub const TOKEN_NODEPORT: &str = "{{NODEPORT}}";
/// VM name
pub const TOKEN_VM_NAME: &str = "{{VM_NAME}}";
/// Host routed by the ingress
pub const TOKEN_DNS_HOST: &str = "{{DNS_HOST}}";
/// Access secret injected into cloud-init
pub const TOKEN_PASSWORD: &str = "{{PASSWORD}}";

/// Separator between documents inside one template file
pub const DOCUMENT_SEPARATOR: &str = "\n---\n";

const TEMPLATE_EXTENSION: &str = ".yaml";

/// Token to value mapping applied to every template file
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Substitutions {
    pairs: Vec<(&'static str, String)>,
}

impl Substitutions {
    /// Empty mapping; templates are decoded verbatim
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the value for a token
    pub fn with(mut self, token: &'static str, value: impl Into<String>) -> Self {
        let value = value.into();
        match self.pairs.iter_mut().find(|(t, _)| *t == token) {
            Some(pair) => pair.1 = value,
            None => self.pairs.push((token, value)),
        }
        self
    }

    /// Mapping used by the bootstrap phase: only the namespace
    pub fn namespace_only(namespace: &str) -> Self {
        Self::new().with(TOKEN_NAMESPACE, namespace)
    }

    /// Mapping used by the VM phase: all five tokens
    pub fn for_vm(request: &ProvisionRequest) -> Self {
        Self::new()
            .with(TOKEN_NAMESPACE, request.namespace.as_str())
            .with(TOKEN_NODEPORT, request.port.to_string())
            .with(TOKEN_VM_NAME, request.vm_name.as_str())
            .with(TOKEN_DNS_HOST, request.access_host.as_str())
            .with(TOKEN_PASSWORD, request.secret.as_str())
    }

    /// Replace every token occurrence in `text`.
    ///
    /// Inserted values are never rescanned, so a value that happens to look
    /// like a token is emitted as-is.
    pub fn apply(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(pos) = rest.find("{{") {
            out.push_str(&rest[..pos]);
            let tail = &rest[pos..];
            match self.pairs.iter().find(|(token, _)| tail.starts_with(token)) {
                Some((token, value)) => {
                    out.push_str(value);
                    rest = &tail[token.len()..];
                }
                None => {
                    out.push('{');
                    rest = &tail[1..];
                }
            }
        }
        out.push_str(rest);
        out
    }
}

/// One decoded resource document
#[derive(Clone, Debug)]
pub struct ManifestDocument {
    /// File the document was read from
    pub source: PathBuf,
    /// Group/version/kind taken from `apiVersion` and `kind`
    pub gvk: GroupVersionKind,
    /// The decoded object
    pub object: DynamicObject,
}

impl ManifestDocument {
    /// `metadata.name`, empty when the template leaves it to the server
    pub fn name(&self) -> &str {
        self.object.metadata.name.as_deref().unwrap_or_default()
    }

    /// `metadata.namespace`, if the template sets one
    pub fn namespace(&self) -> Option<&str> {
        self.object.metadata.namespace.as_deref()
    }

    /// apiVersion string as written in the template
    pub fn api_version(&self) -> String {
        if self.gvk.group.is_empty() {
            self.gvk.version.clone()
        } else {
            format!("{}/{}", self.gvk.group, self.gvk.version)
        }
    }
}

/// HTTP source URL of the first DataVolume among `documents`
pub fn imported_image(documents: &[ManifestDocument]) -> Option<&str> {
    documents
        .iter()
        .filter(|document| document.gvk.kind == "DataVolume")
        .find_map(|document| document.object.data.pointer("/spec/source/http/url")?.as_str())
}

/// Split an apiVersion into (group, version); core resources have an empty group
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Load every `.yaml` file in `dir` in file-name order and decode its documents.
///
/// Subdirectories and files with other extensions are ignored.
pub fn load_dir(dir: &Path, substitutions: &Substitutions) -> Result<Vec<ManifestDocument>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(|e| Error::io(dir, e))? {
        let entry = entry.map_err(|e| Error::io(dir, e))?;
        let path = entry.path();
        let is_file = entry
            .file_type()
            .map_err(|e| Error::io(&path, e))?
            .is_file();
        let is_template = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(TEMPLATE_EXTENSION));
        if is_file && is_template {
            files.push(path);
        }
    }
    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));

    let mut documents = Vec::new();
    for path in files {
        let text = std::fs::read_to_string(&path).map_err(|e| Error::io(&path, e))?;
        let rendered = render(&text, &path, substitutions)?;
        trace!(file = %path.display(), documents = rendered.len(), "rendered template");
        documents.extend(rendered);
    }

    debug!(dir = %dir.display(), documents = documents.len(), "loaded manifest directory");
    Ok(documents)
}

/// Substitute tokens in one file's text and decode each non-blank block
pub fn render(
    text: &str,
    source: &Path,
    substitutions: &Substitutions,
) -> Result<Vec<ManifestDocument>> {
    substitutions
        .apply(text)
        .split(DOCUMENT_SEPARATOR)
        .filter(|block| !block.trim().is_empty())
        .map(|block| decode_block(block, source))
        .collect()
}

/// Decode one YAML block into a resource document
pub fn decode_block(block: &str, source: &Path) -> Result<ManifestDocument> {
    let mut value = yaml::parse_block(block).map_err(|e| Error::decode(source, e.to_string()))?;

    let Some(fields) = value.as_object_mut() else {
        return Err(Error::decode(source, "document is not a mapping"));
    };
    let api_version = required_str(fields.get("apiVersion"))
        .ok_or_else(|| Error::decode(source, "missing apiVersion"))?;
    let kind =
        required_str(fields.get("kind")).ok_or_else(|| Error::decode(source, "missing kind"))?;
    fields
        .entry("metadata")
        .or_insert_with(|| Value::Object(Default::default()));

    let (group, version) = parse_api_version(&api_version);
    let gvk = GroupVersionKind {
        group,
        version,
        kind,
    };

    let object: DynamicObject =
        serde_json::from_value(value).map_err(|e| Error::decode(source, e.to_string()))?;

    Ok(ManifestDocument {
        source: source.to_path_buf(),
        gvk,
        object,
    })
}

fn required_str(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
