//! Input validation for provisioning requests
//!
//! Every value that ends up substituted into a manifest template passes these
//! checks first. Checks run in a fixed order and the first failure wins.

use std::path::{Component, Path};

use crate::model::ProvisionRequest;
use crate::{Error, Result};

/// Lowest NodePort a request may ask for
pub const MIN_NODE_PORT: u16 = 30003;
/// First NodePort above the accepted range
pub const NODE_PORT_LIMIT: u16 = 32767;

/// Secret length bounds in bytes, inclusive
pub const SECRET_MIN_LEN: usize = 8;
/// Upper secret length bound, inclusive
pub const SECRET_MAX_LEN: usize = 16;

const SECRET_SYMBOLS: &str = "!@#$%^&*()_+-=[]{}|;:,.<>/?";

/// Validate a provisioning request
pub fn check(request: &ProvisionRequest) -> Result<()> {
    let manifest_dir = request.manifest_dir.to_string_lossy();

    if request.namespace.is_empty()
        || request.vm_name.is_empty()
        || request.secret.is_empty()
        || request.access_host.is_empty()
        || manifest_dir.is_empty()
        || request.port == 0
    {
        return Err(Error::validation(
            "invalid parameters: empty values not allowed",
        ));
    }

    if !(MIN_NODE_PORT..NODE_PORT_LIMIT).contains(&request.port) {
        return Err(Error::validation(format!(
            "invalid port: {} (NodePort must be between {} and {})",
            request.port, MIN_NODE_PORT, NODE_PORT_LIMIT
        )));
    }

    validate_dns_label("namespace", &request.namespace)?;
    validate_dns_label("vm name", &request.vm_name)?;
    validate_secret(&request.secret)?;
    validate_access_host(&request.access_host)?;
    validate_manifest_dir(&manifest_dir)?;

    Ok(())
}

/// DNS-1123 label: lowercase alphanumerics and internal hyphens
pub fn validate_dns_label(field: &str, value: &str) -> Result<()> {
    let invalid = || {
        Error::validation(format!(
            "invalid {} format: {} (must be DNS-1123 compliant)",
            field, value
        ))
    };
    let is_alnum = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit();

    let (Some(first), Some(last)) = (value.chars().next(), value.chars().last()) else {
        return Err(invalid());
    };
    if !is_alnum(first) || !is_alnum(last) {
        return Err(invalid());
    }
    if !value.chars().all(|c| is_alnum(c) || c == '-') {
        return Err(invalid());
    }
    Ok(())
}

/// Secret length and character set
pub fn validate_secret(secret: &str) -> Result<()> {
    if !(SECRET_MIN_LEN..=SECRET_MAX_LEN).contains(&secret.len()) {
        return Err(Error::validation(format!(
            "invalid password: length must be between {} and {} characters",
            SECRET_MIN_LEN, SECRET_MAX_LEN
        )));
    }
    if !secret
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || SECRET_SYMBOLS.contains(c))
    {
        return Err(Error::validation(format!(
            "invalid password format: contains invalid characters (allowed: alphanumeric and {})",
            SECRET_SYMBOLS
        )));
    }
    Ok(())
}

/// Host names: letters, digits, dots and hyphens
pub fn validate_access_host(host: &str) -> Result<()> {
    if host
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
    {
        Ok(())
    } else {
        Err(Error::validation(format!(
            "invalid access host format: {} (contains invalid characters)",
            host
        )))
    }
}

/// Manifest directory must stay relative after normalization
pub fn validate_manifest_dir(dir: &str) -> Result<()> {
    let invalid = || {
        Error::validation(format!(
            "invalid manifest directory: {} (must be a relative path without parent segments)",
            dir
        ))
    };

    if dir.starts_with('\\') {
        return Err(invalid());
    }

    // Lexical normalization: "a/../b" is fine, "a/../../b" escapes
    let mut depth = 0usize;
    for component in Path::new(dir).components() {
        match component {
            Component::Prefix(_) | Component::RootDir => return Err(invalid()),
            Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    return Err(invalid());
                }
                depth -= 1;
            }
            Component::Normal(_) => depth += 1,
        }
    }
    Ok(())
}
