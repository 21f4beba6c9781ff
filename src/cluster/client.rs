//! Kubernetes client construction
//!
//! Resolution order:
//! 1. an explicit kubeconfig path;
//! 2. a mounted service account token (`<token_dir>/token` + `ca.crt`)
//!    against `KUBERNETES_SERVICE_HOST:KUBERNETES_SERVICE_PORT`;
//! 3. in-cluster configuration;
//! 4. the default kubeconfig (`KUBECONFIG` or `~/.kube/config`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::{Error, Result};

/// API server host used when `KUBERNETES_SERVICE_HOST` is unset
pub const DEFAULT_SERVICE_HOST: &str = "10.43.0.1";
/// API server port used when `KUBERNETES_SERVICE_PORT` is unset
pub const DEFAULT_SERVICE_PORT: &str = "443";
/// Directory the access token and CA bundle are mounted in
pub const DEFAULT_TOKEN_DIR: &str = "/mnt/secrets";

const TOKEN_FILE: &str = "token";
const CA_FILE: &str = "ca.crt";
const CONTEXT_NAME: &str = "vm-controller";

/// Trait for reading the API server location from the environment
///
/// Keeps client construction testable without touching process env.
#[cfg_attr(test, mockall::automock)]
pub trait KubeEnv: Send + Sync {
    /// `KUBERNETES_SERVICE_HOST`, if set and non-empty
    fn service_host(&self) -> Option<String>;

    /// `KUBERNETES_SERVICE_PORT`, if set and non-empty
    fn service_port(&self) -> Option<String>;
}

/// Reads the real process environment
#[derive(Clone, Copy, Debug, Default)]
pub struct OsKubeEnv;

impl KubeEnv for OsKubeEnv {
    fn service_host(&self) -> Option<String> {
        std::env::var("KUBERNETES_SERVICE_HOST")
            .ok()
            .filter(|v| !v.is_empty())
    }

    fn service_port(&self) -> Option<String> {
        std::env::var("KUBERNETES_SERVICE_PORT")
            .ok()
            .filter(|v| !v.is_empty())
    }
}

/// API server URL for token-based access
pub fn api_server_url(env: &dyn KubeEnv) -> String {
    let host = env
        .service_host()
        .unwrap_or_else(|| DEFAULT_SERVICE_HOST.to_string());
    let port = env
        .service_port()
        .unwrap_or_else(|| DEFAULT_SERVICE_PORT.to_string());
    if host.contains(':') {
        format!("https://[{}]:{}", host, port)
    } else {
        format!("https://{}:{}", host, port)
    }
}

/// Inputs for building the client
#[derive(Clone, Debug)]
pub struct ClientSettings {
    /// Explicit kubeconfig path; takes precedence over everything else
    pub kubeconfig: Option<PathBuf>,
    /// Directory holding a mounted `token` and `ca.crt`
    pub token_dir: PathBuf,
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// Per-request read timeout
    pub read_timeout: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            kubeconfig: None,
            token_dir: PathBuf::from(DEFAULT_TOKEN_DIR),
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(30),
        }
    }
}

/// Kubeconfig with a single context authenticating by bearer token
pub fn token_kubeconfig(server: &str, token: &str, ca_file: Option<&Path>) -> Result<Kubeconfig> {
    let mut cluster = json!({ "server": server });
    if let Some(ca) = ca_file {
        cluster["certificate-authority"] = json!(ca.to_string_lossy());
    }

    serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{ "name": CONTEXT_NAME, "cluster": cluster }],
        "users": [{ "name": CONTEXT_NAME, "user": { "token": token } }],
        "contexts": [{
            "name": CONTEXT_NAME,
            "context": { "cluster": CONTEXT_NAME, "user": CONTEXT_NAME },
        }],
        "current-context": CONTEXT_NAME,
    }))
    .map_err(|e| Error::config(format!("failed to build token kubeconfig: {}", e)))
}

/// Build a client following the resolution order in the module docs
pub async fn build_client(settings: &ClientSettings, env: &dyn KubeEnv) -> Result<Client> {
    let mut config = resolve_config(settings, env).await?;
    config.connect_timeout = Some(settings.connect_timeout);
    config.read_timeout = Some(settings.read_timeout);
    Client::try_from(config).map_err(|e| Error::config(format!("failed to create client: {}", e)))
}

/// Where the client configuration comes from
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigSource {
    /// Kubeconfig file named on the command line
    Explicit(PathBuf),
    /// Mounted bearer token against the service host
    Token {
        /// Path of the token file
        token: PathBuf,
        /// CA bundle, when mounted next to the token
        ca: Option<PathBuf>,
        /// API server URL
        server: String,
    },
    /// In-cluster config, then the default kubeconfig loading rules
    Inferred,
}

/// Pick the configuration source in resolution order
///
/// `KUBECONFIG` is never read here; it only feeds the final fallback.
pub fn config_source(settings: &ClientSettings, env: &dyn KubeEnv) -> ConfigSource {
    if let Some(path) = &settings.kubeconfig {
        return ConfigSource::Explicit(path.clone());
    }

    let token = settings.token_dir.join(TOKEN_FILE);
    if token.is_file() {
        let ca = settings.token_dir.join(CA_FILE);
        let ca = if ca.is_file() {
            Some(ca)
        } else {
            warn!(path = %ca.display(), "CA bundle missing, using system roots");
            None
        };
        return ConfigSource::Token {
            token,
            ca,
            server: api_server_url(env),
        };
    }

    ConfigSource::Inferred
}

async fn resolve_config(settings: &ClientSettings, env: &dyn KubeEnv) -> Result<Config> {
    match config_source(settings, env) {
        ConfigSource::Explicit(path) => {
            info!(path = %path.display(), "Using kubeconfig");
            let kubeconfig = Kubeconfig::read_from(&path)
                .map_err(|e| Error::config(format!("failed to read kubeconfig: {}", e)))?;
            from_kubeconfig(kubeconfig).await
        }
        ConfigSource::Token { token, ca, server } => {
            let value = std::fs::read_to_string(&token).map_err(|e| Error::io(&token, e))?;
            info!(token = %token.display(), server = %server, "Using mounted token");
            from_kubeconfig(token_kubeconfig(&server, value.trim(), ca.as_deref())?).await
        }
        ConfigSource::Inferred => match Config::incluster() {
            Ok(config) => {
                info!("Using in-cluster configuration");
                Ok(config)
            }
            Err(e) => {
                debug!(error = %e, "In-cluster configuration unavailable, falling back to kubeconfig");
                Config::from_kubeconfig(&KubeConfigOptions::default())
                    .await
                    .map_err(|e| Error::config(format!("failed to load kubeconfig: {}", e)))
            }
        },
    }
}

async fn from_kubeconfig(kubeconfig: Kubeconfig) -> Result<Config> {
    Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| Error::config(format!("failed to load kubeconfig: {}", e)))
}
