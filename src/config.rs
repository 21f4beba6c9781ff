//! Controller configuration
//!
//! Flags fall back to environment variables. [`ControllerArgs`] is the raw
//! clap view; [`ControllerConfig`] is the checked form the rest of the crate
//! consumes.

use std::path::PathBuf;
use std::time::Duration;

use clap::Args;

use crate::cluster::{ClientSettings, DEFAULT_TOKEN_DIR};
use crate::lifecycle::PollSettings;
use crate::provision::DEFAULT_INIT_DIR;
use crate::{Error, Result};

/// Image imported by the typed builder when a launch names none
pub const DEFAULT_IMAGE: &str =
    "https://cloud-images.ubuntu.com/jammy/current/jammy-server-cloudimg-amd64.img";

/// Flags shared by every subcommand
#[derive(Args, Debug, Clone)]
pub struct ControllerArgs {
    /// Path to a kubeconfig file; skips token and in-cluster discovery.
    /// A plain `KUBECONFIG` is only used when nothing else resolves.
    #[arg(long, env = "VM_CONTROLLER_KUBECONFIG", global = true)]
    pub kubeconfig: Option<PathBuf>,

    /// Directory holding a mounted `token` and `ca.crt`
    #[arg(
        long,
        env = "VM_CONTROLLER_TOKEN_DIR",
        default_value = DEFAULT_TOKEN_DIR,
        global = true
    )]
    pub token_dir: PathBuf,

    /// Bootstrap templates used when none sit next to the VM templates
    #[arg(
        long,
        env = "VM_CONTROLLER_INIT_DIR",
        default_value = DEFAULT_INIT_DIR,
        global = true
    )]
    pub init_manifest_dir: PathBuf,

    /// Seconds between VM status polls
    #[arg(long, default_value = "5", global = true)]
    pub poll_interval_secs: u64,

    /// Seconds before a status wait gives up
    #[arg(long, default_value = "60", global = true)]
    pub poll_timeout_secs: u64,

    /// Concurrent lifecycle operations
    #[arg(long, default_value = "4", global = true)]
    pub lifecycle_workers: usize,

    /// Lifecycle jobs that may wait for a worker
    #[arg(long, default_value = "64", global = true)]
    pub lifecycle_queue: usize,

    /// Disk image for the typed builder
    #[arg(long, env = "VM_CONTROLLER_DEFAULT_IMAGE", default_value = DEFAULT_IMAGE, global = true)]
    pub default_image: String,

    /// Log JSON lines instead of text
    #[arg(long, global = true)]
    pub log_json: bool,
}

/// Checked controller configuration
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Cluster client inputs
    pub client: ClientSettings,
    /// Bootstrap fallback directory
    pub init_manifest_dir: PathBuf,
    /// Status wait cadence
    pub poll: PollSettings,
    /// Lifecycle pool size
    pub lifecycle_workers: usize,
    /// Lifecycle queue capacity
    pub lifecycle_queue: usize,
    /// Typed builder image
    pub default_image: String,
    /// JSON log output
    pub log_json: bool,
}

impl TryFrom<ControllerArgs> for ControllerConfig {
    type Error = Error;

    fn try_from(args: ControllerArgs) -> Result<Self> {
        if args.poll_interval_secs == 0 {
            return Err(Error::config("poll interval must be at least one second"));
        }
        if args.poll_timeout_secs < args.poll_interval_secs {
            return Err(Error::config(format!(
                "poll timeout ({}s) is shorter than the poll interval ({}s)",
                args.poll_timeout_secs, args.poll_interval_secs
            )));
        }
        if args.lifecycle_workers == 0 || args.lifecycle_queue == 0 {
            return Err(Error::config(
                "lifecycle workers and queue capacity must be positive",
            ));
        }
        if args.default_image.trim().is_empty() {
            return Err(Error::config("default image must not be empty"));
        }

        Ok(Self {
            client: ClientSettings {
                kubeconfig: args.kubeconfig,
                token_dir: args.token_dir,
                ..ClientSettings::default()
            },
            init_manifest_dir: args.init_manifest_dir,
            poll: PollSettings {
                interval: Duration::from_secs(args.poll_interval_secs),
                timeout: Duration::from_secs(args.poll_timeout_secs),
            },
            lifecycle_workers: args.lifecycle_workers,
            lifecycle_queue: args.lifecycle_queue,
            default_image: args.default_image,
            log_json: args.log_json,
        })
    }
}
