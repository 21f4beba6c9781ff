//! vm-controller - provisioning and lifecycle engine for per-user KubeVirt VMs
//!
//! Each user VM is a fixed bundle of cluster objects: a cloud-init Secret, a
//! DataVolume, the VirtualMachine itself, an SSH NodePort Service, a web
//! Service and an Ingress. Provisioning applies that bundle (after the
//! namespace's shared bootstrap objects) and removes everything it created if
//! any step fails. Lifecycle operations run in a bounded background pool and
//! report their outcome through the persisted VM record.
//!
//! # Modules
//!
//! - [`guard`] - Validation of every value substituted into manifests
//! - [`manifest`] - Template loading, token substitution and the typed builder
//! - [`cluster`] - Cluster access trait, live client and API discovery
//! - [`applier`] - Create-or-skip application of decoded documents
//! - [`provision`] - Two-phase provisioning with compensating rollback
//! - [`lifecycle`] - Stop, start, delete and status polling; worker pool
//! - [`repository`] - VM record storage
//! - [`ports`] - NodePort allocation
//! - [`service`] - Caller-facing VM operations
//! - [`config`] - CLI flags and environment configuration
//! - [`telemetry`] - Tracing subscriber setup
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod applier;
pub mod cluster;
pub mod config;
pub mod error;
pub mod guard;
pub mod lifecycle;
pub mod manifest;
pub mod model;
pub mod ports;
pub mod provision;
pub mod repository;
pub mod service;
pub mod telemetry;

pub use error::Error;

/// Result type alias using the crate's Error type
pub type Result<T, E = Error> = std::result::Result<T, E>;
