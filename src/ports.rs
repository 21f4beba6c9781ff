//! NodePort allocation
//!
//! The allocator scans a fixed band for a port no active record holds. The
//! scan and the later claim are not serialized: two callers can be handed the
//! same port, and the repository's uniqueness check decides which one wins.
//!
//! [`PortAllocator::available_cluster_port`] also skips NodePorts already
//! declared by Services in any namespace, for callers without a populated
//! store.

use std::collections::HashSet;
use std::ops::RangeInclusive;
use std::sync::Arc;

use kube::api::DynamicObject;
use tracing::debug;

use crate::cluster::{gvk, ClusterApi};
use crate::repository::VmRepository;
use crate::{Error, Result};

/// First port handed out by the allocator
pub const PORT_BAND_START: u16 = 30003;
/// Last port handed out by the allocator, inclusive
pub const PORT_BAND_END: u16 = 30300;

/// Picks free NodePorts from the allocator band
#[derive(Clone)]
pub struct PortAllocator {
    repository: Arc<dyn VmRepository>,
    band: RangeInclusive<u16>,
}

impl PortAllocator {
    /// Allocator over the default band
    pub fn new(repository: Arc<dyn VmRepository>) -> Self {
        Self::with_band(repository, PORT_BAND_START..=PORT_BAND_END)
    }

    /// Allocator over a custom band
    pub fn with_band(repository: Arc<dyn VmRepository>, band: RangeInclusive<u16>) -> Self {
        Self { repository, band }
    }

    /// Lowest port in the band not held by an active record
    pub async fn available_port(&self) -> Result<u16> {
        let used: HashSet<u16> = self.repository.used_ports().await?.into_iter().collect();
        self.lowest_free(&used)
    }

    /// Lowest port in the band held by neither an active record nor a
    /// Service anywhere in the cluster
    pub async fn available_cluster_port(&self, cluster: &dyn ClusterApi) -> Result<u16> {
        let target = cluster.resolve(&gvk("v1", "Service"))?;
        let services = cluster.list(&target, "", 0).await?;
        let mut used: HashSet<u16> = self.repository.used_ports().await?.into_iter().collect();
        used.extend(service_node_ports(&services));
        self.lowest_free(&used)
    }

    fn lowest_free(&self, used: &HashSet<u16>) -> Result<u16> {
        let port = self
            .band
            .clone()
            .find(|port| !used.contains(port))
            .ok_or(Error::PortsExhausted {
                min: *self.band.start(),
                max: *self.band.end(),
            })?;
        debug!(port, in_use = used.len(), "Selected available port");
        Ok(port)
    }

    /// Whether no active record holds `port`
    pub async fn is_port_available(&self, port: u16) -> Result<bool> {
        Ok(!self.repository.used_ports().await?.contains(&port))
    }
}

/// NodePorts declared in `spec.ports[].nodePort` of the given Services
pub fn service_node_ports(services: &[DynamicObject]) -> Vec<u16> {
    services
        .iter()
        .filter_map(|service| service.data.pointer("/spec/ports")?.as_array())
        .flatten()
        .filter_map(|port| port.get("nodePort")?.as_u64())
        .filter_map(|port| u16::try_from(port).ok())
        .collect()
}
