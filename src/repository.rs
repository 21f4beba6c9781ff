//! VM record persistence
//!
//! The repository is the only place name and port uniqueness is enforced.
//! Soft-deleted records stay stored but are invisible to every query and do
//! not hold their name or port.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::model::{NewVirtualMachine, VirtualMachine, VmStatus};
use crate::{Error, Result};

/// Storage contract for VM records
#[cfg_attr(test, automock)]
#[async_trait]
pub trait VmRepository: Send + Sync {
    /// Insert a record in `Provisioning`; fails on a name or port conflict
    async fn create(&self, vm: NewVirtualMachine) -> Result<VirtualMachine>;

    /// Active record with this name
    async fn find_by_name(&self, name: &str) -> Result<Option<VirtualMachine>>;

    /// Active records of one owner
    async fn list_by_owner(&self, owner_id: u64) -> Result<Vec<VirtualMachine>>;

    /// Set the status of the active record with this name
    async fn update_status(&self, name: &str, status: VmStatus) -> Result<()>;

    /// Soft-delete the active record with this name
    async fn mark_deleted(&self, name: &str) -> Result<()>;

    /// Ports held by active records
    async fn used_ports(&self) -> Result<Vec<u16>>;
}

#[derive(Default)]
struct Records {
    rows: Vec<VirtualMachine>,
    next_id: u64,
}

impl Records {
    fn active(&self) -> impl Iterator<Item = &VirtualMachine> {
        self.rows.iter().filter(|vm| !vm.deleted)
    }

    fn active_mut(&mut self, name: &str) -> Option<&mut VirtualMachine> {
        self.rows
            .iter_mut()
            .find(|vm| !vm.deleted && vm.name == name)
    }
}

/// Process-local repository
#[derive(Default)]
pub struct InMemoryVmRepository {
    records: RwLock<Records>,
}

impl InMemoryVmRepository {
    /// Empty repository
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VmRepository for InMemoryVmRepository {
    async fn create(&self, vm: NewVirtualMachine) -> Result<VirtualMachine> {
        let mut records = self.records.write();
        if records.active().any(|r| r.name == vm.name) {
            return Err(Error::conflict(format!("vm name {} already in use", vm.name)));
        }
        if records.active().any(|r| r.node_port == vm.node_port) {
            return Err(Error::conflict(format!(
                "node port {} already in use",
                vm.node_port
            )));
        }

        records.next_id += 1;
        let now = Utc::now();
        let record = VirtualMachine {
            id: records.next_id,
            owner_id: vm.owner_id,
            name: vm.name,
            namespace: vm.namespace,
            node_port: vm.node_port,
            secret: vm.secret,
            image: vm.image,
            status: VmStatus::Provisioning,
            deleted: false,
            created_at: now,
            updated_at: now,
        };
        records.rows.push(record.clone());
        debug!(vm = %record.name, id = record.id, port = record.node_port, "Stored VM record");
        Ok(record)
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<VirtualMachine>> {
        Ok(self.records.read().active().find(|r| r.name == name).cloned())
    }

    async fn list_by_owner(&self, owner_id: u64) -> Result<Vec<VirtualMachine>> {
        Ok(self
            .records
            .read()
            .active()
            .filter(|r| r.owner_id == owner_id)
            .cloned()
            .collect())
    }

    async fn update_status(&self, name: &str, status: VmStatus) -> Result<()> {
        let mut records = self.records.write();
        let record = records
            .active_mut(name)
            .ok_or_else(|| Error::not_found(name))?;
        record.status = status;
        record.updated_at = Utc::now();
        debug!(vm = %name, status = %status, "Updated VM status");
        Ok(())
    }

    async fn mark_deleted(&self, name: &str) -> Result<()> {
        let mut records = self.records.write();
        let record = records
            .active_mut(name)
            .ok_or_else(|| Error::not_found(name))?;
        record.deleted = true;
        record.status = VmStatus::Deleted;
        record.updated_at = Utc::now();
        debug!(vm = %name, "Soft-deleted VM record");
        Ok(())
    }

    async fn used_ports(&self) -> Result<Vec<u16>> {
        Ok(self.records.read().active().map(|r| r.node_port).collect())
    }
}
