//! Transactional persistence contract consumed by the engine.
//!
//! The store is the source of truth; the engine's in-memory handles
//! are soft state. All mutations happen inside a [`StoreTx`]; reads
//! outside a transaction go through [`Store`] directly and may observe
//! any committed state.
//!
//! Backends return plain `anyhow` errors: the engine enforces its own
//! uniqueness and existence checks inside transactions, so a backend
//! never needs to speak the engine's error taxonomy.

pub mod memory;

use std::net::Ipv4Addr;

use anyhow::Result;
use async_trait::async_trait;

use vmherd_core::config::{CloudInitRecord, VmConfigPayload, VmConfigRecord};
use vmherd_core::group::VmGroup;
use vmherd_core::vm::{VmRecord, VmStatus};

pub use memory::MemStore;

/// One open transaction. Writes are invisible to other readers until
/// [`StoreTx::commit`]; dropping the transaction without committing
/// rolls everything back.
#[async_trait]
pub trait StoreTx: Send {
    // --- IP allocations ---

    /// Insert any missing pool addresses as free. Idempotent.
    async fn ensure_pool(&mut self, pool: &[Ipv4Addr]) -> Result<()>;
    /// Lease the lowest free address, or None when the pool is empty.
    async fn lease_next_available(&mut self) -> Result<Option<String>>;
    /// Bind a leased IP to a VM id.
    async fn assign_ip(&mut self, ip: &str, vm_id: i64) -> Result<()>;
    /// Return an IP to the free set. No-op on an empty string.
    async fn release_ip(&mut self, ip: &str) -> Result<()>;

    // --- VMs ---

    /// Insert a VM row; the store assigns and returns the id.
    async fn vm_create(&mut self, vm: &VmRecord) -> Result<i64>;
    async fn vm_delete(&mut self, id: i64) -> Result<()>;
    async fn vm_get_by_name(&mut self, name: &str) -> Result<Option<VmRecord>>;
    async fn vm_list(&mut self) -> Result<Vec<VmRecord>>;
    async fn vm_update_runtime_state(
        &mut self,
        id: i64,
        status: VmStatus,
        pid: Option<u32>,
    ) -> Result<()>;
    async fn vm_update_sockets(&mut self, id: i64, serial_socket: &str) -> Result<()>;
    async fn vm_update_spec(
        &mut self,
        id: i64,
        runtime: &str,
        cpu_cores: u32,
        memory_mb: u32,
        kernel_cmdline: &str,
    ) -> Result<()>;

    // --- VM configs ---

    /// Persist a new config version (previous version + 1, or 1).
    async fn config_upsert(&mut self, vm_id: i64, payload: &VmConfigPayload)
    -> Result<VmConfigRecord>;
    async fn config_get_current(&mut self, vm_id: i64) -> Result<Option<VmConfigRecord>>;

    // --- VM cloud-init ---

    async fn cloudinit_get(&mut self, vm_id: i64) -> Result<Option<CloudInitRecord>>;
    async fn cloudinit_upsert(&mut self, record: &CloudInitRecord) -> Result<()>;
    async fn cloudinit_delete(&mut self, vm_id: i64) -> Result<()>;

    // --- VM groups ---

    /// Insert a group row; the store assigns and returns the id.
    async fn group_create(&mut self, group: &VmGroup) -> Result<i64>;
    async fn group_get_by_name(&mut self, name: &str) -> Result<Option<VmGroup>>;
    async fn group_update_replicas(&mut self, id: i64, replicas: u32) -> Result<()>;
    async fn group_delete(&mut self, id: i64) -> Result<()>;

    /// Commit all writes atomically.
    async fn commit(self: Box<Self>) -> Result<()>;
}

/// A transactional store plus its non-transactional read surface.
#[async_trait]
pub trait Store: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn StoreTx>>;

    async fn vm_get_by_name(&self, name: &str) -> Result<Option<VmRecord>>;
    async fn vm_list(&self) -> Result<Vec<VmRecord>>;
    async fn vm_list_by_group(&self, group_id: i64) -> Result<Vec<VmRecord>>;

    async fn config_get_current(&self, vm_id: i64) -> Result<Option<VmConfigRecord>>;
    /// Config history, most recent version first.
    async fn config_history(&self, vm_id: i64, limit: u32) -> Result<Vec<VmConfigRecord>>;

    async fn cloudinit_get(&self, vm_id: i64) -> Result<Option<CloudInitRecord>>;

    async fn group_get_by_id(&self, id: i64) -> Result<Option<VmGroup>>;
    async fn group_get_by_name(&self, name: &str) -> Result<Option<VmGroup>>;
    async fn group_list(&self) -> Result<Vec<VmGroup>>;
}
