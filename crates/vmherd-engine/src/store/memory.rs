//! In-memory reference store.
//!
//! Serializable isolation via a single state mutex: a transaction
//! holds the lock for its whole lifetime and restores a snapshot on
//! drop unless committed. Useful for tests and embedded single-host
//! deployments; production backends implement the same traits over a
//! real database.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use vmherd_core::config::{CloudInitRecord, VmConfigPayload, VmConfigRecord};
use vmherd_core::group::VmGroup;
use vmherd_core::vm::{VmRecord, VmStatus};

use super::{Store, StoreTx};

#[derive(Debug, Default, Clone)]
struct MemState {
    next_vm_id: i64,
    next_group_id: i64,
    vms: BTreeMap<i64, VmRecord>,
    /// ip -> leased_to_vm_id. `Some(0)` marks "leased, pending
    /// assignment" inside an open transaction.
    leases: BTreeMap<Ipv4Addr, Option<i64>>,
    configs: BTreeMap<i64, Vec<VmConfigRecord>>,
    cloudinit: BTreeMap<i64, CloudInitRecord>,
    groups: BTreeMap<i64, VmGroup>,
}

/// The in-memory store handle. Cheap to clone.
#[derive(Clone, Default)]
pub struct MemStore {
    state: Arc<Mutex<MemState>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

struct MemTx {
    guard: OwnedMutexGuard<MemState>,
    snapshot: MemState,
    committed: bool,
}

impl Drop for MemTx {
    fn drop(&mut self) {
        if !self.committed {
            *self.guard = std::mem::take(&mut self.snapshot);
        }
    }
}

fn parse_ip(ip: &str) -> Result<Ipv4Addr> {
    ip.parse()
        .map_err(|_| anyhow::anyhow!("not an IPv4 address: {:?}", ip))
}

#[async_trait]
impl StoreTx for MemTx {
    async fn ensure_pool(&mut self, pool: &[Ipv4Addr]) -> Result<()> {
        for ip in pool {
            self.guard.leases.entry(*ip).or_insert(None);
        }
        Ok(())
    }

    async fn lease_next_available(&mut self) -> Result<Option<String>> {
        let free = self
            .guard
            .leases
            .iter()
            .find(|(_, holder)| holder.is_none())
            .map(|(ip, _)| *ip);
        if let Some(ip) = free {
            self.guard.leases.insert(ip, Some(0));
            return Ok(Some(ip.to_string()));
        }
        Ok(None)
    }

    async fn assign_ip(&mut self, ip: &str, vm_id: i64) -> Result<()> {
        let addr = parse_ip(ip)?;
        match self.guard.leases.get_mut(&addr) {
            Some(holder) => {
                *holder = Some(vm_id);
                Ok(())
            }
            None => bail!("ip {} not in pool", ip),
        }
    }

    async fn release_ip(&mut self, ip: &str) -> Result<()> {
        if ip.is_empty() {
            return Ok(());
        }
        let addr = parse_ip(ip)?;
        if let Some(holder) = self.guard.leases.get_mut(&addr) {
            *holder = None;
        }
        Ok(())
    }

    async fn vm_create(&mut self, vm: &VmRecord) -> Result<i64> {
        if self.guard.vms.values().any(|v| v.name == vm.name) {
            bail!("vm name {:?} already exists", vm.name);
        }
        self.guard.next_vm_id += 1;
        let id = self.guard.next_vm_id;
        let mut row = vm.clone();
        row.id = id;
        self.guard.vms.insert(id, row);
        Ok(id)
    }

    async fn vm_delete(&mut self, id: i64) -> Result<()> {
        self.guard.vms.remove(&id);
        self.guard.configs.remove(&id);
        Ok(())
    }

    async fn vm_get_by_name(&mut self, name: &str) -> Result<Option<VmRecord>> {
        Ok(self.guard.vms.values().find(|v| v.name == name).cloned())
    }

    async fn vm_list(&mut self) -> Result<Vec<VmRecord>> {
        Ok(self.guard.vms.values().cloned().collect())
    }

    async fn vm_update_runtime_state(
        &mut self,
        id: i64,
        status: VmStatus,
        pid: Option<u32>,
    ) -> Result<()> {
        match self.guard.vms.get_mut(&id) {
            Some(vm) => {
                vm.status = status;
                vm.pid = pid;
                Ok(())
            }
            None => bail!("vm id {} not found", id),
        }
    }

    async fn vm_update_sockets(&mut self, id: i64, serial_socket: &str) -> Result<()> {
        match self.guard.vms.get_mut(&id) {
            Some(vm) => {
                vm.serial_socket = serial_socket.to_string();
                Ok(())
            }
            None => bail!("vm id {} not found", id),
        }
    }

    async fn vm_update_spec(
        &mut self,
        id: i64,
        runtime: &str,
        cpu_cores: u32,
        memory_mb: u32,
        kernel_cmdline: &str,
    ) -> Result<()> {
        match self.guard.vms.get_mut(&id) {
            Some(vm) => {
                vm.runtime = runtime.to_string();
                vm.cpu_cores = cpu_cores;
                vm.memory_mb = memory_mb;
                vm.kernel_cmdline = kernel_cmdline.to_string();
                Ok(())
            }
            None => bail!("vm id {} not found", id),
        }
    }

    async fn config_upsert(
        &mut self,
        vm_id: i64,
        payload: &VmConfigPayload,
    ) -> Result<VmConfigRecord> {
        let versions = self.guard.configs.entry(vm_id).or_default();
        let version = versions.last().map(|r| r.version).unwrap_or(0) + 1;
        let record = VmConfigRecord {
            vm_id,
            version,
            payload: payload.clone(),
            created_at: Utc::now(),
        };
        versions.push(record.clone());
        Ok(record)
    }

    async fn config_get_current(&mut self, vm_id: i64) -> Result<Option<VmConfigRecord>> {
        Ok(self
            .guard
            .configs
            .get(&vm_id)
            .and_then(|v| v.last())
            .cloned())
    }

    async fn cloudinit_get(&mut self, vm_id: i64) -> Result<Option<CloudInitRecord>> {
        Ok(self.guard.cloudinit.get(&vm_id).cloned())
    }

    async fn cloudinit_upsert(&mut self, record: &CloudInitRecord) -> Result<()> {
        self.guard.cloudinit.insert(record.vm_id, record.clone());
        Ok(())
    }

    async fn cloudinit_delete(&mut self, vm_id: i64) -> Result<()> {
        self.guard.cloudinit.remove(&vm_id);
        Ok(())
    }

    async fn group_create(&mut self, group: &VmGroup) -> Result<i64> {
        if self.guard.groups.values().any(|g| g.name == group.name) {
            bail!("group name {:?} already exists", group.name);
        }
        self.guard.next_group_id += 1;
        let id = self.guard.next_group_id;
        let mut row = group.clone();
        row.id = id;
        self.guard.groups.insert(id, row);
        Ok(id)
    }

    async fn group_get_by_name(&mut self, name: &str) -> Result<Option<VmGroup>> {
        Ok(self.guard.groups.values().find(|g| g.name == name).cloned())
    }

    async fn group_update_replicas(&mut self, id: i64, replicas: u32) -> Result<()> {
        match self.guard.groups.get_mut(&id) {
            Some(group) => {
                group.replicas = replicas;
                group.updated_at = Utc::now();
                Ok(())
            }
            None => bail!("group id {} not found", id),
        }
    }

    async fn group_delete(&mut self, id: i64) -> Result<()> {
        self.guard.groups.remove(&id);
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        self.committed = true;
        Ok(())
    }
}

#[async_trait]
impl Store for MemStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>> {
        let guard = Arc::clone(&self.state).lock_owned().await;
        let snapshot = guard.clone();
        Ok(Box::new(MemTx {
            guard,
            snapshot,
            committed: false,
        }))
    }

    async fn vm_get_by_name(&self, name: &str) -> Result<Option<VmRecord>> {
        let state = self.state.lock().await;
        Ok(state.vms.values().find(|v| v.name == name).cloned())
    }

    async fn vm_list(&self) -> Result<Vec<VmRecord>> {
        let state = self.state.lock().await;
        Ok(state.vms.values().cloned().collect())
    }

    async fn vm_list_by_group(&self, group_id: i64) -> Result<Vec<VmRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .vms
            .values()
            .filter(|v| v.group_id == Some(group_id))
            .cloned()
            .collect())
    }

    async fn config_get_current(&self, vm_id: i64) -> Result<Option<VmConfigRecord>> {
        let state = self.state.lock().await;
        Ok(state.configs.get(&vm_id).and_then(|v| v.last()).cloned())
    }

    async fn config_history(&self, vm_id: i64, limit: u32) -> Result<Vec<VmConfigRecord>> {
        let state = self.state.lock().await;
        let mut history: Vec<VmConfigRecord> =
            state.configs.get(&vm_id).cloned().unwrap_or_default();
        history.reverse();
        if limit > 0 {
            history.truncate(limit as usize);
        }
        Ok(history)
    }

    async fn cloudinit_get(&self, vm_id: i64) -> Result<Option<CloudInitRecord>> {
        let state = self.state.lock().await;
        Ok(state.cloudinit.get(&vm_id).cloned())
    }

    async fn group_get_by_id(&self, id: i64) -> Result<Option<VmGroup>> {
        let state = self.state.lock().await;
        Ok(state.groups.get(&id).cloned())
    }

    async fn group_get_by_name(&self, name: &str) -> Result<Option<VmGroup>> {
        let state = self.state.lock().await;
        Ok(state.groups.values().find(|g| g.name == name).cloned())
    }

    async fn group_list(&self) -> Result<Vec<VmGroup>> {
        let state = self.state.lock().await;
        Ok(state.groups.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vm(name: &str) -> VmRecord {
        VmRecord {
            id: 0,
            name: name.into(),
            status: VmStatus::Starting,
            runtime: "browser".into(),
            ip_address: String::new(),
            mac_address: String::new(),
            vsock_cid: 3,
            cpu_cores: 1,
            memory_mb: 512,
            kernel_cmdline: String::new(),
            group_id: None,
            pid: None,
            serial_socket: String::new(),
        }
    }

    #[tokio::test]
    async fn test_commit_persists() {
        let store = MemStore::new();
        let mut tx = store.begin().await.unwrap();
        let id = tx.vm_create(&vm("a")).await.unwrap();
        tx.commit().await.unwrap();
        let got = store.vm_get_by_name("a").await.unwrap().unwrap();
        assert_eq!(got.id, id);
    }

    #[tokio::test]
    async fn test_drop_rolls_back() {
        let store = MemStore::new();
        {
            let mut tx = store.begin().await.unwrap();
            tx.vm_create(&vm("a")).await.unwrap();
            // dropped without commit
        }
        assert!(store.vm_get_by_name("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lease_lowest_free_and_release() {
        let store = MemStore::new();
        let pool: Vec<Ipv4Addr> = vec![
            "10.0.0.3".parse().unwrap(),
            "10.0.0.2".parse().unwrap(),
            "10.0.0.4".parse().unwrap(),
        ];
        let mut tx = store.begin().await.unwrap();
        tx.ensure_pool(&pool).await.unwrap();
        assert_eq!(
            tx.lease_next_available().await.unwrap().as_deref(),
            Some("10.0.0.2")
        );
        assert_eq!(
            tx.lease_next_available().await.unwrap().as_deref(),
            Some("10.0.0.3")
        );
        tx.release_ip("10.0.0.2").await.unwrap();
        assert_eq!(
            tx.lease_next_available().await.unwrap().as_deref(),
            Some("10.0.0.2")
        );
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_ensure_pool_idempotent_keeps_leases() {
        let store = MemStore::new();
        let pool: Vec<Ipv4Addr> = vec!["10.0.0.2".parse().unwrap()];
        let mut tx = store.begin().await.unwrap();
        tx.ensure_pool(&pool).await.unwrap();
        tx.lease_next_available().await.unwrap();
        tx.ensure_pool(&pool).await.unwrap();
        // Re-seeding must not free the leased address.
        assert!(tx.lease_next_available().await.unwrap().is_none());
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_config_versions_increment() {
        let store = MemStore::new();
        let mut tx = store.begin().await.unwrap();
        let v1 = tx
            .config_upsert(1, &VmConfigPayload::default())
            .await
            .unwrap();
        let v2 = tx
            .config_upsert(1, &VmConfigPayload::default())
            .await
            .unwrap();
        tx.commit().await.unwrap();
        assert_eq!(v1.version, 1);
        assert_eq!(v2.version, 2);
        let history = store.config_history(1, 0).await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[0].version > history[1].version);
        let limited = store.config_history(1, 1).await.unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].version, 2);
    }

    #[tokio::test]
    async fn test_duplicate_names_rejected() {
        let store = MemStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.vm_create(&vm("a")).await.unwrap();
        assert!(tx.vm_create(&vm("a")).await.is_err());
        tx.commit().await.unwrap();
    }
}
