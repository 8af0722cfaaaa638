//! Start, stop, restart, destroy.

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use vmherd_core::config::CloudInitRecord;
use vmherd_core::error::{EngineError, Result};
use vmherd_core::events::{VmEvent, VmEventType};
use vmherd_core::vm::{VmRecord, VmStatus};

use super::{Engine, VmHandle, remove_file_best_effort, seed_spec_for};

impl Engine {
    /// Boot an existing (stopped or crashed) VM from its latest
    /// stored config. IP, MAC, and CID are reused, never
    /// re-allocated.
    #[instrument(skip_all, fields(vm = %name))]
    pub async fn start_vm(&self, name: &str) -> Result<VmRecord> {
        {
            let mut map = self.inner.handles.lock().await;
            if map.live.contains_key(name) || map.starting.contains(name) {
                return Err(EngineError::PreconditionFailed(format!(
                    "vm {:?} is already running",
                    name
                )));
            }
            map.starting.insert(name.to_string());
        }

        let result = self.start_vm_inner(name).await;

        let mut map = self.inner.handles.lock().await;
        map.starting.remove(name);
        result
    }

    async fn start_vm_inner(&self, name: &str) -> Result<VmRecord> {
        let mut vm = self.get_vm(name).await?;
        let current = self
            .inner
            .store
            .config_get_current(vm.id)
            .await
            .map_err(EngineError::dependency)?
            .ok_or_else(|| {
                EngineError::PreconditionFailed(format!(
                    "vm {:?} has no stored config; recreate it",
                    name
                ))
            })?;
        let payload = current.payload;

        let mode = payload.effective_network_mode();
        self.validate_expose(&payload)?;
        let api = self.resolve_api(&payload.api);
        let injected = self.injected_args(&payload, &api)?;
        let kernel_cmdline =
            self.build_cmdline(&vm.ip_address, &vm.name, &payload.kernel_cmdline, &injected);

        // Mark the row starting and refresh the spec columns so the
        // persisted cmdline matches what the guest will boot with.
        let marked = async {
            let mut tx = self.inner.store.begin().await?;
            tx.vm_update_runtime_state(vm.id, VmStatus::Starting, None)
                .await?;
            tx.vm_update_spec(
                vm.id,
                &payload.runtime,
                payload.resources.cpu_cores,
                payload.resources.memory_mb,
                &kernel_cmdline,
            )
            .await?;
            tx.commit().await
        }
        .await;
        marked.map_err(EngineError::dependency)?;
        vm.status = VmStatus::Starting;
        vm.runtime = payload.runtime.clone();
        vm.cpu_cores = payload.resources.cpu_cores;
        vm.memory_mb = payload.resources.memory_mb;
        vm.kernel_cmdline = kernel_cmdline;

        // Rebuild the seed. A prior seed at a different path is
        // removed only after the record points at the new one.
        let docs = payload.merged_cloud_init();
        let prior_seed = self
            .inner
            .store
            .cloudinit_get(vm.id)
            .await
            .map_err(EngineError::dependency)?
            .map(|r| r.seed_path);
        let mut seed_path: Option<PathBuf> = None;
        if !docs.is_empty() {
            let target = self.seed_image_path(&vm.name);
            let spec = seed_spec_for(self.instance_id(vm.id), &vm.name, &docs);
            if let Err(e) = self.inner.seed.build(&spec, &target).await {
                remove_file_best_effort(&target).await;
                self.mark_stopped_after_failed_start(vm.id).await;
                return Err(EngineError::dependency(e));
            }
            let recorded = async {
                let mut tx = self.inner.store.begin().await?;
                tx.cloudinit_upsert(&CloudInitRecord {
                    vm_id: vm.id,
                    docs: docs.clone(),
                    seed_path: target.display().to_string(),
                })
                .await?;
                tx.commit().await
            }
            .await;
            if let Err(e) = recorded {
                remove_file_best_effort(&target).await;
                self.mark_stopped_after_failed_start(vm.id).await;
                return Err(EngineError::dependency(e));
            }
            if let Some(prior) = prior_seed
                && prior != target.display().to_string()
                && !prior.is_empty()
            {
                remove_file_best_effort(&PathBuf::from(prior)).await;
            }
            seed_path = Some(target);
        }

        let mut tap = String::new();
        if mode.needs_tap() {
            match self
                .inner
                .network
                .prepare_tap(&vm.name, &vm.mac_address)
                .await
            {
                Ok(dev) => tap = dev,
                Err(e) => {
                    if let Some(p) = &seed_path {
                        remove_file_best_effort(p).await;
                    }
                    self.mark_stopped_after_failed_start(vm.id).await;
                    return Err(EngineError::dependency(e));
                }
            }
        }

        vm.serial_socket = self.serial_socket_path(&vm.name).display().to_string();
        let spec = self.build_launch_spec(
            &vm,
            &payload,
            injected,
            (!tap.is_empty()).then(|| tap.clone()),
            seed_path.as_deref(),
        );
        info!(cmdline = %vm.kernel_cmdline, "launching microVM");

        let instance = match self.inner.launcher.launch(&self.inner.lifetime, &spec).await {
            Ok(instance) => instance,
            Err(e) => {
                self.cleanup_tap_best_effort(&tap).await;
                if let Some(p) = &seed_path {
                    remove_file_best_effort(p).await;
                }
                self.mark_stopped_after_failed_start(vm.id).await;
                return Err(EngineError::dependency(e));
            }
        };

        let recorded = async {
            let mut tx = self.inner.store.begin().await?;
            tx.vm_update_runtime_state(vm.id, VmStatus::Running, Some(instance.pid()))
                .await?;
            tx.vm_update_sockets(vm.id, &vm.serial_socket).await?;
            tx.commit().await
        }
        .await;
        if let Err(e) = recorded {
            let _ = instance.stop(&CancellationToken::new()).await;
            self.cleanup_tap_best_effort(&tap).await;
            if let Some(p) = &seed_path {
                remove_file_best_effort(p).await;
            }
            self.mark_stopped_after_failed_start(vm.id).await;
            return Err(EngineError::dependency(e));
        }
        vm.status = VmStatus::Running;
        vm.pid = Some(instance.pid());

        {
            let mut map = self.inner.handles.lock().await;
            map.live.insert(
                vm.name.clone(),
                VmHandle {
                    instance: Arc::clone(&instance),
                    tap,
                    seed_path,
                },
            );
        }
        self.spawn_monitor(vm.name.clone(), instance);

        self.publish_event(VmEvent::lifecycle(
            VmEventType::Running,
            VmStatus::Running,
            &vm,
        ))
        .await;
        Ok(vm)
    }

    async fn mark_stopped_after_failed_start(&self, vm_id: i64) {
        let result = async {
            let mut tx = self.inner.store.begin().await?;
            tx.vm_update_runtime_state(vm_id, VmStatus::Stopped, None)
                .await?;
            tx.commit().await
        }
        .await;
        if let Err(e) = result {
            error!(vm_id, error = %e, "marking vm stopped after failed start");
        }
    }

    /// Stop a running VM. The handle is detached first; if the row
    /// update then fails it is reinserted, keeping handle and store
    /// consistent.
    #[instrument(skip_all, fields(vm = %name))]
    pub async fn stop_vm(&self, name: &str) -> Result<()> {
        let vm = self.get_vm(name).await?;

        let handle = {
            let mut map = self.inner.handles.lock().await;
            map.live.remove(name)
        };

        let updated = async {
            let mut tx = self.inner.store.begin().await?;
            tx.vm_update_runtime_state(vm.id, VmStatus::Stopped, None)
                .await?;
            tx.commit().await
        }
        .await;
        if let Err(e) = updated {
            if let Some(handle) = handle {
                let mut map = self.inner.handles.lock().await;
                map.live.insert(name.to_string(), handle);
            }
            return Err(EngineError::dependency(e));
        }

        if let Some(handle) = &handle {
            if let Err(e) = handle.instance.stop(&CancellationToken::new()).await {
                warn!(error = %e, "instance stop");
            }
            self.cleanup_tap_best_effort(&handle.tap).await;
            if let Some(socket) = handle.instance.api_socket_path() {
                remove_file_best_effort(&socket).await;
            }
        }

        let mut stopped = vm;
        stopped.status = VmStatus::Stopped;
        stopped.pid = None;
        self.publish_event(VmEvent::lifecycle(
            VmEventType::Stopped,
            VmStatus::Stopped,
            &stopped,
        ))
        .await;
        Ok(())
    }

    /// Stop then start; errors from either phase surface directly.
    pub async fn restart_vm(&self, name: &str) -> Result<VmRecord> {
        self.stop_vm(name).await?;
        self.start_vm(name).await
    }

    /// Remove a VM and release everything it held: row, IP lease,
    /// cloud-init record, subprocess, tap, sockets, seed image.
    ///
    /// `reconcile_group` controls whether a deployment member's group
    /// is reconciled afterwards; the reconciler itself passes `false`
    /// to avoid recursion.
    #[instrument(skip_all, fields(vm = %name))]
    pub async fn destroy_vm(&self, name: &str, reconcile_group: bool) -> Result<()> {
        let vm = self.get_vm(name).await?;
        let recorded_seed = self
            .inner
            .store
            .cloudinit_get(vm.id)
            .await
            .map_err(EngineError::dependency)?
            .map(|r| r.seed_path);

        let deleted = async {
            let mut tx = self.inner.store.begin().await?;
            tx.cloudinit_delete(vm.id).await?;
            tx.vm_delete(vm.id).await?;
            tx.release_ip(&vm.ip_address).await?;
            tx.commit().await
        }
        .await;
        deleted.map_err(EngineError::dependency)?;

        let handle = {
            let mut map = self.inner.handles.lock().await;
            map.live.remove(name)
        };
        if let Some(handle) = &handle {
            if let Err(e) = handle.instance.stop(&CancellationToken::new()).await {
                warn!(error = %e, "instance stop");
            }
            self.cleanup_tap_best_effort(&handle.tap).await;
            if let Some(socket) = handle.instance.api_socket_path() {
                remove_file_best_effort(&socket).await;
            }
            if let Some(seed) = &handle.seed_path {
                remove_file_best_effort(seed).await;
            }
        }
        if let Some(seed) = recorded_seed
            && !seed.is_empty()
        {
            remove_file_best_effort(&PathBuf::from(seed)).await;
        }

        let group_id = vm.group_id;
        let mut gone = vm;
        gone.status = VmStatus::Stopped;
        gone.pid = None;
        self.publish_event(VmEvent::lifecycle(
            VmEventType::Deleted,
            VmStatus::Stopped,
            &gone,
        ))
        .await;

        // After the delete is visible: a replacement replica under
        // the same name must publish its events after ours.
        if reconcile_group
            && let Some(group_id) = group_id
            && let Err(e) = Box::pin(self.reconcile_group(group_id)).await
        {
            warn!(group_id, error = %e, "post-destroy reconciliation");
        }
        Ok(())
    }
}
