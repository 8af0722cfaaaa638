//! VM creation: the longest effect chain in the engine.
//!
//! Every step that touches the outside world is followed by explicit
//! compensation on failure, so a failed create leaves no row, no IP
//! lease, no seed file, no tap, and no subprocess behind.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

use vmherd_core::config::{CloudInitRecord, Resources, VmConfigPayload};
use vmherd_core::error::{EngineError, Result};
use vmherd_core::events::{VmEvent, VmEventType};
use vmherd_core::manifest::{ManifestSnapshot, resolve_runtime};
use vmherd_core::naming;
use vmherd_core::vm::{VmRecord, VmStatus};

use super::{Engine, VmHandle, remove_file_best_effort, seed_spec_for};
use crate::cid;

/// Inputs to [`Engine::create_vm`].
#[derive(Debug, Clone, Default)]
pub struct CreateVmRequest {
    pub name: String,
    pub cpu_cores: u32,
    pub memory_mb: u32,
    /// Plugin name; optional.
    pub plugin: String,
    /// Runtime tag; resolved against the manifest when empty.
    pub runtime: String,
    pub manifest: Option<ManifestSnapshot>,
    /// Operator extras appended to the kernel cmdline.
    pub kernel_cmdline_extra: String,
    pub api_host: String,
    pub api_port: u16,
    /// Full config override; request fields win over it.
    pub config: Option<VmConfigPayload>,
    pub group_id: Option<i64>,
}

impl Engine {
    /// Provision and boot a new VM, returning its record with
    /// `status = running` and the pid set.
    #[instrument(skip_all, fields(vm = %req.name))]
    pub async fn create_vm(&self, req: CreateVmRequest) -> Result<VmRecord> {
        naming::validate_name(&req.name, "VM")?;
        if req.cpu_cores == 0 {
            return Err(EngineError::InvalidArgument("cpu_cores must be > 0".into()));
        }
        if req.memory_mb == 0 {
            return Err(EngineError::InvalidArgument("memory_mb must be > 0".into()));
        }

        // Effective config: the override (if any) with request fields
        // layered on top.
        let mut payload = req.config.clone().unwrap_or_default();
        if let Some(manifest) = req.manifest.clone() {
            payload.manifest = Some(manifest.normalized()?);
        }
        let requested_runtime = if req.runtime.is_empty() {
            payload.runtime.clone()
        } else {
            req.runtime.clone()
        };
        payload.runtime = resolve_runtime(&requested_runtime, payload.manifest.as_ref())?;
        if !req.plugin.is_empty() {
            payload.plugin = req.plugin.clone();
        }
        payload.resources = Resources {
            cpu_cores: req.cpu_cores,
            memory_mb: req.memory_mb,
        };
        if !req.api_host.is_empty() {
            payload.api.host = req.api_host.clone();
        }
        if req.api_port != 0 {
            payload.api.port = req.api_port;
        }
        if !req.kernel_cmdline_extra.trim().is_empty() {
            payload.kernel_cmdline = req.kernel_cmdline_extra.trim().to_string();
        }

        let mode = payload.effective_network_mode();
        self.validate_expose(&payload)?;

        let api = self.resolve_api(&payload.api);
        payload.api = api.clone();
        let injected = self.injected_args(&payload, &api)?;

        // Reserve identity and leases in one transaction: name
        // uniqueness, IP lease, vsock CID, the row itself.
        let mut vm = {
            let mut tx = self
                .inner
                .store
                .begin()
                .await
                .map_err(EngineError::dependency)?;
            if tx
                .vm_get_by_name(&req.name)
                .await
                .map_err(EngineError::dependency)?
                .is_some()
            {
                return Err(EngineError::AlreadyExists(format!("vm {:?}", req.name)));
            }

            let ip = if mode.needs_ip() {
                tx.lease_next_available()
                    .await
                    .map_err(EngineError::dependency)?
                    .ok_or_else(|| {
                        EngineError::ResourceExhausted("no free IP in managed subnet".into())
                    })?
            } else {
                String::new()
            };

            let used: HashSet<u32> = tx
                .vm_list()
                .await
                .map_err(EngineError::dependency)?
                .iter()
                .map(|v| v.vsock_cid)
                .filter(|c| *c > 0)
                .collect();
            let vsock_cid = cid::first_free(&used).ok_or_else(|| {
                EngineError::ResourceExhausted("no free vsock CID".into())
            })?;

            let row = VmRecord {
                id: 0,
                name: req.name.clone(),
                status: VmStatus::Starting,
                runtime: payload.runtime.clone(),
                mac_address: naming::mac_address(&req.name, &ip),
                vsock_cid,
                cpu_cores: req.cpu_cores,
                memory_mb: req.memory_mb,
                kernel_cmdline: self.build_cmdline(
                    &ip,
                    &req.name,
                    &payload.kernel_cmdline,
                    &injected,
                ),
                group_id: req.group_id,
                pid: None,
                serial_socket: String::new(),
                ip_address: ip,
            };
            let id = tx.vm_create(&row).await.map_err(EngineError::dependency)?;
            if !row.ip_address.is_empty() {
                tx.assign_ip(&row.ip_address, id)
                    .await
                    .map_err(EngineError::dependency)?;
            }
            tx.commit().await.map_err(EngineError::dependency)?;
            VmRecord { id, ..row }
        };

        self.publish_event(VmEvent::lifecycle(
            VmEventType::Created,
            VmStatus::Starting,
            &vm,
        ))
        .await;

        // Persist the applied config version plus the cloud-init
        // record, if the merged documents are non-empty.
        let docs = payload.merged_cloud_init();
        let seed_target = (!docs.is_empty()).then(|| self.seed_image_path(&vm.name));
        let persisted = async {
            let mut tx = self.inner.store.begin().await?;
            tx.config_upsert(vm.id, &payload).await?;
            if let Some(target) = &seed_target {
                tx.cloudinit_upsert(&CloudInitRecord {
                    vm_id: vm.id,
                    docs: docs.clone(),
                    seed_path: target.display().to_string(),
                })
                .await?;
            }
            tx.commit().await
        }
        .await;
        if let Err(e) = persisted {
            self.rollback_db(vm.id, &vm.ip_address).await;
            return Err(EngineError::dependency(e));
        }

        // Seed image.
        let mut seed_path: Option<PathBuf> = None;
        if let Some(target) = &seed_target {
            let spec = seed_spec_for(self.instance_id(vm.id), &vm.name, &docs);
            if let Err(e) = self.inner.seed.build(&spec, target).await {
                remove_file_best_effort(target).await;
                self.rollback_db(vm.id, &vm.ip_address).await;
                return Err(EngineError::dependency(e));
            }
            seed_path = Some(target.clone());
        }

        // Tap device.
        let mut tap = String::new();
        if mode.needs_tap() {
            match self
                .inner
                .network
                .prepare_tap(&vm.name, &vm.mac_address)
                .await
            {
                Ok(name) => tap = name,
                Err(e) => {
                    if let Some(p) = &seed_path {
                        remove_file_best_effort(p).await;
                    }
                    self.rollback_db(vm.id, &vm.ip_address).await;
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

        // Launch on the engine lifetime token: an operator-side
        // cancellation must not orphan the subprocess.
        let instance = match self.inner.launcher.launch(&self.inner.lifetime, &spec).await {
            Ok(instance) => instance,
            Err(e) => {
                self.cleanup_tap_best_effort(&tap).await;
                if let Some(p) = &seed_path {
                    remove_file_best_effort(p).await;
                }
                self.rollback_db(vm.id, &vm.ip_address).await;
                return Err(EngineError::dependency(e));
            }
        };

        // Record the runtime state; a failure here is fatal for the
        // launch, so the subprocess comes back down.
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
            self.rollback_db(vm.id, &vm.ip_address).await;
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

    /// Undo the identity transaction: cloud-init record, row, lease.
    /// Best-effort; a failure here is logged and otherwise swallowed
    /// because the original error is what the caller needs.
    pub(crate) async fn rollback_db(&self, vm_id: i64, ip: &str) {
        let result = async {
            let mut tx = self.inner.store.begin().await?;
            tx.cloudinit_delete(vm_id).await?;
            tx.vm_delete(vm_id).await?;
            tx.release_ip(ip).await?;
            tx.commit().await
        }
        .await;
        if let Err(e) = result {
            error!(vm_id, error = %e, "rollback after failed create did not complete");
        }
    }

    pub(crate) async fn cleanup_tap_best_effort(&self, tap: &str) {
        if let Err(e) = self.inner.network.cleanup_tap(tap).await {
            error!(tap, error = %e, "tap cleanup failed");
        }
    }
}
