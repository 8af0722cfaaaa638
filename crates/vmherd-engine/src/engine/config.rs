//! Versioned config updates.

use tracing::instrument;

use vmherd_core::config::{VmConfigPatch, VmConfigRecord};
use vmherd_core::error::{EngineError, Result};

use super::Engine;

impl Engine {
    /// Apply a patch to the VM's latest config and persist it as a
    /// new version, rebuilding the kernel cmdline so it reflects the
    /// row's addressing plus the new extras.
    ///
    /// The running subprocess is untouched; a restart is needed for
    /// resource or cmdline changes to take effect.
    #[instrument(skip_all, fields(vm = %name))]
    pub async fn update_vm_config(
        &self,
        name: &str,
        patch: &VmConfigPatch,
    ) -> Result<VmConfigRecord> {
        let mut tx = self
            .inner
            .store
            .begin()
            .await
            .map_err(EngineError::dependency)?;
        let vm = tx
            .vm_get_by_name(name)
            .await
            .map_err(EngineError::dependency)?
            .ok_or_else(|| EngineError::NotFound(format!("vm {:?}", name)))?;
        let current = tx
            .config_get_current(vm.id)
            .await
            .map_err(EngineError::dependency)?
            .ok_or_else(|| {
                EngineError::PreconditionFailed(format!("vm {:?} has no stored config", name))
            })?;

        let mut next = patch.apply(&current.payload);
        self.validate_expose(&next)?;
        next.api = self.resolve_api(&next.api);
        let api = next.api.clone();
        let injected = self.injected_args(&next, &api)?;
        let kernel_cmdline =
            self.build_cmdline(&vm.ip_address, &vm.name, &next.kernel_cmdline, &injected);

        tx.vm_update_spec(
            vm.id,
            &next.runtime,
            next.resources.cpu_cores,
            next.resources.memory_mb,
            &kernel_cmdline,
        )
        .await
        .map_err(EngineError::dependency)?;
        let record = tx
            .config_upsert(vm.id, &next)
            .await
            .map_err(EngineError::dependency)?;
        tx.commit().await.map_err(EngineError::dependency)?;
        Ok(record)
    }
}
