//! Per-VM subprocess monitor.
//!
//! One task per launch, blocked on the instance's exit. On exit it
//! detaches the handle (only if the map still points at this exact
//! instance), corrects the database of record, releases host
//! resources, publishes the terminal event, and finally reconciles
//! the VM's deployment group if it had one.

use std::sync::Arc;

use tracing::{error, info};

use vmherd_core::events::{VmEvent, VmEventType};
use vmherd_core::vm::VmStatus;

use super::{Engine, remove_file_best_effort};
use crate::launcher::{ExitOutcome, Instance};

impl Engine {
    pub(crate) fn spawn_monitor(&self, name: String, instance: Arc<dyn Instance>) {
        let engine = self.clone();
        tokio::spawn(async move {
            let outcome = instance.wait().await;
            engine.observe_exit(&name, instance, outcome).await;
        });
    }

    async fn observe_exit(
        &self,
        name: &str,
        instance: Arc<dyn Instance>,
        outcome: ExitOutcome,
    ) {
        // A Stop or Destroy that already detached the handle owns the
        // cleanup; an older instance under the same name must not
        // touch a newer one's resources.
        let handle = {
            let mut map = self.inner.handles.lock().await;
            match map.live.get(name) {
                Some(h) if Arc::ptr_eq(&h.instance, &instance) => map.live.remove(name),
                _ => return,
            }
        };
        let Some(handle) = handle else { return };

        let (status, event_type, message) = match &outcome {
            ExitOutcome::Clean => (VmStatus::Stopped, VmEventType::Stopped, None),
            ExitOutcome::Crashed(msg) => {
                (VmStatus::Crashed, VmEventType::Crashed, Some(msg.clone()))
            }
        };
        info!(vm = %name, status = %status, "subprocess exited");

        // Correct the database of record on a background context; the
        // commit must land before the event or any reconciliation.
        let row = match self.inner.store.vm_get_by_name(name).await {
            Ok(row) => row,
            Err(e) => {
                error!(vm = %name, error = %e, "loading row after exit");
                None
            }
        };
        if let Some(vm) = &row {
            let updated = async {
                let mut tx = self.inner.store.begin().await?;
                tx.vm_update_runtime_state(vm.id, status, None).await?;
                tx.commit().await
            }
            .await;
            if let Err(e) = updated {
                error!(vm = %name, error = %e, "recording exit status");
            }
        }

        self.cleanup_tap_best_effort(&handle.tap).await;
        if let Some(socket) = handle.instance.api_socket_path() {
            remove_file_best_effort(&socket).await;
        }
        if let Some(seed) = &handle.seed_path {
            remove_file_best_effort(seed).await;
        }

        if let Some(vm) = &row {
            let mut exited = vm.clone();
            exited.status = status;
            exited.pid = None;
            let mut event = VmEvent::lifecycle(event_type, status, &exited);
            if let Some(message) = message {
                event = event.with_message(message);
            }
            self.publish_event(event).await;

            if let Some(group_id) = vm.group_id
                && let Err(e) = self.reconcile_group(group_id).await
            {
                error!(vm = %name, group_id, error = %e, "post-exit reconciliation");
            }
        }
    }
}
