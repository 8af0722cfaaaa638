//! Deployments (C9): a named VM template plus a desired replica
//! count, kept converged by the reconciler.
//!
//! Reconciliation serializes per group: concurrent scale
//! requests, monitor-triggered passes, and deletes all queue on the
//! group's mutex. Scale-down removes the highest-indexed children;
//! scale-up fills index holes from 1 upward so a crashed `demo-2`
//! comes back as `demo-2`.

use std::collections::HashSet;

use chrono::Utc;
use tracing::{error, info, instrument};

use vmherd_core::config::VmConfigPayload;
use vmherd_core::error::{EngineError, Result};
use vmherd_core::group::{DeploymentView, VmGroup};
use vmherd_core::manifest::resolve_runtime;
use vmherd_core::naming::{parse_replica_index, replica_name, validate_name};
use vmherd_core::vm::{VmRecord, VmStatus};

use crate::engine::{CreateVmRequest, Engine};

/// Inputs to [`Engine::create_deployment`].
#[derive(Debug, Clone, Default)]
pub struct CreateDeploymentRequest {
    pub name: String,
    pub replicas: u32,
    /// Complete config template for every replica.
    pub config: VmConfigPayload,
}

impl Engine {
    /// Register a deployment and bring up its replicas.
    #[instrument(skip_all, fields(deployment = %req.name))]
    pub async fn create_deployment(
        &self,
        req: CreateDeploymentRequest,
    ) -> Result<(VmGroup, DeploymentView)> {
        validate_name(&req.name, "deployment")?;
        let mut config = req.config.clone();
        if config.resources.cpu_cores == 0 || config.resources.memory_mb == 0 {
            return Err(EngineError::InvalidArgument(
                "deployment template needs positive cpu_cores and memory_mb".into(),
            ));
        }
        if let Some(manifest) = config.manifest.take() {
            config.manifest = Some(manifest.normalized()?);
        }
        config.runtime = resolve_runtime(&config.runtime, config.manifest.as_ref())?;

        let group = {
            let mut tx = self
                .inner
                .store
                .begin()
                .await
                .map_err(EngineError::dependency)?;
            if tx
                .group_get_by_name(&req.name)
                .await
                .map_err(EngineError::dependency)?
                .is_some()
            {
                return Err(EngineError::AlreadyExists(format!(
                    "deployment {:?}",
                    req.name
                )));
            }
            let now = Utc::now();
            let row = VmGroup {
                id: 0,
                name: req.name.clone(),
                config,
                replicas: req.replicas,
                created_at: now,
                updated_at: now,
            };
            let id = tx.group_create(&row).await.map_err(EngineError::dependency)?;
            tx.commit().await.map_err(EngineError::dependency)?;
            VmGroup { id, ..row }
        };

        let view = self.reconcile_group(group.id).await?;
        Ok((group, view))
    }

    /// Change the desired replica count and converge.
    #[instrument(skip_all, fields(deployment = %name, replicas))]
    pub async fn scale_deployment(&self, name: &str, replicas: u32) -> Result<DeploymentView> {
        let group = self.require_group(name).await?;
        let mut tx = self
            .inner
            .store
            .begin()
            .await
            .map_err(EngineError::dependency)?;
        tx.group_update_replicas(group.id, replicas)
            .await
            .map_err(EngineError::dependency)?;
        tx.commit().await.map_err(EngineError::dependency)?;

        self.reconcile_group(group.id).await
    }

    /// Destroy every child VM, then remove the group row.
    #[instrument(skip_all, fields(deployment = %name))]
    pub async fn delete_deployment(&self, name: &str) -> Result<()> {
        let group = self.require_group(name).await?;
        let lock = self.group_lock(group.id).await;
        let _guard = lock.lock().await;

        let children = self
            .inner
            .store
            .vm_list_by_group(group.id)
            .await
            .map_err(EngineError::dependency)?;
        for child in &children {
            self.destroy_vm(&child.name, false).await?;
        }

        let mut tx = self
            .inner
            .store
            .begin()
            .await
            .map_err(EngineError::dependency)?;
        tx.group_delete(group.id)
            .await
            .map_err(EngineError::dependency)?;
        tx.commit().await.map_err(EngineError::dependency)?;

        self.inner.group_locks.lock().await.remove(&group.id);
        info!(children = children.len(), "deployment deleted");
        Ok(())
    }

    pub async fn get_deployment(&self, name: &str) -> Result<(VmGroup, DeploymentView)> {
        let group = self.require_group(name).await?;
        let children = self
            .inner
            .store
            .vm_list_by_group(group.id)
            .await
            .map_err(EngineError::dependency)?;
        let view = DeploymentView {
            desired: group.replicas,
            ready: count_ready(&children),
        };
        Ok((group, view))
    }

    pub async fn list_deployments(&self) -> Result<Vec<VmGroup>> {
        self.inner
            .store
            .group_list()
            .await
            .map_err(EngineError::dependency)
    }

    async fn require_group(&self, name: &str) -> Result<VmGroup> {
        self.inner
            .store
            .group_get_by_name(name)
            .await
            .map_err(EngineError::dependency)?
            .ok_or_else(|| EngineError::NotFound(format!("deployment {:?}", name)))
    }

    /// Converge one group: destroy surplus children (highest index
    /// first), create missing ones (lowest free index first).
    pub(crate) async fn reconcile_group(&self, group_id: i64) -> Result<DeploymentView> {
        let lock = self.group_lock(group_id).await;
        let _guard = lock.lock().await;

        let Some(group) = self
            .inner
            .store
            .group_get_by_id(group_id)
            .await
            .map_err(EngineError::dependency)?
        else {
            // Deleted while this pass was queued; nothing to converge.
            return Ok(DeploymentView {
                desired: 0,
                ready: 0,
            });
        };

        // Dead members (crashed, or stopped out from under us) are
        // destroyed first: that frees their replica index so the fill
        // pass below can bring the name back.
        let mut children = Vec::new();
        for vm in self
            .inner
            .store
            .vm_list_by_group(group_id)
            .await
            .map_err(EngineError::dependency)?
        {
            match vm.status {
                VmStatus::Running | VmStatus::Starting => children.push(vm),
                VmStatus::Stopped | VmStatus::Crashed | VmStatus::Pending => {
                    self.destroy_vm(&vm.name, false).await?;
                }
            }
        }
        let current = children.len() as u32;
        let desired = group.replicas;

        if current > desired {
            let mut indexed: Vec<(u32, &VmRecord)> = children
                .iter()
                .map(|vm| {
                    (
                        parse_replica_index(&group.name, &vm.name).unwrap_or(0),
                        vm,
                    )
                })
                .collect();
            indexed.sort_by(|a, b| b.0.cmp(&a.0));
            for (_, vm) in indexed.into_iter().take((current - desired) as usize) {
                // Group reconciliation stays off here: we ARE the
                // reconciliation.
                self.destroy_vm(&vm.name, false).await?;
            }
        } else if desired > current {
            let used: HashSet<u32> = children
                .iter()
                .filter_map(|vm| parse_replica_index(&group.name, &vm.name))
                .collect();
            let mut remaining = desired - current;
            let mut index = 1;
            while remaining > 0 {
                if used.contains(&index) {
                    index += 1;
                    continue;
                }
                let req = CreateVmRequest {
                    name: replica_name(&group.name, index),
                    cpu_cores: group.config.resources.cpu_cores,
                    memory_mb: group.config.resources.memory_mb,
                    runtime: group.config.runtime.clone(),
                    config: Some(group.config.clone()),
                    group_id: Some(group.id),
                    ..Default::default()
                };
                if let Err(e) = self.create_vm(req).await {
                    error!(
                        deployment = %group.name,
                        replica = index,
                        error = %e,
                        "replica create failed"
                    );
                    break;
                }
                remaining -= 1;
                index += 1;
            }
        }

        let children = self
            .inner
            .store
            .vm_list_by_group(group_id)
            .await
            .map_err(EngineError::dependency)?;
        Ok(DeploymentView {
            desired,
            ready: count_ready(&children),
        })
    }
}

fn count_ready(children: &[VmRecord]) -> u32 {
    children
        .iter()
        .filter(|vm| vm.status == VmStatus::Running)
        .count() as u32
}
