//! The lifecycle engine (C8).
//!
//! One `Engine` instance per host. Operations are async and safe to
//! call concurrently: per-name serialization happens through the
//! handle-map mutex plus the store's transactional uniqueness, and the
//! mutex is never held across collaborator I/O.

mod config;
mod create;
mod lifecycle;
mod monitor;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ipnet::{IpNet, Ipv4Net};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use vmherd_core::config::{ApiEndpoint, VmConfigPayload, VmConfigRecord};
use vmherd_core::error::{EngineError, Result};
use vmherd_core::events::{TOPIC_VM_LIFECYCLE, VmEvent};
use vmherd_core::netmode::NetworkMode;
use vmherd_core::vm::VmRecord;
use vmherd_core::{cmdline, naming};

use crate::bus::EventBus;
use crate::ippool;
use crate::launcher::{DiskSpec, Instance, LaunchSpec, Launcher};
use crate::network::NetworkManager;
use crate::seed::{DefaultSeedBuilder, SeedBuilder};
use crate::store::Store;

pub use create::CreateVmRequest;

/// Instance-id prefix used in synthesized cloud-init meta-data.
const DEFAULT_INSTANCE_PREFIX: &str = "vmherd";

/// Engine construction parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Managed IPv4 subnet VMs lease addresses from.
    pub subnet: IpNet,
    /// The host's own address inside `subnet`; used as the guests'
    /// gateway and excluded from the pool.
    pub host_ip: Ipv4Addr,
    /// Where the control API listens, `host:port`.
    pub api_listen_addr: String,
    /// The `host:port` guests are told to reach the control plane at.
    /// Loopback/unspecified hosts fall back to `host_ip`; port 0
    /// falls back to the listen port.
    #[serde(default)]
    pub api_advertise_addr: String,
    /// Absolute directory for serial sockets and seed images.
    pub runtime_dir: PathBuf,
    /// Topic lifecycle events are published on; empty selects the
    /// default.
    #[serde(default)]
    pub event_topic: String,
}

/// In-memory record of a live subprocess plus its ancillary
/// resources.
pub(crate) struct VmHandle {
    pub(crate) instance: Arc<dyn Instance>,
    pub(crate) tap: String,
    pub(crate) seed_path: Option<PathBuf>,
}

/// Handle map plus the names with a start in flight. Guarded by one
/// mutex with short critical sections.
#[derive(Default)]
pub(crate) struct HandleMap {
    pub(crate) live: HashMap<String, VmHandle>,
    pub(crate) starting: HashSet<String>,
}

pub(crate) struct Inner {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) launcher: Arc<dyn Launcher>,
    pub(crate) network: Arc<dyn NetworkManager>,
    pub(crate) bus: Arc<dyn EventBus>,
    pub(crate) seed: Arc<dyn SeedBuilder>,
    pub(crate) subnet: Ipv4Net,
    pub(crate) host_ip: Ipv4Addr,
    pub(crate) advertise: ApiEndpoint,
    pub(crate) runtime_dir: PathBuf,
    pub(crate) topic: String,
    pub(crate) handles: Mutex<HandleMap>,
    pub(crate) group_locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
    pub(crate) lifetime: CancellationToken,
}

/// The orchestrator engine. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Engine {
    pub(crate) inner: Arc<Inner>,
}

impl Engine {
    /// Construct an engine with the default seed builder.
    ///
    /// Validates the subnet/host pair, prepares the runtime
    /// directory, and seeds the IP pool (idempotent). Rows left in
    /// `running` by a previous process are deliberately not touched
    /// here.
    pub async fn new(
        store: Arc<dyn Store>,
        launcher: Arc<dyn Launcher>,
        network: Arc<dyn NetworkManager>,
        bus: Arc<dyn EventBus>,
        config: EngineConfig,
    ) -> Result<Self> {
        Self::with_seed_builder(
            store,
            launcher,
            network,
            bus,
            Arc::new(DefaultSeedBuilder::new()),
            config,
        )
        .await
    }

    pub async fn with_seed_builder(
        store: Arc<dyn Store>,
        launcher: Arc<dyn Launcher>,
        network: Arc<dyn NetworkManager>,
        bus: Arc<dyn EventBus>,
        seed: Arc<dyn SeedBuilder>,
        config: EngineConfig,
    ) -> Result<Self> {
        let subnet = ippool::validate_subnet(config.subnet, config.host_ip)?;
        if !config.runtime_dir.is_absolute() {
            return Err(EngineError::InvalidArgument(format!(
                "runtime dir must be absolute: {}",
                config.runtime_dir.display()
            )));
        }
        std::fs::create_dir_all(config.runtime_dir.join("cloudinit"))
            .map_err(EngineError::dependency)?;

        let advertise = resolve_advertise(
            &config.api_listen_addr,
            &config.api_advertise_addr,
            config.host_ip,
        )?;

        let topic = if config.event_topic.is_empty() {
            TOPIC_VM_LIFECYCLE.to_string()
        } else {
            config.event_topic.clone()
        };

        let engine = Self {
            inner: Arc::new(Inner {
                store,
                launcher,
                network,
                bus,
                seed,
                subnet,
                host_ip: config.host_ip,
                advertise,
                runtime_dir: config.runtime_dir,
                topic,
                handles: Mutex::new(HandleMap::default()),
                group_locks: Mutex::new(HashMap::new()),
                lifetime: CancellationToken::new(),
            }),
        };

        engine.seed_ip_pool().await?;
        Ok(engine)
    }

    async fn seed_ip_pool(&self) -> Result<()> {
        let pool = ippool::derive_pool(self.inner.subnet, self.inner.host_ip);
        let mut tx = self.inner.store.begin().await.map_err(EngineError::dependency)?;
        tx.ensure_pool(&pool).await.map_err(EngineError::dependency)?;
        tx.commit().await.map_err(EngineError::dependency)?;
        Ok(())
    }

    // --- pure reads ---

    pub async fn get_vm(&self, name: &str) -> Result<VmRecord> {
        self.inner
            .store
            .vm_get_by_name(name)
            .await
            .map_err(EngineError::dependency)?
            .ok_or_else(|| EngineError::NotFound(format!("vm {:?}", name)))
    }

    pub async fn list_vms(&self) -> Result<Vec<VmRecord>> {
        self.inner.store.vm_list().await.map_err(EngineError::dependency)
    }

    pub async fn get_vm_config(&self, name: &str) -> Result<VmConfigRecord> {
        let vm = self.get_vm(name).await?;
        self.inner
            .store
            .config_get_current(vm.id)
            .await
            .map_err(EngineError::dependency)?
            .ok_or_else(|| EngineError::NotFound(format!("config for vm {:?}", name)))
    }

    pub async fn get_vm_config_history(
        &self,
        name: &str,
        limit: u32,
    ) -> Result<Vec<VmConfigRecord>> {
        let vm = self.get_vm(name).await?;
        self.inner
            .store
            .config_history(vm.id, limit)
            .await
            .map_err(EngineError::dependency)
    }

    // --- shutdown ---

    /// Cancel the lifetime context, stop every live instance, and
    /// clean up its tap. Errors are joined, not short-circuited; the
    /// store is left alone (rows are corrected on the next explicit
    /// operation).
    pub async fn shutdown(&self) -> Result<()> {
        self.inner.lifetime.cancel();

        let drained: Vec<(String, VmHandle)> = {
            let mut map = self.inner.handles.lock().await;
            map.starting.clear();
            map.live.drain().collect()
        };

        let ctx = CancellationToken::new();
        let mut failures = Vec::new();
        for (name, handle) in drained {
            if let Err(e) = handle.instance.stop(&ctx).await {
                failures.push(format!("stop {}: {}", name, e));
            }
            if let Err(e) = self.inner.network.cleanup_tap(&handle.tap).await {
                failures.push(format!("cleanup tap for {}: {}", name, e));
            }
            if let Some(socket) = handle.instance.api_socket_path() {
                remove_file_best_effort(&socket).await;
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(EngineError::Dependency(anyhow::anyhow!(
                "shutdown: {}",
                failures.join("; ")
            )))
        }
    }

    // --- shared internals ---

    /// Per-VM API endpoint: empty/loopback host falls back to the
    /// engine's advertise host, port 0 to the advertise port.
    pub(crate) fn resolve_api(&self, api: &ApiEndpoint) -> ApiEndpoint {
        let host = if api.host.is_empty() || is_local_placeholder(&api.host) {
            self.inner.advertise.host.clone()
        } else {
            api.host.clone()
        };
        let port = if api.port == 0 {
            self.inner.advertise.port
        } else {
            api.port
        };
        ApiEndpoint { host, port }
    }

    pub(crate) fn serial_socket_path(&self, name: &str) -> PathBuf {
        self.inner.runtime_dir.join(format!("{}.serial", name))
    }

    pub(crate) fn seed_image_path(&self, name: &str) -> PathBuf {
        self.inner
            .runtime_dir
            .join("cloudinit")
            .join(format!("{}-seed.img", name))
    }

    pub(crate) fn instance_id(&self, vm_id: i64) -> String {
        format!("{}-{}", DEFAULT_INSTANCE_PREFIX, vm_id)
    }

    /// Publish on the configured topic; failures are logged, never
    /// surfaced (delivery is best-effort by contract).
    pub(crate) async fn publish_event(&self, event: VmEvent) {
        if let Err(e) = self.inner.bus.publish(&self.inner.topic, &event).await {
            warn!(vm = %event.name, error = %e, "event publish failed");
        }
    }

    pub(crate) async fn group_lock(&self, group_id: i64) -> Arc<Mutex<()>> {
        let mut locks = self.inner.group_locks.lock().await;
        Arc::clone(locks.entry(group_id).or_default())
    }

    /// Kernel args the engine injects for the guest supervisor.
    pub(crate) fn injected_args(
        &self,
        payload: &VmConfigPayload,
        api: &ApiEndpoint,
    ) -> Result<BTreeMap<String, String>> {
        let mut args = BTreeMap::new();
        args.insert("runtime".to_string(), payload.runtime.clone());
        args.insert("api-host".to_string(), api.host.clone());
        args.insert("api-port".to_string(), api.port.to_string());
        args.insert("rootfs-device".to_string(), "vda".to_string());
        args.insert("rootfs-fstype".to_string(), "ext4".to_string());
        if !payload.plugin.is_empty() {
            args.insert("plugin".to_string(), payload.plugin.clone());
        }
        if let Some(manifest) = &payload.manifest {
            args.insert("manifest".to_string(), manifest.encode_for_guest()?);
        }
        Ok(args)
    }

    /// Assemble the row's kernel cmdline from its addressing, the
    /// operator extras, and the injected args.
    pub(crate) fn build_cmdline(
        &self,
        ip: &str,
        hostname: &str,
        extra: &str,
        injected: &BTreeMap<String, String>,
    ) -> String {
        if ip.is_empty() {
            cmdline::assemble("", "", "", hostname, extra, injected)
        } else {
            cmdline::assemble(
                ip,
                &self.inner.host_ip.to_string(),
                &self.inner.subnet.netmask().to_string(),
                hostname,
                extra,
                injected,
            )
        }
    }

    /// Vsock-mode VMs cannot carry non-TCP expose rules.
    pub(crate) fn validate_expose(&self, payload: &VmConfigPayload) -> Result<()> {
        if payload.effective_network_mode() != NetworkMode::Vsock {
            return Ok(());
        }
        for rule in payload.effective_expose() {
            if !rule.is_tcp() {
                return Err(EngineError::PreconditionFailed(format!(
                    "expose {}->{} uses protocol {:?}: vsock routes require TCP",
                    rule.host_port, rule.port, rule.protocol
                )));
            }
        }
        Ok(())
    }

    pub(crate) fn build_launch_spec(
        &self,
        vm: &VmRecord,
        payload: &VmConfigPayload,
        args: BTreeMap<String, String>,
        tap: Option<String>,
        seed_path: Option<&Path>,
    ) -> LaunchSpec {
        let manifest = payload.manifest.as_ref();
        let disks = manifest
            .map(|m| {
                m.disks
                    .iter()
                    .map(|d| DiskSpec {
                        name: d.name.clone(),
                        path: d.path.clone(),
                        checksum: d.checksum.clone(),
                        readonly: d.readonly,
                    })
                    .collect()
            })
            .unwrap_or_default();

        LaunchSpec {
            name: vm.name.clone(),
            cpu_cores: vm.cpu_cores,
            memory_mb: vm.memory_mb,
            kernel_cmdline: vm.kernel_cmdline.clone(),
            kernel_override: payload.kernel_override.clone(),
            tap_device: tap,
            mac_address: vm.mac_address.clone(),
            ip_address: vm.ip_address.clone(),
            gateway: self.inner.host_ip.to_string(),
            netmask: self.inner.subnet.netmask().to_string(),
            vsock_cid: vm.vsock_cid,
            args,
            rootfs: manifest.and_then(|m| none_if_empty(&m.rootfs)),
            rootfs_checksum: manifest.and_then(|m| none_if_empty(&m.rootfs_checksum)),
            initramfs: manifest.and_then(|m| none_if_empty(&m.initramfs)),
            initramfs_checksum: manifest.and_then(|m| none_if_empty(&m.initramfs_checksum)),
            serial_socket: self.serial_socket_path(&vm.name),
            disks,
            seed_disk: seed_path.map(|p| DiskSpec {
                name: "cloud-init".to_string(),
                path: p.display().to_string(),
                checksum: String::new(),
                readonly: true,
            }),
        }
    }
}

fn none_if_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}

/// Placeholder hosts that must not be advertised to guests.
fn is_local_placeholder(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    match host.parse::<IpAddr>() {
        Ok(ip) => ip.is_loopback() || ip.is_unspecified(),
        Err(_) => false,
    }
}

fn split_host_port(addr: &str) -> (String, u16) {
    match addr.rsplit_once(':') {
        Some((host, port)) => (host.to_string(), port.parse().unwrap_or(0)),
        None => (addr.to_string(), 0),
    }
}

/// Engine-level advertise resolution: loopback/unspecified/
/// empty advertise hosts fall back to the host IP, port 0 to the
/// listen port.
fn resolve_advertise(
    listen_addr: &str,
    advertise_addr: &str,
    host_ip: Ipv4Addr,
) -> Result<ApiEndpoint> {
    let (_, listen_port) = split_host_port(listen_addr);
    if listen_port == 0 {
        return Err(EngineError::InvalidArgument(format!(
            "listen address {:?} carries no port",
            listen_addr
        )));
    }

    let (adv_host, adv_port) = split_host_port(advertise_addr);
    let host = if adv_host.is_empty() || is_local_placeholder(&adv_host) {
        host_ip.to_string()
    } else {
        adv_host
    };
    let port = if adv_port == 0 { listen_port } else { adv_port };
    Ok(ApiEndpoint { host, port })
}

pub(crate) async fn remove_file_best_effort(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "file cleanup failed"),
    }
}

/// Seed spec for a VM, from its merged cloud-init documents.
pub(crate) fn seed_spec_for(
    instance_id: String,
    hostname: &str,
    docs: &vmherd_core::cloudinit::CloudInitDocs,
) -> crate::seed::SeedSpec {
    crate::seed::SeedSpec {
        instance_id,
        hostname: naming::sanitize_hostname(hostname),
        user_data: docs.user_data.clone(),
        meta_data: docs.meta_data.clone(),
        network_config: docs.network_config.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_advertise_fallbacks() {
        let host_ip: Ipv4Addr = "192.168.127.1".parse().unwrap();
        let api = resolve_advertise("0.0.0.0:8800", "127.0.0.1:0", host_ip).unwrap();
        assert_eq!(api.host, "192.168.127.1");
        assert_eq!(api.port, 8800);

        let api = resolve_advertise("0.0.0.0:8800", "", host_ip).unwrap();
        assert_eq!(api.host, "192.168.127.1");
        assert_eq!(api.port, 8800);

        let api = resolve_advertise("0.0.0.0:8800", "orchestrator.lan:9000", host_ip).unwrap();
        assert_eq!(api.host, "orchestrator.lan");
        assert_eq!(api.port, 9000);

        let api = resolve_advertise("0.0.0.0:8800", "localhost:9000", host_ip).unwrap();
        assert_eq!(api.host, "192.168.127.1");
        assert_eq!(api.port, 9000);
    }

    #[test]
    fn test_resolve_advertise_requires_listen_port() {
        let host_ip: Ipv4Addr = "10.0.0.1".parse().unwrap();
        assert!(resolve_advertise("0.0.0.0", "", host_ip).is_err());
    }

    #[test]
    fn test_local_placeholder() {
        assert!(is_local_placeholder("127.0.0.1"));
        assert!(is_local_placeholder("::1"));
        assert!(is_local_placeholder("0.0.0.0"));
        assert!(is_local_placeholder("LocalHost"));
        assert!(!is_local_placeholder("10.0.0.7"));
        assert!(!is_local_placeholder("example.com"));
    }
}
