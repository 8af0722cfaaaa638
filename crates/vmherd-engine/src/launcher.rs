//! Hypervisor launcher contract.
//!
//! The engine never spawns hypervisor processes itself; a launcher
//! implementation (Firecracker, Cloud Hypervisor, a test stub) turns a
//! [`LaunchSpec`] into a live [`Instance`]. Launches run on the
//! engine's lifetime token, not the request context, so an impatient
//! caller cannot orphan a half-started subprocess.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// A disk attached to the guest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiskSpec {
    pub name: String,
    pub path: String,
    pub checksum: String,
    pub readonly: bool,
}

/// Everything a launcher needs to boot one microVM.
#[derive(Debug, Clone, Default)]
pub struct LaunchSpec {
    pub name: String,
    pub cpu_cores: u32,
    pub memory_mb: u32,
    pub kernel_cmdline: String,
    /// Alternate kernel image; honoring it is launcher-dependent.
    pub kernel_override: Option<String>,
    /// Host tap device, when the network mode uses one.
    pub tap_device: Option<String>,
    pub mac_address: String,
    /// Empty when the guest manages its own addressing.
    pub ip_address: String,
    pub gateway: String,
    pub netmask: String,
    pub vsock_cid: u32,
    /// Key/value args for the guest supervisor; also re-emitted into
    /// the kernel cmdline, sorted by key.
    pub args: BTreeMap<String, String>,
    pub rootfs: Option<String>,
    pub rootfs_checksum: Option<String>,
    pub initramfs: Option<String>,
    pub initramfs_checksum: Option<String>,
    pub serial_socket: PathBuf,
    /// Additional disks from the plugin manifest.
    pub disks: Vec<DiskSpec>,
    /// Cloud-init seed, mounted readonly.
    pub seed_disk: Option<DiskSpec>,
}

/// How a subprocess exited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Zero exit status.
    Clean,
    /// Non-zero exit or launcher-level failure, with detail.
    Crashed(String),
}

/// A running hypervisor subprocess.
#[async_trait]
pub trait Instance: Send + Sync {
    fn name(&self) -> &str;
    fn pid(&self) -> u32;
    /// The hypervisor's API socket, when it exposes one. The engine
    /// removes the file on stop/destroy.
    fn api_socket_path(&self) -> Option<PathBuf>;
    /// Ask the subprocess to stop. Cancellable via `ctx`; the engine
    /// treats failures as best-effort.
    async fn stop(&self, ctx: &CancellationToken) -> Result<()>;
    /// Resolves exactly once, when the subprocess exits.
    async fn wait(&self) -> ExitOutcome;
}

/// Starts hypervisor subprocesses.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Boot a microVM. `ctx` is the engine's lifetime token: when it
    /// is cancelled the launch must abort instead of leaving a
    /// half-configured subprocess behind.
    async fn launch(&self, ctx: &CancellationToken, spec: &LaunchSpec)
    -> Result<Arc<dyn Instance>>;
}
