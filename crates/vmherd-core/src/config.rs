use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cloudinit::CloudInitDocs;
use crate::manifest::{ExposeRule, ManifestSnapshot};
use crate::netmode::NetworkMode;

/// Compute resources applied to a VM.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    pub cpu_cores: u32,
    pub memory_mb: u32,
}

/// The control-plane endpoint advertised to the guest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiEndpoint {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
}

/// Self-describing VM configuration blob, persisted with a version
/// history. One payload fully describes how to (re)launch a VM.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VmConfigPayload {
    #[serde(default)]
    pub plugin: String,
    #[serde(default)]
    pub runtime: String,
    #[serde(default)]
    pub resources: Resources,
    #[serde(default)]
    pub api: ApiEndpoint,
    /// Operator extras appended to the assembled kernel cmdline.
    #[serde(default)]
    pub kernel_cmdline: String,
    /// Alternate kernel image, forwarded to the launcher verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel_override: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest: Option<ManifestSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_init: Option<CloudInitDocs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkMode>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expose: Vec<ExposeRule>,
}

impl VmConfigPayload {
    /// Effective network mode: config override > manifest.network >
    /// bridged default.
    pub fn effective_network_mode(&self) -> NetworkMode {
        if let Some(mode) = self.network {
            return mode;
        }
        match &self.manifest {
            Some(m) if !m.network.trim().is_empty() => NetworkMode::parse(&m.network),
            _ => NetworkMode::default(),
        }
    }

    /// Cloud-init documents after overlaying the config's docs on the
    /// manifest's.
    pub fn merged_cloud_init(&self) -> CloudInitDocs {
        let base = self
            .manifest
            .as_ref()
            .and_then(|m| m.cloud_init.clone())
            .unwrap_or_default();
        match &self.cloud_init {
            Some(over) => CloudInitDocs::merged(&base, over),
            None => base,
        }
    }

    /// Expose rules: the config's own list wins wholesale when
    /// non-empty, otherwise the manifest's.
    pub fn effective_expose(&self) -> &[ExposeRule] {
        if !self.expose.is_empty() {
            return &self.expose;
        }
        match &self.manifest {
            Some(m) => &m.expose,
            None => &[],
        }
    }
}

/// Optional overrides applied to a clone of the current config by
/// `update_vm_config`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct VmConfigPatch {
    #[serde(default)]
    pub runtime: Option<String>,
    #[serde(default)]
    pub cpu_cores: Option<u32>,
    #[serde(default)]
    pub memory_mb: Option<u32>,
    /// Replaced with the trimmed value; an empty string clears the
    /// extras.
    #[serde(default)]
    pub kernel_cmdline: Option<String>,
    #[serde(default)]
    pub api_host: Option<String>,
    #[serde(default)]
    pub api_port: Option<u16>,
    #[serde(default)]
    pub network: Option<NetworkMode>,
    #[serde(default)]
    pub cloud_init: Option<CloudInitDocs>,
    #[serde(default)]
    pub expose: Option<Vec<ExposeRule>>,
    #[serde(default)]
    pub manifest: Option<ManifestSnapshot>,
}

impl VmConfigPatch {
    /// Apply the patch to a clone of `base`.
    ///
    /// Scalars replace only when meaningful (non-empty string,
    /// positive number); the structured fields replace wholesale when
    /// provided.
    pub fn apply(&self, base: &VmConfigPayload) -> VmConfigPayload {
        let mut next = base.clone();
        if let Some(runtime) = &self.runtime
            && !runtime.trim().is_empty()
        {
            next.runtime = runtime.trim().to_string();
        }
        if let Some(cpu) = self.cpu_cores
            && cpu > 0
        {
            next.resources.cpu_cores = cpu;
        }
        if let Some(mem) = self.memory_mb
            && mem > 0
        {
            next.resources.memory_mb = mem;
        }
        if let Some(cmdline) = &self.kernel_cmdline {
            next.kernel_cmdline = cmdline.trim().to_string();
        }
        if let Some(host) = &self.api_host
            && !host.is_empty()
        {
            next.api.host = host.clone();
        }
        if let Some(port) = self.api_port
            && port != 0
        {
            next.api.port = port;
        }
        if let Some(network) = self.network {
            next.network = Some(network);
        }
        if let Some(cloud_init) = &self.cloud_init {
            next.cloud_init = Some(cloud_init.clone());
        }
        if let Some(expose) = &self.expose {
            next.expose = expose.clone();
        }
        if let Some(manifest) = &self.manifest {
            next.manifest = Some(manifest.clone());
        }
        next
    }
}

/// One persisted version of a VM's config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmConfigRecord {
    pub vm_id: i64,
    /// Starts at 1, incremented on every upsert.
    pub version: u32,
    pub payload: VmConfigPayload,
    pub created_at: DateTime<Utc>,
}

/// Per-VM cloud-init bookkeeping: the documents plus where the built
/// seed image lives on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudInitRecord {
    pub vm_id: i64,
    pub docs: CloudInitDocs,
    pub seed_path: String,
}
