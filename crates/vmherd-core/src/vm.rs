use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// VM lifecycle status.
///
/// `Pending` is never persisted: it exists only as an event status for
/// "created but not yet scheduled". Rows are inserted as `Starting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmStatus {
    Pending,
    Starting,
    Running,
    Stopped,
    Crashed,
}

impl std::fmt::Display for VmStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Crashed => write!(f, "crashed"),
        }
    }
}

/// Validate that a status transition is allowed.
pub fn validate_transition(from: VmStatus, to: VmStatus) -> Result<()> {
    let valid = matches!(
        (from, to),
        // Launch completes
        (VmStatus::Starting, VmStatus::Running)
        // Launch fails before the subprocess comes up
        | (VmStatus::Starting, VmStatus::Stopped)
        // Operator stop or clean subprocess exit
        | (VmStatus::Running, VmStatus::Stopped)
        // Non-zero subprocess exit
        | (VmStatus::Running, VmStatus::Crashed)
        // Restart path; no re-allocation of IP, MAC, CID
        | (VmStatus::Stopped, VmStatus::Starting)
        | (VmStatus::Crashed, VmStatus::Starting)
    );

    if valid {
        Ok(())
    } else {
        Err(EngineError::Internal(format!(
            "invalid status transition: {} -> {}",
            from, to
        )))
    }
}

/// Persisted VM row. The store is the source of truth; the engine's
/// in-memory handles are soft state layered on top.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmRecord {
    /// Monotonically assigned by the store on insert.
    pub id: i64,
    /// Unique, non-empty, DNS-style after sanitization.
    pub name: String,
    pub status: VmStatus,
    /// Plugin/runtime tag, e.g. "browser".
    pub runtime: String,
    /// Dotted quad, or empty when the network mode does not use a
    /// host-managed IP.
    pub ip_address: String,
    /// Locally-administered unicast MAC, derived from name + IP.
    pub mac_address: String,
    /// Unique across live VMs, >= 3. 0 means unassigned.
    pub vsock_cid: u32,
    pub cpu_cores: u32,
    pub memory_mb: u32,
    pub kernel_cmdline: String,
    /// Deployment group this VM belongs to, if any.
    #[serde(default)]
    pub group_id: Option<i64>,
    /// Present only while running.
    #[serde(default)]
    pub pid: Option<u32>,
    /// Path to the hypervisor's serial Unix socket.
    #[serde(default)]
    pub serial_socket: String,
}
