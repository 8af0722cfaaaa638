use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::VmConfigPayload;

/// A deployment: a named VM template with a desired replica count.
/// Replica `i` is the VM named `<name>-<i>`, `i >= 1`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmGroup {
    pub id: i64,
    /// Unique across groups.
    pub name: String,
    /// Complete config template used to instantiate replicas.
    pub config: VmConfigPayload,
    pub replicas: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Deployment status as reported after a reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentView {
    pub desired: u32,
    /// Children currently in `running` status.
    pub ready: u32,
}
