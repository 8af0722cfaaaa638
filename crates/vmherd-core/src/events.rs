use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::vm::{VmRecord, VmStatus};

/// Default topic lifecycle events are published on.
pub const TOPIC_VM_LIFECYCLE: &str = "vm.lifecycle";

/// Lifecycle event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VmEventType {
    #[serde(rename = "VM_CREATED")]
    Created,
    #[serde(rename = "VM_RUNNING")]
    Running,
    #[serde(rename = "VM_STOPPED")]
    Stopped,
    #[serde(rename = "VM_CRASHED")]
    Crashed,
    #[serde(rename = "VM_DELETED")]
    Deleted,
    #[serde(rename = "VM_LOG")]
    Log,
}

impl std::fmt::Display for VmEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "VM_CREATED",
            Self::Running => "VM_RUNNING",
            Self::Stopped => "VM_STOPPED",
            Self::Crashed => "VM_CRASHED",
            Self::Deleted => "VM_DELETED",
            Self::Log => "VM_LOG",
        };
        write!(f, "{}", s)
    }
}

/// A lifecycle (or guest log) event published on the event bus.
///
/// Delivery is best-effort; consumers must not assume completeness.
/// Per VM name, events arrive in causal order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmEvent {
    #[serde(rename = "type")]
    pub event_type: VmEventType,
    pub name: String,
    pub status: VmStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// For VM_LOG: which stream the line came from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<String>,
    /// For VM_LOG: the log line itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<String>,
}

impl VmEvent {
    /// Event for a lifecycle edge of the given VM row.
    pub fn lifecycle(event_type: VmEventType, status: VmStatus, vm: &VmRecord) -> Self {
        Self {
            event_type,
            name: vm.name.clone(),
            status,
            ip_address: (!vm.ip_address.is_empty()).then(|| vm.ip_address.clone()),
            mac_address: (!vm.mac_address.is_empty()).then(|| vm.mac_address.clone()),
            pid: vm.pid,
            timestamp: Utc::now(),
            message: None,
            stream: None,
            line: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> VmRecord {
        VmRecord {
            id: 1,
            name: "web-1".into(),
            status: VmStatus::Running,
            runtime: "browser".into(),
            ip_address: "10.1.0.2".into(),
            mac_address: "02:aa:bb:cc:dd:ee".into(),
            vsock_cid: 3,
            cpu_cores: 1,
            memory_mb: 512,
            kernel_cmdline: String::new(),
            group_id: None,
            pid: Some(99),
            serial_socket: String::new(),
        }
    }

    #[test]
    fn test_event_type_wire_names() {
        let json = serde_json::to_string(&VmEventType::Crashed).unwrap();
        assert_eq!(json, "\"VM_CRASHED\"");
        assert_eq!(VmEventType::Deleted.to_string(), "VM_DELETED");
    }

    #[test]
    fn test_lifecycle_event_carries_row_fields() {
        let ev = VmEvent::lifecycle(VmEventType::Running, VmStatus::Running, &record());
        assert_eq!(ev.name, "web-1");
        assert_eq!(ev.ip_address.as_deref(), Some("10.1.0.2"));
        assert_eq!(ev.pid, Some(99));
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "VM_RUNNING");
        assert_eq!(json["status"], "running");
        // Optional fields are dropped, not nulled.
        assert!(json.get("line").is_none());
    }

    #[test]
    fn test_empty_ip_omitted() {
        let mut rec = record();
        rec.ip_address.clear();
        let ev = VmEvent::lifecycle(VmEventType::Created, VmStatus::Starting, &rec);
        assert!(ev.ip_address.is_none());
    }
}
