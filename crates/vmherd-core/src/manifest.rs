use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use crate::cloudinit::CloudInitDocs;
use crate::error::{EngineError, Result};

/// An additional disk a plugin manifest attaches to its VMs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestDisk {
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub checksum: String,
    #[serde(default)]
    pub readonly: bool,
}

/// A guest port exposed through the host.
///
/// Carried as data by the engine; route synthesis happens elsewhere.
/// Vsock-mode VMs only support TCP rules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExposeRule {
    pub host_port: u16,
    pub port: u16,
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub protocol: String,
}

impl ExposeRule {
    /// Protocol comparison is trim- and case-insensitive; empty means
    /// TCP.
    pub fn is_tcp(&self) -> bool {
        let p = self.protocol.trim();
        p.is_empty() || p.eq_ignore_ascii_case("tcp")
    }
}

/// Snapshot of a plugin manifest, persisted alongside the VM config.
///
/// The engine reads it through accessors and tolerates fields it does
/// not know about, so manifests from newer plugin toolchains survive a
/// store round trip unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManifestSnapshot {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub runtime: String,
    /// Network mode string, resolved through [`crate::netmode`].
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub network: String,
    /// Root filesystem image, forwarded to the launcher.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub rootfs: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub rootfs_checksum: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub initramfs: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub initramfs_checksum: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disks: Vec<ManifestDisk>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_init: Option<CloudInitDocs>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expose: Vec<ExposeRule>,
    /// Unknown manifest fields, preserved verbatim.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ManifestSnapshot {
    /// Trim the identity fields. A manifest with neither name nor
    /// runtime is rejected.
    pub fn normalized(mut self) -> Result<Self> {
        self.name = self.name.trim().to_string();
        self.runtime = self.runtime.trim().to_string();
        if self.name.is_empty() && self.runtime.is_empty() {
            return Err(EngineError::InvalidArgument(
                "manifest carries neither name nor runtime".into(),
            ));
        }
        Ok(self)
    }

    /// Base64-encoded JSON form injected into the guest kernel args.
    pub fn encode_for_guest(&self) -> Result<String> {
        let json = serde_json::to_vec(self)
            .map_err(|e| EngineError::Internal(format!("manifest encode: {}", e)))?;
        Ok(BASE64.encode(json))
    }
}

/// Resolve the effective runtime tag with the precedence
/// explicit request > manifest.runtime > manifest.name.
///
/// A request that names a runtime conflicting with the manifest's is
/// rejected rather than silently overridden.
pub fn resolve_runtime(requested: &str, manifest: Option<&ManifestSnapshot>) -> Result<String> {
    let requested = requested.trim();
    let from_manifest = manifest
        .map(|m| {
            if m.runtime.is_empty() {
                m.name.as_str()
            } else {
                m.runtime.as_str()
            }
        })
        .unwrap_or("");

    match (requested.is_empty(), from_manifest.is_empty()) {
        (false, false) if requested != from_manifest => Err(EngineError::InvalidArgument(format!(
            "requested runtime {:?} conflicts with manifest runtime {:?}",
            requested, from_manifest
        ))),
        (false, _) => Ok(requested.to_string()),
        (true, false) => Ok(from_manifest.to_string()),
        (true, true) => Err(EngineError::InvalidArgument(
            "no runtime: pass one explicitly or provide a manifest".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(name: &str, runtime: &str) -> ManifestSnapshot {
        ManifestSnapshot {
            name: name.into(),
            runtime: runtime.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_resolve_runtime_precedence() {
        let m = manifest("browser", "chromium");
        assert_eq!(resolve_runtime("chromium", Some(&m)).unwrap(), "chromium");
        assert_eq!(resolve_runtime("", Some(&m)).unwrap(), "chromium");
        // Falls back to the manifest name when runtime is empty.
        let m = manifest("browser", "");
        assert_eq!(resolve_runtime("", Some(&m)).unwrap(), "browser");
        assert_eq!(resolve_runtime("other", None).unwrap(), "other");
    }

    #[test]
    fn test_resolve_runtime_conflict() {
        let m = manifest("browser", "browser");
        let err = resolve_runtime("python", Some(&m)).unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));
    }

    #[test]
    fn test_resolve_runtime_missing() {
        assert!(resolve_runtime("", None).is_err());
    }

    #[test]
    fn test_normalized_rejects_empty_identity() {
        assert!(ManifestSnapshot::default().normalized().is_err());
        assert!(manifest(" browser ", "").normalized().is_ok());
    }

    #[test]
    fn test_unknown_fields_survive_roundtrip() {
        let json = r#"{"name":"browser","runtime":"browser","assets":{"rootfs":"u24.img"}}"#;
        let m: ManifestSnapshot = serde_json::from_str(json).unwrap();
        assert_eq!(m.extra["assets"]["rootfs"], "u24.img");
        let back = serde_json::to_value(&m).unwrap();
        assert_eq!(back["assets"]["rootfs"], "u24.img");
    }

    #[test]
    fn test_expose_rule_protocol() {
        let mut rule = ExposeRule {
            host_port: 9000,
            port: 9000,
            mode: "vsock".into(),
            protocol: "udp".into(),
        };
        assert!(!rule.is_tcp());
        rule.protocol = " TCP ".into();
        assert!(rule.is_tcp());
        rule.protocol.clear();
        assert!(rule.is_tcp());
    }

    #[test]
    fn test_encode_for_guest_is_base64_json() {
        let m = manifest("browser", "browser");
        let encoded = m.encode_for_guest().unwrap();
        let decoded = BASE64.decode(encoded).unwrap();
        let back: ManifestSnapshot = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(back.name, "browser");
    }
}
