use sha1::{Digest, Sha1};

use crate::error::{EngineError, Result};

/// Validate a VM or group name: lowercase alphanumeric + hyphens,
/// 1-63 chars, no leading/trailing hyphen.
pub fn validate_name(name: &str, kind: &str) -> Result<()> {
    if name.is_empty() || name.len() > 63 {
        return Err(EngineError::InvalidArgument(format!(
            "{} name must be 1-63 characters, got {}",
            kind,
            name.len()
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(EngineError::InvalidArgument(format!(
            "{} name must be lowercase alphanumeric + hyphens: {:?}",
            kind, name
        )));
    }
    if name.starts_with('-') || name.ends_with('-') {
        return Err(EngineError::InvalidArgument(format!(
            "{} name must not start or end with a hyphen: {:?}",
            kind, name
        )));
    }
    Ok(())
}

/// Sanitize a string into a hostname: lowercase `[a-z0-9-]`, other
/// characters dropped. Empty after sanitization becomes "vm".
pub fn sanitize_hostname(raw: &str) -> String {
    let s: String = raw
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-')
        .collect();
    if s.is_empty() { "vm".to_string() } else { s }
}

/// Deterministic MAC address from a VM name and its leased IP
/// (empty string when the VM has no host-managed IP).
///
/// First 6 bytes of `SHA1(name "|" ip)`, first byte forced to 0x02
/// (locally-administered unicast).
pub fn mac_address(name: &str, ip: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(name.as_bytes());
    hasher.update(b"|");
    hasher.update(ip.as_bytes());
    let digest = hasher.finalize();
    format!(
        "02:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        digest[1], digest[2], digest[3], digest[4], digest[5]
    )
}

/// Name of replica `index` (1-based) in a deployment group.
pub fn replica_name(group: &str, index: u32) -> String {
    format!("{}-{}", group, index)
}

/// Recover the replica index from a child VM name, e.g.
/// `demo-3` in group `demo` -> 3. Returns None for names that do not
/// carry the `<group>-<index>` shape.
pub fn parse_replica_index(group: &str, vm_name: &str) -> Option<u32> {
    let suffix = vm_name.strip_prefix(group)?.strip_prefix('-')?;
    suffix.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name_valid() {
        assert!(validate_name("web", "VM").is_ok());
        assert!(validate_name("demo-1", "VM").is_ok());
        assert!(validate_name("a", "group").is_ok());
    }

    #[test]
    fn test_validate_name_invalid() {
        assert!(validate_name("", "VM").is_err());
        assert!(validate_name("UPPER", "VM").is_err());
        assert!(validate_name("-leading", "VM").is_err());
        assert!(validate_name("trailing-", "VM").is_err());
        assert!(validate_name("has space", "VM").is_err());
        assert!(validate_name(&"a".repeat(64), "VM").is_err());
    }

    #[test]
    fn test_sanitize_hostname() {
        assert_eq!(sanitize_hostname("Vm_A!"), "vma");
        assert_eq!(sanitize_hostname("web-1"), "web-1");
        assert_eq!(sanitize_hostname("_!?"), "vm");
        assert_eq!(sanitize_hostname(""), "vm");
    }

    #[test]
    fn test_mac_address_shape() {
        let mac = mac_address("vm-test-1", "192.168.127.2");
        assert!(mac.starts_with("02:"));
        assert_eq!(mac.len(), 17);
        assert_eq!(mac.split(':').count(), 6);
    }

    #[test]
    fn test_mac_address_deterministic() {
        let a = mac_address("vm-test-1", "192.168.127.2");
        let b = mac_address("vm-test-1", "192.168.127.2");
        assert_eq!(a, b);
        // Different inputs diverge.
        assert_ne!(a, mac_address("vm-test-2", "192.168.127.2"));
        assert_ne!(a, mac_address("vm-test-1", "192.168.127.3"));
    }

    #[test]
    fn test_replica_names() {
        assert_eq!(replica_name("demo", 1), "demo-1");
        assert_eq!(parse_replica_index("demo", "demo-3"), Some(3));
        assert_eq!(parse_replica_index("demo", "demo-"), None);
        assert_eq!(parse_replica_index("demo", "other-3"), None);
        // Group names containing hyphens still parse.
        assert_eq!(parse_replica_index("my-app", "my-app-12"), Some(12));
    }
}
