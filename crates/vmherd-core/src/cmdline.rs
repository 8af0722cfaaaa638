use std::collections::BTreeMap;

use crate::naming::sanitize_hostname;

/// Fixed base tokens every guest kernel receives.
const BASE_TOKENS: [&str; 3] = ["console=ttyS0", "reboot=k", "panic=1"];

/// Assemble a deterministic kernel command line.
///
/// Token order:
///   1. the fixed base tokens,
///   2. the initramfs-style `ip=` argument (omitted when the VM has
///      no host-managed IP),
///   3. the trimmed operator extras split on whitespace,
///   4. injected key/value pairs sorted lexicographically by key
///      (bare key when the value is empty).
///
/// Sorting the injected pairs makes the output byte-for-byte stable
/// regardless of how the caller's map iterates.
pub fn assemble(
    ip: &str,
    gateway: &str,
    netmask: &str,
    hostname: &str,
    extra: &str,
    injected: &BTreeMap<String, String>,
) -> String {
    let mut tokens: Vec<String> = BASE_TOKENS.iter().map(|t| t.to_string()).collect();

    if !ip.is_empty() {
        tokens.push(format!(
            "ip={}::{}:{}:{}:eth0:off",
            ip,
            gateway,
            netmask,
            sanitize_hostname(hostname)
        ));
    }

    for token in extra.split_whitespace() {
        tokens.push(token.to_string());
    }

    for (key, value) in injected {
        if value.is_empty() {
            tokens.push(key.clone());
        } else {
            tokens.push(format!("{}={}", key, value));
        }
    }

    tokens.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kv(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_assemble_full() {
        let injected = kv(&[
            ("runtime", "browser"),
            ("api-host", "10.0.0.1"),
            ("api-port", "7777"),
            ("plugin", "browser"),
            ("rootfs-device", "vda"),
            ("rootfs-fstype", "ext4"),
        ]);
        let line = assemble(
            "10.0.0.5",
            "10.0.0.1",
            "255.255.255.0",
            "Vm_A!",
            "  quiet   splash ",
            &injected,
        );
        assert_eq!(
            line,
            "console=ttyS0 reboot=k panic=1 \
             ip=10.0.0.5::10.0.0.1:255.255.255.0:vma:eth0:off \
             quiet splash \
             api-host=10.0.0.1 api-port=7777 plugin=browser \
             rootfs-device=vda rootfs-fstype=ext4 runtime=browser"
        );
    }

    #[test]
    fn test_assemble_empty_extra_no_trailing_whitespace() {
        let line = assemble("10.0.0.5", "10.0.0.1", "255.255.255.0", "vm-a", "", &kv(&[]));
        assert_eq!(
            line,
            "console=ttyS0 reboot=k panic=1 ip=10.0.0.5::10.0.0.1:255.255.255.0:vm-a:eth0:off"
        );
        assert_eq!(line, line.trim());
    }

    #[test]
    fn test_assemble_without_host_ip_omits_ip_token() {
        let line = assemble("", "", "", "vm-a", "quiet", &kv(&[]));
        assert_eq!(line, "console=ttyS0 reboot=k panic=1 quiet");
        assert!(!line.contains("ip="));
    }

    #[test]
    fn test_bare_key_for_empty_value() {
        let line = assemble("", "", "", "vm", "", &kv(&[("nomodeset", "")]));
        assert!(line.ends_with(" nomodeset"));
    }

    #[test]
    fn test_assemble_deterministic_across_insert_order() {
        let a = kv(&[("b", "2"), ("a", "1"), ("c", "3")]);
        let mut b = BTreeMap::new();
        b.insert("c".to_string(), "3".to_string());
        b.insert("a".to_string(), "1".to_string());
        b.insert("b".to_string(), "2".to_string());
        assert_eq!(
            assemble("", "", "", "vm", "", &a),
            assemble("", "", "", "vm", "", &b)
        );
    }
}
