//! Assignable-address derivation for the managed subnet.
//!
//! The pool is computed once at engine construction and seeded into
//! the store; leasing happens transactionally through the store so
//! concurrent creates can never double-assign.

use std::net::Ipv4Addr;

use ipnet::{IpNet, Ipv4Net};

use vmherd_core::error::{EngineError, Result};

/// Validate the managed subnet and host address.
///
/// IPv6 subnets and /31–/32 subnets (no assignable hosts) are
/// rejected; the host must lie inside the subnet.
pub fn validate_subnet(subnet: IpNet, host_ip: Ipv4Addr) -> Result<Ipv4Net> {
    let subnet = match subnet {
        IpNet::V4(v4) => v4,
        IpNet::V6(_) => {
            return Err(EngineError::InvalidArgument(format!(
                "subnet {} is IPv6; only IPv4 subnets are managed",
                subnet
            )));
        }
    };
    if subnet.prefix_len() >= 31 {
        return Err(EngineError::InvalidArgument(format!(
            "subnet {} has no assignable addresses",
            subnet
        )));
    }
    if !subnet.contains(&host_ip) {
        return Err(EngineError::InvalidArgument(format!(
            "host ip {} is outside subnet {}",
            host_ip, subnet
        )));
    }
    Ok(subnet)
}

/// All leasable addresses: every host in the subnet minus the
/// network address, the broadcast address, and the host itself.
pub fn derive_pool(subnet: Ipv4Net, host_ip: Ipv4Addr) -> Vec<Ipv4Addr> {
    subnet.hosts().filter(|ip| *ip != host_ip).collect()
}
