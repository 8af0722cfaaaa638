use serde::{Deserialize, Serialize};

/// Guest network attachment strategy, selected at create/start time.
///
/// Unknown mode strings map to [`NetworkMode::Bridged`], the implicit
/// default of "bridged with host-managed IP".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkMode {
    /// Host leases an IP from the managed subnet; tap on the bridge.
    #[default]
    Bridged,
    /// Guest acquires its own IP; tap still created.
    Dhcp,
    /// Vsock only: no host IP, no tap.
    Vsock,
}

impl NetworkMode {
    /// Parse a mode string; comparison is case-insensitive after
    /// trimming. Unknown or empty input is Bridged.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "dhcp" => Self::Dhcp,
            "vsock" => Self::Vsock,
            _ => Self::Bridged,
        }
    }

    /// Whether the engine leases a host-managed IP for this mode.
    pub fn needs_ip(self) -> bool {
        matches!(self, Self::Bridged)
    }

    /// Whether the engine prepares a tap device for this mode.
    pub fn needs_tap(self) -> bool {
        matches!(self, Self::Bridged | Self::Dhcp)
    }
}

impl std::fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bridged => write!(f, "bridged"),
            Self::Dhcp => write!(f, "dhcp"),
            Self::Vsock => write!(f, "vsock"),
        }
    }
}
