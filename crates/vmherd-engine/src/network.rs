//! Host network attachment contract.

use anyhow::Result;
use async_trait::async_trait;

/// Prepares and tears down tap devices on the host bridge.
///
/// Both operations are idempotent on the happy path; `cleanup_tap`
/// with an empty name is a no-op, which lets callers clean up
/// unconditionally.
#[async_trait]
pub trait NetworkManager: Send + Sync {
    /// Create (or reuse) a tap for the VM and attach it to the
    /// bridge. Returns the tap device name.
    async fn prepare_tap(&self, vm_name: &str, mac: &str) -> Result<String>;

    async fn cleanup_tap(&self, tap_name: &str) -> Result<()>;
}
