use thiserror::Error;

/// Error taxonomy for engine operations.
///
/// Kinds are classified by effect on the caller, not by which
/// collaborator produced them. Collaborator failures (launcher,
/// network manager, seed builder, store) are wrapped in
/// [`EngineError::Dependency`] after the engine has compensated any
/// partial effects.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed request: empty name, non-positive resources,
    /// inconsistent plugin/runtime.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Name or group-name collision.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// VM or group not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// IP pool empty or no free vsock CID.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Operation requires state that is absent or conflicting:
    /// missing config on start, network mode vs expose protocol.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// A collaborator (launcher, network manager, seed builder,
    /// store) returned an error.
    #[error("dependency failure: {0}")]
    Dependency(#[source] anyhow::Error),

    /// Inconsistent internal state detected.
    #[error("internal: {0}")]
    Internal(String),
}

impl EngineError {
    /// Wrap a collaborator error, preserving its chain.
    pub fn dependency<E: Into<anyhow::Error>>(err: E) -> Self {
        Self::Dependency(err.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
