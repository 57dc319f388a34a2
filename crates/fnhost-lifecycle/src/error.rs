//! Lifecycle controller error types.

use thiserror::Error;

use crate::state::HostState;

/// Errors surfaced by lifecycle operations.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("invalid host state transition: {from} -> {to}")]
    InvalidTransition { from: HostState, to: HostState },

    #[error("host build was canceled")]
    Canceled,

    /// A joined build failed; the message is the original error.
    #[error("joined host build failed: {0}")]
    JoinedBuildFailed(String),

    #[error("host shutdown requested, no new host will be started")]
    ShuttingDown,

    #[error("host build failed: {0}")]
    Build(#[source] anyhow::Error),

    #[error("host start failed: {0}")]
    Start(#[source] anyhow::Error),
}

pub type LifecycleResult<T> = Result<T, LifecycleError>;
