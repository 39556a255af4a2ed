use thiserror::Error;

use crate::plugin::{InstanceId, Role};

/// All errors produced by vox-core.
#[derive(Debug, Error)]
pub enum VoxError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("unknown plugin role: {0}")]
    UnknownRole(String),

    #[error("no {role} plugin registered for kind '{kind}'")]
    UnknownKind { role: Role, kind: String },

    #[error("registry is sealed, dispatch has already started")]
    AlreadyStarted,

    #[error("engine is not running")]
    NotRunning,

    #[error("plugin instance not found: {0}")]
    NotFound(InstanceId),

    #[error("plugin error: {0}")]
    Plugin(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl VoxError {
    /// Shorthand for plugin implementations reporting a failure.
    pub fn plugin(msg: impl Into<String>) -> Self {
        Self::Plugin(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, VoxError>;
