use thiserror::Error;

/// Engine error taxonomy. Executors convert most of these into a textual
/// failure on [`crate::core::executor::ExecOutcome`] so the supervisor can
/// always complete its terminal write; variants surface directly only from
/// the engine facade and the store.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid parameter envelope: {0}")]
    Parameter(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("execution timed out after {0} seconds and was terminated")]
    Timeout(u64),

    #[error("container runtime is not installed or not responding")]
    SandboxUnavailable,

    #[error("execution was cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Storage(#[from] rusqlite::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    pub fn not_found(entity: &'static str, id: i64) -> Self {
        Self::NotFound { entity, id }
    }
}
