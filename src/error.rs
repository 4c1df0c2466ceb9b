//! Error taxonomy for the engine.
//!
//! Storage backends report failures through `EngineError::Storage`; the
//! remaining variants carry enough context for callers to decide between
//! retrying (`ConcurrencyConflict`), surfacing (`Handler`), and giving up
//! (`DefinitionNotFound`, `InstanceNotFound`).

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("process definition not found: {0}")]
    DefinitionNotFound(String),

    #[error("process instance not found: {0}")]
    InstanceNotFound(Uuid),

    #[error("invalid process definition: {0}")]
    InvalidDefinition(String),

    #[error("handler failed at element '{element_id}': {source}")]
    Handler {
        element_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("concurrency conflict on {entity} {id}")]
    ConcurrencyConflict { entity: &'static str, id: Uuid },

    #[error("operation cancelled")]
    Cancelled,

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl EngineError {
    /// Returns true for errors a caller may resolve by re-reading and retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::ConcurrencyConflict { .. })
    }
}
