//! Error taxonomy per spec §7: transient I/O, terminal per-call, conflict,
//! validation, and config/invariant. Components map their failures into this
//! enum; `services/api` maps it onward into HTTP status codes the way the
//! teacher's `ApiError` maps `anyhow::Error`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("transient I/O failure in {component}: {detail}")]
    Transient { component: &'static str, detail: String },

    #[error("terminal call failure: {detail}")]
    Terminal { detail: String },

    #[error("conflict: {detail}")]
    Conflict { detail: String },

    #[error("validation failed: {detail}")]
    Validation { detail: String },

    #[error("config/invariant violation: {detail}")]
    ConfigInvariant { detail: String },

    #[error("conversation {0} was already billed")]
    AlreadyBilled(uuid::Uuid),

    #[error("conversation {0} not found")]
    ConversationNotFound(uuid::Uuid),

    #[error("no orchestrator is live for call {0}")]
    NoLiveOrchestrator(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;
