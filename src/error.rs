//! Error taxonomy for the build-and-dispatch pipeline.
//!
//! Validation findings are never errors here - they travel as
//! [`CompilerMessage`](crate::model::CompilerMessage) entries inside a failed
//! [`Build`](crate::model::Build). This enum covers the failures that abort a
//! handler: bad arguments, missing preconditions, persistence and dispatch
//! integrity problems. Persistence and collaborator failures are retriable by
//! the message transport; argument errors are not.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// A required identifier was null or empty at the boundary.
    #[error("missing required argument: {0}")]
    MissingArgument(&'static str),

    /// No build project exists for the specification.
    #[error("build project not found for specification '{0}'")]
    BuildProjectNotFound(String),

    /// Job-tracking mode could not resolve the parent job.
    #[error("parent job '{0}' not found")]
    ParentJobNotFound(String),

    /// Fewer child jobs were created than batches were computed.
    #[error("Only {created} child jobs from {expected} were created")]
    DispatchIntegrity { created: usize, expected: usize },

    /// A repository save returned a non-success status.
    #[error("failed to persist {entity}: status {status}")]
    Persistence { entity: &'static str, status: u16 },

    /// Compilation produced an empty binary for the specification.
    #[error("compiled assembly for specification '{0}' is empty")]
    EmptyAssembly(String),

    #[error("cache operation failed: {0}")]
    Cache(String),

    #[error("queue send failed: {0}")]
    Queue(String),

    /// A collaborator call failed for a reason outside this crate.
    #[error("collaborator call failed: {0}")]
    Collaborator(String),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}
