//! # Collaborator Seams
//!
//! Trait objects for every external service the pipeline talks to: job
//! tracking, queue transport, cache, provider results, and the persistence
//! collaborators for build projects and calculations. Production wiring
//! supplies HTTP/queue-backed implementations; tests supply in-memory
//! doubles.

use crate::error::Result;
use crate::model::{
    BuildProject, Calculation, CompilerOptions, DatasetField, Job, JobCreateModel, JobLogUpdate,
    SourceFile, SourceFileKind,
};
use async_trait::async_trait;
use std::collections::HashMap;

/// Outcome of a repository save. Mirrors HTTP-status-returning persistence
/// services: any non-ok status is surfaced, not swallowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveStatus {
    Ok,
    Failed(u16),
}

impl SaveStatus {
    pub fn is_ok(self) -> bool {
        matches!(self, SaveStatus::Ok)
    }
}

/// Job-tracking service.
#[async_trait]
pub trait JobsClient: Send + Sync {
    async fn get_job(&self, job_id: &str) -> Result<Option<Job>>;

    /// Create a batch of jobs in one call, returning those actually created.
    async fn create_jobs(&self, jobs: Vec<JobCreateModel>) -> Result<Vec<Job>>;

    async fn add_job_log(&self, job_id: &str, update: JobLogUpdate) -> Result<()>;
}

/// Queue transport for direct (non-job-tracked) dispatch.
#[async_trait]
pub trait QueueSender: Send + Sync {
    async fn send(
        &self,
        queue: &str,
        payload: serde_json::Value,
        properties: HashMap<String, String>,
    ) -> Result<()>;
}

/// Shared cache. All entries here are derived, rebuildable state - never the
/// source of truth.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn key_exists(&self, key: &str) -> Result<bool>;

    async fn list_length(&self, key: &str) -> Result<usize>;

    async fn list_range(&self, key: &str, start: usize, count: usize) -> Result<Vec<String>>;

    async fn remove_by_pattern(&self, pattern: &str) -> Result<()>;

    async fn get_fields(&self, key: &str) -> Result<Option<Vec<DatasetField>>>;

    async fn set_fields(&self, key: &str, fields: &[DatasetField]) -> Result<()>;
}

/// Provider-results service: the authority on which providers are in scope
/// for a specification.
#[async_trait]
pub trait ProviderResultsClient: Send + Sync {
    async fn scoped_provider_ids(&self, specification_id: &str) -> Result<Vec<String>>;

    /// Rebuild the cached provider summaries for a specification.
    async fn populate_provider_summaries(&self, specification_id: &str) -> Result<()>;
}

/// Build-project persistence.
#[async_trait]
pub trait BuildProjectRepository: Send + Sync {
    async fn build_project_for_specification(
        &self,
        specification_id: &str,
    ) -> Result<Option<BuildProject>>;

    async fn save(&self, build_project: &BuildProject) -> Result<SaveStatus>;
}

/// Calculation persistence and generated-source storage.
#[async_trait]
pub trait CalculationsRepository: Send + Sync {
    /// Every calculation bound to the specification; empty when none exist.
    async fn calculations_for_specification(
        &self,
        specification_id: &str,
    ) -> Result<Vec<Calculation>>;

    async fn compiler_options(&self, specification_id: &str) -> Result<CompilerOptions>;

    async fn save_source_files(
        &self,
        specification_id: &str,
        files: &[SourceFile],
        kind: SourceFileKind,
    ) -> Result<()>;
}

/// Dataset-relationship schema service: supplies the aggregable-field
/// allow-list on a cache miss.
#[async_trait]
pub trait DatasetFieldsClient: Send + Sync {
    async fn relationship_fields(&self, specification_id: &str) -> Result<Vec<DatasetField>>;
}

/// Specification service, used to signal that a new allocation run is in
/// flight.
#[async_trait]
pub trait SpecificationsClient: Send + Sync {
    async fn touch_calculation_last_updated(&self, specification_id: &str) -> Result<()>;
}
