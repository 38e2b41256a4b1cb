//! # Pipeline Data Model
//!
//! Core types shared across the calculation build-and-dispatch pipeline:
//! calculations and their versions, the per-specification build project,
//! compile results and diagnostics, dataset relationship bindings, and the
//! job/queue models used when fanning allocation runs out into batches.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Queue that receives per-batch allocation messages when job tracking is disabled.
pub const ALLOCATION_RESULTS_QUEUE: &str = "calc-events-instruct-generate-allocations";

/// Job definition for a plain allocation run.
pub const ALLOCATION_JOB_DEFINITION: &str = "CreateInstructAllocationJob";

/// Job definition for an allocation run that also drives calculation aggregation.
pub const ALLOCATION_AGGREGATION_JOB_DEFINITION: &str =
    "CreateInstructGenerateAggregationsAllocationJob";

/// Job definition given to each child batch job.
pub const ALLOCATION_BATCH_JOB_DEFINITION: &str = "GenerateAllocationResultsJob";

/// Message/user property carrying the specification id on trigger messages.
pub const SPECIFICATION_ID_PROPERTY: &str = "specification-id";

/// Message/user property carrying the parent job id in job-tracking mode.
pub const JOB_ID_PROPERTY: &str = "jobId";

/// Child-job property: 0-based index of the provider-summary partition.
pub const PARTITION_INDEX_PROPERTY: &str = "provider-summaries-partition-index";

/// Child-job property: 1-based batch number.
pub const BATCH_NUMBER_PROPERTY: &str = "batch-number";

/// Child-job property: comma-joined names of calculations being aggregated.
pub const CALCULATIONS_TO_AGGREGATE_PROPERTY: &str = "calculations-to-aggregate";

/// Cache key for the scoped provider-summary list of a specification.
pub fn scoped_provider_cache_key(specification_id: &str) -> String {
    format!("scoped-provider-summaries:{specification_id}")
}

/// Cache key pattern matching every aggregation entry of a specification.
pub fn calculation_aggregations_cache_pattern(specification_id: &str) -> String {
    format!("calculation-aggregations:{specification_id}*")
}

/// Cache key for the cached aggregable-field list of a specification.
pub fn dataset_fields_cache_key(specification_id: &str) -> String {
    format!("dataset-relationship-fields:{specification_id}")
}

/// One analyst-authored calculation script bound to a specification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Calculation {
    pub id: String,
    /// Display name chosen by the author; may contain arbitrary symbols.
    pub name: String,
    /// Sanitized identifier used in generated source.
    pub source_code_name: String,
    pub specification_id: String,
    pub current: CalculationVersion,
}

/// The current (immutable once published) version of a calculation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalculationVersion {
    pub source_code: String,
    pub version: u32,
}

/// Per-specification artifact binding calculations, dataset relationships
/// and the latest compile result. Created lazily on first need.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildProject {
    pub id: String,
    pub specification_id: String,
    pub dataset_relationships: Vec<DatasetRelationship>,
    pub build: Build,
}

impl BuildProject {
    pub fn new(specification_id: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            specification_id: specification_id.into(),
            dataset_relationships: Vec::new(),
            build: Build::default(),
        }
    }

    /// Whether a relationship with this name is already attached.
    pub fn has_relationship(&self, name: &str) -> bool {
        self.dataset_relationships
            .iter()
            .any(|r| r.name.eq_ignore_ascii_case(name))
    }
}

/// A dataset relationship attached to a specification, carrying the schema
/// fields calculations may reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetRelationship {
    pub id: String,
    pub name: String,
    pub fields: Vec<DatasetField>,
}

/// One field of a dataset relationship schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetField {
    pub name: String,
    pub source_name: String,
    pub source_relationship_name: String,
    /// Only aggregable fields may appear as aggregate-function arguments.
    pub is_aggregable: bool,
}

/// One compilation outcome. Immutable snapshot, replaced wholesale on each
/// compile and never patched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Build {
    pub success: bool,
    pub source_files: Vec<SourceFile>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assembly: Option<Vec<u8>>,
    pub compiler_messages: Vec<CompilerMessage>,
}

impl Build {
    /// A failed build carrying only diagnostics.
    pub fn failed(messages: Vec<CompilerMessage>) -> Self {
        Self {
            success: false,
            compiler_messages: messages,
            ..Self::default()
        }
    }

    pub fn error_count(&self) -> usize {
        self.compiler_messages
            .iter()
            .filter(|m| m.severity == Severity::Error)
            .count()
    }
}

/// A generated source unit handed to the compiler backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    pub file_name: String,
    pub source_code: String,
}

/// Whether persisted generated source belongs to a release build or an
/// ad-hoc preview compile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceFileKind {
    Release,
    Preview,
}

/// Severity of a compiler diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Hidden,
    Info,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Hidden => write!(f, "hidden"),
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
        }
    }
}

/// One diagnostic produced by validation or compilation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompilerMessage {
    pub severity: Severity,
    pub message: String,
    pub location: SourceLocation,
}

impl CompilerMessage {
    pub fn error(message: impl Into<String>, location: SourceLocation) -> Self {
        Self {
            severity: Severity::Error,
            message: message.into(),
            location,
        }
    }
}

/// Source position of a diagnostic. `start_line` is 0-based; anything
/// presented to a human adds 1.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceLocation {
    /// Id or name of the calculation (or file) owning the line.
    pub owner: String,
    pub start_line: usize,
}

impl SourceLocation {
    pub fn new(owner: impl Into<String>, start_line: usize) -> Self {
        Self {
            owner: owner.into(),
            start_line,
        }
    }

    /// 1-based line for logs and user-facing output.
    pub fn display_line(&self) -> usize {
        self.start_line + 1
    }
}

/// Compiler options persisted per specification; the preview compiler merges
/// these into its second compile pass.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CompilerOptions {
    /// When false, implicit numeric conversions are warnings instead of errors.
    pub option_strict: bool,
    /// Compatibility code path kept for specifications created before the
    /// current generator.
    pub use_legacy_code: bool,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        Self {
            option_strict: true,
            use_legacy_code: false,
        }
    }
}

/// Lifecycle status of a tracked job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunningStatus {
    Queued,
    InProgress,
    Completed,
}

/// Terminal outcome of a tracked job, set once it completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompletionStatus {
    Succeeded,
    Failed,
    Cancelled,
    Superseded,
    TimedOut,
}

/// What raised a job: the entity it acts on plus a human-readable reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    pub entity_id: String,
    pub entity_type: String,
    pub message: String,
}

/// A tracked unit of work. The parent represents a whole allocation run,
/// children represent individual provider batches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub parent_job_id: Option<String>,
    pub job_definition_id: String,
    pub specification_id: String,
    pub invoker_user_id: String,
    pub invoker_user_display_name: String,
    pub correlation_id: String,
    pub running_status: RunningStatus,
    pub completion_status: Option<CompletionStatus>,
    pub trigger: Trigger,
    pub properties: HashMap<String, String>,
}

impl Job {
    /// A completed or superseded parent must not be re-dispatched.
    pub fn is_finished(&self) -> bool {
        self.running_status == RunningStatus::Completed || self.completion_status.is_some()
    }
}

/// Request to create one child job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobCreateModel {
    pub parent_job_id: Option<String>,
    pub job_definition_id: String,
    pub specification_id: String,
    pub invoker_user_id: String,
    pub invoker_user_display_name: String,
    pub correlation_id: String,
    pub trigger: Trigger,
    pub properties: HashMap<String, String>,
}

/// One log entry appended to a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobLogUpdate {
    pub completed_successfully: bool,
    pub outcome: String,
}
