//! # Calculation Build-and-Dispatch Pipeline
//!
//! Turns a funding specification's analyst-authored calculation scripts and
//! dataset-field bindings into a compiled program, then fans execution for
//! the specification's scoped providers out into bounded, trackable batches.
//!
//! ## Architecture
//!
//! The pipeline runs in phases:
//!
//! 1. **Source generation** - [`codegen`] renders calculations plus dataset
//!    bindings into deterministic source units
//! 2. **Aggregate validation** - [`aggregate`] checks every aggregate call
//!    against the allow-list and rejects nested/self aggregation
//! 3. **Compilation** - [`compile`] turns source units into a [`model::Build`]
//!    with ordered diagnostics and an optional binary
//! 4. **Lifecycle** - [`store`] owns the per-specification build project and
//!    recompiles it when calculations or relationships change
//! 5. **Dispatch** - [`dispatch`] partitions the scoped-provider list and
//!    submits one tracked child job (or queue message) per batch
//!
//! [`preview`] is the ad-hoc variant: a single edited calculation compiled
//! against the full set without persisting a build.
//!
//! ## Quick start
//!
//! ```rust
//! use calc_engine::codegen::CodeGenerator;
//! use calc_engine::compile::{CompilerBackend, ScriptCompiler};
//!
//! let files = CodeGenerator::generate(&[], &[]);
//! let build = ScriptCompiler::new().compile(&files);
//! assert!(build.success);
//! ```

pub mod aggregate;
pub mod clients;
pub mod codegen;
pub mod compile;
pub mod dispatch;
pub mod error;
pub mod model;
pub mod preview;
pub mod store;
pub mod token;

// Re-export the main pipeline API
pub use compile::{CompilerBackend, ScriptCompiler};
pub use dispatch::{AllocationTrigger, DispatchOutcome, DispatcherSettings, PartitionDispatcher};
pub use error::{EngineError, Result};
pub use model::{Build, BuildProject, Calculation, CompilerMessage, Severity};
pub use preview::{PreviewCompiler, PreviewOutcome, PreviewRequest};
pub use store::BuildProjectStore;
