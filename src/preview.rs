//! # Preview Compiler
//!
//! Ad-hoc, non-persisting compile of a single edited calculation against the
//! full calculation set of its specification. Used by the authoring surface
//! to give analysts diagnostics before they save.
//!
//! Missing preconditions (calculation, build project) come back as outcomes
//! with a human-readable message, never as errors: a preview request for
//! something that does not exist is a caller problem, not a system fault.

use crate::aggregate::AggregateAnalyzer;
use crate::clients::{BuildProjectRepository, CalculationsRepository};
use crate::codegen::CodeGenerator;
use crate::compile::{CompilerBackend, ScriptCompiler};
use crate::error::Result;
use crate::model::{
    Build, Calculation, CompilerMessage, Severity, SourceFileKind, SourceLocation,
};
use crate::token;
use std::sync::Arc;

/// A request to preview-compile one edited calculation.
#[derive(Debug, Clone)]
pub struct PreviewRequest {
    pub specification_id: String,
    pub calculation_id: String,
    /// The edited source, replacing the calculation's current version.
    pub source_code: String,
}

/// How a preview request was handled.
#[derive(Debug)]
pub enum PreviewOutcome {
    /// The request compiled; the build carries any diagnostics.
    Compiled(Build),
    /// The request itself was invalid.
    BadRequest(String),
    /// A required entity was missing.
    PreconditionFailed(String),
}

pub struct PreviewCompiler {
    calculations: Arc<dyn CalculationsRepository>,
    build_projects: Arc<dyn BuildProjectRepository>,
    analyzer: AggregateAnalyzer,
}

impl PreviewCompiler {
    pub fn new(
        calculations: Arc<dyn CalculationsRepository>,
        build_projects: Arc<dyn BuildProjectRepository>,
        analyzer: AggregateAnalyzer,
    ) -> Self {
        Self {
            calculations,
            build_projects,
            analyzer,
        }
    }

    pub async fn compile(&self, request: &PreviewRequest) -> Result<PreviewOutcome> {
        if request.specification_id.trim().is_empty() {
            tracing::warn!("preview rejected: empty specification id");
            return Ok(PreviewOutcome::BadRequest(
                "A specification id is required".to_string(),
            ));
        }
        if request.calculation_id.trim().is_empty() {
            tracing::warn!(
                specification_id = request.specification_id.as_str(),
                "preview rejected: empty calculation id"
            );
            return Ok(PreviewOutcome::BadRequest(
                "A calculation id is required".to_string(),
            ));
        }

        let mut calculations = self
            .calculations
            .calculations_for_specification(&request.specification_id)
            .await?;

        let Some(target) = calculations
            .iter()
            .find(|c| c.id == request.calculation_id)
            .cloned()
        else {
            let message = format!(
                "Calculation '{}' was not found for specification '{}'",
                request.calculation_id, request.specification_id
            );
            tracing::warn!(
                specification_id = request.specification_id.as_str(),
                calculation_id = request.calculation_id.as_str(),
                "{message}"
            );
            return Ok(PreviewOutcome::PreconditionFailed(message));
        };

        let Some(project) = self
            .build_projects
            .build_project_for_specification(&request.specification_id)
            .await?
        else {
            let message = format!(
                "Build project was not found for specification '{}'",
                request.specification_id
            );
            tracing::error!(
                specification_id = request.specification_id.as_str(),
                calculation_id = request.calculation_id.as_str(),
                "{message}"
            );
            return Ok(PreviewOutcome::PreconditionFailed(message));
        };

        // Merge the candidate source over the calculation being edited.
        for calc in &mut calculations {
            if calc.id == target.id {
                calc.current.source_code = request.source_code.clone();
            }
        }

        let mut validation = self.self_reference_check(&target, &request.source_code);
        validation.extend(
            self.analyzer
                .validate(&request.specification_id, &calculations)
                .await?,
        );

        if !validation.is_empty() {
            self.log_diagnostics(request, &target, &validation);
            return Ok(PreviewOutcome::Compiled(Build::failed(validation)));
        }

        let files = CodeGenerator::generate(&calculations, &project.dataset_relationships);

        // Compile with default options and again with the specification's
        // persisted options so both code paths stay exercised.
        let default_build = ScriptCompiler::new().compile(&files);
        let options = self
            .calculations
            .compiler_options(&request.specification_id)
            .await?;
        let build = ScriptCompiler::with_options(options).compile(&files);

        if default_build.success != build.success {
            tracing::error!(
                specification_id = request.specification_id.as_str(),
                calculation_id = target.id.as_str(),
                default_success = default_build.success,
                options_success = build.success,
                "default and options-merged compiles disagree"
            );
        }

        self.log_diagnostics(request, &target, &build.compiler_messages);

        if build.success {
            self.calculations
                .save_source_files(
                    &request.specification_id,
                    &build.source_files,
                    SourceFileKind::Preview,
                )
                .await?;
        }

        Ok(PreviewOutcome::Compiled(build))
    }

    /// A calculation whose source contains its own identifier as a
    /// standalone token calls itself. Token-boundary matching: `HoraceX`
    /// never triggers for `Horace`.
    fn self_reference_check(&self, target: &Calculation, source: &str) -> Vec<CompilerMessage> {
        let self_call = token::contains_identifier(source, &target.source_code_name)
            || token::contains_identifier(source, &target.name);
        if !self_call {
            return Vec::new();
        }

        vec![CompilerMessage::error(
            format!(
                "Circular reference detected - Calculation '{}' calls itself",
                target.name
            ),
            SourceLocation::new(target.name.clone(), 0),
        )]
    }

    fn log_diagnostics(
        &self,
        request: &PreviewRequest,
        target: &Calculation,
        messages: &[CompilerMessage],
    ) {
        for message in messages {
            let line = message.location.display_line();
            match message.severity {
                Severity::Hidden => {}
                Severity::Info => tracing::debug!(
                    specification_id = request.specification_id.as_str(),
                    calculation_id = target.id.as_str(),
                    calculation_name = target.name.as_str(),
                    line,
                    "{}",
                    message.message
                ),
                Severity::Warning => tracing::warn!(
                    specification_id = request.specification_id.as_str(),
                    calculation_id = target.id.as_str(),
                    calculation_name = target.name.as_str(),
                    line,
                    "{}",
                    message.message
                ),
                Severity::Error => tracing::error!(
                    specification_id = request.specification_id.as_str(),
                    calculation_id = target.id.as_str(),
                    calculation_name = target.name.as_str(),
                    line,
                    "{}",
                    message.message
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{Cache, DatasetFieldsClient, SaveStatus};
    use crate::codegen::sanitize_identifier;
    use crate::error::Result;
    use crate::model::{
        BuildProject, CalculationVersion, CompilerOptions, DatasetField, DatasetRelationship,
        SourceFile,
    };
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeCalculations {
        calculations: Mutex<Vec<Calculation>>,
        options: Mutex<CompilerOptions>,
        saved: Mutex<Vec<(Vec<SourceFile>, SourceFileKind)>>,
    }

    #[async_trait]
    impl CalculationsRepository for FakeCalculations {
        async fn calculations_for_specification(&self, _: &str) -> Result<Vec<Calculation>> {
            Ok(self.calculations.lock().unwrap().clone())
        }

        async fn compiler_options(&self, _: &str) -> Result<CompilerOptions> {
            Ok(*self.options.lock().unwrap())
        }

        async fn save_source_files(
            &self,
            _: &str,
            files: &[SourceFile],
            kind: SourceFileKind,
        ) -> Result<()> {
            self.saved.lock().unwrap().push((files.to_vec(), kind));
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeBuildProjects {
        projects: Mutex<HashMap<String, BuildProject>>,
    }

    #[async_trait]
    impl BuildProjectRepository for FakeBuildProjects {
        async fn build_project_for_specification(
            &self,
            specification_id: &str,
        ) -> Result<Option<BuildProject>> {
            Ok(self.projects.lock().unwrap().get(specification_id).cloned())
        }

        async fn save(&self, build_project: &BuildProject) -> Result<SaveStatus> {
            self.projects
                .lock()
                .unwrap()
                .insert(build_project.specification_id.clone(), build_project.clone());
            Ok(SaveStatus::Ok)
        }
    }

    #[derive(Default)]
    struct FakeCache;

    #[async_trait]
    impl Cache for FakeCache {
        async fn key_exists(&self, _: &str) -> Result<bool> {
            Ok(false)
        }
        async fn list_length(&self, _: &str) -> Result<usize> {
            Ok(0)
        }
        async fn list_range(&self, _: &str, _: usize, _: usize) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
        async fn remove_by_pattern(&self, _: &str) -> Result<()> {
            Ok(())
        }
        async fn get_fields(&self, _: &str) -> Result<Option<Vec<DatasetField>>> {
            Ok(None)
        }
        async fn set_fields(&self, _: &str, _: &[DatasetField]) -> Result<()> {
            Ok(())
        }
    }

    struct FakeFields {
        fields: Vec<DatasetField>,
    }

    #[async_trait]
    impl DatasetFieldsClient for FakeFields {
        async fn relationship_fields(&self, _: &str) -> Result<Vec<DatasetField>> {
            Ok(self.fields.clone())
        }
    }

    fn calc(id: &str, name: &str, source: &str) -> Calculation {
        Calculation {
            id: id.into(),
            name: name.into(),
            source_code_name: sanitize_identifier(name),
            specification_id: "spec-1".into(),
            current: CalculationVersion {
                source_code: source.into(),
                version: 1,
            },
        }
    }

    fn pupils() -> DatasetField {
        DatasetField {
            name: "Pupils".into(),
            source_name: "PupilCount".into(),
            source_relationship_name: "Census".into(),
            is_aggregable: true,
        }
    }

    struct Harness {
        calculations: Arc<FakeCalculations>,
        compiler: PreviewCompiler,
    }

    fn harness(calcs: Vec<Calculation>) -> Harness {
        let calculations = Arc::new(FakeCalculations::default());
        *calculations.calculations.lock().unwrap() = calcs;

        let build_projects = Arc::new(FakeBuildProjects::default());
        let mut project = BuildProject::new("spec-1");
        project.dataset_relationships.push(DatasetRelationship {
            id: "rel-1".into(),
            name: "Census".into(),
            fields: vec![pupils()],
        });
        build_projects
            .projects
            .lock()
            .unwrap()
            .insert("spec-1".into(), project);

        let analyzer = AggregateAnalyzer::new(
            Arc::new(FakeCache),
            Arc::new(FakeFields {
                fields: vec![pupils()],
            }),
        );

        let compiler = PreviewCompiler::new(
            Arc::clone(&calculations) as Arc<dyn CalculationsRepository>,
            build_projects,
            analyzer,
        );

        Harness {
            calculations,
            compiler,
        }
    }

    fn request(calculation_id: &str, source: &str) -> PreviewRequest {
        PreviewRequest {
            specification_id: "spec-1".into(),
            calculation_id: calculation_id.into(),
            source_code: source.into(),
        }
    }

    #[tokio::test]
    async fn blank_ids_are_bad_requests() {
        let h = harness(vec![calc("a", "Horace", "Return 1")]);

        let outcome = h
            .compiler
            .compile(&PreviewRequest {
                specification_id: "  ".into(),
                calculation_id: "a".into(),
                source_code: "Return 1".into(),
            })
            .await
            .unwrap();
        assert!(matches!(outcome, PreviewOutcome::BadRequest(_)));

        let outcome = h.compiler.compile(&request("", "Return 1")).await.unwrap();
        assert!(matches!(outcome, PreviewOutcome::BadRequest(_)));
    }

    #[tokio::test]
    async fn missing_calculation_is_a_precondition_failure() {
        let h = harness(vec![calc("a", "Horace", "Return 1")]);
        let outcome = h
            .compiler
            .compile(&request("missing", "Return 1"))
            .await
            .unwrap();
        match outcome {
            PreviewOutcome::PreconditionFailed(message) => {
                assert!(message.contains("missing"));
            }
            other => panic!("expected precondition failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_build_project_is_a_precondition_failure() {
        let calculations = Arc::new(FakeCalculations::default());
        calculations
            .calculations
            .lock()
            .unwrap()
            .push(calc("a", "Horace", "Return 1"));

        let compiler = PreviewCompiler::new(
            calculations,
            Arc::new(FakeBuildProjects::default()),
            AggregateAnalyzer::new(Arc::new(FakeCache), Arc::new(FakeFields { fields: vec![] })),
        );

        let outcome = compiler.compile(&request("a", "Return 1")).await.unwrap();
        assert!(matches!(outcome, PreviewOutcome::PreconditionFailed(_)));
    }

    #[tokio::test]
    async fn self_reference_is_a_circular_reference_error() {
        let h = harness(vec![calc("a", "Horace", "Return 1")]);
        let outcome = h
            .compiler
            .compile(&request("a", "Return horace + 1"))
            .await
            .unwrap();

        let PreviewOutcome::Compiled(build) = outcome else {
            panic!("expected a compiled outcome");
        };
        assert!(!build.success);
        assert!(build.compiler_messages.iter().any(|m| m.message
            == "Circular reference detected - Calculation 'Horace' calls itself"));
    }

    #[tokio::test]
    async fn substring_of_own_name_does_not_trigger() {
        let h = harness(vec![
            calc("a", "Horace", "Return 1"),
            calc("b", "HoraceX", "Return 2"),
        ]);
        let outcome = h
            .compiler
            .compile(&request("a", "Return HoraceX"))
            .await
            .unwrap();

        let PreviewOutcome::Compiled(build) = outcome else {
            panic!("expected a compiled outcome");
        };
        assert!(build.success, "{:?}", build.compiler_messages);
    }

    #[tokio::test]
    async fn aggregate_misuse_fails_the_preview_build() {
        let h = harness(vec![calc("a", "Horace", "Return 1")]);
        let outcome = h
            .compiler
            .compile(&request("a", "Return Sum(Mystery)"))
            .await
            .unwrap();

        let PreviewOutcome::Compiled(build) = outcome else {
            panic!("expected a compiled outcome");
        };
        assert!(!build.success);
        assert!(build
            .compiler_messages
            .iter()
            .any(|m| m.message == "Mystery is not an aggregable field"));
    }

    #[tokio::test]
    async fn clean_preview_persists_source_with_preview_flag() {
        let h = harness(vec![calc("a", "Horace", "Return 1")]);
        let outcome = h
            .compiler
            .compile(&request("a", "Return Sum(Pupils)"))
            .await
            .unwrap();

        let PreviewOutcome::Compiled(build) = outcome else {
            panic!("expected a compiled outcome");
        };
        assert!(build.success);

        let saved = h.calculations.saved.lock().unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].1, SourceFileKind::Preview);
        assert!(!saved[0].0.is_empty());
    }

    #[tokio::test]
    async fn persisted_options_drive_the_returned_build() {
        let h = harness(vec![calc("a", "Horace", "Return 1")]);
        *h.calculations.options.lock().unwrap() = CompilerOptions {
            option_strict: false,
            use_legacy_code: true,
        };

        // Under default (strict) options this source fails; the persisted
        // lax options demote the finding to a warning.
        let outcome = h
            .compiler
            .compile(&request("a", "Return \"ten\""))
            .await
            .unwrap();

        let PreviewOutcome::Compiled(build) = outcome else {
            panic!("expected a compiled outcome");
        };
        assert!(build.success);
        assert!(build
            .compiler_messages
            .iter()
            .any(|m| m.severity == Severity::Warning));
    }
}
