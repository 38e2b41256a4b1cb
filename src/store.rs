//! # Build Project Lifecycle
//!
//! Owns the per-specification [`BuildProject`]: created lazily on the first
//! relationship update or allocation trigger, recompiled whenever the bound
//! calculations or dataset relationships change, and the source of the
//! compiled assembly handed to the dispatcher.
//!
//! Persistence is last-write-wins; a save returning a non-success status is
//! fatal for the triggering event and surfaces as a retriable error.

use crate::clients::{BuildProjectRepository, CalculationsRepository};
use crate::codegen::CodeGenerator;
use crate::compile::{log_messages, CompilerBackend};
use crate::error::{EngineError, Result};
use crate::model::{BuildProject, DatasetRelationship};
use std::sync::Arc;

pub struct BuildProjectStore {
    build_projects: Arc<dyn BuildProjectRepository>,
    calculations: Arc<dyn CalculationsRepository>,
    compiler: Arc<dyn CompilerBackend>,
}

impl BuildProjectStore {
    pub fn new(
        build_projects: Arc<dyn BuildProjectRepository>,
        calculations: Arc<dyn CalculationsRepository>,
        compiler: Arc<dyn CompilerBackend>,
    ) -> Self {
        Self {
            build_projects,
            calculations,
            compiler,
        }
    }

    /// The build project for a specification, creating and compiling one on
    /// first need.
    pub async fn ensure_build_project(&self, specification_id: &str) -> Result<BuildProject> {
        if specification_id.is_empty() {
            return Err(EngineError::MissingArgument("specification_id"));
        }

        if let Some(project) = self
            .build_projects
            .build_project_for_specification(specification_id)
            .await?
        {
            return Ok(project);
        }

        tracing::info!(specification_id, "creating build project");
        let project = BuildProject::new(specification_id);
        self.recompile_and_save(project).await
    }

    /// Handle a dataset-relationship-changed event.
    ///
    /// Attaching a relationship name that is already present is an idempotent
    /// no-op: duplicate change notifications must not trigger redundant
    /// recompiles or repository writes.
    pub async fn relationship_changed(
        &self,
        specification_id: &str,
        relationship: DatasetRelationship,
    ) -> Result<BuildProject> {
        if specification_id.is_empty() {
            return Err(EngineError::MissingArgument("specification_id"));
        }

        let mut project = match self
            .build_projects
            .build_project_for_specification(specification_id)
            .await?
        {
            Some(project) => project,
            None => BuildProject::new(specification_id),
        };

        if project.has_relationship(&relationship.name) {
            tracing::info!(
                specification_id,
                relationship = relationship.name.as_str(),
                "relationship already attached, skipping recompile"
            );
            return Ok(project);
        }

        tracing::info!(
            specification_id,
            relationship = relationship.name.as_str(),
            "attaching relationship and recompiling"
        );
        project.dataset_relationships.push(relationship);
        self.recompile_and_save(project).await
    }

    /// The compiled binary for a build project. Uses the cached assembly when
    /// present; otherwise regenerates source, recompiles and persists before
    /// returning. An empty binary is an error, never a silent return.
    pub async fn assembly(&self, project: &BuildProject) -> Result<Vec<u8>> {
        if let Some(assembly) = &project.build.assembly {
            if !assembly.is_empty() {
                return Ok(assembly.clone());
            }
        }

        tracing::info!(
            specification_id = project.specification_id.as_str(),
            "no cached assembly, recompiling"
        );
        let project = self.recompile_and_save(project.clone()).await?;

        match project.build.assembly {
            Some(assembly) if !assembly.is_empty() => Ok(assembly),
            _ => Err(EngineError::EmptyAssembly(project.specification_id)),
        }
    }

    async fn recompile_and_save(&self, mut project: BuildProject) -> Result<BuildProject> {
        let calculations = self
            .calculations
            .calculations_for_specification(&project.specification_id)
            .await?;

        let files = CodeGenerator::generate(&calculations, &project.dataset_relationships);
        let build = self.compiler.compile(&files);
        log_messages(&project.specification_id, &build.compiler_messages);

        // The build is replaced wholesale, never patched.
        project.build = build;

        let status = self.build_projects.save(&project).await?;
        if let crate::clients::SaveStatus::Failed(code) = status {
            return Err(EngineError::Persistence {
                entity: "build project",
                status: code,
            });
        }

        Ok(project)
    }
}
