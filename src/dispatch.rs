//! # Partition Dispatcher
//!
//! Handles an allocation trigger for one specification: resolves the build
//! project and the scoped-provider-id list, slices the providers into
//! bounded, contiguous batches, and dispatches one unit of work per batch -
//! either a tracked child job under the triggering parent job or a direct
//! queue message.
//!
//! Dispatch is all-or-nothing per trigger: the child batch is submitted in a
//! single call and the number actually created must equal the computed batch
//! count, otherwise the whole handler fails and the transport's redelivery
//! retries it. Handlers are safe to re-run; a parent job that already
//! finished short-circuits without dispatching.

use crate::aggregate::aggregated_calculations;
use crate::clients::{
    BuildProjectRepository, Cache, CalculationsRepository, JobsClient, ProviderResultsClient,
    QueueSender, SpecificationsClient,
};
use crate::error::{EngineError, Result};
use crate::model::{
    calculation_aggregations_cache_pattern, scoped_provider_cache_key, Job, JobCreateModel,
    JobLogUpdate, Trigger, ALLOCATION_AGGREGATION_JOB_DEFINITION, ALLOCATION_BATCH_JOB_DEFINITION,
    ALLOCATION_RESULTS_QUEUE, BATCH_NUMBER_PROPERTY, CALCULATIONS_TO_AGGREGATE_PROPERTY,
    JOB_ID_PROPERTY, PARTITION_INDEX_PROPERTY, SPECIFICATION_ID_PROPERTY,
};
use std::collections::HashMap;
use std::sync::Arc;

/// Inbound allocation trigger. `job_id` is required only in job-tracking
/// mode.
#[derive(Debug, Clone)]
pub struct AllocationTrigger {
    pub specification_id: String,
    pub job_id: Option<String>,
}

impl AllocationTrigger {
    /// Build a trigger from a transport message's user properties. A missing
    /// or empty `specification-id` is an argument error at the boundary.
    pub fn from_properties(properties: &HashMap<String, String>) -> Result<Self> {
        let specification_id = properties
            .get(SPECIFICATION_ID_PROPERTY)
            .filter(|s| !s.is_empty())
            .cloned()
            .ok_or(EngineError::MissingArgument("specification-id"))?;

        Ok(Self {
            specification_id,
            job_id: properties.get(JOB_ID_PROPERTY).cloned(),
        })
    }
}

/// Dispatcher configuration, passed in at construction time.
#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    /// Maximum providers per batch.
    pub max_partition_size: usize,
    /// When enabled, batches become tracked child jobs under the parent;
    /// otherwise one queue message is sent per batch.
    pub job_tracking_enabled: bool,
    /// When enabled, bump the specification's calculations-last-updated
    /// timestamp after a successful dispatch.
    pub touch_last_updated: bool,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            max_partition_size: 1000,
            job_tracking_enabled: true,
            touch_last_updated: false,
        }
    }
}

/// How a trigger was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Batches were dispatched.
    Dispatched { batches: usize },
    /// Nothing to do: the specification has no scoped providers.
    NoScopedProviders,
    /// The parent job already completed; duplicate trigger ignored.
    ParentAlreadyFinished,
}

pub struct PartitionDispatcher {
    settings: DispatcherSettings,
    build_projects: Arc<dyn BuildProjectRepository>,
    calculations: Arc<dyn CalculationsRepository>,
    jobs: Arc<dyn JobsClient>,
    queue: Arc<dyn QueueSender>,
    cache: Arc<dyn Cache>,
    results: Arc<dyn ProviderResultsClient>,
    specifications: Arc<dyn SpecificationsClient>,
}

impl PartitionDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        mut settings: DispatcherSettings,
        build_projects: Arc<dyn BuildProjectRepository>,
        calculations: Arc<dyn CalculationsRepository>,
        jobs: Arc<dyn JobsClient>,
        queue: Arc<dyn QueueSender>,
        cache: Arc<dyn Cache>,
        results: Arc<dyn ProviderResultsClient>,
        specifications: Arc<dyn SpecificationsClient>,
    ) -> Self {
        // A batch holds at least one provider.
        settings.max_partition_size = settings.max_partition_size.max(1);
        Self {
            settings,
            build_projects,
            calculations,
            jobs,
            queue,
            cache,
            results,
            specifications,
        }
    }

    /// Handle one allocation trigger end to end.
    pub async fn dispatch(&self, trigger: &AllocationTrigger) -> Result<DispatchOutcome> {
        let specification_id = trigger.specification_id.as_str();
        if specification_id.is_empty() {
            return Err(EngineError::MissingArgument("specification-id"));
        }

        // Absence of the build project is an argument error - a trigger for a
        // specification that was never built cannot be retried into success.
        if self
            .build_projects
            .build_project_for_specification(specification_id)
            .await?
            .is_none()
        {
            tracing::error!(specification_id, "no build project for specification");
            return Err(EngineError::BuildProjectNotFound(
                specification_id.to_string(),
            ));
        }

        let provider_ids = self.resolve_scoped_providers(specification_id).await?;

        if provider_ids.is_empty() {
            tracing::info!(specification_id, "no scoped providers set for specification");
            if self.settings.job_tracking_enabled {
                let job_id = trigger
                    .job_id
                    .as_deref()
                    .ok_or(EngineError::MissingArgument("jobId"))?;
                self.jobs
                    .add_job_log(
                        job_id,
                        JobLogUpdate {
                            completed_successfully: true,
                            outcome: "no scoped providers set for specification".to_string(),
                        },
                    )
                    .await?;
            }
            return Ok(DispatchOutcome::NoScopedProviders);
        }

        let batch_count = provider_ids
            .len()
            .div_ceil(self.settings.max_partition_size);

        if !self.settings.job_tracking_enabled {
            self.send_queue_batches(specification_id, &provider_ids, batch_count)
                .await?;
        } else {
            let job_id = trigger
                .job_id
                .as_deref()
                .ok_or(EngineError::MissingArgument("jobId"))?;
            let parent = match self.jobs.get_job(job_id).await? {
                Some(parent) => parent,
                None => {
                    tracing::error!(specification_id, job_id, "parent job not found");
                    return Err(EngineError::ParentJobNotFound(job_id.to_string()));
                }
            };
            if parent.is_finished() {
                tracing::warn!(
                    specification_id,
                    job_id,
                    "parent job already completed, ignoring duplicate trigger"
                );
                return Ok(DispatchOutcome::ParentAlreadyFinished);
            }

            self.create_child_jobs(specification_id, &parent, &provider_ids, batch_count)
                .await?;
        }

        if self.settings.touch_last_updated {
            self.specifications
                .touch_calculation_last_updated(specification_id)
                .await?;
        }

        Ok(DispatchOutcome::Dispatched {
            batches: batch_count,
        })
    }

    /// The ordered scoped-provider-id list, refreshing the derived
    /// provider-summary cache when it is absent or stale.
    async fn resolve_scoped_providers(&self, specification_id: &str) -> Result<Vec<String>> {
        let cache_key = scoped_provider_cache_key(specification_id);
        let provider_ids = self.results.scoped_provider_ids(specification_id).await?;

        let cached_length = if self.cache.key_exists(&cache_key).await? {
            Some(self.cache.list_length(&cache_key).await?)
        } else {
            None
        };

        if cached_length != Some(provider_ids.len()) {
            tracing::info!(
                specification_id,
                cached = ?cached_length,
                authoritative = provider_ids.len(),
                "provider summary cache stale, repopulating"
            );
            self.results
                .populate_provider_summaries(specification_id)
                .await?;
        }

        Ok(provider_ids)
    }

    async fn create_child_jobs(
        &self,
        specification_id: &str,
        parent: &Job,
        provider_ids: &[String],
        batch_count: usize,
    ) -> Result<()> {
        // An aggregation-driving parent tags every child with the
        // calculations being aggregated, and the stale aggregate cache is
        // evicted so no run reuses old values.
        let calculations_to_aggregate =
            if parent.job_definition_id == ALLOCATION_AGGREGATION_JOB_DEFINITION {
                let calculations = self
                    .calculations
                    .calculations_for_specification(specification_id)
                    .await?;
                let names = aggregated_calculations(&calculations);
                self.cache
                    .remove_by_pattern(&calculation_aggregations_cache_pattern(specification_id))
                    .await?;
                Some(names.join(","))
            } else {
                None
            };

        let mut children = Vec::with_capacity(batch_count);
        for (index, _batch) in provider_ids
            .chunks(self.settings.max_partition_size)
            .enumerate()
        {
            let mut properties = HashMap::new();
            properties.insert(
                SPECIFICATION_ID_PROPERTY.to_string(),
                specification_id.to_string(),
            );
            properties.insert(PARTITION_INDEX_PROPERTY.to_string(), index.to_string());
            properties.insert(BATCH_NUMBER_PROPERTY.to_string(), (index + 1).to_string());
            if let Some(names) = &calculations_to_aggregate {
                properties.insert(CALCULATIONS_TO_AGGREGATE_PROPERTY.to_string(), names.clone());
            }

            children.push(JobCreateModel {
                parent_job_id: Some(parent.id.clone()),
                job_definition_id: ALLOCATION_BATCH_JOB_DEFINITION.to_string(),
                specification_id: specification_id.to_string(),
                invoker_user_id: parent.invoker_user_id.clone(),
                invoker_user_display_name: parent.invoker_user_display_name.clone(),
                correlation_id: parent.correlation_id.clone(),
                trigger: Trigger {
                    entity_id: parent.id.clone(),
                    entity_type: "Job".to_string(),
                    message: format!(
                        "Generating allocation results for specification '{specification_id}'"
                    ),
                },
                properties,
            });
        }

        let created = self.jobs.create_jobs(children).await?;

        if created.len() != batch_count {
            tracing::error!(
                specification_id,
                created = created.len(),
                expected = batch_count,
                "Only {} child jobs from {} were created",
                created.len(),
                batch_count
            );
            // Best effort: record the failure against the parent before
            // raising.
            let _ = self
                .jobs
                .add_job_log(
                    &parent.id,
                    JobLogUpdate {
                        completed_successfully: false,
                        outcome: format!(
                            "Only {} child jobs from {} were created",
                            created.len(),
                            batch_count
                        ),
                    },
                )
                .await;
            return Err(EngineError::DispatchIntegrity {
                created: created.len(),
                expected: batch_count,
            });
        }

        tracing::info!(specification_id, "{batch_count} child jobs were created");
        self.jobs
            .add_job_log(
                &parent.id,
                JobLogUpdate {
                    completed_successfully: true,
                    outcome: format!("{batch_count} child jobs were created"),
                },
            )
            .await?;

        Ok(())
    }

    async fn send_queue_batches(
        &self,
        specification_id: &str,
        provider_ids: &[String],
        batch_count: usize,
    ) -> Result<()> {
        for (index, _batch) in provider_ids
            .chunks(self.settings.max_partition_size)
            .enumerate()
        {
            let mut properties = HashMap::new();
            properties.insert(
                SPECIFICATION_ID_PROPERTY.to_string(),
                specification_id.to_string(),
            );
            properties.insert(PARTITION_INDEX_PROPERTY.to_string(), index.to_string());

            self.queue
                .send(
                    ALLOCATION_RESULTS_QUEUE,
                    serde_json::json!({ "specification_id": specification_id }),
                    properties,
                )
                .await?;
        }

        tracing::info!(
            specification_id,
            batches = batch_count,
            "allocation batches sent to queue"
        );
        Ok(())
    }
}

/// Contiguous, order-preserving partition of a provider-id sequence.
/// Exposed for the batch workers, which re-derive their slice from the
/// partition index.
pub fn partition_bounds(total: usize, partition_size: usize, index: usize) -> (usize, usize) {
    // An index past the last batch yields an empty range rather than a
    // panic; workers can be retried with a stale index.
    let start = usize::min(index * partition_size, total);
    let end = usize::min(start + partition_size, total);
    (start, end)
}

/// Read one batch's provider ids back from the provider-summary cache.
/// Workers call this with the partition index carried on their job or queue
/// message.
pub async fn batch_provider_ids(
    cache: &dyn Cache,
    specification_id: &str,
    partition_index: usize,
    partition_size: usize,
) -> Result<Vec<String>> {
    let key = scoped_provider_cache_key(specification_id);
    let total = cache.list_length(&key).await?;
    let (start, end) = partition_bounds(total, partition_size, partition_index);
    cache.list_range(&key, start, end - start).await
}
