//! The sync orchestrator.
//!
//! Drives one pipeline per enabled entity (fetch, dedup, transform, staged
//! merge), bounded-concurrently, with per-entity error isolation: one
//! entity's failure is recorded in the run summary and never aborts its
//! siblings. Run-scoped state (dedup arenas, the identity map, the outbound
//! permit pool) is created per invocation and dropped with it.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use config::shared::{AppConfig, EntityConfig, SourceKind, TransformKind, WarehouseConfig};
use futures::StreamExt;
use tokio::sync::Semaphore;
use tracing::{error, info};
use uuid::Uuid;

use crate::bail;
use crate::concurrency::shutdown::{ShutdownRx, ShutdownTx, create_shutdown_channel};
use crate::dedup::{RecordDeduplicator, SyncKey};
use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::fetch::{Fetcher, HttpSource, Pagination, RetryPolicy, build_http_client};
use crate::identity::IdentityMap;
use crate::sync_error;
use crate::transform::{self, TransformContext};
use crate::types::{EntityOutcome, FetchReport, RunSummary, SourceRecord};
use crate::warehouse::{MemoryWarehouse, Warehouse};
use crate::writer::{MergeOptions, StageMergeWriter};

/// Join attribute for cross-source person resolution.
const IDENTITY_JOIN_ATTRIBUTE: &str = "email";

/// Tracker resource listing the users of the workspace.
const TRACKER_USERS_PATH: &str = "/users";

/// Planner resource listing people, the target identity space.
const PLANNER_PEOPLE_PATH: &str = "/people";

/// Per-run options supplied by the trigger surface.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Force a full reload regardless of the configured default.
    pub full_reload: bool,
    /// Restrict the run to these entities, in registry order.
    pub only: Option<Vec<String>>,
}

/// Normalizes an entity filter: splits comma-separated items, trims, and
/// deduplicates while preserving order. Returns `None` for an empty filter.
pub fn parse_only_filter(raw: &[String]) -> Option<Vec<String>> {
    let mut seen = std::collections::HashSet::new();
    let mut ordered = Vec::new();

    for item in raw {
        for part in item.split(',') {
            let part = part.trim();
            if !part.is_empty() && seen.insert(part.to_string()) {
                ordered.push(part.to_string());
            }
        }
    }

    if ordered.is_empty() { None } else { Some(ordered) }
}

/// Cross-source state built once per run and discarded with it.
struct RunContext {
    /// Tracker users, also the subjects for per-user resource fan-out.
    users: Vec<SourceRecord>,
    identity: IdentityMap,
}

/// Orchestrates sync runs against one warehouse.
pub struct SyncOrchestrator<W> {
    config: Arc<AppConfig>,
    warehouse: W,
    shutdown_tx: ShutdownTx,
    shutdown_rx: ShutdownRx,
}

impl<W> SyncOrchestrator<W>
where
    W: Warehouse + Clone + Send + Sync + 'static,
{
    pub fn new(config: Arc<AppConfig>, warehouse: W) -> Self {
        let (shutdown_tx, shutdown_rx) = create_shutdown_channel();

        Self {
            config,
            warehouse,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Handle for propagating external shutdown (Ctrl-C, deadlines) into the
    /// run's in-flight fetches.
    pub fn shutdown_tx(&self) -> ShutdownTx {
        self.shutdown_tx.clone()
    }

    /// Executes one sync run.
    ///
    /// Returns `Err` only for configuration-level preconditions (invalid
    /// config, unknown entity filter). Entity failures are isolated and
    /// reported inside the [`RunSummary`].
    pub async fn run(&self, options: RunOptions) -> SyncResult<RunSummary> {
        self.config.validate().map_err(|error| {
            sync_error!(
                ErrorKind::ConfigError,
                "Invalid configuration",
                error.to_string()
            )
        })?;

        let entities = self.select_entities(&options)?;
        let full_reload = options.full_reload || self.config.sync.full_reload;
        let run_id = Uuid::new_v4();

        info!(
            %run_id,
            entities = entities.len(),
            full_reload,
            "starting sync run"
        );

        // Run deadline: signal shutdown when it elapses so in-flight page
        // fetches abort promptly and aborted entities are never merged.
        let deadline_task = self.config.sync.run_timeout_secs.map(|secs| {
            let shutdown_tx = self.shutdown_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_secs(secs)).await;
                info!("run deadline elapsed, signaling shutdown");
                let _ = shutdown_tx.shutdown();
            })
        });

        let http = build_http_client()?;
        let permits = Arc::new(Semaphore::new(self.config.sync.max_concurrent_requests));
        let fetcher = Fetcher::new(
            RetryPolicy::from_config(&self.config.retry),
            permits,
            self.shutdown_rx.clone(),
            self.config.sync.page_fetch_concurrency,
        );

        // Cross-source identity state is built once per run, shared by the
        // pipelines that need it, and dropped at the end of the run.
        let needs_context = entities
            .iter()
            .any(|e| e.transform == TransformKind::TimeEntries || e.path.contains("{user_id}"));
        let run_context: Option<Result<Arc<RunContext>, SyncError>> = if needs_context {
            Some(
                self.build_run_context(&fetcher, &http)
                    .await
                    .map(Arc::new)
                    .inspect_err(|error| {
                        error!(%error, "failed to build cross-source identity context");
                    }),
            )
        } else {
            None
        };

        let outcomes: Vec<EntityOutcome> = futures::stream::iter(entities.into_iter().map(|entity| {
            let config = self.config.clone();
            let warehouse = self.warehouse.clone();
            let fetcher = fetcher.clone();
            let http = http.clone();
            let context = run_context.clone();
            let shutdown = self.shutdown_rx.clone();

            async move {
                let name = entity.name.clone();
                match entity_pipeline(
                    config, warehouse, fetcher, http, context, shutdown, entity, full_reload,
                )
                .await
                {
                    Ok(outcome) => outcome,
                    Err(error) => {
                        error!(entity = %name, %error, "entity pipeline failed");
                        EntityOutcome::failed(name, error)
                    }
                }
            }
        }))
        .buffered(self.config.sync.max_concurrent_entities)
        .collect()
        .await;

        if let Some(task) = deadline_task {
            task.abort();
        }

        let match_report = run_context
            .as_ref()
            .and_then(|context| context.as_ref().ok())
            .map(|context| context.identity.report().clone());

        let summary = RunSummary {
            run_id,
            full_reload,
            entities: outcomes,
            match_report,
        };

        info!(
            %run_id,
            total_rows = summary.total_rows(),
            failed = summary.failed_count(),
            "sync run finished"
        );

        Ok(summary)
    }

    /// Applies the enabled flag and the `only` filter, preserving registry
    /// order. Unknown filter names are a configuration error.
    fn select_entities(&self, options: &RunOptions) -> SyncResult<Vec<EntityConfig>> {
        let enabled: Vec<EntityConfig> = self
            .config
            .entities
            .iter()
            .filter(|entity| entity.enabled)
            .cloned()
            .collect();

        let selected = match &options.only {
            None => enabled,
            Some(only) => {
                let unknown: Vec<&String> = only
                    .iter()
                    .filter(|name| !enabled.iter().any(|entity| &&entity.name == name))
                    .collect();
                if !unknown.is_empty() {
                    bail!(
                        ErrorKind::ConfigError,
                        "Unknown or disabled entities in filter",
                        format!("{unknown:?}")
                    );
                }

                enabled
                    .into_iter()
                    .filter(|entity| only.contains(&entity.name))
                    .collect()
            }
        };

        if selected.is_empty() {
            bail!(
                ErrorKind::ConfigError,
                "No entities selected for this run"
            );
        }

        Ok(selected)
    }

    /// Fetches tracker users and planner people, then joins them on email.
    async fn build_run_context(
        &self,
        fetcher: &Fetcher,
        http: &reqwest::Client,
    ) -> SyncResult<RunContext> {
        let users_source =
            HttpSource::tracker(http.clone(), &self.config.tracker, TRACKER_USERS_PATH);
        let users = fetcher
            .fetch_all(
                &users_source,
                Pagination::Numbered {
                    page_size: self.config.tracker.page_size,
                },
            )
            .await?
            .records;

        let people_source =
            HttpSource::planner(http.clone(), &self.config.planner, PLANNER_PEOPLE_PATH);
        let people = fetcher
            .fetch_all(
                &people_source,
                Pagination::Cursor {
                    limit: self.config.planner.page_limit,
                },
            )
            .await?
            .records;

        let identity = IdentityMap::build(&users, &people, IDENTITY_JOIN_ATTRIBUTE);
        let report = identity.report();
        info!(
            foreign = report.foreign_total,
            target = report.target_total,
            matched = report.matched,
            unmatched = report.unmatched,
            ambiguous = report.ambiguous,
            match_rate = report.match_rate(),
            "identity map built"
        );

        Ok(RunContext { users, identity })
    }
}

/// One entity's pipeline: fetch, dedup, transform, staged merge, checkpoint.
#[allow(clippy::too_many_arguments)]
async fn entity_pipeline<W: Warehouse>(
    config: Arc<AppConfig>,
    warehouse: W,
    fetcher: Fetcher,
    http: reqwest::Client,
    context: Option<Result<Arc<RunContext>, SyncError>>,
    shutdown: ShutdownRx,
    entity: EntityConfig,
    full_reload: bool,
) -> SyncResult<EntityOutcome> {
    // The raw checkpoint guards monotonic advancement; the overlapped value
    // is what the source is asked for, re-reading a window to absorb late
    // updates.
    let previous_checkpoint = if entity.incremental {
        warehouse.read_checkpoint(&entity.name).await?
    } else {
        None
    };
    let since = previous_checkpoint
        .map(|checkpoint| checkpoint - ChronoDuration::days(config.sync.overlap_days));

    let context_for_entity = |error_scope: &str| -> SyncResult<Arc<RunContext>> {
        match &context {
            Some(Ok(context)) => Ok(context.clone()),
            Some(Err(error)) => Err(error.clone()),
            None => Err(sync_error!(
                ErrorKind::InvalidState,
                "Entity requires the cross-source context but none was built",
                error_scope.to_string()
            )),
        }
    };

    // Fetch.
    let batch = if entity.path.contains("{user_id}") {
        let run_context = context_for_entity(&entity.name)?;
        fetch_per_user(&config, &fetcher, &http, &entity, &run_context, since).await?
    } else {
        let source = build_source(&config, &http, &entity, since);
        let pagination = pagination_for(&config, entity.source);
        fetcher.fetch_all(&source, pagination).await?
    };
    let fetch_report = batch.report;

    // Dedup, scoped to this run.
    let key = match &entity.sync_key {
        Some(field) => SyncKey::BusinessField(field.clone()),
        None => SyncKey::SourceId,
    };
    let mut deduplicator = RecordDeduplicator::new(key);
    deduplicator.observe_all(batch.records);
    let (records, dedup_report) = deduplicator.finish();

    if dedup_report.duplicates > 0 {
        info!(
            entity = %entity.name,
            received = dedup_report.received,
            unique = dedup_report.unique,
            duplicates = dedup_report.duplicates,
            ratio = dedup_report.duplication_ratio(),
            "collapsed duplicate observations"
        );
    }

    // The checkpoint candidate comes from the raw records, before any
    // transform rewrites timestamps.
    let max_updated_at: Option<DateTime<Utc>> =
        records.iter().filter_map(SourceRecord::updated_at).max();

    // Transform.
    let identity_context = match &context {
        Some(Ok(run_context)) => Some(run_context.clone()),
        _ => None,
    };
    let transform_context = TransformContext {
        source: entity.source,
        identity: identity_context.as_ref().map(|c| &c.identity),
    };
    let rows = records
        .iter()
        .map(|record| transform::apply(entity.transform, record, &transform_context))
        .collect::<SyncResult<Vec<_>>>()?;

    // An aborted entity must not be merged: partially fetched or staged
    // data stays out of the target.
    if shutdown.is_shutdown() {
        bail!(
            ErrorKind::SourceOperationCanceled,
            "Run canceled before merge",
            entity.name.clone()
        );
    }

    // Staged merge.
    let merge_options = MergeOptions {
        full_reload,
        unique_key_column: entity.unique_key.clone(),
    };
    let writer = StageMergeWriter::new(&warehouse);
    let merge_report = writer.write(&entity.name, rows, &merge_options).await?;

    // Checkpoint: advance to the max observed update timestamp, never
    // backwards, and only when the run observed rows.
    if entity.incremental {
        if let Some(candidate) = max_updated_at {
            let advanced = previous_checkpoint.is_none_or(|previous| candidate > previous);
            if advanced {
                warehouse.write_checkpoint(&entity.name, candidate).await?;
            }
        }
    }

    Ok(EntityOutcome {
        entity: entity.name,
        rows_written: merge_report.rows_merged,
        fetch: Some(fetch_report),
        dedup: Some(dedup_report),
        merge: Some(merge_report),
        error: None,
    })
}

/// Fetches a per-user resource once per tracker user, concatenating pages.
async fn fetch_per_user(
    config: &AppConfig,
    fetcher: &Fetcher,
    http: &reqwest::Client,
    entity: &EntityConfig,
    run_context: &RunContext,
    since: Option<DateTime<Utc>>,
) -> SyncResult<crate::fetch::FetchedBatch> {
    let mut records = Vec::new();
    let mut report = FetchReport::default();

    for user in &run_context.users {
        let path = entity.path.replace("{user_id}", user.source_id());
        let per_user_entity = EntityConfig {
            path,
            ..entity.clone()
        };

        let source = build_source(config, http, &per_user_entity, since);
        let pagination = pagination_for(config, entity.source);
        let batch = fetcher.fetch_all(&source, pagination).await?;

        report.absorb(&batch.report);
        records.extend(batch.records);
    }

    Ok(crate::fetch::FetchedBatch { records, report })
}

fn build_source(
    config: &AppConfig,
    http: &reqwest::Client,
    entity: &EntityConfig,
    since: Option<DateTime<Utc>>,
) -> HttpSource {
    let mut source = match entity.source {
        SourceKind::Tracker => HttpSource::tracker(http.clone(), &config.tracker, &entity.path),
        SourceKind::Planner => HttpSource::planner(http.clone(), &config.planner, &entity.path),
    };

    if entity.incremental {
        if let Some(since) = since {
            source = source.with_param(
                "modifiedAfter",
                since.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            );
        }
    }

    source
}

fn pagination_for(config: &AppConfig, source: SourceKind) -> Pagination {
    match source {
        SourceKind::Tracker => Pagination::Numbered {
            page_size: config.tracker.page_size,
        },
        SourceKind::Planner => Pagination::Cursor {
            limit: config.planner.page_limit,
        },
    }
}

/// Runs one sync against the warehouse named in the configuration.
///
/// Dispatches statically per warehouse kind, constructing the orchestrator
/// and executing a single run. The BigQuery arm requires the `bigquery`
/// feature.
pub async fn run_once(config: Arc<AppConfig>, options: RunOptions) -> SyncResult<RunSummary> {
    match &config.warehouse {
        WarehouseConfig::Memory => {
            let orchestrator = SyncOrchestrator::new(config.clone(), MemoryWarehouse::new());
            orchestrator.run(options).await
        }
        #[cfg(feature = "bigquery")]
        WarehouseConfig::BigQuery {
            project_id,
            dataset_id,
            service_account_key,
        } => {
            let warehouse = crate::warehouse::bigquery::BigQueryWarehouse::new_with_key(
                project_id.clone(),
                dataset_id.clone(),
                service_account_key.expose_secret(),
            )
            .await?;
            let orchestrator = SyncOrchestrator::new(config.clone(), warehouse);
            orchestrator.run(options).await
        }
        #[cfg(not(feature = "bigquery"))]
        WarehouseConfig::BigQuery { .. } => {
            bail!(
                ErrorKind::ConfigError,
                "BigQuery warehouse requested but the `bigquery` feature is disabled"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_filter_splits_trims_and_deduplicates() {
        let raw = vec![
            "people, projects".to_string(),
            "people".to_string(),
            " time_entries ".to_string(),
        ];

        assert_eq!(
            parse_only_filter(&raw),
            Some(vec![
                "people".to_string(),
                "projects".to_string(),
                "time_entries".to_string()
            ])
        );
    }

    #[test]
    fn empty_only_filter_is_none() {
        assert_eq!(parse_only_filter(&[]), None);
        assert_eq!(parse_only_filter(&[" , ".to_string()]), None);
    }
}
