use std::sync::Arc;

use config::shared::{AppConfig, WarehouseConfig};
use sync::pipeline::{RunOptions, SyncOrchestrator, parse_only_filter};
use sync::types::RunSummary;
use sync::warehouse::{MemoryWarehouse, Warehouse};
use tracing::{error, info, warn};

/// Loads configuration and executes one sync run against the configured
/// warehouse.
///
/// Configuration problems fail the process before any entity starts; entity
/// failures are reported in the summary, and the process exits non-zero only
/// when every entity failed.
pub async fn start_sync(full_reload: bool, only: Vec<String>) -> anyhow::Result<()> {
    let app_config: AppConfig = config::load_config()?;
    app_config.validate()?;

    let options = RunOptions {
        full_reload,
        only: parse_only_filter(&only),
    };
    let config = Arc::new(app_config);

    // Static dispatch per warehouse kind.
    match &config.warehouse {
        WarehouseConfig::Memory => {
            warn!("using the in-memory warehouse, synced data will not persist");
            let warehouse = MemoryWarehouse::new();
            run_with(config.clone(), warehouse, options).await
        }
        WarehouseConfig::BigQuery {
            project_id,
            dataset_id,
            service_account_key,
        } => {
            let warehouse = sync::warehouse::bigquery::BigQueryWarehouse::new_with_key(
                project_id.clone(),
                dataset_id.clone(),
                service_account_key.expose_secret(),
            )
            .await?;
            run_with(config.clone(), warehouse, options).await
        }
    }
}

async fn run_with<W>(
    config: Arc<AppConfig>,
    warehouse: W,
    options: RunOptions,
) -> anyhow::Result<()>
where
    W: Warehouse + Clone + Send + Sync + 'static,
{
    let orchestrator = SyncOrchestrator::new(config, warehouse);

    // Spawn a task to listen for Ctrl+C and propagate shutdown into the
    // run's in-flight fetches.
    let shutdown_tx = orchestrator.shutdown_tx();
    let shutdown_handle = tokio::spawn(async move {
        if let Err(error) = tokio::signal::ctrl_c().await {
            error!("failed to listen for Ctrl+C: {error}");
            return;
        }

        info!("Ctrl+C received, shutting down the sync run");
        if let Err(error) = shutdown_tx.shutdown() {
            warn!("failed to send shutdown signal: {error}");
        }
    });

    let result = orchestrator.run(options).await;

    // The run is over either way; the Ctrl+C listener is no longer needed.
    shutdown_handle.abort();
    let _ = shutdown_handle.await;

    let summary = result?;
    log_summary(&summary);

    if summary.all_failed() {
        anyhow::bail!("all {} entities failed", summary.entities.len());
    }

    Ok(())
}

fn log_summary(summary: &RunSummary) {
    for outcome in &summary.entities {
        match &outcome.error {
            Some(error) => error!(
                entity = %outcome.entity,
                %error,
                "entity failed"
            ),
            None => info!(
                entity = %outcome.entity,
                rows = outcome.rows_written,
                duplicates = outcome.dedup.as_ref().map(|d| d.duplicates).unwrap_or(0),
                "entity synced"
            ),
        }
    }

    if let Some(report) = &summary.match_report {
        info!(
            matched = report.matched,
            unmatched = report.unmatched,
            ambiguous = report.ambiguous,
            match_rate = report.match_rate(),
            "identity resolution"
        );
    }

    info!(
        run_id = %summary.run_id,
        total_rows = summary.total_rows(),
        failed = summary.failed_count(),
        "sync run summary"
    );
}
