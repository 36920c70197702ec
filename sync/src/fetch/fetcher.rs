use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::bail;
use crate::concurrency::shutdown::ShutdownRx;
use crate::error::{ErrorKind, SyncResult};
use crate::fetch::{PageCursor, PageRequest, PageResponse, PagedSource, Pagination, RetryPolicy};
use crate::sync_error;
use crate::types::{FetchReport, SourceRecord};

/// All records of one resource, with fetch telemetry.
#[derive(Debug)]
pub struct FetchedBatch {
    pub records: Vec<SourceRecord>,
    pub report: FetchReport,
}

/// Drives a [`PagedSource`] to completion with retry and cancellation.
///
/// The fetcher owns no cursor state across runs: restarting a fetch means
/// re-invoking it from the first page.
#[derive(Clone)]
pub struct Fetcher {
    retry: RetryPolicy,
    /// Run-wide permit pool bounding concurrent outbound requests.
    permits: Arc<Semaphore>,
    shutdown: ShutdownRx,
    /// Pages fetched per concurrent wave for numbered pagination.
    page_concurrency: usize,
}

impl Fetcher {
    pub fn new(
        retry: RetryPolicy,
        permits: Arc<Semaphore>,
        shutdown: ShutdownRx,
        page_concurrency: usize,
    ) -> Self {
        Self {
            retry,
            permits,
            shutdown,
            page_concurrency: page_concurrency.max(1),
        }
    }

    /// Fetches every record of the resource behind `source`.
    pub async fn fetch_all<S: PagedSource>(
        &self,
        source: &S,
        pagination: Pagination,
    ) -> SyncResult<FetchedBatch> {
        match pagination {
            Pagination::Numbered { page_size } => self.fetch_numbered(source, page_size).await,
            Pagination::Cursor { limit } => self.fetch_cursor(source, limit).await,
        }
    }

    /// Numbered pagination: pages are independent, fetch them in bounded
    /// concurrent waves and stop at the first short page.
    async fn fetch_numbered<S: PagedSource>(
        &self,
        source: &S,
        page_size: u32,
    ) -> SyncResult<FetchedBatch> {
        let mut records = Vec::new();
        let mut report = FetchReport::default();
        let mut next_page: u32 = 1;

        loop {
            let wave: Vec<u32> = (0..self.page_concurrency as u32)
                .map(|offset| next_page + offset)
                .collect();

            let responses = futures::future::try_join_all(wave.into_iter().map(|page| {
                let request = PageRequest {
                    cursor: PageCursor::Number(page),
                    per_page: page_size,
                };
                async move { self.fetch_page_with_retry(source, request).await }
            }))
            .await?;

            let mut done = false;
            for (response, retries) in responses {
                report.pages += 1;
                report.retries += retries;
                report.received += response.records.len() as u64;

                let short_page = (response.records.len() as u32) < page_size;
                for value in response.records {
                    records.push(SourceRecord::from_value(value)?);
                }

                if short_page {
                    done = true;
                    break;
                }
            }

            if done {
                break;
            }
            next_page += self.page_concurrency as u32;
        }

        debug!(
            endpoint = %source.endpoint(),
            pages = report.pages,
            received = report.received,
            "numbered fetch complete"
        );

        Ok(FetchedBatch { records, report })
    }

    /// Cursor pagination: follow `nextCursor` tokens sequentially until the
    /// source stops returning one.
    async fn fetch_cursor<S: PagedSource>(
        &self,
        source: &S,
        limit: u32,
    ) -> SyncResult<FetchedBatch> {
        let mut records = Vec::new();
        let mut report = FetchReport::default();
        let mut cursor: Option<String> = None;

        loop {
            let request = PageRequest {
                cursor: PageCursor::Token(cursor.clone()),
                per_page: limit,
            };
            let (response, retries) = self.fetch_page_with_retry(source, request).await?;

            report.pages += 1;
            report.retries += retries;
            report.received += response.records.len() as u64;

            for value in response.records {
                records.push(SourceRecord::from_value(value)?);
            }

            match response.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        debug!(
            endpoint = %source.endpoint(),
            pages = report.pages,
            received = report.received,
            "cursor fetch complete"
        );

        Ok(FetchedBatch { records, report })
    }

    /// Fetches one page, retrying transient failures with backoff.
    ///
    /// Returns the page plus the number of retries it took. Permanent
    /// failures and exhausted retries surface with the endpoint and page
    /// context attached.
    async fn fetch_page_with_retry<S: PagedSource>(
        &self,
        source: &S,
        request: PageRequest,
    ) -> SyncResult<(PageResponse, u32)> {
        let mut shutdown = self.shutdown.clone();
        let mut attempt: u32 = 1;
        let mut retries: u32 = 0;

        loop {
            if shutdown.is_shutdown() {
                bail!(
                    ErrorKind::SourceOperationCanceled,
                    "Fetch canceled by shutdown",
                    format!("{} ({})", source.endpoint(), request.describe())
                );
            }

            let permit = self.permits.acquire().await.map_err(|_| {
                sync_error!(
                    ErrorKind::InvalidState,
                    "Outbound permit pool closed during fetch"
                )
            })?;

            let result = tokio::select! {
                _ = shutdown.signaled() => {
                    bail!(
                        ErrorKind::SourceOperationCanceled,
                        "Fetch canceled by shutdown",
                        format!("{} ({})", source.endpoint(), request.describe())
                    );
                }
                result = source.fetch_page(&request) => result,
            };
            drop(permit);

            match result {
                Ok(response) => return Ok((response, retries)),
                Err(error) if error.is_transient() && attempt < self.retry.max_attempts() => {
                    let delay = self.retry.delay_for_attempt(attempt, error.retry_after());
                    warn!(
                        endpoint = %source.endpoint(),
                        page = %request.describe(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "transient fetch failure, backing off"
                    );

                    tokio::select! {
                        _ = shutdown.signaled() => {
                            bail!(
                                ErrorKind::SourceOperationCanceled,
                                "Fetch canceled by shutdown while backing off",
                                format!("{} ({})", source.endpoint(), request.describe())
                            );
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }

                    attempt += 1;
                    retries += 1;
                }
                Err(error) if error.is_transient() => {
                    return Err(sync_error!(
                        error.kind(),
                        "Source retries exhausted",
                        format!(
                            "{} attempts against {} ({})",
                            attempt,
                            source.endpoint(),
                            request.describe()
                        ),
                        source: error
                    ));
                }
                Err(error) => return Err(error),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrency::shutdown::{ShutdownTx, create_shutdown_channel};
    use crate::test_utils::ScriptedSource;
    use serde_json::json;
    use std::time::Duration;

    fn fetcher(max_attempts: u32) -> (Fetcher, ShutdownTx) {
        let (shutdown_tx, shutdown_rx) = create_shutdown_channel();
        let retry = RetryPolicy::new(
            max_attempts,
            Duration::from_millis(1),
            Duration::from_millis(5),
            2.0,
        );
        let fetcher = Fetcher::new(retry, Arc::new(Semaphore::new(4)), shutdown_rx, 1);

        (fetcher, shutdown_tx)
    }

    fn record(id: u32) -> serde_json::Value {
        json!({"id": format!("r{id}")})
    }

    #[tokio::test]
    async fn numbered_fetch_stops_at_short_page() {
        let source = ScriptedSource::new(vec![
            ScriptedSource::page(vec![record(1), record(2)]),
            ScriptedSource::page(vec![record(3), record(4)]),
            ScriptedSource::page(vec![record(5)]),
        ]);
        let (fetcher, _tx) = fetcher(3);

        let batch = fetcher
            .fetch_all(&source, Pagination::Numbered { page_size: 2 })
            .await
            .unwrap();

        assert_eq!(batch.records.len(), 5);
        assert_eq!(batch.report.pages, 3);
        assert_eq!(batch.report.received, 5);
        assert_eq!(source.calls(), 3);
    }

    #[tokio::test]
    async fn cursor_fetch_follows_tokens_sequentially() {
        let source = ScriptedSource::new(vec![
            ScriptedSource::page_with_cursor(vec![record(1)], "t1"),
            ScriptedSource::page_with_cursor(vec![record(2)], "t2"),
            ScriptedSource::page(vec![record(3)]),
        ]);
        let (fetcher, _tx) = fetcher(3);

        let batch = fetcher
            .fetch_all(&source, Pagination::Cursor { limit: 200 })
            .await
            .unwrap();

        assert_eq!(batch.records.len(), 3);
        assert_eq!(batch.report.pages, 3);
        assert_eq!(source.calls(), 3);
    }

    #[tokio::test]
    async fn transient_failure_is_retried_and_counted() {
        let source = ScriptedSource::new(vec![
            ScriptedSource::transient_failure(),
            ScriptedSource::page(vec![record(1)]),
        ]);
        let (fetcher, _tx) = fetcher(3);

        let batch = fetcher
            .fetch_all(&source, Pagination::Cursor { limit: 200 })
            .await
            .unwrap();

        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.report.retries, 1);
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let source = ScriptedSource::new(vec![ScriptedSource::permanent_failure()]);
        let (fetcher, _tx) = fetcher(3);

        let error = fetcher
            .fetch_all(&source, Pagination::Cursor { limit: 200 })
            .await
            .unwrap_err();

        assert_eq!(error.kind(), ErrorKind::SourceRequestFailed);
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_the_attempt_count() {
        let source = ScriptedSource::new(vec![
            ScriptedSource::transient_failure(),
            ScriptedSource::transient_failure(),
            ScriptedSource::transient_failure(),
        ]);
        let (fetcher, _tx) = fetcher(3);

        let error = fetcher
            .fetch_all(&source, Pagination::Cursor { limit: 200 })
            .await
            .unwrap_err();

        assert_eq!(error.kind(), ErrorKind::SourceUnavailable);
        assert!(error.detail().unwrap().contains("3 attempts"));
        assert_eq!(source.calls(), 3);
    }

    #[tokio::test]
    async fn shutdown_aborts_the_fetch() {
        let source = ScriptedSource::new(vec![ScriptedSource::page(vec![record(1)])]);
        let (fetcher, shutdown_tx) = fetcher(3);
        shutdown_tx.shutdown().unwrap();

        let error = fetcher
            .fetch_all(&source, Pagination::Cursor { limit: 200 })
            .await
            .unwrap_err();

        assert_eq!(error.kind(), ErrorKind::SourceOperationCanceled);
        assert_eq!(source.calls(), 0);
    }
}
