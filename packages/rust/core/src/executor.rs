//! Per-run pipeline: fetch → download → parse → collect → save.
//!
//! A run walks `Pending → Fetching → Processing → Saving → Completed` and
//! drops to `Cancelled` on the first stage error or when its scope is
//! cancelled from outside. Errors never leave the run: they are logged and
//! turned into a [`RunReport`].

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use importer_shared::{
    Artifact, Batch, ImportError, JobConfig, Result, RunId, RunReport, RunRequest, RunState,
    WorkItem,
};

use crate::admission::AdmittedRun;
use crate::source::ImportSource;
use crate::worker_pool::WorkerPool;

/// Runs admitted requests end-to-end against an [`ImportSource`].
pub struct PipelineExecutor {
    source: Arc<dyn ImportSource>,
    downloads: WorkerPool,
    parsings: WorkerPool,
    download_timeout: Option<Duration>,
}

impl PipelineExecutor {
    pub fn new(source: Arc<dyn ImportSource>, config: &JobConfig) -> Self {
        Self {
            source,
            downloads: WorkerPool::new(config.max_concurrent_downloads),
            parsings: WorkerPool::new(config.max_concurrent_parsings),
            download_timeout: config.download_timeout,
        }
    }

    /// Execute an admitted run once an execution slot is free.
    ///
    /// The run counts as `Pending` while it waits; cancellation during the
    /// wait ends it as `Cancelled` without touching the source. Admission
    /// capacity is released when this returns.
    #[instrument(
        name = "import",
        skip_all,
        fields(run_id = %admitted.request.id, origin = %admitted.request.origin)
    )]
    pub async fn execute_admitted(
        &self,
        admitted: AdmittedRun,
        cancel: CancellationToken,
    ) -> RunReport {
        let run = RunTracker::new(admitted.request);
        let Some(_slot) = admitted.wait_for_slot(&cancel).await else {
            return run.finish(Err(ImportError::Cancelled));
        };
        self.drive(run, cancel).await
    }

    /// Execute a run right away, bypassing admission.
    #[instrument(
        name = "import",
        skip_all,
        fields(run_id = %request.id, origin = %request.origin)
    )]
    pub async fn execute(&self, request: RunRequest, cancel: CancellationToken) -> RunReport {
        self.drive(RunTracker::new(request), cancel).await
    }

    async fn drive(&self, mut run: RunTracker, cancel: CancellationToken) -> RunReport {
        info!("==> starting import");

        // The run's own scope; cancelled on every exit path.
        let scope = cancel.child_token();
        let _guard = scope.clone().drop_guard();

        let outcome = self.run_stages(&mut run, &scope).await;
        run.finish(outcome)
    }

    async fn run_stages(&self, run: &mut RunTracker, scope: &CancellationToken) -> Result<usize> {
        run.advance(RunState::Fetching);
        let items = scope
            .run_until_cancelled(self.source.fetch_work_items(run.request.id))
            .await
            .ok_or(ImportError::Cancelled)??;
        debug!(items = items.len(), "fetched work items");

        run.advance(RunState::Processing);
        let batch = self.process(items, scope).await?;

        if batch.is_empty() {
            debug!("nothing to save");
            return Ok(0);
        }

        run.advance(RunState::Saving);
        scope
            .run_until_cancelled(self.source.save(run.request.id, &batch, scope.clone()))
            .await
            .ok_or(ImportError::Cancelled)??;
        debug!(suppliers = ?batch.supplier_ids(), "saved batch");

        Ok(batch.len())
    }

    /// Download and parse every item, joining all records into one batch.
    ///
    /// The first failing download or parse cancels `scope`, which aborts
    /// whatever is still in flight in either stage.
    async fn process(&self, items: Vec<WorkItem>, scope: &CancellationToken) -> Result<Batch> {
        let source = Arc::clone(&self.source);
        let timeout = self.download_timeout;
        let mut downloaded = self.downloads.spawn_iter(items, scope.clone(), move |item, token| {
            let source = Arc::clone(&source);
            async move { download_within(source.as_ref(), item, token, timeout).await }
        });

        let (artifacts_tx, artifacts_rx) = mpsc::unbounded_channel::<Artifact>();
        let source = Arc::clone(&self.source);
        let mut parsed = self.parsings.spawn(artifacts_rx, scope.clone(), move |artifact, token| {
            let source = Arc::clone(&source);
            async move { source.parse(artifact, token).await }
        });

        // Dropped once downloads are done, which lets the parse stage drain.
        let mut artifacts_tx = Some(artifacts_tx);
        let mut batch = Batch::new();

        loop {
            tokio::select! {
                biased;

                _ = scope.cancelled() => return Err(ImportError::Cancelled),

                next = downloaded.recv(), if artifacts_tx.is_some() => match next {
                    Some(Ok(artifact)) => {
                        debug!(supplier_id = artifact.supplier_id, "downloaded");
                        if let Some(tx) = &artifacts_tx {
                            let _ = tx.send(artifact);
                        }
                    }
                    Some(Err(e)) => {
                        scope.cancel();
                        return Err(e);
                    }
                    None => artifacts_tx = None,
                },

                next = parsed.recv() => match next {
                    Some(Ok(record)) => {
                        debug!(supplier_id = record.supplier_id, "parsed");
                        batch.push(record);
                    }
                    Some(Err(e)) => {
                        scope.cancel();
                        return Err(e);
                    }
                    None => break,
                },
            }
        }

        Ok(batch)
    }
}

async fn download_within(
    source: &dyn ImportSource,
    item: WorkItem,
    cancel: CancellationToken,
    limit: Option<Duration>,
) -> Result<Artifact> {
    match limit {
        None => source.download(item, cancel).await,
        Some(after) => tokio::time::timeout(after, source.download(item, cancel))
            .await
            .map_err(|_| ImportError::Timeout {
                operation: "download",
                after,
            })?,
    }
}

// ---------------------------------------------------------------------------
// RunTracker
// ---------------------------------------------------------------------------

/// Owns the [`RunState`] of one run from admission to its terminal state.
struct RunTracker {
    request: RunRequest,
    state: RunState,
    started_at: chrono::DateTime<Utc>,
}

impl RunTracker {
    fn new(request: RunRequest) -> Self {
        Self {
            request,
            state: RunState::Pending,
            started_at: Utc::now(),
        }
    }

    fn advance(&mut self, next: RunState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {} -> {}",
            self.state,
            next
        );
        debug!(from = %self.state, to = %next, "run state");
        self.state = next;
    }

    /// Move to the terminal state matching `outcome`, log it and report.
    fn finish(mut self, outcome: Result<usize>) -> RunReport {
        let (records_saved, error) = match outcome {
            Ok(records) => {
                self.advance(RunState::Completed);
                info!(records, "<== import finished");
                (records, None)
            }
            Err(e) => {
                self.advance(RunState::Cancelled);
                if e.is_cancelled() {
                    info!("<== import cancelled");
                } else {
                    warn!(error_kind = %e.kind(), error = %e, "<== import cancelled due to error");
                }
                (0, Some(e))
            }
        };

        RunReport {
            id: self.request.id,
            origin: self.request.origin,
            state: self.state,
            records_saved,
            error_kind: error.as_ref().map(ImportError::kind),
            error: error.map(|e| e.to_string()),
            started_at: self.started_at,
            finished_at: Utc::now(),
        }
    }
}
