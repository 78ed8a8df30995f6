//! Lifecycle facade of the background import job.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use importer_shared::{JobConfig, RunId, RunReport};

use crate::admission::{AdmissionPolicy, RunAdmission};
use crate::executor::PipelineExecutor;
use crate::source::ImportSource;
use crate::trigger::{ManualTrigger, TriggerSource};

/// Buffered run reports per subscriber.
const REPORT_CHANNEL_CAPACITY: usize = 64;

/// Starts, stops and feeds the trigger → admission → executor chain.
pub struct JobController {
    triggers: TriggerSource,
    admission: RunAdmission,
    executor: Arc<PipelineExecutor>,
    reports: broadcast::Sender<RunReport>,
    active: Mutex<Option<ActiveJob>>,
}

struct ActiveJob {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl JobController {
    /// Create a stopped controller with the default admission policy.
    pub fn new(config: &JobConfig, source: Arc<dyn ImportSource>) -> Self {
        Self::with_policy(config, source, AdmissionPolicy::default())
    }

    /// Create a stopped controller with custom admission limits.
    pub fn with_policy(
        config: &JobConfig,
        source: Arc<dyn ImportSource>,
        policy: AdmissionPolicy,
    ) -> Self {
        let (reports, _) = broadcast::channel(REPORT_CHANNEL_CAPACITY);
        Self {
            triggers: TriggerSource::new(config.import_interval),
            admission: RunAdmission::new(policy),
            executor: Arc::new(PipelineExecutor::new(source, config)),
            reports,
            active: Mutex::new(None),
        }
    }

    /// Start consuming triggers. Returns `false` if the job was already running.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) -> bool {
        let mut active = self.lock_active();
        if active.as_ref().is_some_and(|job| !job.handle.is_finished()) {
            return false;
        }

        let cancel = CancellationToken::new();
        let requests = self.triggers.subscribe(cancel.child_token());
        let admission = self.admission.clone();
        let executor = Arc::clone(&self.executor);
        let reports = self.reports.clone();
        let scope = cancel.clone();

        let handle = tokio::spawn(async move {
            admission
                .dispatch(requests, scope, move |admitted, token| {
                    let executor = Arc::clone(&executor);
                    let reports = reports.clone();
                    async move {
                        let report = executor.execute_admitted(admitted, token).await;
                        // Having no report subscribers is fine.
                        let _ = reports.send(report);
                    }
                })
                .await;
            info!("pipeline terminated");
        });

        *active = Some(ActiveJob { cancel, handle });
        info!(interval = ?self.triggers.interval(), "background job started");
        true
    }

    /// Stop the job, cancelling any active run, and wait until it has unwound.
    ///
    /// Does nothing when the job is not running.
    pub async fn stop(&self) {
        let Some(job) = self.lock_active().take() else {
            return;
        };

        job.cancel.cancel();
        if let Err(e) = job.handle.await {
            if e.is_panic() {
                error!(error = %e, "pipeline task panicked");
            }
        }
        info!("background job stopped");
    }

    /// Request a run as soon as possible. Never blocks.
    pub fn enqueue_import(&self) -> RunId {
        self.triggers.enqueue()
    }

    /// Handle for enqueueing from other threads without borrowing the controller.
    pub fn manual_trigger(&self) -> Arc<ManualTrigger> {
        self.triggers.manual()
    }

    /// Receive a [`RunReport`] for every run that reaches a terminal state.
    pub fn subscribe_reports(&self) -> broadcast::Receiver<RunReport> {
        self.reports.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.lock_active()
            .as_ref()
            .is_some_and(|job| !job.handle.is_finished())
    }

    /// Admitted runs that have not finished yet.
    pub fn in_flight(&self) -> usize {
        self.admission.in_flight()
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<ActiveJob>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for JobController {
    fn drop(&mut self) {
        let active = self
            .active
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(job) = active.take() {
            job.cancel.cancel();
        }
    }
}
