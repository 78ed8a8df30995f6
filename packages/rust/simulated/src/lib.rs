//! Simulated supplier source.
//!
//! Stands in for a real supplier directory, file store and database: every
//! step just sleeps for its configured delay. Useful for demos and for
//! watching the scheduler's admission and concurrency behaviour.

use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use importer_core::ImportSource;
use importer_shared::{
    Artifact, Batch, ImportError, PayloadHandle, Record, Result, RunId, SimulationConfig, WorkItem,
};

/// [`ImportSource`] that sleeps instead of doing I/O.
#[derive(Debug)]
pub struct SimulatedSource {
    supplier_count: u32,
    download_delay: Duration,
    parse_delay: Duration,
    save_delay: Duration,
    failing_suppliers: HashSet<u32>,
    saved_batches: AtomicUsize,
    last_saved: Mutex<Option<(RunId, usize)>>,
}

impl SimulatedSource {
    pub fn new(config: &SimulationConfig) -> Self {
        Self {
            supplier_count: config.supplier_count,
            download_delay: Duration::from_millis(config.download_delay_ms),
            parse_delay: Duration::from_millis(config.parse_delay_ms),
            save_delay: Duration::from_millis(config.save_delay_ms),
            failing_suppliers: config.failing_suppliers.iter().copied().collect(),
            saved_batches: AtomicUsize::new(0),
            last_saved: Mutex::new(None),
        }
    }

    /// Number of batches persisted so far.
    pub fn saved_batches(&self) -> usize {
        self.saved_batches.load(Ordering::Acquire)
    }

    /// Run id and record count of the most recent save.
    pub fn last_saved(&self) -> Option<(RunId, usize)> {
        *self
            .last_saved
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Default for SimulatedSource {
    fn default() -> Self {
        Self::new(&SimulationConfig::default())
    }
}

/// Sleep for `delay` unless `cancel` fires first.
async fn simulate(delay: Duration, cancel: &CancellationToken) -> Result<()> {
    cancel
        .run_until_cancelled(tokio::time::sleep(delay))
        .await
        .ok_or(ImportError::Cancelled)
}

#[async_trait]
impl ImportSource for SimulatedSource {
    async fn fetch_work_items(&self, run_id: RunId) -> Result<Vec<WorkItem>> {
        debug!(%run_id, suppliers = self.supplier_count, "listing supplier directory");
        Ok((1..=self.supplier_count)
            .map(|supplier_id| WorkItem {
                run_id,
                supplier_id,
            })
            .collect())
    }

    async fn download(&self, item: WorkItem, cancel: CancellationToken) -> Result<Artifact> {
        info!(run_id = %item.run_id, supplier_id = item.supplier_id, "downloading");
        simulate(self.download_delay, &cancel).await?;
        info!(run_id = %item.run_id, supplier_id = item.supplier_id, "downloaded");
        Ok(Artifact {
            run_id: item.run_id,
            supplier_id: item.supplier_id,
            payload: PayloadHandle::new(),
        })
    }

    async fn parse(&self, artifact: Artifact, cancel: CancellationToken) -> Result<Record> {
        info!(run_id = %artifact.run_id, supplier_id = artifact.supplier_id, "parsing");
        simulate(self.parse_delay, &cancel).await?;

        if self.failing_suppliers.contains(&artifact.supplier_id) {
            return Err(ImportError::format(format!(
                "supplier {} sent an unreadable file",
                artifact.supplier_id
            )));
        }

        info!(run_id = %artifact.run_id, supplier_id = artifact.supplier_id, "parsed");
        Ok(Record {
            supplier_id: artifact.supplier_id,
            payload: format!("supplier-{}:{}", artifact.supplier_id, artifact.payload),
        })
    }

    async fn save(&self, run_id: RunId, batch: &Batch, cancel: CancellationToken) -> Result<()> {
        info!(%run_id, records = batch.len(), "saving batch");
        simulate(self.save_delay, &cancel).await?;

        self.saved_batches.fetch_add(1, Ordering::AcqRel);
        *self
            .last_saved
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some((run_id, batch.len()));
        info!(%run_id, records = batch.len(), "batch saved");
        Ok(())
    }
}
