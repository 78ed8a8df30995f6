//! Instrumented fakes for the core's unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use importer_shared::{
    Artifact, Batch, ImportError, PayloadHandle, Record, Result, RunId, WorkItem,
};

use crate::source::ImportSource;

// ---------------------------------------------------------------------------
// ConcurrencyGauge
// ---------------------------------------------------------------------------

/// Tracks how many callers are inside a section, and the peak.
#[derive(Debug, Clone, Default)]
pub struct ConcurrencyGauge {
    inner: Arc<GaugeInner>,
}

#[derive(Debug, Default)]
struct GaugeInner {
    current: AtomicUsize,
    max: AtomicUsize,
    total: AtomicUsize,
}

impl ConcurrencyGauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(&self) -> GaugeGuard {
        let now = self.inner.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.max.fetch_max(now, Ordering::SeqCst);
        self.inner.total.fetch_add(1, Ordering::SeqCst);
        GaugeGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn current(&self) -> usize {
        self.inner.current.load(Ordering::SeqCst)
    }

    pub fn max(&self) -> usize {
        self.inner.max.load(Ordering::SeqCst)
    }

    /// Number of times the section was entered.
    pub fn total(&self) -> usize {
        self.inner.total.load(Ordering::SeqCst)
    }
}

pub struct GaugeGuard {
    inner: Arc<GaugeInner>,
}

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        self.inner.current.fetch_sub(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// FakeSource
// ---------------------------------------------------------------------------

/// [`ImportSource`] with fixed delays, scripted failures and call counters.
#[derive(Debug)]
pub struct FakeSource {
    pub items: u32,
    pub download_delay: Duration,
    pub parse_delay: Duration,
    pub save_delay: Duration,
    fail_fetch_for: Option<RunId>,
    fail_download_for: Option<(RunId, u32)>,
    fail_parse_for: Option<(RunId, u32)>,
    fail_save_for: Option<RunId>,

    pub downloads: ConcurrencyGauge,
    pub parses: ConcurrencyGauge,
    fetched: Mutex<Vec<RunId>>,
    saved: Mutex<Vec<(RunId, Vec<u32>)>>,
}

impl FakeSource {
    pub fn new(items: u32) -> Self {
        Self {
            items,
            download_delay: Duration::from_millis(1500),
            parse_delay: Duration::from_millis(1000),
            save_delay: Duration::from_millis(200),
            fail_fetch_for: None,
            fail_download_for: None,
            fail_parse_for: None,
            fail_save_for: None,
            downloads: ConcurrencyGauge::new(),
            parses: ConcurrencyGauge::new(),
            fetched: Mutex::new(Vec::new()),
            saved: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delays(mut self, download: Duration, parse: Duration, save: Duration) -> Self {
        self.download_delay = download;
        self.parse_delay = parse;
        self.save_delay = save;
        self
    }

    pub fn fail_fetch_for(mut self, run: RunId) -> Self {
        self.fail_fetch_for = Some(run);
        self
    }

    pub fn fail_download_for(mut self, run: RunId, supplier_id: u32) -> Self {
        self.fail_download_for = Some((run, supplier_id));
        self
    }

    pub fn fail_parse_for(mut self, run: RunId, supplier_id: u32) -> Self {
        self.fail_parse_for = Some((run, supplier_id));
        self
    }

    pub fn fail_save_for(mut self, run: RunId) -> Self {
        self.fail_save_for = Some(run);
        self
    }

    /// Runs whose fetch step was called, in call order.
    pub fn fetched(&self) -> Vec<RunId> {
        self.fetched.lock().unwrap().clone()
    }

    /// Completed save calls with the supplier ids of each batch.
    pub fn saved(&self) -> Vec<(RunId, Vec<u32>)> {
        self.saved.lock().unwrap().clone()
    }

    pub fn save_count(&self) -> usize {
        self.saved.lock().unwrap().len()
    }
}

async fn pause(delay: Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(ImportError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

#[async_trait]
impl ImportSource for FakeSource {
    async fn fetch_work_items(&self, run_id: RunId) -> Result<Vec<WorkItem>> {
        self.fetched.lock().unwrap().push(run_id);
        if self.fail_fetch_for == Some(run_id) {
            return Err(ImportError::io("directory unavailable"));
        }
        Ok((1..=self.items)
            .map(|supplier_id| WorkItem {
                run_id,
                supplier_id,
            })
            .collect())
    }

    async fn download(&self, item: WorkItem, cancel: CancellationToken) -> Result<Artifact> {
        let _guard = self.downloads.enter();
        pause(self.download_delay, &cancel).await?;
        if self.fail_download_for == Some((item.run_id, item.supplier_id)) {
            return Err(ImportError::io(format!(
                "connection reset by supplier {}",
                item.supplier_id
            )));
        }
        Ok(Artifact {
            run_id: item.run_id,
            supplier_id: item.supplier_id,
            payload: PayloadHandle::new(),
        })
    }

    async fn parse(&self, artifact: Artifact, cancel: CancellationToken) -> Result<Record> {
        let _guard = self.parses.enter();
        pause(self.parse_delay, &cancel).await?;
        if self.fail_parse_for == Some((artifact.run_id, artifact.supplier_id)) {
            return Err(ImportError::format(format!(
                "malformed file from supplier {}",
                artifact.supplier_id
            )));
        }
        Ok(Record {
            supplier_id: artifact.supplier_id,
            payload: format!("data-{}", artifact.supplier_id),
        })
    }

    async fn save(&self, run_id: RunId, batch: &Batch, cancel: CancellationToken) -> Result<()> {
        pause(self.save_delay, &cancel).await?;
        if self.fail_save_for == Some(run_id) {
            return Err(ImportError::io("database unavailable"));
        }
        self.saved
            .lock()
            .unwrap()
            .push((run_id, batch.supplier_ids()));
        Ok(())
    }
}
