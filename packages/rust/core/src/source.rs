//! Collaborator boundary: where work items come from and where records go.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use importer_shared::{Artifact, Batch, Record, Result, RunId, WorkItem};

/// External side of an import run.
///
/// Implementations own the actual network and storage calls, including any
/// retry policy. Every call that takes a [`CancellationToken`] should return
/// promptly once it fires; the executor also stops awaiting the call at that
/// point.
#[async_trait]
pub trait ImportSource: Send + Sync {
    /// List the supplier files to import for this run.
    async fn fetch_work_items(&self, run_id: RunId) -> Result<Vec<WorkItem>>;

    /// Download one supplier file.
    async fn download(&self, item: WorkItem, cancel: CancellationToken) -> Result<Artifact>;

    /// Parse a downloaded file into a record.
    async fn parse(&self, artifact: Artifact, cancel: CancellationToken) -> Result<Record>;

    /// Persist the whole batch of a run at once.
    async fn save(&self, run_id: RunId, batch: &Batch, cancel: CancellationToken) -> Result<()>;
}
