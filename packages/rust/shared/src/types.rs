//! Core domain types for import runs.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorKind;

// ---------------------------------------------------------------------------
// RunId
// ---------------------------------------------------------------------------

/// Identifier of a single import run.
///
/// Ids are assigned per origin family and only serve logging and
/// correlation: `-1` for the startup run, `0, 1, 2, ...` for periodic runs
/// and `-2, -3, ...` for on-demand runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub i64);

impl RunId {
    /// Sentinel id of the run triggered on startup.
    pub const STARTUP: RunId = RunId(-1);

    /// First id handed out to on-demand runs; later ones count down.
    pub const FIRST_MANUAL: RunId = RunId(-2);
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

// ---------------------------------------------------------------------------
// RunRequest
// ---------------------------------------------------------------------------

/// What caused a run to be requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOrigin {
    Startup,
    Periodic,
    Manual,
}

impl fmt::Display for RunOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Startup => "startup",
            Self::Periodic => "periodic",
            Self::Manual => "manual",
        })
    }
}

/// A "run now" request emitted by the trigger source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRequest {
    pub id: RunId,
    pub origin: RunOrigin,
}

impl RunRequest {
    pub fn startup() -> Self {
        Self {
            id: RunId::STARTUP,
            origin: RunOrigin::Startup,
        }
    }

    pub fn periodic(tick: i64) -> Self {
        Self {
            id: RunId(tick),
            origin: RunOrigin::Periodic,
        }
    }

    pub fn manual(id: RunId) -> Self {
        Self {
            id,
            origin: RunOrigin::Manual,
        }
    }
}

// ---------------------------------------------------------------------------
// Work items and stage outputs
// ---------------------------------------------------------------------------

/// A supplier file to download as part of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub run_id: RunId,
    pub supplier_id: u32,
}

/// Opaque handle to downloaded content (UUID v7, time-sortable).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PayloadHandle(pub Uuid);

impl PayloadHandle {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for PayloadHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PayloadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result of a successful download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub run_id: RunId,
    pub supplier_id: u32,
    pub payload: PayloadHandle,
}

/// Result of a successful parse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub supplier_id: u32,
    pub payload: String,
}

/// All records collected by one run, in completion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Batch(Vec<Record>);

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: Record) {
        self.0.push(record);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Supplier ids in batch order, handy for log lines.
    pub fn supplier_ids(&self) -> Vec<u32> {
        self.0.iter().map(|r| r.supplier_id).collect()
    }
}

impl FromIterator<Record> for Batch {
    fn from_iter<T: IntoIterator<Item = Record>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

// ---------------------------------------------------------------------------
// Run lifecycle
// ---------------------------------------------------------------------------

/// Lifecycle state of a single run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Fetching,
    Processing,
    Saving,
    Completed,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: RunState) -> bool {
        use RunState::*;
        match (self, next) {
            (Pending, Fetching) | (Fetching, Processing) | (Processing, Saving) => true,
            // Empty batches skip the save step.
            (Processing, Completed) | (Saving, Completed) => true,
            (from, Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Fetching => "fetching",
            Self::Processing => "processing",
            Self::Saving => "saving",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        })
    }
}

/// Terminal summary of one run.
///
/// Lets observers tell a failed run apart from a successful run that simply
/// had nothing to save.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub id: RunId,
    pub origin: RunOrigin,
    /// Terminal state, either `Completed` or `Cancelled`.
    pub state: RunState,
    /// Number of records saved (0 when nothing was saved).
    pub records_saved: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    pub fn is_completed(&self) -> bool {
        self.state == RunState::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_constructors_tag_origin() {
        let startup = RunRequest::startup();
        assert_eq!(startup.id, RunId(-1));
        assert_eq!(startup.origin, RunOrigin::Startup);

        assert_eq!(RunRequest::periodic(3).id, RunId(3));
        assert_eq!(RunRequest::manual(RunId(-4)).origin, RunOrigin::Manual);
        assert_eq!(format!("{:>4}", RunId(-2)), "  -2");
    }

    #[test]
    fn state_transitions() {
        use RunState::*;
        assert!(Pending.can_transition_to(Fetching));
        assert!(Processing.can_transition_to(Completed));
        assert!(Saving.can_transition_to(Cancelled));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(!Completed.can_transition_to(Cancelled));
        assert!(!Cancelled.can_transition_to(Fetching));
        assert!(!Fetching.can_transition_to(Saving));
    }

    #[test]
    fn batch_collects_records() {
        let batch: Batch = (1..=3)
            .map(|id| Record {
                supplier_id: id,
                payload: format!("supplier-{id}"),
            })
            .collect();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.supplier_ids(), vec![1, 2, 3]);
        assert!(Batch::new().is_empty());
    }

    #[test]
    fn report_serializes_without_empty_error() {
        let now = Utc::now();
        let report = RunReport {
            id: RunId(0),
            origin: RunOrigin::Periodic,
            state: RunState::Completed,
            records_saved: 7,
            error_kind: None,
            error: None,
            started_at: now,
            finished_at: now,
        };
        let json = serde_json::to_string(&report).expect("serialize");
        assert!(json.contains(r#""state":"completed""#));
        assert!(json.contains(r#""origin":"periodic""#));
        assert!(!json.contains("error"));
        assert!(report.is_completed());
    }
}
