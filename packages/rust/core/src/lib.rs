//! Core orchestration for the recurring multi-step import job.
//!
//! Run requests flow from a [`TriggerSource`] through [`RunAdmission`] into the
//! [`PipelineExecutor`], which drives one run through
//! fetch → download → parse → collect → save. [`JobController`] wires the
//! chain together and owns its lifecycle.

pub mod admission;
pub mod controller;
pub mod executor;
pub mod source;
pub mod trigger;
pub mod worker_pool;

#[cfg(test)]
mod testing;

pub use admission::{AdmissionPolicy, AdmittedRun, RunAdmission};
pub use controller::JobController;
pub use executor::PipelineExecutor;
pub use source::ImportSource;
pub use trigger::{DEBOUNCE_WINDOW, ManualTrigger, TriggerSource};
pub use worker_pool::WorkerPool;
