//! Shared types, error model, and configuration for the importer.
//!
//! This crate is the foundation depended on by all other importer crates.
//! It provides:
//! - [`ImportError`] — the unified error type
//! - Domain types ([`RunRequest`], [`WorkItem`], [`Artifact`], [`Record`], [`Batch`], [`RunReport`])
//! - Configuration ([`AppConfig`], [`JobConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, JobConfig, JobSection, MAX_IMPORT_INTERVAL, SimulationConfig, config_dir,
    config_file_path, init_config, load_config, load_config_from,
};
pub use error::{ErrorKind, ImportError, Result};
pub use types::{
    Artifact, Batch, PayloadHandle, Record, RunId, RunOrigin, RunReport, RunRequest, RunState,
    WorkItem,
};
