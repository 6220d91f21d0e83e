//! jobdata: experiment job history database
//!
//! Persists the lifecycle of every job of a workflow experiment (submit,
//! start, finish), tracks experiment runs, and attributes scheduler energy
//! accounting to the jobs of wrapper batches. Backed by one DuckDB file per
//! experiment.

pub mod collab;
pub mod config;
pub mod error;
pub mod init;
pub mod schema;
pub mod store;

pub use collab::{
    Accounting, AccountingReport, JobListEntry, NoWrappers, TrackedJob, WrapperLookup,
    WrapperPackages,
};
pub use config::Config;
pub use error::{Error, Result};
pub use schema::{
    ExperimentRun, ExtraData, JobRecord, JobStatus, JobSummary, RowStatus, StepRecord,
};
pub use store::{
    FinishDetails, JobEvent, QueryResult, ReconcileSummary, RunRequest, RunTally, StatusChanges,
    Store, WriteOutcome,
};
