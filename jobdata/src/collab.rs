//! Interfaces of the collaborators the history store consumes.
//!
//! The orchestrator owns the job list, the wrapper registry and the
//! scheduler platforms. The store only reads from them through these traits.

use std::collections::HashMap;
use std::path::Path;

use crate::schema::{ExtraData, JobStatus, JobSummary};
use crate::Result;

/// A job of the workflow graph as seen by the run tracker.
pub trait TrackedJob {
    fn status(&self) -> JobStatus;
    fn date(&self) -> Option<&str>;
    fn member(&self) -> Option<&str>;
}

/// Minimal owned job list entry.
#[derive(Debug, Clone, PartialEq)]
pub struct JobListEntry {
    pub name: String,
    pub status: JobStatus,
    pub date: Option<String>,
    pub member: Option<String>,
}

impl JobListEntry {
    pub fn new(name: impl Into<String>, status: JobStatus) -> Self {
        Self {
            name: name.into(),
            status,
            date: None,
            member: None,
        }
    }

    /// Place the job in a date/member group.
    pub fn in_group(mut self, date: impl Into<String>, member: impl Into<String>) -> Self {
        self.date = Some(date.into());
        self.member = Some(member.into());
        self
    }
}

impl TrackedJob for JobListEntry {
    fn status(&self) -> JobStatus {
        self.status
    }

    fn date(&self) -> Option<&str> {
        self.date.as_deref()
    }

    fn member(&self) -> Option<&str> {
        self.member.as_deref()
    }
}

/// Resolves the wrapper (package) code a job was submitted in.
pub trait WrapperLookup {
    fn wrapper_code(&self, job_name: &str) -> Option<i64>;
}

/// Lookup for experiments that never wrap jobs.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoWrappers;

impl WrapperLookup for NoWrappers {
    fn wrapper_code(&self, _job_name: &str) -> Option<i64> {
        None
    }
}

impl WrapperLookup for HashMap<String, i64> {
    fn wrapper_code(&self, job_name: &str) -> Option<i64> {
        self.get(job_name).copied()
    }
}

/// Wrapper codes built from persisted package rows.
///
/// Package names look like `<expid>_<kind>_<code>_...`; the code is the
/// third underscore-separated field.
#[derive(Debug, Clone, Default)]
pub struct WrapperPackages {
    codes: HashMap<String, i64>,
}

impl WrapperPackages {
    /// Build from `(expid, package_name, job_name)` rows.
    ///
    /// Rows whose package name carries no numeric code are skipped.
    pub fn from_rows<I, S>(rows: I) -> Self
    where
        I: IntoIterator<Item = (S, S, S)>,
        S: AsRef<str>,
    {
        let mut codes = HashMap::new();
        for (_expid, package_name, job_name) in rows {
            let code = package_name
                .as_ref()
                .split('_')
                .nth(2)
                .and_then(|field| field.parse::<i64>().ok());
            match code {
                Some(code) => {
                    codes.insert(job_name.as_ref().to_string(), code);
                }
                None => tracing::debug!(
                    package = package_name.as_ref(),
                    "package name carries no wrapper code"
                ),
            }
        }
        Self { codes }
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }
}

impl WrapperLookup for WrapperPackages {
    fn wrapper_code(&self, job_name: &str) -> Option<i64> {
        self.codes.get(job_name).copied()
    }
}

/// Final accounting of a job as reported by its scheduler.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccountingReport {
    pub submit: i64,
    pub start: i64,
    pub finish: i64,
    pub energy: i64,
    pub ncpus: i64,
    pub nnodes: i64,
    /// Per-step accounting keyed by step name.
    pub extra_data: ExtraData,
    /// True when this job closes a wrapper batch.
    pub end_of_wrapper: bool,
}

/// Scheduler platform able to report accounting for finished jobs.
pub trait Accounting {
    /// False for placeholder platforms that must never be queried.
    fn reports_accounting(&self) -> bool {
        true
    }

    fn fetch_accounting(&self, job_id: i64, is_packed: bool) -> Result<AccountingReport>;

    /// Leave a summary of the finished job next to its output files.
    fn record_summary(&self, _summary: &JobSummary, _out_path: &Path) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrapper_packages_from_rows() {
        let packages = WrapperPackages::from_rows(vec![
            ("a000", "a000_ASThread_16001_4", "a000_20200101_fc0_1_SIM"),
            ("a000", "a000_ASThread_16001_4", "a000_20200101_fc0_2_SIM"),
            ("a000", "a000_Vertical", "a000_POST"),
        ]);
        assert_eq!(packages.len(), 2);
        assert_eq!(packages.wrapper_code("a000_20200101_fc0_2_SIM"), Some(16_001));
        assert_eq!(packages.wrapper_code("a000_POST"), None);
    }

    #[test]
    fn test_map_lookup() {
        let mut codes = HashMap::new();
        codes.insert("JOB".to_string(), 3_001);
        assert_eq!(codes.wrapper_code("JOB"), Some(3_001));
        assert_eq!(NoWrappers.wrapper_code("JOB"), None);
    }

    #[test]
    fn test_job_list_entry() {
        let entry = JobListEntry::new("SIM", JobStatus::Completed).in_group("20200101", "fc0");
        assert_eq!(entry.status(), JobStatus::Completed);
        assert_eq!(entry.date(), Some("20200101"));
        assert_eq!(entry.member(), Some("fc0"));
    }
}
