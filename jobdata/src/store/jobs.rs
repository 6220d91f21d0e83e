//! Job lifecycle writes: submit, start and finish.
//!
//! Each job name owns a chain of row versions; the row with `last = 1` is
//! the current one. Submitting inserts a new version, starting and
//! finishing update the current version in place. A start or finish event
//! for a job without any row first synthesizes the missing earlier events,
//! at most once per call.

use std::path::PathBuf;

use duckdb::params;
use serde_json::json;

use super::codec::{insert_job, update_finish, update_start};
use super::{Store, WriteOutcome};
use crate::collab::{Accounting, AccountingReport};
use crate::schema::{now_epoch, now_string, row_type, JobRecord, JobStatus, RowStatus};
use crate::{Error, Result};

/// A job lifecycle event as reported by the orchestrator.
///
/// `timestamp` is the submit, start or finish time depending on which
/// write it is passed to.
#[derive(Debug, Clone, PartialEq)]
pub struct JobEvent {
    pub job_name: String,
    pub timestamp: i64,
    pub status: JobStatus,
    pub ncpus: i64,
    pub wallclock: String,
    pub qos: String,
    pub date: String,
    pub member: String,
    pub section: String,
    pub chunk: i64,
    pub platform: String,
    pub job_id: i64,
    /// Queue requested by the wrapper the job runs in, if any.
    pub wrapper_queue: Option<String>,
}

impl JobEvent {
    pub fn new(job_name: impl Into<String>, timestamp: i64, status: JobStatus) -> Self {
        Self {
            job_name: job_name.into(),
            timestamp,
            status,
            ncpus: 0,
            wallclock: "00:00".to_string(),
            qos: "debug".to_string(),
            date: String::new(),
            member: String::new(),
            section: String::new(),
            chunk: 0,
            platform: "NA".to_string(),
            job_id: 0,
            wrapper_queue: None,
        }
    }

    pub fn with_job_id(mut self, job_id: i64) -> Self {
        self.job_id = job_id;
        self
    }

    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = platform.into();
        self
    }

    pub fn with_resources(mut self, ncpus: i64, wallclock: impl Into<String>) -> Self {
        self.ncpus = ncpus;
        self.wallclock = wallclock.into();
        self
    }

    pub fn with_qos(mut self, qos: impl Into<String>) -> Self {
        self.qos = qos.into();
        self
    }

    pub fn with_wrapper_queue(mut self, queue: impl Into<String>) -> Self {
        self.wrapper_queue = Some(queue.into());
        self
    }

    /// Place the job in the workflow graph.
    pub fn in_workflow(
        mut self,
        date: impl Into<String>,
        member: impl Into<String>,
        section: impl Into<String>,
        chunk: i64,
    ) -> Self {
        self.date = date.into();
        self.member = member.into();
        self.section = section.into();
        self.chunk = chunk;
        self
    }

    /// Queue to record: the wrapper's queue for wrapped jobs, else the job's own.
    fn queue_name(&self, wrapper_code: Option<i64>) -> String {
        match (wrapper_code, &self.wrapper_queue) {
            (Some(code), Some(queue)) if code > 2 => queue.clone(),
            _ => self.qos.clone(),
        }
    }
}

/// Extra information only known when a job finishes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FinishDetails {
    /// Folder the job's output files live in.
    pub out_path: Option<PathBuf>,
    /// Output file names.
    pub out: Option<String>,
    pub err: Option<String>,
    /// Scheduler ids of the job's parents.
    pub parents: Vec<i64>,
    /// Skip the accounting query entirely.
    pub no_remote_accounting: bool,
}

impl Store {
    /// Record a job submission as a new row version.
    ///
    /// Prior versions of the job are deactivated in the same transaction.
    pub fn write_submit_time(&mut self, event: &JobEvent) -> Result<WriteOutcome> {
        let prior_max = self
            .job_rows(&event.job_name)?
            .iter()
            .map(|row| row.counter)
            .max();
        let global_max = self.max_counter()?;
        let counter = match prior_max {
            Some(job_max) if job_max >= global_max => job_max + 1,
            _ => global_max,
        };

        let wrapper_code = self.wrappers.wrapper_code(&event.job_name);

        let mut record = JobRecord::new(event.job_name.clone());
        record.counter = counter;
        record.submit = event.timestamp;
        record.status = event.status;
        record.rowtype = row_type(wrapper_code);
        record.ncpus = event.ncpus;
        record.wallclock = event.wallclock.clone();
        record.qos = event.queue_name(wrapper_code);
        record.date = event.date.clone();
        record.member = event.member.clone();
        record.section = event.section.clone();
        record.chunk = event.chunk;
        if !event.platform.is_empty() {
            record.platform = event.platform.clone();
        }
        record.job_id = event.job_id;
        record.run_id = self.current_run_id;

        let id = self.in_transaction(|conn| {
            if let Some(job_max) = prior_max {
                conn.execute(
                    "UPDATE job_data SET last = 0, modified = ? \
                     WHERE job_name = ? AND (counter = ? OR last = 1)",
                    params![record.modified, record.job_name, job_max],
                )?;
            }
            insert_job(conn, &record)
        })?;

        tracing::debug!(job = %event.job_name, id, counter, "recorded submission");
        Ok(WriteOutcome::Inserted)
    }

    /// Record a job start on its current row.
    ///
    /// A row that already started is left untouched. A job without any row
    /// gets a submission synthesized from this event first.
    pub fn write_start_time(&mut self, event: &JobEvent) -> Result<WriteOutcome> {
        let mut synthesized = false;

        loop {
            if let Some(mut last) = self.last_row(&event.job_name)?.into_iter().next() {
                if last.start != 0 {
                    return Ok(WriteOutcome::AlreadyStarted);
                }

                let wrapper_code = self.wrappers.wrapper_code(&event.job_name);
                last.start = event.timestamp;
                last.qos = event.queue_name(wrapper_code);
                last.status = event.status;
                last.rowtype = row_type(wrapper_code);
                last.job_id = event.job_id;
                last.modified = now_string();
                update_start(&self.conn, &last)?;

                tracing::debug!(job = %event.job_name, id = last.id, "recorded start");
                return Ok(if synthesized {
                    WriteOutcome::Synthesized
                } else {
                    WriteOutcome::Updated
                });
            }

            if synthesized {
                return Err(Error::NotFound(format!(
                    "no current row for {} after synthesizing its submission",
                    event.job_name
                )));
            }

            tracing::warn!(
                job = %event.job_name,
                "no history row for started job; synthesizing its submission"
            );
            self.write_submit_time(event)?;
            synthesized = true;
        }
    }

    /// Record a job finish on its current row.
    ///
    /// When an accounting collaborator is given (and not bypassed), the
    /// scheduler's final accounting is fetched after the configured settle
    /// delay. Accounting failures are logged and recorded as zeros. When the
    /// scheduler reports the end of a wrapper batch, the energy attribution
    /// pass runs over the current run.
    pub fn write_finish_time(
        &mut self,
        event: &JobEvent,
        details: &FinishDetails,
        accounting: Option<&dyn Accounting>,
    ) -> Result<WriteOutcome> {
        let mut synthesized = false;

        let mut last = loop {
            if let Some(last) = self.last_row(&event.job_name)?.into_iter().next() {
                break last;
            }
            if synthesized {
                return Err(Error::NotFound(format!(
                    "no current row for {} after synthesizing its start",
                    event.job_name
                )));
            }

            tracing::warn!(
                job = %event.job_name,
                db = %self.config.db_path(&self.expid).display(),
                "no history row for finished job; restoring it with default values"
            );
            self.write_submit_time(event)?;
            self.write_start_time(event)?;
            synthesized = true;
        };

        let is_packed = last.is_packed();
        let report = match accounting {
            Some(platform) if !details.no_remote_accounting => {
                self.fetch_accounting(platform, &last, event, details, is_packed)
            }
            _ => AccountingReport::default(),
        };

        let mut extra_data = report.extra_data.clone();
        extra_data.insert("parents", json!(details.parents));

        last.finish = if event.timestamp > 0 {
            event.timestamp
        } else {
            now_epoch()
        };
        last.status = event.status;
        last.job_id = event.job_id;
        last.energy = report.energy;
        last.rowstatus = RowStatus::Completed;
        last.out = details.out.clone().unwrap_or_default();
        last.err = details.err.clone().unwrap_or_default();
        last.max_rss = 0.0;
        last.ave_rss = 0.0;
        if report.ncpus > 0 {
            last.ncpus = report.ncpus;
        }
        if report.nnodes > 0 {
            last.nnodes = report.nnodes;
        }
        last.extra_data = extra_data;
        last.modified = now_string();

        if !is_packed && report.submit > 0 && report.start > 0 {
            last.submit = report.submit;
            last.start = report.start;
        } else if last.start <= 0 {
            last.start = report.start;
        }

        update_finish(&self.conn, &last)?;
        tracing::debug!(
            job = %event.job_name,
            id = last.id,
            energy = last.energy,
            "recorded finish"
        );

        if !details.no_remote_accounting && report.end_of_wrapper {
            if let Err(e) = self.reconcile_current_run() {
                tracing::warn!(error = %e, "energy attribution for the finished wrapper failed");
            }
        }

        Ok(if synthesized {
            WriteOutcome::Synthesized
        } else {
            WriteOutcome::Updated
        })
    }

    fn fetch_accounting(
        &self,
        platform: &dyn Accounting,
        last: &JobRecord,
        event: &JobEvent,
        details: &FinishDetails,
        is_packed: bool,
    ) -> AccountingReport {
        if !platform.reports_accounting() || event.job_id <= 0 {
            return AccountingReport::default();
        }

        // Give the scheduler's accounting time to settle
        let delay = self.config.accounting_settle_delay();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        let report = match platform.fetch_accounting(event.job_id, is_packed) {
            Ok(report) => report,
            Err(e) => {
                tracing::warn!(
                    job = %event.job_name,
                    job_id = event.job_id,
                    error = %e,
                    "could not fetch job accounting"
                );
                AccountingReport::default()
            }
        };

        if let Some(out_path) = &details.out_path {
            if last.job_id == event.job_id {
                if let Err(e) = platform.record_summary(&last.summary(), out_path) {
                    tracing::warn!(
                        job = %event.job_name,
                        error = %e,
                        "could not write job summary"
                    );
                }
            }
        }

        report
    }
}
