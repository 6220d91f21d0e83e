//! Read-only queries over the job history.

use duckdb::OptionalExt;

use super::codec::{select_jobs, select_runs};
use super::Store;
use crate::init;
use crate::schema::{ExperimentRun, JobRecord};
use crate::Result;

impl Store {
    /// All versions of a job, newest counter first.
    pub fn job_rows(&self, job_name: &str) -> Result<Vec<JobRecord>> {
        select_jobs(
            &self.conn,
            self.db_version,
            "SELECT {columns} FROM job_data WHERE job_name = ? ORDER BY counter DESC",
            &[&job_name],
        )
    }

    /// Current version(s) of a job.
    ///
    /// More than one row means the history is inconsistent; callers take
    /// the first.
    pub fn last_row(&self, job_name: &str) -> Result<Vec<JobRecord>> {
        select_jobs(
            &self.conn,
            self.db_version,
            "SELECT {columns} FROM job_data WHERE last = 1 AND job_name = ? ORDER BY id DESC",
            &[&job_name],
        )
    }

    /// Current rows of a run, in insertion order.
    ///
    /// With `only_finished`, only rows that reached a finish time.
    pub fn current_run_rows(&self, run_id: i64, only_finished: bool) -> Result<Vec<JobRecord>> {
        let sql = if only_finished {
            "SELECT {columns} FROM job_data \
             WHERE run_id = ? AND last = 1 AND finish > 0 AND rowtype >= 2 ORDER BY id"
        } else {
            "SELECT {columns} FROM job_data \
             WHERE run_id = ? AND last = 1 AND rowtype >= 2 ORDER BY id"
        };
        select_jobs(&self.conn, self.db_version, sql, &[&run_id])
    }

    /// The experiment run with the highest id.
    ///
    /// `None` also for files written before run tracking existed.
    pub fn max_run(&self) -> Result<Option<ExperimentRun>> {
        if !init::table_exists(&self.conn, "experiment_run")? {
            return Ok(None);
        }
        let runs = select_runs(
            &self.conn,
            self.db_version,
            "SELECT {columns} FROM experiment_run ORDER BY run_id DESC LIMIT 1",
            &[],
        )?;
        Ok(runs.into_iter().next())
    }

    /// Every experiment run, oldest first.
    pub fn runs(&self) -> Result<Vec<ExperimentRun>> {
        if !init::table_exists(&self.conn, "experiment_run")? {
            return Ok(Vec::new());
        }
        select_runs(
            &self.conn,
            self.db_version,
            "SELECT {columns} FROM experiment_run ORDER BY run_id",
            &[],
        )
    }

    /// Every job row, in insertion order.
    pub fn all_rows(&self) -> Result<Vec<JobRecord>> {
        select_jobs(
            &self.conn,
            self.db_version,
            "SELECT {columns} FROM job_data ORDER BY id",
            &[],
        )
    }

    /// Highest counter of the whole table (1 when empty).
    pub fn max_counter(&self) -> Result<i64> {
        let max: Option<i64> = self
            .conn
            .query_row("SELECT MAX(counter) FROM job_data", [], |row| row.get(0))
            .optional()?
            .flatten();
        Ok(match max {
            Some(counter) if counter > 0 => counter,
            _ => 1,
        })
    }
}
