//! Experiment run tracking.
//!
//! The current run is the `experiment_run` row with the highest id. Runs
//! are updated in place while the workflow keeps the same shape, and a new
//! run is started (re-baselined) when the job count drifts or a large share
//! of completed jobs changes status at once.

use std::collections::HashMap;

use super::codec::{insert_run, update_run, update_status_change};
use super::Store;
use crate::collab::TrackedJob;
use crate::schema::{now_epoch, now_string, ExperimentRun, JobStatus, RowStatus};
use crate::{Error, Result};

/// Observed status transitions, keyed by job name: `(old, new)`.
pub type StatusChanges = HashMap<String, (JobStatus, JobStatus)>;

/// Workflow settings a new run is created with.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunRequest {
    pub chunk_unit: String,
    pub chunk_size: i64,
    /// Serialized experiment configuration, kept as run metadata.
    pub config: String,
}

impl RunRequest {
    pub fn new(chunk_unit: impl Into<String>, chunk_size: i64) -> Self {
        Self {
            chunk_unit: chunk_unit.into(),
            chunk_size,
            config: String::new(),
        }
    }

    pub fn with_config(mut self, config: impl Into<String>) -> Self {
        self.config = config.into();
        self
    }
}

/// Job counts by status, taken from a live job list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunTally {
    pub completed: i64,
    pub failed: i64,
    pub queuing: i64,
    pub submitted: i64,
    pub running: i64,
    pub suspended: i64,
    pub total: i64,
}

impl RunTally {
    pub fn from_jobs<J: TrackedJob>(jobs: &[J]) -> Self {
        let mut tally = RunTally {
            total: jobs.len() as i64,
            ..Default::default()
        };
        for job in jobs {
            match job.status() {
                JobStatus::Completed => tally.completed += 1,
                JobStatus::Failed => tally.failed += 1,
                JobStatus::Queuing => tally.queuing += 1,
                JobStatus::Submitted => tally.submitted += 1,
                JobStatus::Running => tally.running += 1,
                JobStatus::Suspended => tally.suspended += 1,
                _ => {}
            }
        }
        tally
    }

    /// Copy the status counts (not the total) onto a run.
    fn apply_counts(&self, run: &mut ExperimentRun) {
        run.completed = self.completed;
        run.failed = self.failed;
        run.queuing = self.queuing;
        run.submitted = self.submitted;
        run.running = self.running;
        run.suspended = self.suspended;
    }
}

/// Statuses an explicit status change is recorded for.
fn is_tracked_change(status: JobStatus) -> bool {
    matches!(
        status,
        JobStatus::Completed
            | JobStatus::Failed
            | JobStatus::Queuing
            | JobStatus::Running
            | JobStatus::Held
            | JobStatus::Suspended
    )
}

impl Store {
    /// The current experiment run, if any.
    pub fn current_run(&self) -> Result<Option<ExperimentRun>> {
        self.max_run()
    }

    /// Point the store at the latest run, creating a placeholder run on an
    /// empty database.
    pub(super) fn resolve_current_run(&mut self) -> Result<i64> {
        match self.max_run()? {
            Some(run) => {
                self.current_run_id = Some(run.run_id);
                self.is_original_run = true;
                Ok(run.run_id)
            }
            None => {
                let run_id = insert_run(&self.conn, &ExperimentRun::default())?;
                tracing::debug!(run_id, "inserted placeholder experiment run");
                self.current_run_id = Some(run_id);
                self.is_original_run = false;
                Ok(run_id)
            }
        }
    }

    /// Check the current run against the live job list.
    ///
    /// Starts a new run when there is none, when `must_create` is set, or
    /// when the job count changed and `only_update` is not set. Otherwise
    /// refreshes the current run's counts in place. Returns the run id.
    pub fn validate_current_run<J: TrackedJob>(
        &mut self,
        jobs: &[J],
        request: &RunRequest,
        must_create: bool,
        only_update: bool,
    ) -> Result<i64> {
        if jobs.is_empty() {
            return Err(Error::InvalidInput(
                "cannot validate the experiment run without a job list".to_string(),
            ));
        }

        let tally = RunTally::from_jobs(jobs);
        let current = self.max_run()?;

        match current {
            Some(mut run) if !must_create && (run.total == tally.total || only_update) => {
                tally.apply_counts(&mut run);
                if only_update {
                    run.total = tally.total;
                }
                run.finish = 0;
                update_run(&self.conn, &run)?;

                self.current_run_id = Some(run.run_id);
                self.is_original_run = true;
                Ok(run.run_id)
            }
            _ => self.start_new_run(&tally, request),
        }
    }

    fn start_new_run(&mut self, tally: &RunTally, request: &RunRequest) -> Result<i64> {
        let mut run = ExperimentRun::new(request.chunk_unit.clone(), request.chunk_size);
        run.start = now_epoch();
        run.total = tally.total;
        run.metadata = request.config.clone();
        tally.apply_counts(&mut run);

        let run_id = insert_run(&self.conn, &run)?;
        tracing::info!(run_id, total = run.total, "started new experiment run");

        self.current_run_id = Some(run_id);
        self.is_original_run = false;
        Ok(run_id)
    }

    /// Record a batch of observed status transitions.
    ///
    /// With `check_run`, a batch at least as large as the configured share
    /// of completed date/member jobs is treated as a restart and starts a
    /// new run. Otherwise the current run's counts are refreshed, and a new
    /// run is started only when the job count drifted. With `is_setstatus`
    /// the transitions are also written to the jobs' current rows.
    ///
    /// Returns the run id that was updated or created, or `None` when there
    /// was nothing to do.
    pub fn process_status_changes<J: TrackedJob>(
        &mut self,
        changes: &StatusChanges,
        jobs: &[J],
        request: &RunRequest,
        check_run: bool,
        is_setstatus: bool,
    ) -> Result<Option<i64>> {
        let Some(mut current) = self.max_run()? else {
            return Ok(None);
        };
        if changes.is_empty() || jobs.is_empty() {
            return Ok(None);
        }

        if check_run {
            let completed_in_groups = jobs
                .iter()
                .filter(|job| {
                    job.date().is_some()
                        && job.member().is_some()
                        && job.status() == JobStatus::Completed
                })
                .count();
            let threshold = (completed_in_groups as f64 * self.config.rebaseline_ratio).floor();

            if changes.len() as f64 >= threshold {
                if is_setstatus {
                    self.apply_status_changes(changes)?;
                }
                tracing::debug!(
                    changes = changes.len(),
                    completed_in_groups,
                    "significant status change; treating it as a new run"
                );
                let run_id = self.validate_current_run(jobs, request, true, false)?;
                return Ok(Some(run_id));
            }
        }

        let tally = RunTally::from_jobs(jobs);
        tally.apply_counts(&mut current);
        if is_setstatus {
            self.apply_status_changes(changes)?;
        }

        if current.total != tally.total {
            let carried = RunRequest {
                chunk_unit: current.chunk_unit.clone(),
                chunk_size: current.chunk_size,
                config: current.metadata.clone(),
            };
            let run_id = self.validate_current_run(jobs, &carried, true, false)?;
            Ok(Some(run_id))
        } else {
            update_run(&self.conn, &current)?;
            Ok(Some(current.run_id))
        }
    }

    /// Write explicit status changes to the current rows of the current run.
    ///
    /// Returns the number of rows changed.
    pub fn apply_status_changes(&self, changes: &StatusChanges) -> Result<usize> {
        let Some(run_id) = self.current_run_id else {
            return Ok(0);
        };
        if changes.is_empty() {
            return Ok(0);
        }

        let rows = self.current_run_rows(run_id, false)?;
        let now = now_epoch();
        let modified = now_string();

        let mut changed = Vec::new();
        for mut row in rows {
            let Some((_, new_status)) = changes.get(&row.job_name) else {
                continue;
            };
            if !is_tracked_change(*new_status) {
                continue;
            }
            row.status = *new_status;
            row.finish = match new_status {
                JobStatus::Completed | JobStatus::Failed => now,
                _ => 0,
            };
            row.modified = modified.clone();
            row.rowstatus = RowStatus::Changed;
            changed.push(row);
        }

        if changed.is_empty() {
            return Ok(0);
        }

        self.in_transaction(|conn| {
            for row in &changed {
                update_status_change(conn, row)?;
            }
            Ok(())
        })?;
        Ok(changed.len())
    }

    /// Stamp the current run as finished now.
    pub fn update_finish_time(&mut self) -> Result<Option<i64>> {
        let Some(mut run) = self.max_run()? else {
            return Ok(None);
        };
        run.finish = now_epoch();
        update_run(&self.conn, &run)?;

        self.current_run_id = Some(run.run_id);
        self.is_original_run = true;
        Ok(Some(run.run_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::JobListEntry;
    use crate::store::tests::setup_store;
    use crate::store::JobEvent;

    fn job_list(statuses: &[JobStatus]) -> Vec<JobListEntry> {
        statuses
            .iter()
            .enumerate()
            .map(|(i, status)| {
                JobListEntry::new(format!("a000_{}_SIM", i), *status).in_group("20200101", "fc0")
            })
            .collect()
    }

    fn changes_for(jobs: &[JobListEntry], count: usize, to: JobStatus) -> StatusChanges {
        jobs.iter()
            .take(count)
            .map(|job| (job.name.clone(), (job.status, to)))
            .collect()
    }

    #[test]
    fn test_tally() {
        let jobs = job_list(&[
            JobStatus::Completed,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Running,
            JobStatus::Waiting,
        ]);
        let tally = RunTally::from_jobs(&jobs);
        assert_eq!(tally.completed, 2);
        assert_eq!(tally.failed, 1);
        assert_eq!(tally.running, 1);
        assert_eq!(tally.queuing, 0);
        assert_eq!(tally.total, 5);
    }

    #[test]
    fn test_validate_requires_jobs() {
        let (_tmp, mut store) = setup_store();
        let empty: Vec<JobListEntry> = Vec::new();
        let result = store.validate_current_run(&empty, &RunRequest::default(), false, false);
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_validate_creates_run_on_total_drift() {
        let (_tmp, mut store) = setup_store();
        let placeholder = store.current_run_id().unwrap();
        let jobs = job_list(&[JobStatus::Completed, JobStatus::Queuing, JobStatus::Waiting]);
        let request = RunRequest::new("month", 1).with_config(r#"{"EXPID": "a000"}"#);

        // The placeholder run has total 0
        let run_id = store.validate_current_run(&jobs, &request, false, false).unwrap();
        assert!(run_id > placeholder);
        assert!(!store.is_original_run());

        let run = store.current_run().unwrap().unwrap();
        assert_eq!(run.run_id, run_id);
        assert_eq!(run.total, 3);
        assert_eq!(run.completed, 1);
        assert_eq!(run.queuing, 1);
        assert_eq!(run.chunk_unit, "month");
        assert_eq!(run.metadata, r#"{"EXPID": "a000"}"#);
        assert!(run.start > 0);
    }

    #[test]
    fn test_validate_updates_in_place() {
        let (_tmp, mut store) = setup_store();
        let request = RunRequest::new("month", 1);
        let jobs = job_list(&[JobStatus::Waiting, JobStatus::Waiting]);
        let run_id = store.validate_current_run(&jobs, &request, false, false).unwrap();
        store.update_finish_time().unwrap();
        assert!(store.current_run().unwrap().unwrap().finish > 0);

        let jobs = job_list(&[JobStatus::Completed, JobStatus::Running]);
        let again = store.validate_current_run(&jobs, &request, false, false).unwrap();
        assert_eq!(again, run_id);
        assert!(store.is_original_run());

        let run = store.current_run().unwrap().unwrap();
        assert_eq!(run.completed, 1);
        assert_eq!(run.running, 1);
        assert_eq!(run.finish, 0);
    }

    #[test]
    fn test_validate_only_update_overwrites_total() {
        let (_tmp, mut store) = setup_store();
        let request = RunRequest::new("day", 2);
        let run_id = store
            .validate_current_run(&job_list(&[JobStatus::Waiting; 4]), &request, false, false)
            .unwrap();

        let jobs = job_list(&[JobStatus::Waiting; 6]);
        let again = store.validate_current_run(&jobs, &request, false, true).unwrap();
        assert_eq!(again, run_id);
        assert_eq!(store.current_run().unwrap().unwrap().total, 6);
    }

    #[test]
    fn test_validate_must_create() {
        let (_tmp, mut store) = setup_store();
        let request = RunRequest::new("day", 2);
        let jobs = job_list(&[JobStatus::Waiting; 2]);
        let first = store.validate_current_run(&jobs, &request, false, false).unwrap();
        let second = store.validate_current_run(&jobs, &request, true, false).unwrap();
        assert!(second > first);
        assert_eq!(store.runs().unwrap().len(), 3);
    }

    #[test]
    fn test_status_changes_rebaseline_threshold() {
        let (_tmp, mut store) = setup_store();
        let request = RunRequest::new("month", 1);
        let jobs = job_list(&[JobStatus::Completed; 10]);
        let run_id = store.validate_current_run(&jobs, &request, false, false).unwrap();

        // 2 changes against 10 completed jobs stays in the same run
        let changes = changes_for(&jobs, 2, JobStatus::Waiting);
        let result = store
            .process_status_changes(&changes, &jobs, &request, true, false)
            .unwrap();
        assert_eq!(result, Some(run_id));

        // 9 changes reach floor(10 * 0.9)
        let changes = changes_for(&jobs, 9, JobStatus::Waiting);
        let result = store
            .process_status_changes(&changes, &jobs, &request, true, false)
            .unwrap()
            .unwrap();
        assert!(result > run_id);
        assert_eq!(store.current_run_id(), Some(result));
    }

    #[test]
    fn test_status_changes_without_completed_jobs_rebaseline() {
        let (_tmp, mut store) = setup_store();
        let request = RunRequest::new("month", 1);
        let jobs = job_list(&[JobStatus::Waiting; 3]);
        let run_id = store.validate_current_run(&jobs, &request, false, false).unwrap();

        let changes = changes_for(&jobs, 1, JobStatus::Ready);
        let result = store
            .process_status_changes(&changes, &jobs, &request, true, false)
            .unwrap()
            .unwrap();
        assert!(result > run_id);
    }

    #[test]
    fn test_status_changes_light_update_and_drift() {
        let (_tmp, mut store) = setup_store();
        let request = RunRequest::new("month", 1).with_config("cfg-1");
        let jobs = job_list(&[JobStatus::Waiting; 3]);
        let run_id = store.validate_current_run(&jobs, &request, false, false).unwrap();

        let jobs = job_list(&[JobStatus::Running, JobStatus::Waiting, JobStatus::Waiting]);
        let changes = changes_for(&jobs, 1, JobStatus::Running);
        let result = store
            .process_status_changes(&changes, &jobs, &RunRequest::default(), false, false)
            .unwrap();
        assert_eq!(result, Some(run_id));
        assert_eq!(store.current_run().unwrap().unwrap().running, 1);

        // One more job than the run knows about: new run, settings carried over
        let jobs = job_list(&[JobStatus::Waiting; 4]);
        let changes = changes_for(&jobs, 1, JobStatus::Ready);
        let result = store
            .process_status_changes(&changes, &jobs, &RunRequest::default(), false, false)
            .unwrap()
            .unwrap();
        assert!(result > run_id);
        let run = store.current_run().unwrap().unwrap();
        assert_eq!(run.total, 4);
        assert_eq!(run.chunk_unit, "month");
        assert_eq!(run.metadata, "cfg-1");
    }

    #[test]
    fn test_status_changes_nothing_to_do() {
        let (_tmp, mut store) = setup_store();
        let jobs = job_list(&[JobStatus::Waiting]);
        let result = store
            .process_status_changes(
                &StatusChanges::new(),
                &jobs,
                &RunRequest::default(),
                true,
                true,
            )
            .unwrap();
        assert_eq!(result, None);
    }

    #[test]
    fn test_apply_status_changes() {
        let (_tmp, mut store) = setup_store();
        store
            .write_submit_time(&JobEvent::new("A", 100, JobStatus::Submitted))
            .unwrap();
        store
            .write_submit_time(&JobEvent::new("B", 100, JobStatus::Submitted))
            .unwrap();

        let mut changes = StatusChanges::new();
        changes.insert("A".to_string(), (JobStatus::Submitted, JobStatus::Completed));
        changes.insert("B".to_string(), (JobStatus::Submitted, JobStatus::Waiting));
        changes.insert("C".to_string(), (JobStatus::Waiting, JobStatus::Failed));

        assert_eq!(store.apply_status_changes(&changes).unwrap(), 1);

        let a = &store.last_row("A").unwrap()[0];
        assert_eq!(a.status, JobStatus::Completed);
        assert!(a.finish > 0);
        assert_eq!(a.rowstatus, RowStatus::Changed);

        let b = &store.last_row("B").unwrap()[0];
        assert_eq!(b.status, JobStatus::Submitted);
        assert_eq!(b.rowstatus, RowStatus::Initial);
    }

    #[test]
    fn test_setstatus_applied_before_rebaseline() {
        let (_tmp, mut store) = setup_store();
        store
            .write_submit_time(&JobEvent::new("a000_0_SIM", 100, JobStatus::Submitted))
            .unwrap();
        let jobs = job_list(&[JobStatus::Completed]);
        let changes = changes_for(&jobs, 1, JobStatus::Running);

        store
            .process_status_changes(&changes, &jobs, &RunRequest::default(), true, true)
            .unwrap();
        let row = &store.last_row("a000_0_SIM").unwrap()[0];
        assert_eq!(row.status, JobStatus::Running);
        assert_eq!(row.finish, 0);
    }

    #[test]
    fn test_update_finish_time() {
        let (_tmp, mut store) = setup_store();
        let run_id = store.update_finish_time().unwrap();
        assert_eq!(run_id, store.current_run_id());
        assert!(store.current_run().unwrap().unwrap().finish > 0);
    }
}
