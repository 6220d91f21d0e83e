//! Energy attribution for finished jobs of the current run.
//!
//! Jobs packed in a wrapper share one scheduler allocation, so the scheduler
//! reports accounting per step of the wrapper rather than per job. The pass
//! maps those steps back onto the member jobs: one to one when the counts
//! match, proportionally to `ncpus * running_time` otherwise.

use super::codec::update_processed;
use super::Store;
use crate::schema::{now_epoch, now_string, JobRecord, StepRecord, ROWTYPE_NORMAL};
use crate::{Error, Result};

/// Outcome of an attribution pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub run_id: Option<i64>,
    /// Finished rows examined.
    pub rows: usize,
    /// Wrapper groups examined.
    pub wrappers: usize,
    /// Groups whose members reported their own energy.
    pub direct: usize,
    /// Groups attributed step by step.
    pub exact: usize,
    /// Groups attributed proportionally.
    pub approximated: usize,
    /// Groups without usable accounting.
    pub skipped: usize,
    /// Rows written back.
    pub updated: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attribution {
    Direct,
    Exact,
    Approximated,
    Skipped,
}

impl Store {
    /// Attribute energy to the finished jobs of the current run and persist
    /// the rows that changed, in one transaction.
    pub fn reconcile_current_run(&self) -> Result<ReconcileSummary> {
        self.reconcile_inner()
            .map_err(|e| Error::Reconciliation(e.to_string()))
    }

    fn reconcile_inner(&self) -> Result<ReconcileSummary> {
        let mut summary = ReconcileSummary::default();

        let Some(run) = self.max_run()? else {
            return Ok(summary);
        };
        summary.run_id = Some(run.run_id);

        let mut rows = self.current_run_rows(run.run_id, true)?;
        if rows.is_empty() {
            tracing::warn!(run_id = run.run_id, "no finished jobs to attribute energy to");
            return Ok(summary);
        }
        summary.rows = rows.len();

        for row in &mut rows {
            row.extra_data.remove_parents();
        }

        let mut codes: Vec<i64> = rows
            .iter()
            .map(|row| row.rowtype)
            .filter(|&rowtype| rowtype > ROWTYPE_NORMAL)
            .collect();
        codes.sort_unstable();
        codes.dedup();

        let now = now_epoch();
        for code in codes {
            let mut members: Vec<usize> = (0..rows.len())
                .filter(|&i| rows[i].rowtype == code)
                .collect();
            members.sort_by(|&a, &b| rows[b].id.cmp(&rows[a].id));

            summary.wrappers += 1;
            match attribute_wrapper(&mut rows, &members, now) {
                Attribution::Direct => summary.direct += 1,
                Attribution::Exact => summary.exact += 1,
                Attribution::Approximated => summary.approximated += 1,
                Attribution::Skipped => {
                    tracing::debug!(wrapper = code, "wrapper has no usable accounting");
                    summary.skipped += 1;
                }
            }
        }

        for row in rows.iter_mut().filter(|row| row.rowtype == ROWTYPE_NORMAL) {
            if let Some(energy) = row.extra_data.standalone_energy() {
                row.set_energy(energy);
            }
        }

        let modified = now_string();
        let changed: Vec<&mut JobRecord> =
            rows.iter_mut().filter(|row| row.require_update).collect();
        summary.updated = changed.len();

        self.in_transaction(|conn| {
            for row in changed {
                row.modified = modified.clone();
                update_processed(conn, row)?;
            }
            Ok(())
        })?;

        tracing::info!(
            run_id = run.run_id,
            wrappers = summary.wrappers,
            updated = summary.updated,
            "energy attribution finished"
        );
        Ok(summary)
    }
}

/// Attribute energy within one wrapper group.
///
/// `members` index into `rows`, ordered by descending id.
fn attribute_wrapper(rows: &mut [JobRecord], members: &[usize], now: i64) -> Attribution {
    let mut steps: Option<Vec<StepRecord>> = None;

    for &i in members {
        if let Some(energy) = rows[i].extra_data.direct_energy() {
            rows[i].set_energy(energy);
            continue;
        }

        let richest = richest_description(rows, members);
        let description = &rows[richest].extra_data;
        let mut keys = description.step_keys();
        if keys.is_empty() {
            keys.extend(description.main_step_key());
        }
        steps = Some(keys.iter().filter_map(|key| description.step(key)).collect());
        break;
    }

    let Some(steps) = steps else {
        return Attribution::Direct;
    };
    let total_energy: i64 = steps.iter().map(|step| step.energy).sum();
    if steps.is_empty() || total_energy <= 0 {
        return Attribution::Skipped;
    }

    if members.len() == steps.len() {
        for (&i, step) in members.iter().zip(&steps) {
            let row = &mut rows[i];
            row.set_energy(step.energy);
            if step.submit > 0 {
                row.submit = step.submit;
            }
            if step.start > 0 {
                row.start = step.start;
            }
            if step.finish > 0 {
                row.finish = step.finish;
            }
            if step.max_rss > 0.0 {
                row.max_rss = step.max_rss;
            }
            if step.ave_rss > 0.0 {
                row.ave_rss = step.ave_rss;
            }
            row.require_update = true;
        }
        return Attribution::Exact;
    }

    let running: Vec<usize> = members
        .iter()
        .copied()
        .filter(|&i| rows[i].running_time_at(now) > 0)
        .collect();
    let weight_total: i64 = running
        .iter()
        .map(|&i| rows[i].ncpus * rows[i].running_time_at(now))
        .sum();
    if weight_total <= 0 {
        return Attribution::Skipped;
    }

    for i in running {
        let weight = rows[i].ncpus * rows[i].running_time_at(now);
        let share = weight as f64 / weight_total as f64 * total_energy as f64;
        rows[i].set_energy(share.round() as i64);
    }
    Attribution::Approximated
}

/// Member with the largest extra data; the first one wins ties.
fn richest_description(rows: &[JobRecord], members: &[usize]) -> usize {
    let mut best = members[0];
    for &i in &members[1..] {
        if rows[i].extra_data.encoded_len() > rows[best].extra_data.encoded_len() {
            best = i;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{Accounting, AccountingReport};
    use crate::schema::{ExtraData, JobStatus, RowStatus};
    use crate::store::tests::setup_store;
    use crate::store::{FinishDetails, JobEvent};
    use duckdb::params;
    use std::collections::HashMap;

    const STEPS_3: &str = r#"{
        "900.batch": {"energy": "5"},
        "900.0": {"submit": "2021-03-01T10:00:00", "start": "2021-03-01T10:00:10",
                  "finish": "2021-03-01T10:10:00", "energy": "100", "MaxRSS": "1K"},
        "900.1": {"submit": "2021-03-01T10:00:00", "start": "2021-03-01T10:10:10",
                  "finish": "2021-03-01T10:20:00", "energy": "200"},
        "900.2": {"submit": "2021-03-01T10:00:00", "start": "2021-03-01T10:20:10",
                  "finish": "2021-03-01T10:30:00", "energy": "300"}
    }"#;

    fn wrapped_store(names: &[&str], code: i64) -> (tempfile::TempDir, Store) {
        let (tmp, store) = setup_store();
        let codes: HashMap<String, i64> = names.iter().map(|n| (n.to_string(), code)).collect();
        (tmp, store.with_wrapper_lookup(codes))
    }

    /// Submit, start and finish a job without accounting.
    fn run_job(store: &mut Store, name: &str, ncpus: i64, start: i64, finish: i64) {
        let event =
            JobEvent::new(name, start - 10, JobStatus::Submitted).with_resources(ncpus, "01:00");
        store.write_submit_time(&event).unwrap();
        store
            .write_start_time(&JobEvent::new(name, start, JobStatus::Running))
            .unwrap();
        store
            .write_finish_time(
                &JobEvent::new(name, finish, JobStatus::Completed),
                &FinishDetails::default(),
                None,
            )
            .unwrap();
    }

    fn set_extra_data(store: &Store, name: &str, extra: &str) {
        let extra = ExtraData::parse(extra).encode();
        store
            .conn
            .execute(
                "UPDATE job_data SET extra_data = ? WHERE job_name = ? AND last = 1",
                params![extra, name],
            )
            .unwrap();
    }

    fn last(store: &Store, name: &str) -> JobRecord {
        store.last_row(name).unwrap().remove(0)
    }

    #[test]
    fn test_exact_attribution_in_descending_id_order() {
        let names = ["J1", "J2", "J3"];
        let (_tmp, mut store) = wrapped_store(&names, 5_001);
        for name in names {
            run_job(&mut store, name, 4, 1_000, 2_000);
        }
        set_extra_data(&store, "J3", STEPS_3);

        let summary = store.reconcile_current_run().unwrap();
        assert_eq!(summary.wrappers, 1);
        assert_eq!(summary.exact, 1);
        assert_eq!(summary.updated, 3);

        // Newest member takes the first step
        assert_eq!(last(&store, "J3").energy, 100);
        assert_eq!(last(&store, "J2").energy, 200);
        assert_eq!(last(&store, "J1").energy, 300);

        let expected = ExtraData::parse(STEPS_3).step("900.0").unwrap();
        let j3 = last(&store, "J3");
        assert_eq!(j3.start, expected.start);
        assert_eq!(j3.finish, expected.finish);
        assert_eq!(j3.max_rss, 1_000.0);
        assert_eq!(j3.rowstatus, RowStatus::Processed);
    }

    #[test]
    fn test_proportional_attribution() {
        let names = ["P1", "P2", "P3", "P4"];
        let (_tmp, mut store) = wrapped_store(&names, 7_001);
        run_job(&mut store, "P1", 1, 1_000, 1_100);
        run_job(&mut store, "P2", 2, 1_000, 1_100);
        run_job(&mut store, "P3", 3, 1_000, 1_100);
        // No running time, left out of the split
        run_job(&mut store, "P4", 8, 1_000, 1_000);
        set_extra_data(
            &store,
            "P4",
            r#"{"77.0": {"energy": "25"}, "77.1": {"energy": "35"}}"#,
        );

        let summary = store.reconcile_current_run().unwrap();
        assert_eq!(summary.approximated, 1);

        assert_eq!(last(&store, "P1").energy, 10);
        assert_eq!(last(&store, "P2").energy, 20);
        assert_eq!(last(&store, "P3").energy, 30);
        assert_eq!(last(&store, "P4").energy, 0);
        assert_eq!(last(&store, "P4").rowstatus, RowStatus::Completed);
    }

    #[test]
    fn test_single_aggregate_step_is_split_proportionally() {
        let names = ["A1", "A2", "A3"];
        let (_tmp, mut store) = wrapped_store(&names, 9_001);
        run_job(&mut store, "A1", 1, 1_000, 1_100);
        run_job(&mut store, "A2", 2, 1_000, 1_100);
        run_job(&mut store, "A3", 3, 1_000, 1_100);
        // No dotted step keys: the job id key is the only step
        set_extra_data(&store, "A3", r#"{"777": {"energy": "60"}}"#);

        let summary = store.reconcile_current_run().unwrap();
        assert_eq!(summary.wrappers, 1);
        assert_eq!(summary.approximated, 1);
        assert_eq!(summary.updated, 3);

        let energies: Vec<i64> = names.iter().map(|name| last(&store, name).energy).collect();
        assert_eq!(energies, vec![10, 20, 30]);
        assert_eq!(last(&store, "A1").rowstatus, RowStatus::Processed);
    }

    #[test]
    fn test_direct_energy_members() {
        let names = ["D1", "D2"];
        let (_tmp, mut store) = wrapped_store(&names, 3_001);
        for name in names {
            run_job(&mut store, name, 1, 1_000, 1_100);
            set_extra_data(&store, name, r#"{"energy": "1.5K"}"#);
        }

        let summary = store.reconcile_current_run().unwrap();
        assert_eq!(summary.direct, 1);
        assert_eq!(last(&store, "D1").energy, 1_500);
        assert_eq!(last(&store, "D2").energy, 1_500);
    }

    #[test]
    fn test_wrapper_without_steps_is_skipped() {
        let names = ["S1", "S2"];
        let (_tmp, mut store) = wrapped_store(&names, 3_001);
        for name in names {
            run_job(&mut store, name, 1, 1_000, 1_100);
        }

        let summary = store.reconcile_current_run().unwrap();
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.updated, 0);
        assert_eq!(last(&store, "S1").energy, 0);
    }

    #[test]
    fn test_standalone_batch_fallback() {
        let (_tmp, mut store) = setup_store();
        run_job(&mut store, "SINGLE", 1, 1_000, 1_100);
        set_extra_data(
            &store,
            "SINGLE",
            r#"{
                "55": {"energy": "NA"},
                "55.batch": {"energy": "900"},
                "55.extern": {"energy": "1"}
            }"#,
        );
        run_job(&mut store, "EMPTY", 1, 1_000, 1_100);

        let summary = store.reconcile_current_run().unwrap();
        assert_eq!(summary.wrappers, 0);
        assert_eq!(summary.updated, 1);
        assert_eq!(last(&store, "SINGLE").energy, 900);
        assert_eq!(last(&store, "EMPTY").energy, 0);
    }

    #[test]
    fn test_unfinished_rows_are_ignored() {
        let (_tmp, mut store) = setup_store();
        store
            .write_submit_time(&JobEvent::new("WAITING", 100, JobStatus::Submitted))
            .unwrap();
        let summary = store.reconcile_current_run().unwrap();
        assert_eq!(summary.rows, 0);
        assert_eq!(summary.updated, 0);
    }

    struct EndOfWrapper;

    impl Accounting for EndOfWrapper {
        fn fetch_accounting(
            &self,
            _job_id: i64,
            _is_packed: bool,
        ) -> crate::Result<AccountingReport> {
            Ok(AccountingReport {
                extra_data: ExtraData::parse(
                    r#"{"31.0": {"energy": "40"}, "31.1": {"energy": "60"}}"#,
                ),
                end_of_wrapper: true,
                ..Default::default()
            })
        }
    }

    #[test]
    fn test_end_of_wrapper_triggers_attribution() {
        let names = ["W1", "W2"];
        let (_tmp, mut store) = wrapped_store(&names, 16_001);
        run_job(&mut store, "W1", 1, 1_000, 1_100);

        store
            .write_submit_time(&JobEvent::new("W2", 990, JobStatus::Submitted).with_job_id(31))
            .unwrap();
        store
            .write_start_time(&JobEvent::new("W2", 1_000, JobStatus::Running).with_job_id(31))
            .unwrap();
        store
            .write_finish_time(
                &JobEvent::new("W2", 1_100, JobStatus::Completed).with_job_id(31),
                &FinishDetails::default(),
                Some(&EndOfWrapper),
            )
            .unwrap();

        assert_eq!(last(&store, "W2").energy, 40);
        assert_eq!(last(&store, "W1").energy, 60);
        assert_eq!(last(&store, "W1").rowstatus, RowStatus::Processed);
    }
}
