//! Row codec: flat `job_data`/`experiment_run` rows to and from records.
//!
//! Column lists depend on the schema version the database is stamped with.
//! Columns a version lacks are not selected, and the decoder fills in the
//! documented defaults for them.

use duckdb::{params, Connection, Row};

use crate::init::{EXPERIMENT_HEADER_CHANGES_DB_VERSION, NODES_AND_RUN_DB_VERSION};
use crate::schema::{ExperimentRun, ExtraData, JobRecord, JobStatus, RowStatus};
use crate::Result;

/// First version with the resource and output columns (`MaxRSS` .. `rowstatus`).
pub const RESOURCE_COLUMNS_DB_VERSION: i32 = 15;

const JOB_BASE_COLUMNS: &str = "id, counter, job_name, created, modified, submit, start, finish, \
     status, rowtype, ncpus, wallclock, qos, energy, date, section, member, chunk, last, \
     platform, job_id, extra_data";

const RUN_BASE_COLUMNS: &str = "run_id, created, start, finish, chunk_unit, chunk_size, \
     completed, total, failed, queuing, running, submitted";

/// SELECT list for `job_data` at the given schema version.
pub fn job_columns(version: i32) -> String {
    let mut columns = JOB_BASE_COLUMNS.to_string();
    if version >= NODES_AND_RUN_DB_VERSION {
        columns.push_str(", nnodes, run_id");
    }
    if version >= RESOURCE_COLUMNS_DB_VERSION {
        columns.push_str(", MaxRSS, AveRSS, out, err, rowstatus");
    }
    columns
}

/// SELECT list for `experiment_run` at the given schema version.
pub fn run_columns(version: i32) -> String {
    let mut columns = RUN_BASE_COLUMNS.to_string();
    if version >= EXPERIMENT_HEADER_CHANGES_DB_VERSION {
        columns.push_str(", suspended, metadata");
    }
    columns
}

/// Decode a row selected with [`job_columns`] for the same version.
pub fn decode_job_row(row: &Row<'_>, version: i32) -> duckdb::Result<JobRecord> {
    let status: String = row.get(8)?;
    let extra_data: Option<String> = row.get(21)?;
    let last: i64 = row.get(18)?;

    let mut record = JobRecord {
        id: row.get(0)?,
        counter: row.get(1)?,
        job_name: row.get(2)?,
        created: row.get(3)?,
        modified: row.get(4)?,
        submit: row.get(5)?,
        start: row.get(6)?,
        finish: row.get(7)?,
        status: JobStatus::parse_lenient(&status),
        rowtype: row.get(9)?,
        ncpus: row.get(10)?,
        wallclock: row.get(11)?,
        qos: row.get(12)?,
        energy: row.get(13)?,
        date: row.get(14)?,
        section: row.get(15)?,
        member: row.get(16)?,
        chunk: row.get(17)?,
        last: last == 1,
        platform: row.get(19)?,
        job_id: row.get(20)?,
        extra_data: ExtraData::parse(extra_data.as_deref().unwrap_or("")),
        nnodes: 0,
        run_id: None,
        max_rss: 0.0,
        ave_rss: 0.0,
        out: String::new(),
        err: String::new(),
        rowstatus: RowStatus::Faulty,
        require_update: false,
    };

    let mut idx = 22;
    if version >= NODES_AND_RUN_DB_VERSION {
        record.nnodes = row.get::<_, Option<i64>>(idx)?.unwrap_or(0);
        record.run_id = row.get(idx + 1)?;
        idx += 2;
    }
    if version >= RESOURCE_COLUMNS_DB_VERSION {
        record.max_rss = row.get::<_, Option<f64>>(idx)?.unwrap_or(0.0);
        record.ave_rss = row.get::<_, Option<f64>>(idx + 1)?.unwrap_or(0.0);
        record.out = row.get::<_, Option<String>>(idx + 2)?.unwrap_or_default();
        record.err = row.get::<_, Option<String>>(idx + 3)?.unwrap_or_default();
        record.rowstatus = row
            .get::<_, Option<i64>>(idx + 4)?
            .map(RowStatus::from_code)
            .unwrap_or(RowStatus::Faulty);
    }

    Ok(record)
}

/// Decode a row selected with [`run_columns`] for the same version.
pub fn decode_run_row(row: &Row<'_>, version: i32) -> duckdb::Result<ExperimentRun> {
    let mut run = ExperimentRun {
        run_id: row.get(0)?,
        created: row.get(1)?,
        start: row.get(2)?,
        finish: row.get::<_, Option<i64>>(3)?.unwrap_or(0),
        chunk_unit: row.get(4)?,
        chunk_size: row.get(5)?,
        completed: row.get(6)?,
        total: row.get(7)?,
        failed: row.get(8)?,
        queuing: row.get(9)?,
        running: row.get(10)?,
        submitted: row.get(11)?,
        suspended: 0,
        metadata: String::new(),
    };
    if version >= EXPERIMENT_HEADER_CHANGES_DB_VERSION {
        run.suspended = row.get::<_, Option<i64>>(12)?.unwrap_or(0);
        run.metadata = row.get::<_, Option<String>>(13)?.unwrap_or_default();
    }
    Ok(run)
}

/// Run a `job_data` query whose select list is `{columns}` and decode every row.
pub fn select_jobs(
    conn: &Connection,
    version: i32,
    sql_template: &str,
    params: &[&dyn duckdb::ToSql],
) -> Result<Vec<JobRecord>> {
    let sql = sql_template.replace("{columns}", &job_columns(version));
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params, |row| decode_job_row(row, version))?;
    let mut records = Vec::new();
    for row in rows {
        records.push(row?);
    }
    Ok(records)
}

/// Run an `experiment_run` query whose select list is `{columns}`.
pub fn select_runs(
    conn: &Connection,
    version: i32,
    sql_template: &str,
    params: &[&dyn duckdb::ToSql],
) -> Result<Vec<ExperimentRun>> {
    let sql = sql_template.replace("{columns}", &run_columns(version));
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params, |row| decode_run_row(row, version))?;
    let mut runs = Vec::new();
    for row in rows {
        runs.push(row?);
    }
    Ok(runs)
}

/// Insert a job row and return its new id.
pub fn insert_job(conn: &Connection, record: &JobRecord) -> Result<i64> {
    let id = conn.query_row(
        r#"
        INSERT INTO job_data (counter, job_name, created, modified, submit, start, finish,
            status, rowtype, ncpus, wallclock, qos, energy, date, section, member, chunk,
            last, platform, job_id, extra_data, nnodes, run_id, MaxRSS, AveRSS, out, err,
            rowstatus)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        RETURNING id
        "#,
        params![
            record.counter,
            record.job_name,
            record.created,
            record.modified,
            record.submit,
            record.start,
            record.finish,
            record.status.as_str(),
            record.rowtype,
            record.ncpus,
            record.wallclock,
            record.qos,
            record.energy,
            record.date,
            record.section,
            record.member,
            record.chunk,
            record.last as i64,
            record.platform,
            record.job_id,
            record.extra_data.encode(),
            record.nnodes,
            record.run_id,
            record.max_rss,
            record.ave_rss,
            record.out,
            record.err,
            record.rowstatus.code(),
        ],
        |row| row.get(0),
    )?;
    Ok(id)
}

/// Insert an experiment run and return its new run id.
pub fn insert_run(conn: &Connection, run: &ExperimentRun) -> Result<i64> {
    let run_id = conn.query_row(
        r#"
        INSERT INTO experiment_run (created, start, finish, chunk_unit, chunk_size, completed,
            total, failed, queuing, running, submitted, suspended, metadata)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        RETURNING run_id
        "#,
        params![
            run.created,
            run.start,
            run.finish,
            run.chunk_unit,
            run.chunk_size,
            run.completed,
            run.total,
            run.failed,
            run.queuing,
            run.running,
            run.submitted,
            run.suspended,
            run.metadata,
        ],
        |row| row.get(0),
    )?;
    Ok(run_id)
}

/// Persist the mutable columns of an experiment run.
pub fn update_run(conn: &Connection, run: &ExperimentRun) -> Result<()> {
    conn.execute(
        r#"
        UPDATE experiment_run SET finish = ?, chunk_unit = ?, chunk_size = ?, completed = ?,
            total = ?, failed = ?, queuing = ?, running = ?, submitted = ?, suspended = ?
        WHERE run_id = ?
        "#,
        params![
            run.finish,
            run.chunk_unit,
            run.chunk_size,
            run.completed,
            run.total,
            run.failed,
            run.queuing,
            run.running,
            run.submitted,
            run.suspended,
            run.run_id,
        ],
    )?;
    Ok(())
}

/// Persist a start event on an existing row.
pub fn update_start(conn: &Connection, record: &JobRecord) -> Result<()> {
    conn.execute(
        r#"
        UPDATE job_data SET start = ?, modified = ?, job_id = ?, status = ?, rowtype = ?, qos = ?
        WHERE id = ?
        "#,
        params![
            record.start,
            record.modified,
            record.job_id,
            record.status.as_str(),
            record.rowtype,
            record.qos,
            record.id,
        ],
    )?;
    Ok(())
}

/// Persist a finish event on an existing row.
pub fn update_finish(conn: &Connection, record: &JobRecord) -> Result<()> {
    conn.execute(
        r#"
        UPDATE job_data SET submit = ?, start = ?, finish = ?, modified = ?, job_id = ?,
            status = ?, energy = ?, extra_data = ?, nnodes = ?, ncpus = ?, rowstatus = ?,
            out = ?, err = ?, MaxRSS = ?, AveRSS = ?
        WHERE id = ?
        "#,
        params![
            record.submit,
            record.start,
            record.finish,
            record.modified,
            record.job_id,
            record.status.as_str(),
            record.energy,
            record.extra_data.encode(),
            record.nnodes,
            record.ncpus,
            record.rowstatus.code(),
            record.out,
            record.err,
            record.max_rss,
            record.ave_rss,
            record.id,
        ],
    )?;
    Ok(())
}

/// Persist reconciled accounting values.
pub fn update_processed(conn: &Connection, record: &JobRecord) -> Result<()> {
    conn.execute(
        r#"
        UPDATE job_data SET energy = ?, modified = ?, MaxRSS = ?, AveRSS = ?, rowstatus = ?,
            submit = ?, start = ?, finish = ?
        WHERE id = ?
        "#,
        params![
            record.energy,
            record.modified,
            record.max_rss,
            record.ave_rss,
            RowStatus::Processed.code(),
            record.submit,
            record.start,
            record.finish,
            record.id,
        ],
    )?;
    Ok(())
}

/// Persist an explicit status change.
pub fn update_status_change(conn: &Connection, record: &JobRecord) -> Result<()> {
    conn.execute(
        "UPDATE job_data SET finish = ?, modified = ?, status = ?, rowstatus = ? WHERE id = ?",
        params![
            record.finish,
            record.modified,
            record.status.as_str(),
            record.rowstatus.code(),
            record.id,
        ],
    )?;
    Ok(())
}
