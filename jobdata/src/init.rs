//! Schema management for the job history database.
//!
//! # Tables
//!
//! - `job_data` - one row per historical snapshot of a job. Rows are never
//!   deleted; the current version of a job is the row with `last = 1`.
//! - `experiment_run` - one row per execution attempt of the workflow.
//! - `db_meta` - key/value metadata, holds the schema version marker.
//!
//! # Versions
//!
//! The schema only ever grows by adding columns. Databases stamped with an
//! older version are brought forward by an ordered list of `ADD COLUMN`
//! statements. Each statement stands on its own: one that fails (normally
//! because the column is already there) is logged and skipped.

use std::path::{Path, PathBuf};

use duckdb::{params, Connection, OptionalExt};

use crate::{Config, Error, Result};

/// Schema version written by this crate.
pub const CURRENT_DB_VERSION: i32 = 15;

/// First version with `job_data.nnodes` and `job_data.run_id`.
pub const NODES_AND_RUN_DB_VERSION: i32 = 10;

/// First version with `experiment_run.suspended` and `experiment_run.metadata`.
pub const EXPERIMENT_HEADER_CHANGES_DB_VERSION: i32 = 14;

/// Name of the secondary index on `job_data.job_name`.
const JOB_NAME_INDEX: &str = "id_job_name";

/// Additive migrations, oldest first.
const SCHEMA_MIGRATIONS: [&str; 9] = [
    // job_data
    "ALTER TABLE job_data ADD COLUMN nnodes BIGINT DEFAULT 0",
    "ALTER TABLE job_data ADD COLUMN run_id BIGINT",
    // version 15
    "ALTER TABLE job_data ADD COLUMN MaxRSS DOUBLE DEFAULT 0.0",
    "ALTER TABLE job_data ADD COLUMN AveRSS DOUBLE DEFAULT 0.0",
    "ALTER TABLE job_data ADD COLUMN out VARCHAR DEFAULT ''",
    "ALTER TABLE job_data ADD COLUMN err VARCHAR DEFAULT ''",
    "ALTER TABLE job_data ADD COLUMN rowstatus INTEGER DEFAULT 0",
    // experiment_run
    "ALTER TABLE experiment_run ADD COLUMN suspended BIGINT DEFAULT 0",
    "ALTER TABLE experiment_run ADD COLUMN metadata VARCHAR",
];

const CREATE_JOB_DATA: &str = r#"
    CREATE SEQUENCE IF NOT EXISTS job_data_id_seq START 1;

    CREATE TABLE IF NOT EXISTS job_data (
        id BIGINT PRIMARY KEY DEFAULT nextval('job_data_id_seq'),
        counter BIGINT NOT NULL,
        job_name VARCHAR NOT NULL,
        created VARCHAR NOT NULL,
        modified VARCHAR NOT NULL,
        submit BIGINT NOT NULL,
        start BIGINT NOT NULL,
        finish BIGINT NOT NULL,
        status VARCHAR NOT NULL,
        rowtype BIGINT NOT NULL,
        ncpus BIGINT NOT NULL,
        wallclock VARCHAR NOT NULL,
        qos VARCHAR NOT NULL,
        energy BIGINT NOT NULL,
        date VARCHAR NOT NULL,
        section VARCHAR NOT NULL,
        member VARCHAR NOT NULL,
        chunk BIGINT NOT NULL,
        last INTEGER NOT NULL,
        platform VARCHAR NOT NULL,
        job_id BIGINT NOT NULL,
        extra_data VARCHAR NOT NULL,
        nnodes BIGINT NOT NULL DEFAULT 0,
        run_id BIGINT,
        MaxRSS DOUBLE NOT NULL DEFAULT 0.0,
        AveRSS DOUBLE NOT NULL DEFAULT 0.0,
        out VARCHAR NOT NULL DEFAULT '',
        err VARCHAR NOT NULL DEFAULT '',
        rowstatus INTEGER NOT NULL DEFAULT 0,
        UNIQUE (counter, job_name)
    );
"#;

const CREATE_EXPERIMENT_RUN: &str = r#"
    CREATE SEQUENCE IF NOT EXISTS experiment_run_id_seq START 1;

    CREATE TABLE IF NOT EXISTS experiment_run (
        run_id BIGINT PRIMARY KEY DEFAULT nextval('experiment_run_id_seq'),
        created VARCHAR NOT NULL,
        start BIGINT NOT NULL,
        finish BIGINT,
        chunk_unit VARCHAR NOT NULL,
        chunk_size BIGINT NOT NULL,
        completed BIGINT NOT NULL,
        total BIGINT NOT NULL,
        failed BIGINT NOT NULL,
        queuing BIGINT NOT NULL,
        running BIGINT NOT NULL,
        submitted BIGINT NOT NULL,
        suspended BIGINT NOT NULL DEFAULT 0,
        metadata VARCHAR
    );
"#;

const CREATE_DB_META: &str = r#"
    CREATE TABLE IF NOT EXISTS db_meta (
        key VARCHAR PRIMARY KEY,
        value VARCHAR NOT NULL
    );
"#;

/// An open history database whose schema has been brought up to date.
pub struct SchemaHandle {
    pub conn: Connection,
    /// Version the database is stamped with after ensuring the schema.
    pub version: i32,
    /// True when the database file did not exist before.
    pub created: bool,
}

/// Open (or create) a history database and make its schema current.
///
/// Failing to open the file is the only fatal outcome. DDL statements
/// that fail are logged and skipped.
pub fn ensure_schema(db_path: &Path) -> Result<SchemaHandle> {
    let created = !db_path.exists();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let conn = Connection::open(db_path).map_err(|source| Error::Open {
        path: db_path.to_path_buf(),
        source,
    })?;

    let version = if created {
        create_schema(&conn)?
    } else {
        upgrade_schema(&conn)?
    };

    Ok(SchemaHandle {
        conn,
        version,
        created,
    })
}

/// Create every table and index at the current version.
fn create_schema(conn: &Connection) -> Result<i32> {
    try_execute_batch(conn, "create experiment_run", CREATE_EXPERIMENT_RUN);
    try_execute_batch(conn, "create job_data", CREATE_JOB_DATA);
    create_index(conn);
    stamp_version(conn, CURRENT_DB_VERSION)?;
    tracing::debug!(version = CURRENT_DB_VERSION, "history database created");
    Ok(CURRENT_DB_VERSION)
}

/// Bring an existing database forward to the current version.
fn upgrade_schema(conn: &Connection) -> Result<i32> {
    let version = read_version(conn)?;

    if version > CURRENT_DB_VERSION {
        tracing::info!(
            found = version,
            supported = CURRENT_DB_VERSION,
            "history database was written by a newer version; some data may be ignored"
        );
        return Ok(version);
    }
    if version == CURRENT_DB_VERSION {
        return Ok(version);
    }

    tracing::info!(
        from = version,
        to = CURRENT_DB_VERSION,
        "history database schema needs update"
    );

    // A file without tables gets them whole; the ALTERs then fail harmlessly
    try_execute_batch(conn, "create job_data", CREATE_JOB_DATA);

    // DuckDB refuses to alter a table that carries an explicit index
    try_execute_batch(
        conn,
        "drop job_name index",
        &format!("DROP INDEX IF EXISTS {}", JOB_NAME_INDEX),
    );
    apply_migrations(conn);
    create_index(conn);
    try_execute_batch(conn, "create experiment_run", CREATE_EXPERIMENT_RUN);

    stamp_version(conn, CURRENT_DB_VERSION)?;
    tracing::info!(version = CURRENT_DB_VERSION, "history database version set");
    Ok(CURRENT_DB_VERSION)
}

/// Apply every additive migration, ignoring the ones already in place.
fn apply_migrations(conn: &Connection) {
    for statement in SCHEMA_MIGRATIONS {
        if let Err(e) = conn.execute_batch(statement) {
            tracing::debug!(
                statement,
                error = %e,
                "schema change not applied; it is safe to ignore this message"
            );
        }
    }
}

fn create_index(conn: &Connection) {
    try_execute_batch(
        conn,
        "create job_name index",
        &format!(
            "CREATE INDEX IF NOT EXISTS {} ON job_data(job_name)",
            JOB_NAME_INDEX
        ),
    );
}

fn try_execute_batch(conn: &Connection, what: &str, sql: &str) {
    if let Err(e) = conn.execute_batch(sql) {
        tracing::warn!(what, error = %e, "schema statement failed");
    }
}

/// Read the schema version marker (0 when the database was never stamped).
pub fn read_version(conn: &Connection) -> Result<i32> {
    if !table_exists(conn, "db_meta")? {
        return Ok(0);
    }

    let value: Option<String> = conn
        .query_row(
            "SELECT value FROM db_meta WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()?;

    match value {
        Some(v) => v
            .trim()
            .parse::<i32>()
            .map(|v| v.max(0))
            .map_err(|_| Error::Schema(format!("invalid schema version marker: {}", v))),
        None => Ok(0),
    }
}

/// Check whether a table is present in the database.
pub fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM information_schema.tables WHERE table_name = ?",
        params![table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Write the schema version marker.
pub fn stamp_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute_batch(CREATE_DB_META)?;
    conn.execute(
        "INSERT OR REPLACE INTO db_meta (key, value) VALUES ('schema_version', ?)",
        params![version.to_string()],
    )?;
    Ok(())
}

/// Path of the history database of an experiment.
pub fn database_path(config: &Config, expid: &str) -> PathBuf {
    config.db_path(expid)
}

/// Check if a history database exists for the experiment.
pub fn is_initialized(config: &Config, expid: &str) -> bool {
    config.db_path(expid).exists()
}
