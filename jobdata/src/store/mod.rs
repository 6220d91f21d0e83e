//! Store - the job history database of one experiment.
//!
//! Owns a single DuckDB connection for its whole lifetime. Operations are
//! split by concern:
//!
//! - `runs` - experiment run tracking
//! - `jobs` - job lifecycle writes (submit, start, finish)
//! - `energy` - energy attribution for finished wrapper batches
//! - `reports` - read-only queries

pub mod codec;
mod energy;
mod jobs;
mod reports;
mod runs;

use chrono::{DateTime, NaiveDate, NaiveTime, TimeDelta, Utc};
use duckdb::{
    types::{TimeUnit, ValueRef},
    Connection,
};

use crate::collab::{NoWrappers, WrapperLookup};
use crate::init::{self, EXPERIMENT_HEADER_CHANGES_DB_VERSION};
use crate::{Config, Error, Result};

pub use energy::ReconcileSummary;
pub use jobs::{FinishDetails, JobEvent};
pub use runs::{RunRequest, RunTally, StatusChanges};

/// What a lifecycle write did to the history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// A new row version was inserted.
    Inserted,
    /// The current row was updated in place.
    Updated,
    /// The current row had already started; nothing was written.
    AlreadyStarted,
    /// A missing earlier event was synthesized before applying this one.
    Synthesized,
}

/// Job history database of one experiment.
pub struct Store {
    config: Config,
    expid: String,
    conn: Connection,
    db_version: i32,
    current_run_id: Option<i64>,
    is_original_run: bool,
    wrappers: Box<dyn WrapperLookup>,
}

impl Store {
    /// Open the history database of an experiment for writing.
    ///
    /// Creates the file and schema when missing, migrates older schemas,
    /// and resolves the current experiment run (inserting a default one on
    /// an empty database).
    pub fn open(config: Config, expid: &str) -> Result<Self> {
        let handle = init::ensure_schema(&config.db_path(expid))?;
        if handle.created {
            tracing::info!(expid, "created job history database");
        }

        let mut store = Self {
            config,
            expid: expid.to_string(),
            conn: handle.conn,
            db_version: handle.version,
            current_run_id: None,
            is_original_run: true,
            wrappers: Box::new(NoWrappers),
        };
        store.resolve_current_run()?;
        Ok(store)
    }

    /// Open an existing history database without creating or migrating it.
    pub fn open_existing(config: Config, expid: &str) -> Result<Self> {
        let path = config.db_path(expid);
        if !path.exists() {
            return Err(Error::NotInitialized(path));
        }

        let conn = Connection::open(&path).map_err(|source| Error::Open {
            path: path.clone(),
            source,
        })?;
        let db_version = init::read_version(&conn)?;

        let mut store = Self {
            config,
            expid: expid.to_string(),
            conn,
            db_version,
            current_run_id: None,
            is_original_run: true,
            wrappers: Box::new(NoWrappers),
        };
        store.current_run_id = store.max_run()?.map(|run| run.run_id);
        Ok(store)
    }

    /// Check whether an experiment has a history database.
    pub fn exists(config: &Config, expid: &str) -> bool {
        init::is_initialized(config, expid)
    }

    /// Resolve wrapper codes through the given lookup.
    pub fn with_wrapper_lookup(mut self, lookup: impl WrapperLookup + 'static) -> Self {
        self.wrappers = Box::new(lookup);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn expid(&self) -> &str {
        &self.expid
    }

    /// Schema version the database is stamped with.
    pub fn db_version(&self) -> i32 {
        self.db_version
    }

    /// True when the experiment run table carries the header columns.
    pub fn is_header_ready(&self) -> bool {
        self.db_version >= EXPERIMENT_HEADER_CHANGES_DB_VERSION
    }

    /// Run id new job rows are attached to.
    pub fn current_run_id(&self) -> Option<i64> {
        self.current_run_id
    }

    /// False right after this store created a new experiment run.
    pub fn is_original_run(&self) -> bool {
        self.is_original_run
    }

    /// Run `f` inside a transaction, rolling back if it fails.
    fn in_transaction<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        self.conn.execute("BEGIN TRANSACTION", [])?;

        match f(&self.conn) {
            Ok(value) => {
                self.conn.execute("COMMIT", [])?;
                Ok(value)
            }
            Err(e) => {
                let _ = self.conn.execute("ROLLBACK", []);
                Err(e)
            }
        }
    }

    /// Query the history database using SQL.
    ///
    /// Returns results as a Vec of rows, where each row is a Vec of string values.
    pub fn query(&self, sql: &str) -> Result<QueryResult> {
        let mut stmt = self.conn.prepare(sql)?;

        // Execute the query first to get column info
        let mut rows_iter = stmt.query([])?;

        let column_count = rows_iter.as_ref().map(|r| r.column_count()).unwrap_or(0);
        let column_names: Vec<String> = if let Some(row_ref) = rows_iter.as_ref() {
            (0..column_count)
                .map(|i| {
                    row_ref
                        .column_name(i)
                        .map(|s| s.to_string())
                        .unwrap_or_else(|_| format!("col{}", i))
                })
                .collect()
        } else {
            Vec::new()
        };

        let mut result_rows = Vec::new();
        while let Some(row) = rows_iter.next()? {
            let mut values = Vec::with_capacity(column_count);
            for i in 0..column_count {
                values.push(render_value(row.get_ref(i)?));
            }
            result_rows.push(values);
        }

        Ok(QueryResult {
            columns: column_names,
            rows: result_rows,
        })
    }
}

/// Render a DuckDB value for display.
fn render_value(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => "NULL".to_string(),
        ValueRef::Boolean(b) => b.to_string(),
        ValueRef::TinyInt(n) => n.to_string(),
        ValueRef::SmallInt(n) => n.to_string(),
        ValueRef::Int(n) => n.to_string(),
        ValueRef::BigInt(n) => n.to_string(),
        ValueRef::HugeInt(n) => n.to_string(),
        ValueRef::UTinyInt(n) => n.to_string(),
        ValueRef::USmallInt(n) => n.to_string(),
        ValueRef::UInt(n) => n.to_string(),
        ValueRef::UBigInt(n) => n.to_string(),
        ValueRef::Float(f) => f.to_string(),
        ValueRef::Double(f) => f.to_string(),
        ValueRef::Decimal(d) => d.to_string(),
        ValueRef::Timestamp(unit, val) => {
            let micros = to_micros(unit, val);
            DateTime::<Utc>::from_timestamp_micros(micros)
                .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| format!("<invalid timestamp {}>", val))
        }
        ValueRef::Date32(days) => NaiveDate::from_ymd_opt(1970, 1, 1)
            .and_then(|epoch| epoch.checked_add_signed(TimeDelta::days(days as i64)))
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| format!("<invalid date {}>", days)),
        ValueRef::Time64(unit, val) => {
            let micros = to_micros(unit, val);
            let secs = (micros / 1_000_000) as u32;
            let micro_part = (micros % 1_000_000) as u32;
            NaiveTime::from_num_seconds_from_midnight_opt(secs, micro_part * 1000)
                .map(|t| t.format("%H:%M:%S").to_string())
                .unwrap_or_else(|| format!("<invalid time {}>", val))
        }
        ValueRef::Interval {
            months,
            days,
            nanos,
        } => format!("{} months {} days {} ns", months, days, nanos),
        ValueRef::Text(s) => String::from_utf8_lossy(s).to_string(),
        ValueRef::Blob(b) => format!("<blob {} bytes>", b.len()),
        _ => "<complex>".to_string(),
    }
}

fn to_micros(unit: TimeUnit, val: i64) -> i64 {
    match unit {
        TimeUnit::Second => val * 1_000_000,
        TimeUnit::Millisecond => val * 1_000,
        TimeUnit::Microsecond => val,
        TimeUnit::Nanosecond => val / 1_000,
    }
}

/// Result of a SQL query.
#[derive(Debug)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}
