//! CLI command implementations.

use std::path::PathBuf;

use jobdata::{Config, JobRecord, Store};

/// Options shared by every command.
pub struct Context {
    pub expid: String,
    pub root: Option<PathBuf>,
}

impl Context {
    fn config(&self) -> jobdata::Result<Config> {
        let config = match &self.root {
            Some(root) => Config::load_from(root)?,
            None => Config::load()?,
        };
        tracing::debug!(
            expid = %self.expid,
            db = %config.db_path(&self.expid).display(),
            "resolved history database"
        );
        Ok(config)
    }

    /// Open for inspection; fails when the database does not exist.
    fn open_read(&self) -> jobdata::Result<Store> {
        Store::open_existing(self.config()?, &self.expid)
    }
}

/// Create or migrate the history database.
pub fn init(ctx: &Context) -> jobdata::Result<()> {
    let config = ctx.config()?;
    let path = config.db_path(&ctx.expid);
    let existed = Store::exists(&config, &ctx.expid);

    let store = Store::open(config, &ctx.expid)?;

    if existed {
        println!("Job history already present at {}", path.display());
    } else {
        println!("Job history initialized at {}", path.display());
    }
    println!("Schema version: {}", store.db_version());
    match store.current_run_id() {
        Some(run_id) => println!("Current run: {}", run_id),
        None => println!("Current run: none"),
    }

    Ok(())
}

/// Every recorded version of a job.
pub fn history(ctx: &Context, job: &str, format: &str) -> jobdata::Result<()> {
    let store = ctx.open_read()?;
    let rows = store.job_rows(job)?;

    match format {
        "json" => {
            let summaries: Vec<_> = rows.iter().map(JobRecord::summary).collect();
            let json = serde_json::to_string_pretty(&summaries)?;
            println!("{}", json);
        }
        "table" => {
            if rows.is_empty() {
                println!("No history for {}.", job);
                return Ok(());
            }
            print_job_rows(&rows);
        }
        other => {
            return Err(jobdata::Error::InvalidInput(format!(
                "unknown format '{}' (expected table or json)",
                other
            )));
        }
    }

    Ok(())
}

/// The current row of a job.
pub fn last(ctx: &Context, job: &str) -> jobdata::Result<()> {
    let store = ctx.open_read()?;
    let rows = store.last_row(job)?;

    let Some(row) = rows.first() else {
        println!("No current row for {}.", job);
        return Ok(());
    };
    if rows.len() > 1 {
        eprintln!("warning: {} rows are marked current for {}", rows.len(), job);
    }

    let summary = row.summary();
    println!("Job:       {}", row.job_name);
    println!("Counter:   {}", row.counter);
    println!("Status:    {}", row.status);
    println!("Job ID:    {}", row.job_id);
    println!("Platform:  {}", row.platform);
    println!("Submit:    {}", summary.submit.as_deref().unwrap_or("-"));
    println!("Start:     {}", summary.start.as_deref().unwrap_or("-"));
    println!("Finish:    {}", summary.finish.as_deref().unwrap_or("-"));
    println!("Queued:    {}", summary.queue_time);
    println!("Ran:       {}", summary.run_time);
    println!("CPUs:      {} ({} nodes)", row.ncpus, row.nnodes);
    println!("Energy:    {}", row.energy);
    if row.is_packed() {
        println!("Wrapper:   {}", row.rowtype);
    }
    if let Some(run_id) = row.run_id {
        println!("Run:       {}", run_id);
    }

    Ok(())
}

/// The current experiment run.
pub fn run(ctx: &Context) -> jobdata::Result<()> {
    let store = ctx.open_read()?;

    let Some(run) = store.max_run()? else {
        println!("No experiment run recorded.");
        return Ok(());
    };

    println!("Run:        {}", run.run_id);
    println!("Created:    {}", run.created);
    println!("Start:      {}", run.start);
    if run.in_progress() {
        println!("Finish:     in progress");
    } else {
        println!("Finish:     {}", run.finish);
    }
    println!("Chunks:     {} {}", run.chunk_size, run.chunk_unit);
    println!("Total:      {}", run.total);
    println!("Completed:  {}", run.completed);
    println!("Failed:     {}", run.failed);
    println!("Queuing:    {}", run.queuing);
    println!("Running:    {}", run.running);
    println!("Submitted:  {}", run.submitted);
    println!("Suspended:  {}", run.suspended);

    Ok(())
}

/// Current rows of an experiment run.
pub fn run_jobs(ctx: &Context, run_id: Option<i64>, all: bool) -> jobdata::Result<()> {
    let store = ctx.open_read()?;

    let Some(run_id) = run_id.or(store.current_run_id()) else {
        println!("No experiment run recorded.");
        return Ok(());
    };

    let rows = store.current_run_rows(run_id, !all)?;
    if rows.is_empty() {
        println!("No jobs in run {}.", run_id);
        return Ok(());
    }
    print_job_rows(&rows);

    Ok(())
}

/// Attribute wrapper energy for the current run.
pub fn reconcile(ctx: &Context) -> jobdata::Result<()> {
    let config = ctx.config()?;
    if !Store::exists(&config, &ctx.expid) {
        return Err(jobdata::Error::NotInitialized(config.db_path(&ctx.expid)));
    }
    // Writes back processed rows, so the schema must be current
    let store = Store::open(config, &ctx.expid)?;
    let summary = store.reconcile_current_run()?;

    match summary.run_id {
        Some(run_id) => println!("Run {}: {} finished rows", run_id, summary.rows),
        None => println!("No experiment run recorded."),
    }
    println!("Wrappers:      {}", summary.wrappers);
    println!("  direct:      {}", summary.direct);
    println!("  exact:       {}", summary.exact);
    println!("  approximated: {}", summary.approximated);
    println!("  skipped:     {}", summary.skipped);
    println!("Rows updated:  {}", summary.updated);

    Ok(())
}

/// Execute a SQL query.
pub fn sql(ctx: &Context, query: &str) -> jobdata::Result<()> {
    let store = ctx.open_read()?;
    let result = store.query(query)?;

    if result.rows.is_empty() {
        println!("No results.");
        return Ok(());
    }

    print_table(&result.columns, &result.rows);
    println!("\n({} rows)", result.rows.len());

    Ok(())
}

fn print_job_rows(rows: &[JobRecord]) {
    let columns: Vec<String> = [
        "counter", "status", "submit", "start", "finish", "queue", "run", "energy", "run_id",
        "last",
    ]
    .iter()
    .map(|c| c.to_string())
    .collect();

    let cells: Vec<Vec<String>> = rows
        .iter()
        .map(|row| {
            let summary = row.summary();
            vec![
                row.counter.to_string(),
                row.status.to_string(),
                summary.submit.unwrap_or_else(|| "-".to_string()),
                summary.start.unwrap_or_else(|| "-".to_string()),
                summary.finish.unwrap_or_else(|| "-".to_string()),
                summary.queue_time,
                summary.run_time,
                row.energy.to_string(),
                row.run_id.map(|id| id.to_string()).unwrap_or_else(|| "-".to_string()),
                if row.last { "*".to_string() } else { String::new() },
            ]
        })
        .collect();

    print_table(&columns, &cells);
}

fn print_table(columns: &[String], rows: &[Vec<String>]) {
    // Calculate column widths
    let mut widths: Vec<usize> = columns.iter().map(|c| c.len()).collect();
    for row in rows {
        for (i, val) in row.iter().enumerate() {
            widths[i] = widths[i].max(val.chars().count().min(50));
        }
    }

    for (i, col) in columns.iter().enumerate() {
        print!("{:width$} ", col, width = widths[i]);
    }
    println!();

    for width in &widths {
        print!("{} ", "-".repeat(*width));
    }
    println!();

    for row in rows {
        for (i, val) in row.iter().enumerate() {
            let display = if val.chars().count() > 50 {
                format!("{}...", val.chars().take(47).collect::<String>())
            } else {
                val.clone()
            };
            print!("{:width$} ", display, width = widths[i]);
        }
        println!();
    }
}
