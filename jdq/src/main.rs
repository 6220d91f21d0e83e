//! jdq: Job Data Query - CLI for inspecting experiment job history databases.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "jdq")]
#[command(about = "Job Data Query - inspect the job history of an experiment")]
#[command(version)]
struct Cli {
    /// Experiment identifier
    #[arg(short = 'e', long = "expid", global = true, default_value = "a000")]
    expid: String,

    /// Folder holding the history databases (overrides JOBDATA_DIR)
    #[arg(long = "root", global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or migrate the history database of the experiment
    Init,

    /// Show every recorded version of a job
    History {
        /// Job name
        job: String,

        /// Output format: table, json
        #[arg(short = 'f', long = "format", default_value = "table")]
        format: String,
    },

    /// Show the current row of a job
    Last {
        /// Job name
        job: String,
    },

    /// Show the current experiment run and its counters
    Run,

    /// List the current rows of an experiment run
    RunJobs {
        /// Run to list (defaults to the current one)
        #[arg(short = 'r', long = "run-id")]
        run_id: Option<i64>,

        /// Include rows that have not finished yet
        #[arg(short = 'a', long = "all")]
        all: bool,
    },

    /// Attribute scheduler energy to the finished jobs of the current run
    Reconcile,

    /// Execute a SQL query against the history database
    #[command(visible_alias = "q")]
    Sql {
        /// SQL query to execute
        query: String,
    },
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() {
    init_logging();
    let cli = Cli::parse();

    let ctx = commands::Context {
        expid: cli.expid,
        root: cli.root,
    };

    let result = match cli.command {
        Commands::Init => commands::init(&ctx),
        Commands::History { job, format } => commands::history(&ctx, &job, &format),
        Commands::Last { job } => commands::last(&ctx, &job),
        Commands::Run => commands::run(&ctx),
        Commands::RunJobs { run_id, all } => commands::run_jobs(&ctx, run_id, all),
        Commands::Reconcile => commands::reconcile(&ctx),
        Commands::Sql { query } => commands::sql(&ctx, &query),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
