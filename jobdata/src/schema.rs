//! Schema definitions for the job history tables.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Wall-clock format of the `created` and `modified` columns.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d-%H:%M:%S";

/// Format of the submit/start/finish strings reported for job steps.
pub const STEP_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Rowtype of a standalone (not wrapped) job.
pub const ROWTYPE_NORMAL: i64 = 2;

/// Rowtypes above this value belong to a packed wrapper batch.
pub const PACKED_ROWTYPE_THRESHOLD: i64 = 1000;

/// Keys that make an extra data blob a flat accounting record instead of
/// a map of job steps.
const FLAT_ACCOUNTING_KEYS: [&str; 8] = [
    "AveRSS", "finish", "ncpus", "submit", "MaxRSS", "start", "nnodes", "energy",
];

/// Current local wall-clock time as stored in `created`/`modified`.
pub fn now_string() -> String {
    Local::now().format(TIMESTAMP_FORMAT).to_string()
}

/// Current time as epoch seconds.
pub fn now_epoch() -> i64 {
    Utc::now().timestamp()
}

/// Rowtype for a job given its wrapper code (if any).
pub fn row_type(wrapper_code: Option<i64>) -> i64 {
    match wrapper_code {
        Some(code) if code != 0 => code,
        _ => ROWTYPE_NORMAL,
    }
}

/// Status of a job as reported by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Waiting,
    Ready,
    Prepared,
    Delayed,
    Submitted,
    Held,
    Queuing,
    Running,
    Completed,
    Failed,
    Suspended,
    Skipped,
    Unknown,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Waiting => "WAITING",
            JobStatus::Ready => "READY",
            JobStatus::Prepared => "PREPARED",
            JobStatus::Delayed => "DELAYED",
            JobStatus::Submitted => "SUBMITTED",
            JobStatus::Held => "HELD",
            JobStatus::Queuing => "QUEUING",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Suspended => "SUSPENDED",
            JobStatus::Skipped => "SKIPPED",
            JobStatus::Unknown => "UNKNOWN",
        }
    }

    /// Parse a stored status, mapping anything unrecognized to `Unknown`.
    pub fn parse_lenient(s: &str) -> Self {
        s.parse().unwrap_or(JobStatus::Unknown)
    }

    /// Statuses for which a running time is meaningful.
    pub fn has_running_time(&self) -> bool {
        matches!(
            self,
            JobStatus::Running | JobStatus::Completed | JobStatus::Failed
        )
    }

    /// Statuses for which a queuing time is meaningful.
    pub fn has_queuing_time(&self) -> bool {
        matches!(
            self,
            JobStatus::Submitted
                | JobStatus::Queuing
                | JobStatus::Running
                | JobStatus::Completed
                | JobStatus::Held
                | JobStatus::Prepared
                | JobStatus::Failed
                | JobStatus::Skipped
        )
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "WAITING" => Ok(JobStatus::Waiting),
            "READY" => Ok(JobStatus::Ready),
            "PREPARED" => Ok(JobStatus::Prepared),
            "DELAYED" => Ok(JobStatus::Delayed),
            "SUBMITTED" => Ok(JobStatus::Submitted),
            "HELD" => Ok(JobStatus::Held),
            "QUEUING" => Ok(JobStatus::Queuing),
            "RUNNING" => Ok(JobStatus::Running),
            "COMPLETED" => Ok(JobStatus::Completed),
            "FAILED" => Ok(JobStatus::Failed),
            "SUSPENDED" => Ok(JobStatus::Suspended),
            "SKIPPED" => Ok(JobStatus::Skipped),
            "UNKNOWN" => Ok(JobStatus::Unknown),
            other => Err(format!("unknown job status: {}", other)),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle tag of a history row itself (not of the job).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowStatus {
    Initial,
    Completed,
    Processed,
    Faulty,
    Changed,
}

impl RowStatus {
    pub fn code(&self) -> i64 {
        match self {
            RowStatus::Initial => 0,
            RowStatus::Completed => 1,
            RowStatus::Processed => 2,
            RowStatus::Faulty => 3,
            RowStatus::Changed => 4,
        }
    }

    pub fn from_code(code: i64) -> Self {
        match code {
            0 => RowStatus::Initial,
            1 => RowStatus::Completed,
            2 => RowStatus::Processed,
            4 => RowStatus::Changed,
            _ => RowStatus::Faulty,
        }
    }
}

/// Parse a scheduler number that may carry a unit suffix (K, M, G, T).
///
/// `"NA"` and anything unparseable yield 0.
pub fn parse_output_number(s: &str) -> f64 {
    let s = s.trim();
    if s.is_empty() || s == "NA" {
        return 0.0;
    }
    let (digits, multiplier) = match s.chars().last() {
        Some('K') => (&s[..s.len() - 1], 1e3),
        Some('M') => (&s[..s.len() - 1], 1e6),
        Some('G') => (&s[..s.len() - 1], 1e9),
        Some('T') => (&s[..s.len() - 1], 1e12),
        _ => (s, 1.0),
    };
    digits
        .trim()
        .parse::<f64>()
        .map(|n| n * multiplier)
        .unwrap_or(0.0)
}

fn value_as_f64(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => parse_output_number(s),
        _ => 0.0,
    }
}

fn value_as_i64(value: &Value) -> i64 {
    value_as_f64(value) as i64
}

/// Parse a step timestamp (local time) into epoch seconds.
fn parse_step_time(value: Option<&Value>) -> i64 {
    let Some(Value::String(s)) = value else {
        return 0;
    };
    NaiveDateTime::parse_from_str(s, STEP_TIME_FORMAT)
        .ok()
        .and_then(|naive| Local.from_local_datetime(&naive).earliest())
        .map(|dt| dt.timestamp())
        .unwrap_or(0)
}

/// Free-form side-channel data attached to a job row.
///
/// Stored as JSON text. Anything that is not a JSON object decodes to an
/// empty value, and an empty value encodes to an empty string.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtraData(Map<String, Value>);

impl ExtraData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse stored text leniently.
    pub fn parse(text: &str) -> Self {
        match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(map)) => Self(map),
            _ => Self::default(),
        }
    }

    /// Encode for storage.
    pub fn encode(&self) -> String {
        if self.0.is_empty() {
            String::new()
        } else {
            Value::Object(self.0.clone()).to_string()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    /// Merge every key of `other` into this blob, overwriting duplicates.
    pub fn merge(&mut self, other: ExtraData) {
        for (key, value) in other.0 {
            self.0.insert(key, value);
        }
    }

    /// Drop the orchestrator's parent cross-reference.
    pub fn remove_parents(&mut self) {
        // Rebuild instead of removing in place so key order is preserved
        self.0 = std::mem::take(&mut self.0)
            .into_iter()
            .filter(|(key, _)| key != "parents")
            .collect();
    }

    /// Parent job ids recorded at finish time.
    pub fn parents(&self) -> Vec<i64> {
        match self.0.get("parents") {
            Some(Value::Array(items)) => items.iter().filter_map(Value::as_i64).collect(),
            _ => Vec::new(),
        }
    }

    /// Energy reported directly on this job (per-job reporting path).
    pub fn direct_energy(&self) -> Option<i64> {
        match self.0.get("energy")? {
            Value::String(s) if s.is_empty() || s == "NA" => None,
            Value::Null | Value::Bool(false) => None,
            value => {
                let energy = value_as_i64(value);
                (energy != 0).then_some(energy)
            }
        }
    }

    /// Keys naming job steps (`<jobid>.<n>`), ordered by step number.
    ///
    /// The `.batch` and `.extern` pseudo steps are excluded.
    pub fn step_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .0
            .keys()
            .filter(|key| key.as_str() != "parents")
            .filter(|key| match key.split_once('.') {
                Some((_, suffix)) => suffix != "batch" && suffix != "extern",
                None => false,
            })
            .cloned()
            .collect();
        keys.sort_by_key(|key| {
            let suffix = key.split_once('.').map(|(_, s)| s).unwrap_or("");
            (suffix.parse::<u64>().unwrap_or(u64::MAX), key.clone())
        });
        keys
    }

    /// First non-dotted key, when it names a step-shaped record.
    pub fn main_step_key(&self) -> Option<String> {
        let first = self
            .0
            .keys()
            .find(|key| key.as_str() != "parents" && !key.contains('.'))?;
        if FLAT_ACCOUNTING_KEYS.contains(&first.as_str()) {
            return None;
        }
        Some(first.clone())
    }

    /// Build a step record from the sub-record under `key`.
    pub fn step(&self, key: &str) -> Option<StepRecord> {
        match self.0.get(key)? {
            Value::Object(fields) => Some(StepRecord::from_fields(key, fields)),
            _ => None,
        }
    }

    /// Energy of a standalone job, read from its main accounting record.
    ///
    /// Falls back to the `.batch` sibling when the main record reports "NA".
    pub fn standalone_energy(&self) -> Option<i64> {
        let key = self
            .0
            .keys()
            .find(|key| key.as_str() != "parents" && !key.contains('.'))?;
        let energy = self.0.get(key)?.as_object()?.get("energy")?;
        let energy = match energy {
            Value::String(s) if s == "NA" => {
                let batch_key = format!("{}.batch", key);
                match self.0.get(&batch_key).and_then(|v| v.get("energy")) {
                    Some(batch_energy) => batch_energy,
                    None => energy,
                }
            }
            _ => energy,
        };
        Some(value_as_i64(energy))
    }

    /// Size of the encoded blob, used to pick the richest description.
    pub fn encoded_len(&self) -> usize {
        self.encode().len()
    }
}

impl From<Map<String, Value>> for ExtraData {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Accounting of one job step, derived from a wrapper's extra data.
#[derive(Debug, Clone, PartialEq)]
pub struct StepRecord {
    pub key: String,
    pub ncpus: i64,
    pub nnodes: i64,
    pub submit: i64,
    pub start: i64,
    pub finish: i64,
    pub energy: i64,
    pub max_rss: f64,
    pub ave_rss: f64,
}

impl StepRecord {
    fn from_fields(key: &str, fields: &Map<String, Value>) -> Self {
        let finish = match fields.get("finish") {
            Some(Value::String(s)) if s == "Unknown" => 0,
            other => parse_step_time(other),
        };
        Self {
            key: key.to_string(),
            ncpus: fields.get("ncpus").map(value_as_i64).unwrap_or(0),
            nnodes: fields.get("nnodes").map(value_as_i64).unwrap_or(0),
            submit: parse_step_time(fields.get("submit")),
            start: parse_step_time(fields.get("start")),
            finish,
            energy: fields.get("energy").map(value_as_i64).unwrap_or(0),
            max_rss: fields.get("MaxRSS").map(value_as_f64).unwrap_or(0.0),
            ave_rss: fields.get("AveRSS").map(value_as_f64).unwrap_or(0.0),
        }
    }
}

/// One historical snapshot of a job (a `job_data` row).
#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    /// Surrogate key assigned by storage (0 before insertion).
    pub id: i64,

    /// Version number of this row among the rows of the same job name.
    pub counter: i64,

    pub job_name: String,
    pub created: String,
    pub modified: String,

    /// Epoch seconds; 0 means not reached yet.
    pub submit: i64,
    pub start: i64,
    pub finish: i64,

    pub status: JobStatus,

    /// 2 for standalone jobs, the wrapper code for packed jobs.
    pub rowtype: i64,

    pub ncpus: i64,
    pub wallclock: String,
    pub qos: String,
    pub energy: i64,
    pub date: String,
    pub section: String,
    pub member: String,
    pub chunk: i64,

    /// True for the current version of the job.
    pub last: bool,

    pub platform: String,
    pub job_id: i64,
    pub extra_data: ExtraData,
    pub nnodes: i64,
    pub run_id: Option<i64>,
    pub max_rss: f64,
    pub ave_rss: f64,
    pub out: String,
    pub err: String,
    pub rowstatus: RowStatus,

    /// Set when a reconciliation pass changed this row in memory.
    pub require_update: bool,
}

impl JobRecord {
    /// Create a fresh, not yet persisted record.
    pub fn new(job_name: impl Into<String>) -> Self {
        let now = now_string();
        Self {
            id: 0,
            counter: 1,
            job_name: job_name.into(),
            created: now.clone(),
            modified: now,
            submit: 0,
            start: 0,
            finish: 0,
            status: JobStatus::Unknown,
            rowtype: 0,
            ncpus: 0,
            wallclock: "00:00".to_string(),
            qos: "debug".to_string(),
            energy: 0,
            date: String::new(),
            section: String::new(),
            member: String::new(),
            chunk: 0,
            last: true,
            platform: "NA".to_string(),
            job_id: 0,
            extra_data: ExtraData::new(),
            nnodes: 0,
            run_id: None,
            max_rss: 0.0,
            ave_rss: 0.0,
            out: String::new(),
            err: String::new(),
            rowstatus: RowStatus::Initial,
            require_update: false,
        }
    }

    /// True when the row belongs to a packed wrapper batch.
    pub fn is_packed(&self) -> bool {
        self.rowtype > PACKED_ROWTYPE_THRESHOLD
    }

    /// Set the energy, flagging the row for persistence if it changed.
    ///
    /// Non-positive values are ignored.
    pub fn set_energy(&mut self, energy: i64) {
        if energy > 0 {
            if energy != self.energy {
                self.require_update = true;
            }
            self.energy = energy;
        }
    }

    /// Running time in seconds, measured against `now` for unfinished jobs.
    pub fn running_time_at(&self, now: i64) -> i64 {
        if !self.status.has_running_time() {
            return 0;
        }
        let end = if self.finish > 0 { self.finish } else { now };
        (end - self.start).max(0)
    }

    pub fn running_time(&self) -> i64 {
        self.running_time_at(now_epoch())
    }

    /// Queuing time in seconds, measured against `now` for jobs not started.
    pub fn queuing_time_at(&self, now: i64) -> i64 {
        if !self.status.has_queuing_time() {
            return 0;
        }
        let end = if self.start > 0 { self.start } else { now };
        (end - self.submit).max(0)
    }

    pub fn queuing_time(&self) -> i64 {
        self.queuing_time_at(now_epoch())
    }

    pub fn submit_datetime(&self) -> Option<DateTime<Local>> {
        epoch_to_local(self.submit)
    }

    pub fn start_datetime(&self) -> Option<DateTime<Local>> {
        epoch_to_local(self.start)
    }

    pub fn finish_datetime(&self) -> Option<DateTime<Local>> {
        epoch_to_local(self.finish)
    }

    pub fn submit_datetime_str(&self) -> Option<String> {
        self.submit_datetime()
            .map(|dt| dt.format(TIMESTAMP_FORMAT).to_string())
    }

    pub fn start_datetime_str(&self) -> Option<String> {
        self.start_datetime()
            .map(|dt| dt.format(TIMESTAMP_FORMAT).to_string())
    }

    pub fn finish_datetime_str(&self) -> Option<String> {
        self.finish_datetime()
            .map(|dt| dt.format(TIMESTAMP_FORMAT).to_string())
    }

    /// Reporting view of this row.
    pub fn summary(&self) -> JobSummary {
        JobSummary {
            name: self.job_name.clone(),
            date: self.date.clone(),
            section: self.section.clone(),
            member: self.member.clone(),
            chunk: self.chunk,
            submit: self.submit_datetime_str(),
            start: self.start_datetime_str(),
            finish: self.finish_datetime_str(),
            queue_time: format_duration(self.queuing_time()),
            run_time: format_duration(self.running_time()),
            wallclock: self.wallclock.clone(),
            ncpus: self.ncpus,
            nnodes: self.nnodes,
            energy: self.energy,
            platform: self.platform.clone(),
            max_rss: self.max_rss,
            ave_rss: self.ave_rss,
        }
    }
}

fn epoch_to_local(epoch: i64) -> Option<DateTime<Local>> {
    if epoch > 0 {
        Local.timestamp_opt(epoch, 0).single()
    } else {
        None
    }
}

/// Format seconds as H:MM:SS.
pub fn format_duration(seconds: i64) -> String {
    let seconds = seconds.max(0);
    format!(
        "{}:{:02}:{:02}",
        seconds / 3600,
        (seconds % 3600) / 60,
        seconds % 60
    )
}

/// Flattened job information for reports and JSON export.
#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub name: String,
    pub date: String,
    pub section: String,
    pub member: String,
    pub chunk: i64,
    pub submit: Option<String>,
    pub start: Option<String>,
    pub finish: Option<String>,
    pub queue_time: String,
    pub run_time: String,
    pub wallclock: String,
    pub ncpus: i64,
    pub nnodes: i64,
    pub energy: i64,
    pub platform: String,
    #[serde(rename = "MaxRSS")]
    pub max_rss: f64,
    #[serde(rename = "AveRSS")]
    pub ave_rss: f64,
}

/// One execution attempt of the whole workflow (an `experiment_run` row).
#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentRun {
    pub run_id: i64,
    pub created: String,
    pub start: i64,
    pub finish: i64,
    pub chunk_unit: String,
    pub chunk_size: i64,
    pub completed: i64,
    pub total: i64,
    pub failed: i64,
    pub queuing: i64,
    pub running: i64,
    pub submitted: i64,
    pub suspended: i64,
    pub metadata: String,
}

impl ExperimentRun {
    /// Create a fresh, not yet persisted run.
    pub fn new(chunk_unit: impl Into<String>, chunk_size: i64) -> Self {
        Self {
            run_id: 0,
            created: now_string(),
            start: 0,
            finish: 0,
            chunk_unit: chunk_unit.into(),
            chunk_size,
            completed: 0,
            total: 0,
            failed: 0,
            queuing: 0,
            running: 0,
            submitted: 0,
            suspended: 0,
            metadata: String::new(),
        }
    }

    /// True while the run has not been stamped as finished.
    pub fn in_progress(&self) -> bool {
        self.finish <= 0
    }
}

impl Default for ExperimentRun {
    fn default() -> Self {
        Self::new("NA", 0)
    }
}
