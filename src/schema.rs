//! Job records, status names, and the JSON reply envelopes.
//!
//! All stdout output is JSON only. Tracing logs go to stderr.
//! Records are encoded with alphabetically-ordered keys and a stable
//! one-space indent so that job files are diff-friendly.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Serialize `value` to a JSON string and print it as a single line to stdout.
///
/// This is the single place where stdout JSON output is written, ensuring the
/// stdout-is-JSON-only contract is enforced uniformly across all reply types.
fn print_json_to_stdout(value: &impl Serialize) {
    println!(
        "{}",
        serde_json::to_string(value).expect("JSON serialization failed")
    );
}

/// Wall clock as seconds since the Unix epoch.
pub fn now_epoch() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

// ---------- Job status ----------

/// The five job statuses. A job's status is defined by which status
/// directory currently holds its record file; it is never stored in the
/// file itself.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl JobStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Canceled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Option<JobStatus> {
        match s {
            "queued" => Some(JobStatus::Queued),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "canceled" => Some(JobStatus::Canceled),
            _ => None,
        }
    }

    /// Terminal statuses are never left.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Canceled
        )
    }
}

// ---------- Job record ----------

/// Deserialize a field so that a missing key, an explicit `null`, and a
/// real value remain distinguishable: missing -> `None` (via `default`),
/// `null` -> `Some(None)`, value -> `Some(Some(v))`.
fn double_option<'de, T, D>(de: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: serde::Deserializer<'de>,
{
    Option::<T>::deserialize(de).map(Some)
}

fn default_permissions() -> Value {
    Value::String("public".to_string())
}

/// Canonical on-disk representation of one job.
///
/// Field presence is time-dependent: the `Option` fields are phase markers,
/// absent until the lifecycle step that populates them. Declaration order is
/// alphabetical so the serialized keys come out sorted.
///
/// `out` and `err` use a nested `Option`: the outer level is presence
/// (absent before the terminal phase), the inner level is the JSON value
/// (`null` for canceled jobs, captured text otherwise).
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct JobRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endtime: Option<f64>,
    #[serde(
        default,
        deserialize_with = "double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub err: Option<Option<String>>,
    #[serde(default)]
    pub interactive: bool,
    pub jobid: i64,
    #[serde(default)]
    pub notify: Vec<Value>,
    #[serde(
        default,
        deserialize_with = "double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub out: Option<Option<String>>,
    #[serde(default)]
    pub outfile: String,
    #[serde(default = "default_permissions")]
    pub permissions: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default)]
    pub post: Vec<Value>,
    #[serde(default)]
    pub project: String,
    // Older records spelled this `queued_endtime`; normalize on read.
    #[serde(
        default,
        alias = "queued_endtime",
        skip_serializing_if = "Option::is_none"
    )]
    pub queue_endtime: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_starttime: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub returncode: Option<i64>,
    #[serde(default)]
    pub simulation: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub starttime: Option<f64>,
    #[serde(default)]
    pub user: String,
}

impl JobRecord {
    /// The initial record a runner writes into the queued directory.
    pub fn enqueued(
        jobid: i64,
        user: String,
        project: String,
        simulation: Value,
        outfile: String,
        pid: u32,
    ) -> Self {
        JobRecord {
            endtime: None,
            err: None,
            interactive: false,
            jobid,
            notify: vec![],
            out: None,
            outfile,
            permissions: default_permissions(),
            pid: Some(pid),
            post: vec![],
            project,
            queue_endtime: None,
            queue_starttime: Some(now_epoch()),
            returncode: None,
            simulation,
            starttime: None,
            user,
        }
    }
}

/// Encode a record with sorted keys, one-space indent, and a trailing
/// newline.
pub fn encode(record: &JobRecord) -> anyhow::Result<Vec<u8>> {
    let mut buf = Vec::new();
    let fmt = serde_json::ser::PrettyFormatter::with_indent(b" ");
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, fmt);
    record.serialize(&mut ser)?;
    buf.push(b'\n');
    Ok(buf)
}

/// Decode a record, tolerating older files missing newer fields.
pub fn decode(bytes: &[u8]) -> anyhow::Result<JobRecord> {
    Ok(serde_json::from_slice(bytes)?)
}

// ---------- Reply envelopes ----------

/// Reply for `spawn`. A negative `jobid` means no identifier was allocated.
#[derive(Debug, Serialize, Deserialize)]
pub struct SpawnReply {
    pub jobid: i64,
    pub status: bool,
    pub message: String,
    /// Runner pid, present only when requested with `return_pid`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

impl SpawnReply {
    pub fn failure(message: impl Into<String>) -> Self {
        SpawnReply {
            jobid: -1,
            status: false,
            message: message.into(),
            pid: None,
        }
    }

    pub fn print(&self) {
        print_json_to_stdout(self);
    }
}

/// Reply for `cancel`.
#[derive(Debug, Serialize, Deserialize)]
pub struct CancelReply {
    pub jobid: i64,
    pub status: bool,
    pub message: String,
}

impl CancelReply {
    pub fn failure(message: impl Into<String>) -> Self {
        CancelReply {
            jobid: -1,
            status: false,
            message: message.into(),
        }
    }

    pub fn print(&self) {
        print_json_to_stdout(self);
    }
}

/// Reply for `query`. `data` is `null` exactly when `status` is false.
#[derive(Debug, Serialize, Deserialize)]
pub struct QueryReply {
    pub data: Option<Vec<Value>>,
    pub status: bool,
    pub message: String,
}

impl QueryReply {
    pub fn failure(message: impl Into<String>) -> Self {
        QueryReply {
            data: None,
            status: false,
            message: message.into(),
        }
    }

    pub fn print(&self) {
        print_json_to_stdout(self);
    }
}

/// Reply for `wait`.
#[derive(Debug, Serialize, Deserialize)]
pub struct WaitReply {
    pub jobid: i64,
    pub status: bool,
    pub message: String,
}

impl WaitReply {
    pub fn print(&self) {
        print_json_to_stdout(self);
    }
}

/// Envelope for configuration and I/O failures. Domain outcomes (rejected
/// spawns, failed cancels) use the reply types above with `status=false`
/// instead.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorReply {
    pub status: bool,
    pub message: String,
}

impl ErrorReply {
    pub fn new(message: impl Into<String>) -> Self {
        ErrorReply {
            status: false,
            message: message.into(),
        }
    }

    pub fn print(&self) {
        print_json_to_stdout(self);
    }
}

// ---------- Unit tests ----------
