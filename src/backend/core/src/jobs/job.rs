//! Job model and status state machine.
//!
//! - **JobId**: globally unique identifier assigned at creation
//! - **JobStatus**: the lifecycle states and the legal moves between them
//! - **JobQuery**: plain SQL text or a structured multi-statement payload
//! - **ConnectionParams**: tenant database parameters captured at creation
//! - **Job**: the persisted record

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{BatchError, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// Job Identification
// ═══════════════════════════════════════════════════════════════════════════════

/// Unique identifier for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Create a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl From<Uuid> for JobId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Status
// ═══════════════════════════════════════════════════════════════════════════════

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued and waiting for the scheduler
    Pending,
    /// Claimed by the scheduler and executing
    Running,
    /// Finished successfully
    Done,
    /// Execution failed; `failed_reason` holds the database message
    Failed,
    /// Cancelled before or during execution
    Cancelled,
    /// Stored status text that this version does not recognise
    Unknown,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        Self::Pending,
        Self::Running,
        Self::Done,
        Self::Failed,
        Self::Cancelled,
        Self::Unknown,
    ];

    /// Check if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Running, Self::Done)
                | (Self::Running, Self::Failed)
                | (Self::Pending, Self::Cancelled)
                | (Self::Running, Self::Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Unknown => "unknown",
        }
    }

    /// Parse stored status text. Unrecognised text maps to `Unknown`.
    pub fn parse(s: &str) -> Self {
        match s {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "done" => Self::Done,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Query
// ═══════════════════════════════════════════════════════════════════════════════

/// The SQL a job runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobQuery {
    /// A single SQL string, stored verbatim
    Text(String),
    /// A JSON array or object describing several statements
    Structured(serde_json::Value),
}

impl JobQuery {
    /// Encode for storage. Plain text is stored as-is; structured payloads as JSON.
    pub fn to_stored(&self) -> String {
        match self {
            Self::Text(sql) => sql.clone(),
            Self::Structured(value) => value.to_string(),
        }
    }

    /// Decode a stored query. Only JSON arrays and objects become `Structured`.
    pub fn from_stored(raw: &str) -> Self {
        match serde_json::from_str::<serde_json::Value>(raw) {
            Ok(value @ (serde_json::Value::Array(_) | serde_json::Value::Object(_))) => {
                Self::Structured(value)
            }
            _ => Self::Text(raw.to_string()),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(sql) => sql.trim().is_empty(),
            Self::Structured(value) => match value {
                serde_json::Value::Array(items) => items.is_empty(),
                serde_json::Value::Object(map) => map.is_empty(),
                serde_json::Value::Null => true,
                _ => false,
            },
        }
    }

    /// The statements to execute, in order.
    ///
    /// Arrays contribute each string element, or each element's `query`
    /// string. An object contributes whatever its `query` field contributes.
    pub fn statements(&self) -> std::result::Result<Vec<String>, String> {
        match self {
            Self::Text(sql) => Ok(vec![sql.clone()]),
            Self::Structured(value) => {
                let mut out = Vec::new();
                collect_statements(value, &mut out)?;
                if out.is_empty() {
                    return Err("invalid query payload".to_string());
                }
                Ok(out)
            }
        }
    }
}

fn collect_statements(value: &serde_json::Value, out: &mut Vec<String>) -> std::result::Result<(), String> {
    match value {
        serde_json::Value::String(sql) => {
            out.push(sql.clone());
            Ok(())
        }
        serde_json::Value::Array(items) => {
            for item in items {
                collect_statements(item, out)?;
            }
            Ok(())
        }
        serde_json::Value::Object(map) => match map.get("query") {
            Some(inner) => collect_statements(inner, out),
            None => Err("invalid query payload".to_string()),
        },
        _ => Err("invalid query payload".to_string()),
    }
}

impl From<&str> for JobQuery {
    fn from(sql: &str) -> Self {
        Self::Text(sql.to_string())
    }
}

impl From<String> for JobQuery {
    fn from(sql: String) -> Self {
        Self::Text(sql)
    }
}

impl From<serde_json::Value> for JobQuery {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::String(sql) => Self::Text(sql),
            other => Self::Structured(other),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Connection Parameters
// ═══════════════════════════════════════════════════════════════════════════════

/// Tenant database parameters resolved when the job was created.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionParams {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub dbname: Option<String>,
    pub dbuser: Option<String>,
    #[serde(skip_serializing)]
    pub pass: Option<String>,
}

impl fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("dbname", &self.dbname)
            .field("dbuser", &self.dbuser)
            .field("pass", &self.pass.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job
// ═══════════════════════════════════════════════════════════════════════════════

/// A batch job record.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub job_id: JobId,
    /// Owning tenant
    pub user: String,
    pub query: JobQuery,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub connection: ConnectionParams,
    /// Set only while `status` is `Failed`
    pub failed_reason: Option<String>,
    /// Carried through storage untouched
    pub fallback_status: Option<String>,
}

impl Job {
    /// Create a pending job with a fresh id.
    pub fn new(user: impl Into<String>, query: impl Into<JobQuery>, connection: ConnectionParams) -> Self {
        // Stored timestamps carry millisecond precision.
        let now = Utc::now().trunc_subsecs(3);
        Self {
            job_id: JobId::new(),
            user: user.into(),
            query: query.into(),
            status: JobStatus::Pending,
            created_at: now,
            updated_at: now,
            connection,
            failed_reason: None,
            fallback_status: None,
        }
    }

    /// Move to `next`, enforcing the state machine.
    pub fn transition(&mut self, next: JobStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(BatchError::invalid_transition(self.job_id.to_string(), self.status, next)
                .with_tenant(self.user.clone()));
        }
        self.status = next;
        self.failed_reason = None;
        Ok(())
    }

    pub fn mark_running(&mut self) -> Result<()> {
        self.transition(JobStatus::Running)
    }

    pub fn mark_done(&mut self) -> Result<()> {
        self.transition(JobStatus::Done)
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>) -> Result<()> {
        self.transition(JobStatus::Failed)?;
        self.failed_reason = Some(reason.into());
        Ok(())
    }

    pub fn mark_cancelled(&mut self) -> Result<()> {
        self.transition(JobStatus::Cancelled)
    }

    /// Client-facing view (no connection parameters).
    pub fn view(&self) -> JobView {
        JobView::from(self)
    }
}

/// Client-facing serialization of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobView {
    pub job_id: String,
    pub user: String,
    pub status: JobStatus,
    pub query: JobQuery,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_status: Option<String>,
}

impl From<&Job> for JobView {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.job_id.to_string(),
            user: job.user.clone(),
            status: job.status,
            query: job.query.clone(),
            created_at: job.created_at,
            updated_at: job.updated_at,
            failed_reason: job.failed_reason.clone(),
            fallback_status: job.fallback_status.clone(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn test_job_id() {
        let id1 = JobId::new();
        let id2 = JobId::new();
        assert_ne!(id1, id2);

        let parsed: JobId = id1.to_string().parse().unwrap();
        assert_eq!(parsed, id1);
        assert!("not-a-uuid".parse::<JobId>().is_err());
    }

    #[test]
    fn test_job_status_terminal() {
        assert!(JobStatus::Done.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(!JobStatus::Unknown.is_terminal());
    }

    #[test]
    fn test_no_transition_leaves_terminal_state() {
        for from in JobStatus::ALL.iter().filter(|s| s.is_terminal()) {
            for to in JobStatus::ALL {
                assert!(!from.can_transition_to(to), "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn test_status_parse() {
        for status in JobStatus::ALL {
            assert_eq!(JobStatus::parse(status.as_str()), status);
        }
        assert_eq!(JobStatus::parse("exploded"), JobStatus::Unknown);
    }

    #[test]
    fn test_lifecycle_success() {
        let mut job = Job::new("alice", "SELECT 1", ConnectionParams::default());
        assert_eq!(job.status, JobStatus::Pending);
        job.mark_running().unwrap();
        job.mark_done().unwrap();
        assert_eq!(job.status, JobStatus::Done);
        assert!(job.failed_reason.is_none());
    }

    #[test]
    fn test_failed_reason_only_on_failed() {
        let mut job = Job::new("alice", "SELECT 1", ConnectionParams::default());
        assert!(job.mark_failed("boom").is_err());
        assert!(job.failed_reason.is_none());

        job.mark_running().unwrap();
        job.mark_failed("boom").unwrap();
        assert_eq!(job.failed_reason.as_deref(), Some("boom"));
    }

    #[test]
    fn test_cannot_skip_running() {
        let mut job = Job::new("alice", "SELECT 1", ConnectionParams::default());
        let err = job.mark_done().unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidStateTransition);
        assert_eq!(err.tenant(), Some("alice"));
        assert_eq!(job.status, JobStatus::Pending);
    }

    #[test]
    fn test_query_stored_forms() {
        assert_eq!(JobQuery::from_stored("SELECT 1"), JobQuery::Text("SELECT 1".into()));
        // Scalars that happen to be valid JSON stay text.
        assert_eq!(JobQuery::from_stored("42"), JobQuery::Text("42".into()));

        let structured = JobQuery::Structured(serde_json::json!(["SELECT 1", "SELECT 2"]));
        assert_eq!(JobQuery::from_stored(&structured.to_stored()), structured);
    }

    #[test]
    fn test_query_statements() {
        let text = JobQuery::from("COPY t TO STDOUT");
        assert_eq!(text.statements().unwrap(), vec!["COPY t TO STDOUT"]);

        let nested = JobQuery::Structured(serde_json::json!({
            "query": [
                { "query": "UPDATE a SET x = 1" },
                "UPDATE b SET y = 2"
            ]
        }));
        assert_eq!(
            nested.statements().unwrap(),
            vec!["UPDATE a SET x = 1", "UPDATE b SET y = 2"]
        );

        let bad = JobQuery::Structured(serde_json::json!([1, 2]));
        assert_eq!(bad.statements().unwrap_err(), "invalid query payload");
    }

    #[test]
    fn test_view_hides_connection() {
        let params = ConnectionParams {
            host: Some("db1".into()),
            pass: Some("secret".into()),
            ..Default::default()
        };
        let job = Job::new("alice", "SELECT 1", params);
        let json = serde_json::to_value(job.view()).unwrap();
        assert_eq!(json["status"], "pending");
        assert_eq!(json["query"], "SELECT 1");
        assert!(json.get("pass").is_none());
        assert!(json.get("failed_reason").is_none());
        assert!(!format!("{:?}", job.connection).contains("secret"));
    }
}
