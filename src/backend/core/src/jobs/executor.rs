//! Query execution against tenant databases.
//!
//! Execution is cooperative: the caller passes a [`CancellationToken`] and the
//! executor races it against the running statement. Losing the race drops
//! the in-flight future and asks the server to abort the backend.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::{Connection, Executor};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::job::{ConnectionParams, Job};

/// Why an execution did not complete.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    /// The database rejected or failed the query; holds the server's message.
    #[error("{0}")]
    Failed(String),
    #[error("execution cancelled")]
    Cancelled,
}

/// Runs a job's query against its captured connection parameters.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(&self, job: &Job, cancel: CancellationToken) -> Result<(), ExecutionError>;
}

/// Configuration for [`PgQueryExecutor`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PgExecutorConfig {
    /// Connection establishment timeout (seconds)
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Per-statement timeout (seconds); unset means no limit
    #[serde(default)]
    pub statement_timeout_secs: Option<u64>,
}

fn default_connect_timeout_secs() -> u64 {
    10
}

impl Default for PgExecutorConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            statement_timeout_secs: None,
        }
    }
}

/// PostgreSQL executor; one dedicated connection per job.
#[derive(Debug, Clone, Default)]
pub struct PgQueryExecutor {
    config: PgExecutorConfig,
}

impl PgQueryExecutor {
    pub fn new(config: PgExecutorConfig) -> Self {
        Self { config }
    }

    fn connect_options(params: &ConnectionParams) -> PgConnectOptions {
        let mut opts = PgConnectOptions::new();
        if let Some(host) = &params.host {
            opts = opts.host(host);
        }
        if let Some(port) = params.port {
            opts = opts.port(port);
        }
        if let Some(dbname) = &params.dbname {
            opts = opts.database(dbname);
        }
        if let Some(dbuser) = &params.dbuser {
            opts = opts.username(dbuser);
        }
        if let Some(pass) = &params.pass {
            opts = opts.password(pass);
        }
        opts
    }

    async fn connect(&self, opts: &PgConnectOptions) -> Result<PgConnection, ExecutionError> {
        let timeout = Duration::from_secs(self.config.connect_timeout_secs);
        match tokio::time::timeout(timeout, PgConnection::connect_with(opts)).await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(e)) => Err(ExecutionError::Failed(error_text(e))),
            Err(_) => Err(ExecutionError::Failed("connection timeout".to_string())),
        }
    }

    async fn run_statements(
        &self,
        conn: &mut PgConnection,
        statements: &[String],
    ) -> Result<(), ExecutionError> {
        let limit = self.config.statement_timeout_secs.map(Duration::from_secs);
        for sql in statements {
            // A bare &str carries no arguments, so it goes over the simple query protocol.
            let run = (&mut *conn).execute(sql.as_str());
            let result = match limit {
                Some(limit) => tokio::time::timeout(limit, run)
                    .await
                    .map_err(|_| ExecutionError::Failed("statement timeout".to_string()))?,
                None => run.await,
            };
            let done = result.map_err(|e| ExecutionError::Failed(error_text(e)))?;
            debug!(rows_affected = done.rows_affected(), "Statement finished");
        }
        Ok(())
    }

    /// Ask the server to abort `pid` from a separate connection.
    async fn cancel_backend(&self, opts: &PgConnectOptions, pid: i32) {
        let mut side = match self.connect(opts).await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(pid, error = %e, "Could not open connection to cancel backend");
                return;
            }
        };
        match sqlx::query_scalar::<_, bool>("SELECT pg_cancel_backend($1)")
            .bind(pid)
            .fetch_one(&mut side)
            .await
        {
            Ok(signalled) => debug!(pid, signalled, "Backend cancel requested"),
            Err(e) => warn!(pid, error = %error_text(e), "Backend cancel failed"),
        }
        let _ = side.close().await;
    }
}

#[async_trait]
impl QueryExecutor for PgQueryExecutor {
    async fn execute(&self, job: &Job, cancel: CancellationToken) -> Result<(), ExecutionError> {
        let statements = job.query.statements().map_err(ExecutionError::Failed)?;
        let opts = Self::connect_options(&job.connection);

        let mut conn = until_cancelled(&cancel, self.connect(&opts)).await?;

        let pid = until_cancelled(&cancel, async {
            sqlx::query_scalar::<_, i32>("SELECT pg_backend_pid()")
                .fetch_one(&mut conn)
                .await
                .map_err(|e| ExecutionError::Failed(error_text(e)))
        })
        .await?;
        debug!(job_id = %job.job_id, user = %job.user, pid, "Executing job");

        let outcome = until_cancelled(&cancel, self.run_statements(&mut conn, &statements)).await;

        match &outcome {
            Ok(()) => {
                let _ = conn.close().await;
            }
            Err(ExecutionError::Cancelled) => self.cancel_backend(&opts, pid).await,
            Err(ExecutionError::Failed(reason)) if reason == "statement timeout" => {
                self.cancel_backend(&opts, pid).await
            }
            Err(ExecutionError::Failed(_)) => {}
        }
        outcome
    }
}

/// Race `fut` against `cancel`; a cancel that is already set wins.
async fn until_cancelled<T, F>(cancel: &CancellationToken, fut: F) -> Result<T, ExecutionError>
where
    F: Future<Output = Result<T, ExecutionError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ExecutionError::Cancelled),
        res = fut => res,
    }
}

/// Server message for database errors, display text for everything else.
fn error_text(err: sqlx::Error) -> String {
    match err {
        sqlx::Error::Database(db) => db.message().to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_payload_fails_without_connecting() {
        let job = Job::new(
            "alice",
            serde_json::json!({ "statements": ["SELECT 1"] }),
            ConnectionParams::default(),
        );
        let err = PgQueryExecutor::default()
            .execute(&job, CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, ExecutionError::Failed("invalid query payload".to_string()));
    }

    #[tokio::test]
    async fn test_cancelled_before_connect() {
        let job = Job::new(
            "alice",
            "SELECT 1",
            ConnectionParams {
                host: Some("192.0.2.1".into()),
                ..Default::default()
            },
        );
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = PgQueryExecutor::default().execute(&job, cancel).await.unwrap_err();
        assert_eq!(err, ExecutionError::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_stalled_step() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let stalled = std::future::pending::<Result<i32, ExecutionError>>();
        let err = tokio::time::timeout(Duration::from_secs(5), until_cancelled(&cancel, stalled))
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(err, ExecutionError::Cancelled);
    }

    #[tokio::test]
    async fn test_uncancelled_step_passes_result_through() {
        let cancel = CancellationToken::new();
        let pid = until_cancelled(&cancel, async { Ok::<_, ExecutionError>(4242) })
            .await
            .unwrap();
        assert_eq!(pid, 4242);
    }

    #[test]
    fn test_failed_displays_message_verbatim() {
        let err = ExecutionError::Failed("permission denied for relation private_table".into());
        assert_eq!(err.to_string(), "permission denied for relation private_table");
    }
}
