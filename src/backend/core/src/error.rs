//! Error handling for the batch job subsystem.
//!
//! This module provides:
//! - A single error type with a machine-readable code and chained source
//! - User-facing messages kept apart from internal diagnostic detail
//! - Job and tenant correlation carried on every propagated error
//! - Severity-based logging and an error counter
//!
//! # Usage
//!
//! ```rust,ignore
//! use sqlbatch_core::error::{BatchError, ErrorContext, Result};
//!
//! fn load(raw: &str) -> Result<serde_json::Value> {
//!     serde_json::from_str(raw).context("Failed to decode stored payload")
//! }
//! ```

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for batch operations.
pub type Result<T> = std::result::Result<T, BatchError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Job Errors (1000-1099)
    JobNotFound,
    QueueFull,
    InvalidStateTransition,

    // Store Errors (2000-2099)
    StoreError,
    StoreConnectionFailed,

    // Serialization Errors (2200-2299)
    SerializationError,
    DeserializationError,

    // Validation Errors (4100-4199)
    ValidationError,
    PayloadTooLarge,

    // Configuration Errors (5000-5099)
    ConfigurationError,

    // Internal Errors (9000-9099)
    InternalError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::JobNotFound => 1000,
            Self::QueueFull => 1001,
            Self::InvalidStateTransition => 1002,

            Self::StoreError => 2000,
            Self::StoreConnectionFailed => 2001,

            Self::SerializationError => 2200,
            Self::DeserializationError => 2201,

            Self::ValidationError => 4100,
            Self::PayloadTooLarge => 4101,

            Self::ConfigurationError => 5000,

            Self::InternalError => 9000,
        }
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "job",
            2000..=2099 => "store",
            2200..=2299 => "serialization",
            4100..=4199 => "validation",
            5000..=5099 => "configuration",
            9000..=9099 => "internal",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Caller errors (unknown job, bad input)
    Low,
    /// Operational conditions (full queues)
    Medium,
    /// Store or serialization failures
    High,
    /// Lost connectivity or internal bugs
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::JobNotFound
            | ErrorCode::InvalidStateTransition
            | ErrorCode::ValidationError
            | ErrorCode::PayloadTooLarge => Self::Low,

            ErrorCode::QueueFull => Self::Medium,

            ErrorCode::StoreError
            | ErrorCode::SerializationError
            | ErrorCode::DeserializationError
            | ErrorCode::ConfigurationError => Self::High,

            ErrorCode::StoreConnectionFailed | ErrorCode::InternalError => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Details
// ═══════════════════════════════════════════════════════════════════════════════

/// Structured correlation data attached to an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// The job the failing operation was acting on
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,

    /// The tenant owning that job
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,

    /// Additional context key-value pairs
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,
}

impl ErrorDetails {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for the batch subsystem.
#[derive(Error, Debug)]
pub struct BatchError {
    /// Machine-readable error code
    code: ErrorCode,

    /// Message safe to expose to clients
    user_message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// Job/tenant correlation and extra context
    details: ErrorDetails,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for BatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl BatchError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and user message.
    pub fn new(code: ErrorCode, user_message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            user_message: user_message.into(),
            internal_message: None,
            details: ErrorDetails::default(),
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create an error with both user and internal messages.
    pub fn with_internal(
        code: ErrorCode,
        user_message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, user_message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::InternalError, "An internal error occurred", message)
    }

    /// The job does not exist, or its stored record is incomplete.
    pub fn job_not_found(job_id: impl Into<String>) -> Self {
        let job_id = job_id.into();
        Self::new(ErrorCode::JobNotFound, format!("Job with id {} not found", job_id))
            .with_details(ErrorDetails::new().with_job_id(job_id))
    }

    /// The tenant already has `max` jobs queued.
    pub fn queue_full(tenant: impl Into<String>, max: usize) -> Self {
        Self::new(
            ErrorCode::QueueFull,
            "Failed to create job, max number of jobs queued reached",
        )
        .with_tenant(tenant)
        .with_context("max_queued_jobs", max)
    }

    /// A store round-trip failed.
    pub fn store(user_message: impl Into<Cow<'static, str>>, internal: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::StoreError, user_message, internal)
    }

    /// The state machine forbids moving from `from` to `to`.
    pub fn invalid_transition(
        job_id: impl Into<String>,
        from: impl fmt::Display,
        to: impl fmt::Display,
    ) -> Self {
        Self::new(
            ErrorCode::InvalidStateTransition,
            format!("Cannot set status from {} to {}", from, to),
        )
        .with_job_id(job_id)
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Replace the error details.
    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = details;
        self
    }

    /// Attach the job id for correlation.
    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.details.job_id = Some(job_id.into());
        self
    }

    /// Attach the tenant for correlation.
    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.details.tenant = Some(tenant.into());
        self
    }

    /// Attach both correlation ids, keeping any already present.
    pub fn for_job(mut self, job_id: impl fmt::Display, tenant: &str) -> Self {
        if self.details.job_id.is_none() {
            self.details.job_id = Some(job_id.to_string());
        }
        if self.details.tenant.is_none() {
            self.details.tenant = Some(tenant.to_string());
        }
        self
    }

    /// Add context to details.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.details.context.insert(key.into(), v);
        }
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    /// Get the error code.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Get the user-friendly message.
    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    /// Get the internal message (if any).
    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    /// Get the error details.
    pub fn details(&self) -> &ErrorDetails {
        &self.details
    }

    /// The job id this error concerns, if known.
    pub fn job_id(&self) -> Option<&str> {
        self.details.job_id.as_deref()
    }

    /// The tenant this error concerns, if known.
    pub fn tenant(&self) -> Option<&str> {
        self.details.tenant.as_deref()
    }

    pub fn is_not_found(&self) -> bool {
        self.code == ErrorCode::JobNotFound
    }

    pub fn is_queue_full(&self) -> bool {
        self.code == ErrorCode::QueueFull
    }

    /// Get the error severity.
    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error with appropriate severity.
    pub fn log(&self) {
        let code = self.code.to_string();
        let category = self.code.category();
        let job_id = self.details.job_id.as_deref().unwrap_or("-");
        let tenant = self.details.tenant.as_deref().unwrap_or("-");

        match self.severity() {
            ErrorSeverity::Critical | ErrorSeverity::High => {
                error!(
                    error_code = %code,
                    category = category,
                    job_id = job_id,
                    user = tenant,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    source = ?self.source,
                    "Batch error"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = %code,
                    category = category,
                    job_id = job_id,
                    user = tenant,
                    user_message = %self.user_message,
                    "Batch error"
                );
            }
            ErrorSeverity::Low => {
                tracing::debug!(
                    error_code = %code,
                    category = category,
                    job_id = job_id,
                    user = tenant,
                    user_message = %self.user_message,
                    "Batch error"
                );
            }
        }
    }

    fn record_metrics(&self) {
        counter!(
            crate::telemetry::names::ERRORS_TOTAL,
            "code" => self.code.to_string(),
            "category" => self.code.category().to_string(),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Context Extension Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Extension trait for adding context to errors.
pub trait ErrorContext<T> {
    /// Add context to an error.
    fn context(self, message: impl Into<String>) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| BatchError::internal(message.into()).with_source(e))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// From Implementations for Common Error Types
// ═══════════════════════════════════════════════════════════════════════════════

impl From<redis::RedisError> for BatchError {
    fn from(error: redis::RedisError) -> Self {
        let (code, user_msg) = if error.is_connection_refusal() || error.is_connection_dropped() {
            (ErrorCode::StoreConnectionFailed, "Unable to connect to job store")
        } else if error.is_timeout() {
            (ErrorCode::StoreError, "Job store operation timed out")
        } else {
            (ErrorCode::StoreError, "A job store error occurred")
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<serde_json::Error> for BatchError {
    fn from(error: serde_json::Error) -> Self {
        let code = if error.is_syntax() || error.is_data() || error.is_eof() {
            ErrorCode::DeserializationError
        } else {
            ErrorCode::SerializationError
        };

        Self::with_internal(code, "Failed to process JSON data", error.to_string())
            .with_source(error)
    }
}

impl From<chrono::ParseError> for BatchError {
    fn from(error: chrono::ParseError) -> Self {
        Self::with_internal(
            ErrorCode::DeserializationError,
            "Stored timestamp is malformed",
            error.to_string(),
        )
        .with_source(error)
    }
}

impl From<config::ConfigError> for BatchError {
    fn from(error: config::ConfigError) -> Self {
        Self::with_internal(
            ErrorCode::ConfigurationError,
            "Configuration error",
            error.to_string(),
        )
        .with_source(error)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_categories() {
        assert_eq!(ErrorCode::JobNotFound.category(), "job");
        assert_eq!(ErrorCode::QueueFull.category(), "job");
        assert_eq!(ErrorCode::StoreError.category(), "store");
        assert_eq!(ErrorCode::DeserializationError.category(), "serialization");
        assert_eq!(ErrorCode::ConfigurationError.category(), "configuration");
    }

    #[test]
    fn test_every_code_is_categorised_once() {
        let codes = [
            ErrorCode::JobNotFound,
            ErrorCode::QueueFull,
            ErrorCode::InvalidStateTransition,
            ErrorCode::StoreError,
            ErrorCode::StoreConnectionFailed,
            ErrorCode::SerializationError,
            ErrorCode::DeserializationError,
            ErrorCode::ValidationError,
            ErrorCode::PayloadTooLarge,
            ErrorCode::ConfigurationError,
            ErrorCode::InternalError,
        ];
        let numeric: std::collections::HashSet<_> = codes.iter().map(|c| c.numeric_code()).collect();
        assert_eq!(numeric.len(), codes.len());
        assert!(codes.iter().all(|c| c.category() != "unknown"));
    }

    #[test]
    fn test_job_not_found_carries_job_id() {
        let err = BatchError::job_not_found("abc");
        assert!(err.is_not_found());
        assert_eq!(err.job_id(), Some("abc"));
        assert_eq!(err.user_message(), "Job with id abc not found");
    }

    #[test]
    fn test_queue_full_carries_tenant() {
        let err = BatchError::queue_full("alice", 100);
        assert!(err.is_queue_full());
        assert_eq!(err.tenant(), Some("alice"));
        assert_eq!(
            err.details().context.get("max_queued_jobs"),
            Some(&serde_json::json!(100))
        );
    }

    #[test]
    fn test_for_job_keeps_existing_ids() {
        let err = BatchError::job_not_found("first").for_job("second", "bob");
        assert_eq!(err.job_id(), Some("first"));
        assert_eq!(err.tenant(), Some("bob"));
    }

    #[test]
    fn test_invalid_transition_message() {
        let err = BatchError::invalid_transition("j1", "done", "cancelled");
        assert_eq!(err.code(), ErrorCode::InvalidStateTransition);
        assert_eq!(err.user_message(), "Cannot set status from done to cancelled");
    }

    #[test]
    fn test_error_severity() {
        assert_eq!(BatchError::job_not_found("x").severity(), ErrorSeverity::Low);
        assert_eq!(BatchError::queue_full("t", 1).severity(), ErrorSeverity::Medium);
        assert_eq!(BatchError::store("failed", "boom").severity(), ErrorSeverity::High);
        assert_eq!(BatchError::internal("bug").severity(), ErrorSeverity::Critical);
    }

    #[test]
    fn test_error_display() {
        let err = BatchError::store("Failed to save job", "connection reset");
        assert_eq!(
            err.to_string(),
            "[StoreError] Failed to save job (internal: connection reset)"
        );
    }

    #[test]
    fn test_error_context_trait() {
        let parsed: std::result::Result<u32, std::num::ParseIntError> = "x".parse();
        let err = parsed.context("Failed to parse port").unwrap_err();
        assert_eq!(err.code(), ErrorCode::InternalError);
        assert_eq!(err.internal_message(), Some("Failed to parse port"));
    }

    #[test]
    fn test_from_serde_json_error() {
        let err: BatchError = serde_json::from_str::<serde_json::Value>("{bad")
            .unwrap_err()
            .into();
        assert_eq!(err.code(), ErrorCode::DeserializationError);
    }
}
