// shared-types-rs/src/record.rs
// Request records and their monotonic outcome state machine

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{AnalysisResult, CommandDescriptor, ExecutionMetrics, ExecutionReport};

/// Where a request came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Origin {
    Local,
    Remote,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Remote => write!(f, "remote"),
        }
    }
}

/// Lifecycle of a request. Transitions only move forward:
/// `Pending -> Processing -> <terminal>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestOutcome {
    Pending,
    Processing,
    Blocked,
    Cancelled,
    CompletedSuccess,
    CompletedError,
    SystemError,
}

impl RequestOutcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Processing)
    }

    pub fn can_transition_to(&self, next: RequestOutcome) -> bool {
        match self {
            Self::Pending => next == Self::Processing,
            Self::Processing => next.is_terminal(),
            _ => false,
        }
    }

    /// Label written to the status channel.
    pub fn status_label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Blocked => "blocked",
            Self::Cancelled => "cancelled",
            Self::CompletedSuccess => "completed_success",
            Self::CompletedError => "completed_error",
            Self::SystemError => "error",
        }
    }
}

impl fmt::Display for RequestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.status_label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("invalid transition for request {request_id}: {from} -> {to}")]
    InvalidTransition {
        request_id: String,
        from: RequestOutcome,
        to: RequestOutcome,
    },

    #[error("request {request_id} already has a {field}")]
    AlreadySet {
        request_id: String,
        field: &'static str,
    },

    #[error("request {0} is terminal and can no longer change")]
    Sealed(String),
}

/// Everything known about one request, from admission to its terminal outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub request_id: String,
    pub origin: Origin,
    pub raw_request: String,
    pub descriptor: Option<CommandDescriptor>,
    pub metrics: Option<ExecutionMetrics>,
    pub analysis: Option<AnalysisResult>,
    pub execution_success: bool,
    pub output: String,
    /// Reason for BLOCKED/CANCELLED, fault description for SYSTEM_ERROR.
    pub error: Option<String>,
    pub outcome: RequestOutcome,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RequestRecord {
    pub fn new(request_id: impl Into<String>, origin: Origin, raw_request: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            origin,
            raw_request: raw_request.into(),
            descriptor: None,
            metrics: None,
            analysis: None,
            execution_success: false,
            output: String::new(),
            error: None,
            outcome: RequestOutcome::Pending,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.outcome.is_terminal()
    }

    /// Move to `next`, refusing anything that would revisit or skip a state.
    pub fn transition(&mut self, next: RequestOutcome) -> Result<(), RecordError> {
        if !self.outcome.can_transition_to(next) {
            return Err(RecordError::InvalidTransition {
                request_id: self.request_id.clone(),
                from: self.outcome,
                to: next,
            });
        }
        self.outcome = next;
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    pub fn attach_descriptor(&mut self, descriptor: CommandDescriptor) -> Result<(), RecordError> {
        self.ensure_open()?;
        if self.descriptor.is_some() {
            return Err(self.already_set("descriptor"));
        }
        self.descriptor = Some(descriptor);
        Ok(())
    }

    pub fn attach_execution(&mut self, report: ExecutionReport) -> Result<(), RecordError> {
        self.ensure_open()?;
        if self.metrics.is_some() {
            return Err(self.already_set("metrics"));
        }
        self.execution_success = report.success;
        self.output = report.output;
        self.metrics = Some(report.metrics);
        Ok(())
    }

    pub fn attach_analysis(&mut self, analysis: AnalysisResult) -> Result<(), RecordError> {
        self.ensure_open()?;
        if self.analysis.is_some() {
            return Err(self.already_set("analysis"));
        }
        self.analysis = Some(analysis);
        Ok(())
    }

    pub fn set_error(&mut self, error: impl Into<String>) -> Result<(), RecordError> {
        self.ensure_open()?;
        self.error = Some(error.into());
        Ok(())
    }

    pub fn request_fulfilled(&self) -> bool {
        self.analysis.as_ref().map(|a| a.request_fulfilled).unwrap_or(false)
    }

    /// True when the request ran and was judged fulfilled.
    pub fn succeeded(&self) -> bool {
        self.execution_success && self.request_fulfilled()
    }

    fn ensure_open(&self) -> Result<(), RecordError> {
        if self.is_terminal() {
            Err(RecordError::Sealed(self.request_id.clone()))
        } else {
            Ok(())
        }
    }

    fn already_set(&self, field: &'static str) -> RecordError {
        RecordError::AlreadySet {
            request_id: self.request_id.clone(),
            field,
        }
    }
}
