// orchestrator-service-rs/src/dispatch.rs
// Classify -> gate -> execute -> analyze -> report, for both origins

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use executor::CommandRunner;
use futures::FutureExt;
use llm_service::{CodeOracle, OracleError};
use reflection::ResultAnalyzer;
use safety::{decide, decide_unattended, Decision, SafetyPolicy, UnattendedDecision};
use serde_json::{json, Map, Value};
use shared_types::{
    CommandDescriptor, Origin, RecordError, RequestOutcome, RequestRecord, SafetyLevel,
};
use tracing::{error, info, info_span, warn, Instrument};

use crate::correlator::{CorrelationError, LocalDelivery, RequestCorrelator, ResultSink};
use crate::session::{CommandHistoryEntry, Session};
use crate::status::{labels, StatusSink};

pub const CANCELLED_REASON: &str = "User cancelled dangerous operation";

/// Asks the operator whether a DANGEROUS command may run.
#[async_trait]
pub trait Confirmer: Send + Sync {
    async fn confirm(&self, descriptor: &CommandDescriptor) -> bool;
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Correlation(#[from] CorrelationError),

    #[error("code generation failed: {0}")]
    Oracle(#[from] OracleError),

    #[error(transparent)]
    Record(#[from] RecordError),

    #[error("pipeline panicked: {0}")]
    Panic(String),
}

impl DispatchError {
    /// True when the request was refused at admission and never ran.
    pub fn is_refused(&self) -> bool {
        matches!(
            self,
            DispatchError::Correlation(
                CorrelationError::DuplicateId(_) | CorrelationError::MissingRemoteId
            )
        )
    }
}

// Only `dispatch_local` can build the interactive variant, so the remote
// path has no route to a confirmation prompt.
enum Gate<'a> {
    Interactive(&'a dyn Confirmer),
    Unattended,
}

/// The dispatch loop. One instance serves the local REPL and the remote
/// listener concurrently; all per-request state lives in the record.
pub struct Dispatcher {
    generator: Arc<dyn CodeOracle>,
    runner: Arc<dyn CommandRunner>,
    analyzer: ResultAnalyzer,
    correlator: Arc<RequestCorrelator>,
    status: Arc<dyn StatusSink>,
    session: Arc<Session>,
}

impl Dispatcher {
    pub fn new(
        generator: Arc<dyn CodeOracle>,
        runner: Arc<dyn CommandRunner>,
        analyzer: ResultAnalyzer,
        correlator: Arc<RequestCorrelator>,
        status: Arc<dyn StatusSink>,
        session: Arc<Session>,
    ) -> Self {
        Self {
            generator,
            runner,
            analyzer,
            correlator,
            status,
            session,
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn correlator(&self) -> &Arc<RequestCorrelator> {
        &self.correlator
    }

    /// Run a request typed at the local terminal. DANGEROUS commands are put
    /// to `confirmer` while safety mode is on.
    pub async fn dispatch_local(
        &self,
        raw_request: &str,
        confirmer: &dyn Confirmer,
    ) -> Result<RequestRecord, DispatchError> {
        let record = self.correlator.admit(raw_request, Origin::Local, None)?;
        self.run(record, Gate::Interactive(confirmer), &LocalDelivery)
            .await
    }

    /// Run a request received from the remote channel under its own id. The
    /// finished record goes to `sink`.
    pub async fn dispatch_remote(
        &self,
        raw_request: &str,
        request_id: &str,
        sink: &dyn ResultSink,
    ) -> Result<RequestRecord, DispatchError> {
        let record = self
            .correlator
            .admit(raw_request, Origin::Remote, Some(request_id))?;
        self.run(record, Gate::Unattended, sink).await
    }

    async fn run(
        &self,
        record: RequestRecord,
        gate: Gate<'_>,
        sink: &dyn ResultSink,
    ) -> Result<RequestRecord, DispatchError> {
        let span = info_span!(
            "dispatch",
            request_id = %record.request_id,
            origin = %record.origin
        );

        self.run_in_span(record, gate, sink).instrument(span).await
    }

    async fn run_in_span(
        &self,
        mut record: RequestRecord,
        gate: Gate<'_>,
        sink: &dyn ResultSink,
    ) -> Result<RequestRecord, DispatchError> {
        record.transition(RequestOutcome::Processing)?;
        self.correlator.track(&record);

        let mut extra = Map::new();
        extra.insert("current_command".into(), json!(record.raw_request));
        extra.insert("command_id".into(), json!(record.request_id));
        self.publish(labels::PROCESSING, extra).await;

        let result = AssertUnwindSafe(self.pipeline(&mut record, gate))
            .catch_unwind()
            .await;

        let outcome = match result {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) => {
                error!(error = %err, "dispatch failed");
                record.set_error(format!("Unexpected error during processing: {}", err))?;
                RequestOutcome::SystemError
            }
            Err(payload) => {
                let err = DispatchError::Panic(panic_message(payload.as_ref()));
                error!(error = %err, "dispatch pipeline panicked");
                record.set_error(format!("Unexpected error during processing: {}", err))?;
                RequestOutcome::SystemError
            }
        };

        self.publish(outcome.status_label(), terminal_extra(&record, outcome))
            .await;

        let completion = self.correlator.complete(&mut record, outcome, sink).await?;
        info!(
            outcome = %record.outcome,
            delivered = completion.delivered,
            "request completed"
        );
        self.session.log_record(record.clone());
        Ok(record)
    }

    /// Everything between PROCESSING and the terminal outcome. Errors and
    /// panics from here become SYSTEM_ERROR.
    async fn pipeline(
        &self,
        record: &mut RequestRecord,
        gate: Gate<'_>,
    ) -> Result<RequestOutcome, DispatchError> {
        let context = self.context(record);
        let descriptor = self.generator.generate(&record.raw_request, &context).await?;
        record.attach_descriptor(descriptor.clone())?;
        self.correlator.track(record);

        let safety_mode = self.session.safety_mode();
        let decision = match gate {
            Gate::Interactive(confirmer) => {
                match decide(descriptor.safety_level, SafetyPolicy::local(safety_mode)) {
                    Decision::RequireConfirmation => {
                        if confirmer.confirm(&descriptor).await {
                            Decision::Proceed
                        } else {
                            info!("dangerous command declined by operator");
                            record.set_error(CANCELLED_REASON)?;
                            return Ok(RequestOutcome::Cancelled);
                        }
                    }
                    other => other,
                }
            }
            Gate::Unattended => {
                let decision = decide_unattended(descriptor.safety_level);
                if decision == UnattendedDecision::Proceed
                    && descriptor.safety_level == SafetyLevel::Dangerous
                {
                    warn!("dangerous remote command runs without confirmation");
                }
                decision.into()
            }
        };

        if decision == Decision::Reject {
            warn!(safety_level = %descriptor.safety_level, "command rejected by safety gate");
            let reason = if descriptor.explanation.trim().is_empty() {
                "Command blocked for safety reasons".to_string()
            } else {
                descriptor.explanation.clone()
            };
            record.set_error(reason)?;
            return Ok(RequestOutcome::Blocked);
        }

        let report = self
            .runner
            .run(&descriptor.code, self.session.timeout_seconds())
            .await;
        let success = report.success;
        let output = report.output.clone();
        let metrics = report.metrics.clone();
        record.attach_execution(report)?;
        self.correlator.track(record);

        self.session.record_command(CommandHistoryEntry {
            timestamp: Utc::now(),
            request_id: record.request_id.clone(),
            origin: record.origin,
            request: record.raw_request.clone(),
            code: descriptor.code.clone(),
            execution_success: success,
        });

        let analysis = self
            .analyzer
            .analyze(&record.raw_request, &descriptor, success, &output, &metrics)
            .await;
        let fulfilled = analysis.request_fulfilled;
        record.attach_analysis(analysis)?;

        Ok(if success && fulfilled {
            RequestOutcome::CompletedSuccess
        } else {
            RequestOutcome::CompletedError
        })
    }

    fn context(&self, record: &RequestRecord) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("timestamp".to_string(), Utc::now().to_rfc3339()),
            (
                "session_id".to_string(),
                self.session.session_id().to_string(),
            ),
            ("device_id".to_string(), self.session.device_id().to_string()),
            ("command_id".to_string(), record.request_id.clone()),
        ])
    }

    /// Publish a status snapshot. Failures are logged and otherwise ignored.
    pub async fn publish(&self, status: &str, extra: Map<String, Value>) {
        let snapshot = self.session.snapshot(status, extra);
        if let Err(err) = self.status.publish(&snapshot).await {
            warn!(status, error = %err, "status update failed");
        }
    }
}

fn terminal_extra(record: &RequestRecord, outcome: RequestOutcome) -> Map<String, Value> {
    let mut extra = Map::new();
    extra.insert("command_id".into(), json!(record.request_id));
    match outcome {
        RequestOutcome::Blocked | RequestOutcome::Cancelled => {
            extra.insert("reason".into(), json!(record.error));
        }
        RequestOutcome::SystemError => {
            extra.insert("error_message".into(), json!(record.error));
        }
        _ => {
            extra.insert("last_command".into(), json!(record.raw_request));
            extra.insert("execution_success".into(), json!(record.execution_success));
            extra.insert("request_fulfilled".into(), json!(record.request_fulfilled()));
        }
    }
    extra
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
