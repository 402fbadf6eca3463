// orchestrator-service-rs/src/correlator.rs
// Request identity, in-flight tracking and the single completion point

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use action_ledger::{AppendOutcome, HistorySink, LedgerError};
use async_trait::async_trait;
use shared_types::{Origin, RecordError, RequestOutcome, RequestRecord};
use tracing::{debug, warn};

use crate::remote::RemoteError;

/// Where a finished record is handed back to its originator.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn deliver(&self, record: &RequestRecord) -> Result<(), RemoteError>;
}

/// Local callers get the record as the return value; nothing to send.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalDelivery;

#[async_trait]
impl ResultSink for LocalDelivery {
    async fn deliver(&self, _record: &RequestRecord) -> Result<(), RemoteError> {
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CorrelationError {
    #[error("request id {0} has already been used")]
    DuplicateId(String),

    #[error("remote requests must carry an id")]
    MissingRemoteId,

    #[error(transparent)]
    Transition(#[from] RecordError),

    #[error("history append failed: {0}")]
    History(#[from] LedgerError),
}

/// What `complete` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub delivered: bool,
    pub archived: AppendOutcome,
}

/// Issues request ids, remembers every id it has seen, and is the only place
/// a record is delivered and archived.
pub struct RequestCorrelator {
    seen: Mutex<HashSet<String>>,
    in_flight: Mutex<HashMap<String, RequestRecord>>,
    history: Arc<dyn HistorySink>,
}

impl RequestCorrelator {
    pub fn new(history: Arc<dyn HistorySink>) -> Self {
        Self {
            seen: Mutex::new(HashSet::new()),
            in_flight: Mutex::new(HashMap::new()),
            history,
        }
    }

    fn seen(&self) -> MutexGuard<'_, HashSet<String>> {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn in_flight_map(&self) -> MutexGuard<'_, HashMap<String, RequestRecord>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a PENDING record. Local requests get a fresh v4 UUID unless an
    /// id is supplied; remote requests must supply one. Ids already used in
    /// this process or present in history are refused.
    pub fn admit(
        &self,
        raw_request: &str,
        origin: Origin,
        external_id: Option<&str>,
    ) -> Result<RequestRecord, CorrelationError> {
        let external_id = external_id.map(str::trim).filter(|id| !id.is_empty());
        let request_id = match (external_id, origin) {
            (Some(id), _) => id.to_string(),
            (None, Origin::Remote) => return Err(CorrelationError::MissingRemoteId),
            (None, Origin::Local) => uuid::Uuid::new_v4().to_string(),
        };

        {
            let mut seen = self.seen();
            if seen.contains(&request_id) || self.history.contains(&request_id)? {
                return Err(CorrelationError::DuplicateId(request_id));
            }
            seen.insert(request_id.clone());
        }

        let record = RequestRecord::new(request_id, origin, raw_request);
        self.track(&record);
        Ok(record)
    }

    /// Refresh the in-flight copy of a record that is not yet terminal.
    pub fn track(&self, record: &RequestRecord) {
        if !record.is_terminal() {
            self.in_flight_map()
                .insert(record.request_id.clone(), record.clone());
        }
    }

    /// Last known state of a request that has not completed.
    pub fn in_flight(&self, request_id: &str) -> Option<RequestRecord> {
        self.in_flight_map().get(request_id).cloned()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight_map().len()
    }

    /// Move `record` to `outcome`, hand it to `delivery`, and append it to
    /// history.
    ///
    /// Completing again with the same outcome re-delivers but never appends a
    /// second history entry. Delivery failures are logged; the record is
    /// still archived.
    pub async fn complete(
        &self,
        record: &mut RequestRecord,
        outcome: RequestOutcome,
        delivery: &dyn ResultSink,
    ) -> Result<Completion, CorrelationError> {
        if !outcome.is_terminal() {
            return Err(RecordError::InvalidTransition {
                request_id: record.request_id.clone(),
                from: record.outcome,
                to: outcome,
            }
            .into());
        }
        if record.outcome != outcome {
            record.transition(outcome)?;
        }

        let delivered = match delivery.deliver(record).await {
            Ok(()) => true,
            Err(err) => {
                warn!(request_id = %record.request_id, error = %err, "result delivery failed");
                false
            }
        };

        let archived = self.history.append(record)?;
        if archived == AppendOutcome::Duplicate {
            debug!(request_id = %record.request_id, "record already archived");
        }
        self.in_flight_map().remove(&record.request_id);

        Ok(Completion {
            delivered,
            archived,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use action_ledger::MemoryHistory;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingSink(AtomicUsize);

    #[async_trait]
    impl ResultSink for CountingSink {
        async fn deliver(&self, _record: &RequestRecord) -> Result<(), RemoteError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl ResultSink for FailingSink {
        async fn deliver(&self, _record: &RequestRecord) -> Result<(), RemoteError> {
            Err(RemoteError::Transport("store offline".into()))
        }
    }

    fn correlator() -> (RequestCorrelator, Arc<MemoryHistory>) {
        let history = Arc::new(MemoryHistory::new());
        (RequestCorrelator::new(history.clone()), history)
    }

    #[test]
    fn ten_thousand_admissions_yield_distinct_ids() {
        let (correlator, _) = correlator();
        let ids: HashSet<String> = (0..10_000)
            .map(|_| correlator.admit("ls", Origin::Local, None).unwrap().request_id)
            .collect();
        assert_eq!(ids.len(), 10_000);
    }

    #[test]
    fn reused_ids_are_rejected() {
        let (correlator, _) = correlator();
        correlator.admit("ls", Origin::Remote, Some("cmd-1")).unwrap();
        assert!(matches!(
            correlator.admit("ls", Origin::Remote, Some("cmd-1")),
            Err(CorrelationError::DuplicateId(id)) if id == "cmd-1"
        ));
    }

    #[test]
    fn ids_in_history_are_rejected() {
        let (correlator, history) = correlator();
        let mut archived = RequestRecord::new("old", Origin::Remote, "ls");
        archived.transition(RequestOutcome::Processing).unwrap();
        archived.transition(RequestOutcome::Blocked).unwrap();
        history.append(&archived).unwrap();

        assert!(matches!(
            correlator.admit("ls", Origin::Remote, Some("old")),
            Err(CorrelationError::DuplicateId(_))
        ));
    }

    #[test]
    fn remote_requests_need_an_id() {
        let (correlator, _) = correlator();
        assert!(matches!(
            correlator.admit("ls", Origin::Remote, None),
            Err(CorrelationError::MissingRemoteId)
        ));
        assert!(matches!(
            correlator.admit("ls", Origin::Remote, Some("  ")),
            Err(CorrelationError::MissingRemoteId)
        ));
    }

    #[tokio::test]
    async fn processing_records_stay_retrievable_until_completed() {
        let (correlator, _) = correlator();
        let mut record = correlator.admit("ls", Origin::Local, None).unwrap();
        record.transition(RequestOutcome::Processing).unwrap();
        correlator.track(&record);

        let seen = correlator.in_flight(&record.request_id).unwrap();
        assert_eq!(seen.outcome, RequestOutcome::Processing);

        correlator
            .complete(&mut record, RequestOutcome::CompletedError, &LocalDelivery)
            .await
            .unwrap();
        assert!(correlator.in_flight(&record.request_id).is_none());
        assert_eq!(correlator.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn completing_twice_archives_once() {
        let (correlator, history) = correlator();
        let sink = CountingSink::default();
        let mut record = correlator.admit("ls", Origin::Local, None).unwrap();
        record.transition(RequestOutcome::Processing).unwrap();

        let first = correlator
            .complete(&mut record, RequestOutcome::CompletedSuccess, &sink)
            .await
            .unwrap();
        let second = correlator
            .complete(&mut record, RequestOutcome::CompletedSuccess, &sink)
            .await
            .unwrap();

        assert_eq!(first.archived, AppendOutcome::Appended);
        assert_eq!(second.archived, AppendOutcome::Duplicate);
        assert_eq!(history.len(), 1);
        assert_eq!(sink.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn completing_with_a_different_outcome_is_refused() {
        let (correlator, history) = correlator();
        let mut record = correlator.admit("ls", Origin::Local, None).unwrap();
        record.transition(RequestOutcome::Processing).unwrap();
        correlator
            .complete(&mut record, RequestOutcome::Cancelled, &LocalDelivery)
            .await
            .unwrap();

        let again = correlator
            .complete(&mut record, RequestOutcome::CompletedSuccess, &LocalDelivery)
            .await;
        assert!(matches!(again, Err(CorrelationError::Transition(_))));
        assert_eq!(record.outcome, RequestOutcome::Cancelled);
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn failed_delivery_still_archives() {
        let (correlator, history) = correlator();
        let mut record = correlator.admit("ls", Origin::Remote, Some("r-9")).unwrap();
        record.transition(RequestOutcome::Processing).unwrap();

        let completion = correlator
            .complete(&mut record, RequestOutcome::SystemError, &FailingSink)
            .await
            .unwrap();
        assert!(!completion.delivered);
        assert_eq!(history.len(), 1);
    }
}
